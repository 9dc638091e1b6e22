//! MPC cluster client.
//!
//! Submits named computations to the MXE program, correlates the
//! asynchronous result by computation offset, and exposes the finalization
//! wait used by the settlement pipeline. The cluster itself is opaque: the
//! crank only knows the instruction layouts and the callback events.

pub mod events;

use std::sync::Arc;

use anyhow::{Context, Result};
use rand::RngCore;
use sha2::{Digest, Sha256};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature};
use tracing::debug;

use crate::chain::blockhash::BlockhashCache;
use crate::chain::rpc::RpcClient;
use crate::chain::tx::{
    build_signed_transaction, calculate_fill_data, compare_prices_data, computation_instruction,
    ComputationAccounts, CALCULATE_FILL_IX, COMPARE_PRICES_IX,
};
use crate::db::tx_records::TxRecordRepo;
use crate::mpc::events::{MpcCorrelator, MpcEvent};
use crate::util::retry::{with_retry, RetryPolicy};
use crate::util::timeout::with_timeout;

/// Byte range of the cluster-state account holding the MXE x25519 public
/// key; all-zero until keygen completes.
const MXE_PUBKEY_RANGE: std::ops::Range<usize> = 95..127;

const SEED_COMPUTATION: &[u8] = b"computation";
const SEED_COMP_DEF: &[u8] = b"comp_def";
const SEED_CLUSTER: &[u8] = b"cluster";
const SEED_MXE: &[u8] = b"mxe";

#[derive(Debug, Clone)]
pub struct MpcClientConfig {
    pub mxe_program: Pubkey,
    pub dex_program: Pubkey,
    pub cluster_offset: u64,
    pub mpc_timeout_ms: u64,
}

/// Deterministic PDA set for one computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MpcAccounts {
    pub computation: Pubkey,
    pub cluster: Pubkey,
    pub mxe: Pubkey,
}

/// Accepted compare/fill submission, carrying the correlation handles.
#[derive(Debug, Clone)]
pub struct ComputationSubmission {
    pub signature: Signature,
    pub computation_offset: u64,
    pub request_id: [u8; 32],
    pub nonce: u128,
}

pub struct ComparePricesRequest {
    pub buy_price: [u8; 32],
    pub sell_price: [u8; 32],
    pub ephemeral_pubkey: [u8; 32],
    pub buy_order: Pubkey,
    pub sell_order: Pubkey,
}

pub struct CalculateFillRequest {
    pub buy_amount: [u8; 32],
    pub sell_amount: [u8; 32],
    pub buy_price: [u8; 32],
    pub sell_price: [u8; 32],
    pub buy_filled: [u8; 32],
    pub sell_filled: [u8; 32],
    pub ephemeral_pubkey: [u8; 32],
    pub buy_order: Pubkey,
    pub sell_order: Pubkey,
}

pub struct MpcClient {
    rpc: Arc<RpcClient>,
    blockhash: Arc<BlockhashCache>,
    wallet: Arc<Keypair>,
    config: MpcClientConfig,
    correlator: Arc<MpcCorrelator>,
    tx_records: TxRecordRepo,
}

impl MpcClient {
    pub fn new(
        rpc: Arc<RpcClient>,
        blockhash: Arc<BlockhashCache>,
        wallet: Arc<Keypair>,
        config: MpcClientConfig,
        correlator: Arc<MpcCorrelator>,
        tx_records: TxRecordRepo,
    ) -> Self {
        Self {
            rpc,
            blockhash,
            wallet,
            config,
            correlator,
            tx_records,
        }
    }

    pub fn correlator(&self) -> Arc<MpcCorrelator> {
        Arc::clone(&self.correlator)
    }

    /// Pure, deterministic PDA derivation for a computation offset.
    pub fn derive_accounts(&self, computation_offset: u64) -> MpcAccounts {
        let (computation, _) = Pubkey::find_program_address(
            &[SEED_COMPUTATION, &computation_offset.to_le_bytes()],
            &self.config.mxe_program,
        );
        let (cluster, _) = Pubkey::find_program_address(
            &[SEED_CLUSTER, &self.config.cluster_offset.to_le_bytes()],
            &self.config.mxe_program,
        );
        let (mxe, _) = Pubkey::find_program_address(&[SEED_MXE], &self.config.mxe_program);
        MpcAccounts {
            computation,
            cluster,
            mxe,
        }
    }

    pub fn comp_def_pda(&self, computation_name: &str) -> Pubkey {
        Pubkey::find_program_address(
            &[SEED_COMP_DEF, computation_name.as_bytes()],
            &self.config.mxe_program,
        )
        .0
    }

    /// The cluster is available once its keygen has completed, observable
    /// as a non-zero MXE public key in the cluster-state account.
    pub async fn is_available(&self) -> Result<bool> {
        Ok(self.get_mxe_public_key().await?.is_some())
    }

    pub async fn get_mxe_public_key(&self) -> Result<Option<[u8; 32]>> {
        let cluster = self.derive_accounts(0).cluster;
        let Some(account) = self.rpc.get_account_info(&cluster).await? else {
            return Ok(None);
        };
        if account.data.len() < MXE_PUBKEY_RANGE.end {
            return Ok(None);
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&account.data[MXE_PUBKEY_RANGE]);
        if key.iter().all(|&b| b == 0) {
            return Ok(None);
        }
        Ok(Some(key))
    }

    fn random_offset_and_nonce(&self) -> (u64, u128) {
        let mut rng = rand::thread_rng();
        let mut nonce_bytes = [0u8; 16];
        rng.fill_bytes(&mut nonce_bytes);
        (rng.next_u64(), u128::from_le_bytes(nonce_bytes))
    }

    /// Request id binding a computation to its order pair; stable across
    /// the submit/callback round trip.
    pub fn derive_request_id(
        computation_offset: u64,
        nonce: u128,
        buy_order: &Pubkey,
        sell_order: &Pubkey,
    ) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"mpc:request");
        hasher.update(computation_offset.to_le_bytes());
        hasher.update(nonce.to_le_bytes());
        hasher.update(buy_order.as_ref());
        hasher.update(sell_order.as_ref());
        hasher.finalize().into()
    }

    pub async fn execute_compare_prices(
        &self,
        request: &ComparePricesRequest,
    ) -> Result<ComputationSubmission> {
        let (computation_offset, nonce) = self.random_offset_and_nonce();
        let request_id = Self::derive_request_id(
            computation_offset,
            nonce,
            &request.buy_order,
            &request.sell_order,
        );
        let data = compare_prices_data(
            computation_offset,
            &request.buy_price,
            &request.sell_price,
            &request.ephemeral_pubkey,
            nonce,
        );
        let signature = self
            .submit_computation(
                COMPARE_PRICES_IX,
                computation_offset,
                data,
                &request.buy_order,
                &request.sell_order,
                &request_id,
            )
            .await?;
        Ok(ComputationSubmission {
            signature,
            computation_offset,
            request_id,
            nonce,
        })
    }

    pub async fn execute_calculate_fill(
        &self,
        request: &CalculateFillRequest,
    ) -> Result<ComputationSubmission> {
        let (computation_offset, nonce) = self.random_offset_and_nonce();
        let request_id = Self::derive_request_id(
            computation_offset,
            nonce,
            &request.buy_order,
            &request.sell_order,
        );
        let data = calculate_fill_data(
            computation_offset,
            &request.buy_amount,
            &request.sell_amount,
            &request.buy_price,
            &request.sell_price,
            &request.buy_filled,
            &request.sell_filled,
            &request.ephemeral_pubkey,
            nonce,
        );
        let signature = self
            .submit_computation(
                CALCULATE_FILL_IX,
                computation_offset,
                data,
                &request.buy_order,
                &request.sell_order,
                &request_id,
            )
            .await?;
        Ok(ComputationSubmission {
            signature,
            computation_offset,
            request_id,
            nonce,
        })
    }

    async fn submit_computation(
        &self,
        computation_name: &str,
        computation_offset: u64,
        data: Vec<u8>,
        buy_order: &Pubkey,
        sell_order: &Pubkey,
        request_id: &[u8; 32],
    ) -> Result<Signature> {
        use solana_sdk::signer::Signer;

        let derived = self.derive_accounts(computation_offset);
        let accounts = ComputationAccounts {
            payer: self.wallet.pubkey(),
            computation: derived.computation,
            computation_definition: self.comp_def_pda(computation_name),
            cluster: derived.cluster,
            mxe: derived.mxe,
            buy_order: *buy_order,
            sell_order: *sell_order,
        };
        let instruction = computation_instruction(&self.config.mxe_program, &accounts, data);

        let instruction = &instruction;
        let signature = with_retry(computation_name, &RetryPolicy::rpc(), || async move {
            let blockhash = self.blockhash.ensure_fresh_blockhash(150).await?;
            let tx = build_signed_transaction(
                std::slice::from_ref(instruction),
                &self.wallet,
                blockhash.hash,
            );
            self.rpc.send_transaction(&tx).await
        })
        .await
        .into_result()
        .with_context(|| format!("submit {computation_name}"))?;

        self.tx_records
            .insert_pending(
                &signature.to_string(),
                computation_name,
                Some(&buy_order.to_string()),
                Some(&sell_order.to_string()),
                Some(&hex::encode(request_id)),
            )
            .await?;

        debug!(
            computation = computation_name,
            offset = computation_offset,
            sig = %signature,
            "computation submitted"
        );
        Ok(signature)
    }

    /// Wait for the callback event of a computation, bounded by the MPC
    /// timeout. The waiter is deregistered on every exit path.
    pub async fn await_finalization(&self, computation_offset: u64) -> Result<MpcEvent> {
        let rx = self.correlator.register(computation_offset);
        let result = with_timeout("mpc finalization", self.config.mpc_timeout_ms, async {
            rx.await.context("mpc event channel closed")
        })
        .await;
        if result.is_err() {
            self.correlator.unregister(computation_offset);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::blockhash::BlockhashConfig;
    use crate::db::Database;
    use crate::metrics::CrankMetrics;
    use crate::util::timeout::TimeoutError;

    async fn client(mpc_timeout_ms: u64) -> MpcClient {
        let metrics = Arc::new(CrankMetrics::new());
        let rpc = Arc::new(
            RpcClient::new(
                "http://127.0.0.1:1".to_string(),
                vec![],
                200,
                Arc::clone(&metrics),
            )
            .unwrap(),
        );
        let blockhash = Arc::new(BlockhashCache::new(
            Arc::clone(&rpc),
            BlockhashConfig {
                refresh_interval_ms: 30_000,
                max_age_ms: 60_000,
                prefetch_count: 2,
                fetch_timeout_ms: 200,
            },
            Arc::clone(&metrics),
        ));
        let db = Database::open_in_memory().unwrap();
        db.migrate().await.unwrap();
        MpcClient::new(
            rpc,
            blockhash,
            Arc::new(Keypair::new()),
            MpcClientConfig {
                mxe_program: Pubkey::new_unique(),
                dex_program: Pubkey::new_unique(),
                cluster_offset: 456,
                mpc_timeout_ms,
            },
            Arc::new(MpcCorrelator::new()),
            TxRecordRepo::new(db),
        )
    }

    #[tokio::test]
    async fn account_derivation_is_deterministic() {
        let client = client(120_000).await;
        let a = client.derive_accounts(7);
        let b = client.derive_accounts(7);
        let c = client.derive_accounts(8);
        assert_eq!(a, b);
        assert_ne!(a.computation, c.computation);
        // Cluster and MXE PDAs do not depend on the computation offset.
        assert_eq!(a.cluster, c.cluster);
        assert_eq!(a.mxe, c.mxe);
    }

    #[test]
    fn request_id_binds_offset_nonce_and_orders() {
        let buy = Pubkey::new_unique();
        let sell = Pubkey::new_unique();
        let id = MpcClient::derive_request_id(1, 2, &buy, &sell);
        assert_eq!(id, MpcClient::derive_request_id(1, 2, &buy, &sell));
        assert_ne!(id, MpcClient::derive_request_id(2, 2, &buy, &sell));
        assert_ne!(id, MpcClient::derive_request_id(1, 3, &buy, &sell));
        assert_ne!(id, MpcClient::derive_request_id(1, 2, &sell, &buy));
    }

    #[tokio::test(start_paused = true)]
    async fn finalization_times_out_and_unregisters() {
        let client = client(50).await;
        let err = client.await_finalization(99).await.unwrap_err();
        assert!(err.downcast_ref::<TimeoutError>().is_some());
        assert_eq!(client.correlator.waiting_count(), 0);
    }

    #[tokio::test]
    async fn finalization_receives_delivered_event() {
        let client = client(5_000).await;
        let correlator = client.correlator();

        let event = MpcEvent::PriceCompare(events::PriceCompareResult {
            computation_offset: 11,
            prices_match: false,
            request_id: [1u8; 32],
            buy_order: Pubkey::new_unique(),
            sell_order: Pubkey::new_unique(),
            nonce: 0,
        });
        let waiter = tokio::spawn({
            let event = event.clone();
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                correlator.complete(event)
            }
        });

        let received = client.await_finalization(11).await.unwrap();
        assert_eq!(received, event);
        assert!(waiter.await.unwrap());
    }
}
