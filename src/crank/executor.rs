//! Settlement executor.
//!
//! Drives one match candidate through the two-step MPC protocol and the
//! on-chain settlement. Transient failures leave the durable pending
//! operation in place for a later tick; fatal failures mark it failed and
//! release the pair locks. A prices-don't-match outcome is a completed
//! operation, not a crank error.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rand::RngCore;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use tracing::{info, warn};

use crate::chain::blockhash::BlockhashCache;
use crate::chain::order::cipher_body;
use crate::chain::rpc::{ConfirmStatus, RpcClient};
use crate::chain::tx::{
    build_signed_transaction, match_orders_data, match_orders_instruction, MATCH_ORDERS_IX,
};
use crate::crank::order_locks::OrderLockManager;
use crate::crank::selector::MatchCandidate;
use crate::db::pending_ops::{OpType, PendingOpRepo, PendingOperation, DEFAULT_MAX_RETRIES};
use crate::db::settlements::{SettlementRepo, SettlementRequest};
use crate::db::tx_records::{TxRecordRepo, TxStatus};
use crate::error::is_fatal;
use crate::metrics::CrankMetrics;
use crate::mpc::events::{FillCalculationResult, MpcEvent};
use crate::mpc::{CalculateFillRequest, ComparePricesRequest, MpcClient};
use crate::util::retry::{with_retry, RetryPolicy};
use crate::util::timeout::CancelToken;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub dex_program: Pubkey,
    /// Dev-only escape: synthesize successful matches without the cluster.
    pub use_real_mpc: bool,
    pub settlement_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Settled { signature: Option<String> },
    /// The MPC compared prices and they do not cross.
    NoMatch,
    /// Not attempted (locked elsewhere, duplicate in-flight operation).
    Skipped { reason: String },
    Failed { error: String, fatal: bool },
}

impl MatchOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, MatchOutcome::Failed { .. })
    }
}

pub struct SettlementExecutor {
    rpc: Arc<RpcClient>,
    blockhash: Arc<BlockhashCache>,
    mpc: Arc<MpcClient>,
    locks: Arc<OrderLockManager>,
    pending_ops: PendingOpRepo,
    tx_records: TxRecordRepo,
    settlements: SettlementRepo,
    wallet: Arc<Keypair>,
    metrics: Arc<CrankMetrics>,
    instance_id: String,
    config: ExecutorConfig,
    cancel: CancelToken,
}

impl SettlementExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rpc: Arc<RpcClient>,
        blockhash: Arc<BlockhashCache>,
        mpc: Arc<MpcClient>,
        locks: Arc<OrderLockManager>,
        pending_ops: PendingOpRepo,
        tx_records: TxRecordRepo,
        settlements: SettlementRepo,
        wallet: Arc<Keypair>,
        metrics: Arc<CrankMetrics>,
        instance_id: String,
        config: ExecutorConfig,
        cancel: CancelToken,
    ) -> Self {
        Self {
            rpc,
            blockhash,
            mpc,
            locks,
            pending_ops,
            tx_records,
            settlements,
            wallet,
            metrics,
            instance_id,
            config,
            cancel,
        }
    }

    fn failure(err: anyhow::Error) -> MatchOutcome {
        MatchOutcome::Failed {
            fatal: is_fatal(&err),
            error: format!("{err:#}"),
        }
    }

    fn random_ephemeral() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    /// Drive one candidate to an outcome. Pair locks are held for the
    /// attempt and always released before returning.
    pub async fn execute_match(&self, candidate: &MatchCandidate) -> MatchOutcome {
        let buy_pda = candidate.buy.pda.to_string();
        let sell_pda = candidate.sell.pda.to_string();

        if !self.locks.acquire_locks(&buy_pda, &sell_pda, None) {
            return MatchOutcome::Skipped {
                reason: "orders already locked".to_string(),
            };
        }

        let op = match self.claim_operation(candidate).await {
            Ok(Some(op)) => op,
            Ok(None) => {
                self.locks.release_locks(&buy_pda, &sell_pda);
                return MatchOutcome::Skipped {
                    reason: "operation already in flight".to_string(),
                };
            }
            Err(e) => {
                self.locks.release_locks(&buy_pda, &sell_pda);
                return Self::failure(e);
            }
        };

        let outcome = if self.config.use_real_mpc {
            self.run_mpc_match(candidate).await
        } else {
            self.run_simulated_match(candidate).await
        };

        if let Err(e) = self.record_outcome(&op, &outcome).await {
            warn!(op = %op.id, err = %e, "failed to record match outcome");
        }
        self.locks.release_locks(&buy_pda, &sell_pda);
        outcome
    }

    /// Create (or refuse to duplicate) the durable operation for this pair
    /// and claim it for this instance.
    async fn claim_operation(&self, candidate: &MatchCandidate) -> Result<Option<PendingOperation>> {
        let key = candidate.op_key();
        if self.pending_ops.exists(&key).await? {
            return Ok(None);
        }
        let payload = serde_json::json!({
            "buy_order": candidate.buy.pda.to_string(),
            "sell_order": candidate.sell.pda.to_string(),
            "pair": candidate.pair.to_string(),
        })
        .to_string();
        let op = self
            .pending_ops
            .create(OpType::Match, &key, &payload, DEFAULT_MAX_RETRIES)
            .await?;
        self.pending_ops
            .mark_in_progress(&op.id, &self.instance_id)
            .await?;
        Ok(Some(op))
    }

    async fn record_outcome(&self, op: &PendingOperation, outcome: &MatchOutcome) -> Result<()> {
        match outcome {
            MatchOutcome::Settled { .. } | MatchOutcome::NoMatch => {
                self.pending_ops.mark_completed(&op.id).await
            }
            MatchOutcome::Failed { error, fatal: true } => {
                self.pending_ops.mark_failed(&op.id, error).await
            }
            MatchOutcome::Failed { error, fatal: false } => {
                self.pending_ops.reset_for_retry(&op.id, error).await?;
                Ok(())
            }
            MatchOutcome::Skipped { .. } => Ok(()),
        }
    }

    async fn run_mpc_match(&self, candidate: &MatchCandidate) -> MatchOutcome {
        let buy = &candidate.buy;
        let sell = &candidate.sell;

        match self.mpc.is_available().await {
            Ok(true) => {}
            Ok(false) => {
                return MatchOutcome::Failed {
                    error: "mpc cluster keygen incomplete, connection timeout expected".to_string(),
                    fatal: false,
                }
            }
            Err(e) => return Self::failure(e),
        }

        let ephemeral = Self::random_ephemeral();
        let compare = ComparePricesRequest {
            buy_price: cipher_body(&buy.encrypted_price),
            sell_price: cipher_body(&sell.encrypted_price),
            ephemeral_pubkey: ephemeral,
            buy_order: buy.pda,
            sell_order: sell.pda,
        };
        let submission = match self.mpc.execute_compare_prices(&compare).await {
            Ok(submission) => submission,
            Err(e) => return Self::failure(e),
        };
        self.locks.attach_request_id(
            &buy.pda.to_string(),
            &sell.pda.to_string(),
            &hex::encode(submission.request_id),
        );

        let event = match self.mpc.await_finalization(submission.computation_offset).await {
            Ok(event) => event,
            Err(e) => return Self::failure(e),
        };

        let compare_result = match event {
            MpcEvent::PriceCompare(result) => result,
            other => {
                self.metrics.record_validation_error();
                return MatchOutcome::Failed {
                    error: format!(
                        "expected PriceCompareResult, got {} (invalid account data for callback)",
                        other.name()
                    ),
                    fatal: true,
                };
            }
        };
        self.tx_records
            .set_status(&submission.signature.to_string(), TxStatus::Confirmed, None)
            .await
            .ok();

        if !compare_result.prices_match {
            info!(buy = %buy.pda, sell = %sell.pda, "prices do not cross");
            return MatchOutcome::NoMatch;
        }

        // Prices cross: ask the cluster for the fill amounts.
        let fill_request = CalculateFillRequest {
            buy_amount: cipher_body(&buy.encrypted_amount),
            sell_amount: cipher_body(&sell.encrypted_amount),
            buy_price: cipher_body(&buy.encrypted_price),
            sell_price: cipher_body(&sell.encrypted_price),
            buy_filled: cipher_body(&buy.encrypted_filled),
            sell_filled: cipher_body(&sell.encrypted_filled),
            ephemeral_pubkey: ephemeral,
            buy_order: buy.pda,
            sell_order: sell.pda,
        };
        let fill_submission = match self.mpc.execute_calculate_fill(&fill_request).await {
            Ok(submission) => submission,
            Err(e) => return Self::failure(e),
        };

        let fill_event = match self
            .mpc
            .await_finalization(fill_submission.computation_offset)
            .await
        {
            Ok(event) => event,
            Err(e) => return Self::failure(e),
        };
        let fill = match fill_event {
            MpcEvent::FillCalculation(result) => result,
            other => {
                self.metrics.record_validation_error();
                return MatchOutcome::Failed {
                    error: format!(
                        "expected FillCalculationResult, got {} (invalid account data for callback)",
                        other.name()
                    ),
                    fatal: true,
                };
            }
        };
        self.tx_records
            .set_status(&fill_submission.signature.to_string(), TxStatus::Confirmed, None)
            .await
            .ok();

        self.settle(candidate.pair, &fill).await
    }

    /// Build, submit and confirm the on-chain settlement using the fresh
    /// fill ciphertext.
    async fn settle(&self, pair: Pubkey, fill: &FillCalculationResult) -> MatchOutcome {
        use solana_sdk::signer::Signer;

        let request_id = hex::encode(fill.request_id);
        if let Err(e) = self
            .settlements
            .upsert_pending(
                &request_id,
                &fill.buy_order.to_string(),
                &fill.sell_order.to_string(),
                &pair.to_string(),
                &fill.encrypted_fill_amount,
                fill.buy_fully_filled,
                fill.sell_fully_filled,
            )
            .await
        {
            return Self::failure(e);
        }

        let data = match_orders_data(
            &fill.request_id,
            &fill.encrypted_fill_amount,
            fill.buy_fully_filled,
            fill.sell_fully_filled,
        );
        let instruction = match_orders_instruction(
            &self.config.dex_program,
            &self.wallet.pubkey(),
            &fill.buy_order,
            &fill.sell_order,
            &pair,
            data,
        );

        let instruction = &instruction;
        let submitted = with_retry(MATCH_ORDERS_IX, &RetryPolicy::rpc(), || async move {
            let blockhash = self.blockhash.ensure_fresh_blockhash(150).await?;
            let tx = build_signed_transaction(
                std::slice::from_ref(instruction),
                &self.wallet,
                blockhash.hash,
            );
            let signature = self.rpc.send_transaction(&tx).await?;
            Ok((signature, blockhash.last_valid_block_height))
        })
        .await
        .into_result()
        .context("settlement submit");

        let (signature, last_valid_block_height) = match submitted {
            Ok(pair) => pair,
            Err(e) => {
                self.settlements.mark_failed(&request_id).await.ok();
                return Self::failure(e);
            }
        };
        let sig_str = signature.to_string();
        self.tx_records
            .insert_pending(
                &sig_str,
                MATCH_ORDERS_IX,
                Some(&fill.buy_order.to_string()),
                Some(&fill.sell_order.to_string()),
                Some(&request_id),
            )
            .await
            .ok();

        match self
            .rpc
            .confirm_transaction(
                &signature,
                last_valid_block_height,
                self.config.settlement_timeout_ms,
                Some(&self.cancel),
            )
            .await
        {
            Ok(ConfirmStatus::Confirmed { slot }) => {
                self.tx_records
                    .set_status(&sig_str, TxStatus::Confirmed, Some(slot))
                    .await
                    .ok();
                self.settlements.mark_settled(&request_id, &sig_str).await.ok();
                info!(sig = %sig_str, slot, "🤝 match settled");
                MatchOutcome::Settled {
                    signature: Some(sig_str),
                }
            }
            Ok(ConfirmStatus::Expired) => {
                self.tx_records
                    .set_status(&sig_str, TxStatus::Expired, None)
                    .await
                    .ok();
                MatchOutcome::Failed {
                    error: "settlement expired: blockhash not found".to_string(),
                    fatal: false,
                }
            }
            Err(e) => {
                let fatal = is_fatal(&e);
                self.tx_records
                    .set_status(
                        &sig_str,
                        if fatal { TxStatus::Failed } else { TxStatus::Pending },
                        None,
                    )
                    .await
                    .ok();
                Self::failure(e)
            }
        }
    }

    /// Resume a persisted settlement request (crash recovery / orphan
    /// callback path).
    pub async fn settle_from_request(&self, request: &SettlementRequest) -> MatchOutcome {
        let parse = |label: &str, value: &str| -> Result<Pubkey> {
            value
                .parse::<Pubkey>()
                .map_err(|e| anyhow!("settlement request {label}: invalid account data: {e}"))
        };
        let buy_order = match parse("buy_order", &request.buy_order) {
            Ok(pk) => pk,
            Err(e) => return Self::failure(e),
        };
        let sell_order = match parse("sell_order", &request.sell_order) {
            Ok(pk) => pk,
            Err(e) => return Self::failure(e),
        };
        let pair = match parse("pair", &request.pair) {
            Ok(pk) => pk,
            Err(e) => return Self::failure(e),
        };
        let request_id: [u8; 32] = match hex::decode(&request.request_id)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
        {
            Some(id) => id,
            None => {
                return MatchOutcome::Failed {
                    error: "settlement request id is not 32 hex bytes (invalid account data)"
                        .to_string(),
                    fatal: true,
                }
            }
        };
        let encrypted_fill_amount: [u8; 64] =
            match request.encrypted_fill_amount.clone().try_into() {
                Ok(fill) => fill,
                Err(_) => {
                    return MatchOutcome::Failed {
                        error: "settlement fill ciphertext is not 64 bytes (invalid account data)"
                            .to_string(),
                        fatal: true,
                    }
                }
            };

        let fill = FillCalculationResult {
            computation_offset: 0,
            encrypted_fill_amount,
            buy_fully_filled: request.buy_fully_filled,
            sell_fully_filled: request.sell_fully_filled,
            request_id,
            buy_order,
            sell_order,
        };
        self.settle(pair, &fill).await
    }

    /// Dev-only mode: no cluster, every candidate "matches" immediately.
    async fn run_simulated_match(&self, candidate: &MatchCandidate) -> MatchOutcome {
        warn!(
            buy = %candidate.buy.pda,
            sell = %candidate.sell.pda,
            "DRY MPC: synthesizing successful match without cluster"
        );
        MatchOutcome::Settled { signature: None }
    }
}
