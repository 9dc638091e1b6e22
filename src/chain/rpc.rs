//! Chain JSON-RPC client.
//!
//! Hand-rolled JSON-RPC 2.0 over HTTP with a per-call timeout, message-based
//! error classification and primary/fallback failover. After
//! `FAILOVER_THRESHOLD` consecutive retryable failures the primary is marked
//! down and requests round-robin across fallbacks; the primary is re-probed
//! after `PRIMARY_REPROBE_SECS`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::Transaction;
use tracing::{debug, info, warn};

use crate::error::{classify, ErrorClass, RpcError};
use crate::metrics::CrankMetrics;
use crate::util::timeout::{delay, with_timeout, CancelToken};

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const FAILOVER_THRESHOLD: u32 = 3;
const PRIMARY_REPROBE_SECS: u64 = 60;
const CONFIRM_POLL_INTERVAL_MS: u64 = 2_000;

#[derive(Debug, Clone)]
pub struct AccountInfo {
    pub data: Vec<u8>,
    pub owner: String,
    pub lamports: u64,
    pub slot: u64,
}

#[derive(Debug, Clone)]
pub struct KeyedAccount {
    pub pubkey: Pubkey,
    pub data: Vec<u8>,
    pub slot: u64,
}

#[derive(Debug, Clone)]
pub struct LatestBlockhash {
    pub blockhash: Hash,
    pub last_valid_block_height: u64,
    pub slot: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmStatus {
    Confirmed { slot: u64 },
    /// The transaction's blockhash aged out before confirmation.
    Expired,
}

#[derive(Debug, Default)]
struct EndpointState {
    primary_failures: u32,
    primary_down_since: Option<Instant>,
    fallback_cursor: usize,
}

pub struct RpcClient {
    http: reqwest::Client,
    primary: String,
    fallbacks: Vec<String>,
    state: Mutex<EndpointState>,
    request_id: AtomicU64,
    request_timeout_ms: u64,
    metrics: Arc<CrankMetrics>,
}

impl RpcClient {
    pub fn new(
        primary: String,
        fallbacks: Vec<String>,
        request_timeout_ms: u64,
        metrics: Arc<CrankMetrics>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(request_timeout_ms.saturating_add(1_000)))
            .pool_max_idle_per_host(8)
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .context("building rpc http client")?;

        Ok(Self {
            http,
            primary,
            fallbacks,
            state: Mutex::new(EndpointState::default()),
            request_id: AtomicU64::new(1),
            request_timeout_ms,
            metrics,
        })
    }

    pub fn primary_url(&self) -> &str {
        &self.primary
    }

    pub fn primary_healthy(&self) -> bool {
        self.state.lock().primary_down_since.is_none()
    }

    fn pick_url(&self) -> String {
        let mut state = self.state.lock();
        match state.primary_down_since {
            None => self.primary.clone(),
            Some(since) => {
                if since.elapsed() >= Duration::from_secs(PRIMARY_REPROBE_SECS)
                    || self.fallbacks.is_empty()
                {
                    debug!("re-probing primary rpc endpoint");
                    self.primary.clone()
                } else {
                    let url = self.fallbacks[state.fallback_cursor % self.fallbacks.len()].clone();
                    state.fallback_cursor += 1;
                    url
                }
            }
        }
    }

    fn note_outcome(&self, url: &str, err: Option<&anyhow::Error>) {
        if url != self.primary {
            return;
        }
        let mut state = self.state.lock();
        match err {
            None => {
                if state.primary_down_since.take().is_some() {
                    info!("✅ primary rpc endpoint recovered");
                }
                state.primary_failures = 0;
            }
            Some(e) if classify(e) == ErrorClass::Retryable => {
                state.primary_failures += 1;
                if state.primary_failures >= FAILOVER_THRESHOLD
                    && state.primary_down_since.is_none()
                {
                    warn!(
                        failures = state.primary_failures,
                        "⚠️ primary rpc marked down, failing over"
                    );
                    state.primary_down_since = Some(Instant::now());
                    self.metrics.rpc_failovers.fetch_add(1, Ordering::Relaxed);
                }
            }
            // Fatal / unknown errors say nothing about endpoint health.
            Some(_) => {}
        }
    }

    pub async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T> {
        let url = self.pick_url();
        let result = self.call_url(&url, method, params).await;
        self.note_outcome(&url, result.as_ref().err());
        result
    }

    async fn call_url<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        method: &str,
        params: Value,
    ) -> Result<T> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let method_owned = method.to_string();
        let response: Value = with_timeout(method, self.request_timeout_ms, async {
            let resp = self
                .http
                .post(url)
                .json(&body)
                .send()
                .await
                .with_context(|| format!("rpc send ({method_owned})"))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(RpcError {
                    method: method_owned.clone(),
                    message: format!("HTTP {status}"),
                }
                .into());
            }

            resp.json::<Value>()
                .await
                .with_context(|| format!("rpc decode ({method_owned})"))
        })
        .await?;

        if let Some(err) = response.get("error").filter(|e| !e.is_null()) {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown rpc error")
                .to_string();
            let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
            return Err(RpcError {
                method: method.to_string(),
                message: format!("{message} (code {code})"),
            }
            .into());
        }

        let result = response
            .get("result")
            .cloned()
            .ok_or_else(|| RpcError {
                method: method.to_string(),
                message: "response missing result".to_string(),
            })?;

        serde_json::from_value(result).with_context(|| format!("rpc result shape ({method})"))
    }

    // ---- typed methods ----------------------------------------------------

    pub async fn get_slot(&self) -> Result<u64> {
        self.call("getSlot", json!([{"commitment": "confirmed"}]))
            .await
    }

    pub async fn get_block_height(&self) -> Result<u64> {
        self.call("getBlockHeight", json!([{"commitment": "confirmed"}]))
            .await
    }

    pub async fn get_balance(&self, pubkey: &Pubkey) -> Result<u64> {
        #[derive(Deserialize)]
        struct Resp {
            value: u64,
        }
        let resp: Resp = self
            .call("getBalance", json!([pubkey.to_string()]))
            .await?;
        Ok(resp.value)
    }

    pub async fn get_latest_blockhash(&self, commitment: &str) -> Result<LatestBlockhash> {
        #[derive(Deserialize)]
        struct Resp {
            context: ContextPart,
            value: ValuePart,
        }
        #[derive(Deserialize)]
        struct ContextPart {
            slot: u64,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ValuePart {
            blockhash: String,
            last_valid_block_height: u64,
        }

        let resp: Resp = self
            .call("getLatestBlockhash", json!([{"commitment": commitment}]))
            .await?;

        let blockhash = resp
            .value
            .blockhash
            .parse::<Hash>()
            .context("blockhash parse")?;
        Ok(LatestBlockhash {
            blockhash,
            last_valid_block_height: resp.value.last_valid_block_height,
            slot: resp.context.slot,
        })
    }

    pub async fn get_account_info(&self, pubkey: &Pubkey) -> Result<Option<AccountInfo>> {
        #[derive(Deserialize)]
        struct Resp {
            context: ContextPart,
            value: Option<AccountPart>,
        }
        #[derive(Deserialize)]
        struct ContextPart {
            slot: u64,
        }
        #[derive(Deserialize)]
        struct AccountPart {
            data: (String, String),
            owner: String,
            lamports: u64,
        }

        let resp: Resp = self
            .call(
                "getAccountInfo",
                json!([pubkey.to_string(), {"encoding": "base64", "commitment": "confirmed"}]),
            )
            .await?;

        match resp.value {
            None => Ok(None),
            Some(account) => Ok(Some(AccountInfo {
                data: BASE64
                    .decode(account.data.0.as_bytes())
                    .context("account data base64")?,
                owner: account.owner,
                lamports: account.lamports,
                slot: resp.context.slot,
            })),
        }
    }

    /// Fetch every account of `program` matching an exact data size.
    pub async fn get_program_accounts(
        &self,
        program: &Pubkey,
        data_size: Option<u64>,
    ) -> Result<Vec<KeyedAccount>> {
        #[derive(Deserialize)]
        struct Resp {
            context: ContextPart,
            value: Vec<Entry>,
        }
        #[derive(Deserialize)]
        struct ContextPart {
            slot: u64,
        }
        #[derive(Deserialize)]
        struct Entry {
            pubkey: String,
            account: AccountPart,
        }
        #[derive(Deserialize)]
        struct AccountPart {
            data: (String, String),
        }

        let mut config = json!({
            "encoding": "base64",
            "commitment": "confirmed",
            "withContext": true,
        });
        if let Some(size) = data_size {
            config["filters"] = json!([{"dataSize": size}]);
        }

        let resp: Resp = self
            .call("getProgramAccounts", json!([program.to_string(), config]))
            .await?;

        let mut accounts = Vec::with_capacity(resp.value.len());
        for entry in resp.value {
            accounts.push(KeyedAccount {
                pubkey: entry.pubkey.parse().context("program account pubkey")?,
                data: BASE64
                    .decode(entry.account.data.0.as_bytes())
                    .context("program account base64")?,
                slot: resp.context.slot,
            });
        }
        Ok(accounts)
    }

    pub async fn send_transaction(&self, tx: &Transaction) -> Result<Signature> {
        let wire = bincode::serialize(tx).context("transaction serialize")?;
        let encoded = BASE64.encode(wire);
        let signature: String = self
            .call(
                "sendTransaction",
                json!([encoded, {
                    "encoding": "base64",
                    "skipPreflight": false,
                    "preflightCommitment": "confirmed",
                    "maxRetries": 0,
                }]),
            )
            .await?;
        signature.parse().context("signature parse")
    }

    pub async fn simulate_transaction(&self, tx: &Transaction) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct Resp {
            value: SimValue,
        }
        #[derive(Deserialize)]
        struct SimValue {
            err: Option<Value>,
            logs: Option<Vec<String>>,
        }

        let wire = bincode::serialize(tx).context("transaction serialize")?;
        let encoded = BASE64.encode(wire);
        let resp: Resp = self
            .call(
                "simulateTransaction",
                json!([encoded, {"encoding": "base64", "commitment": "confirmed"}]),
            )
            .await?;

        if let Some(err) = resp.value.err {
            bail!("instruction error during simulation: {err}");
        }
        Ok(resp.value.logs.unwrap_or_default())
    }

    /// Poll signature status until confirmation, blockhash expiry, or the
    /// caller's time budget elapses.
    pub async fn confirm_transaction(
        &self,
        signature: &Signature,
        last_valid_block_height: u64,
        timeout_ms: u64,
        cancel: Option<&CancelToken>,
    ) -> Result<ConfirmStatus> {
        #[derive(Deserialize)]
        struct Resp {
            value: Vec<Option<StatusPart>>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct StatusPart {
            slot: u64,
            err: Option<Value>,
            confirmation_status: Option<String>,
        }

        let started = Instant::now();
        loop {
            let resp: Resp = self
                .call(
                    "getSignatureStatuses",
                    json!([[signature.to_string()], {"searchTransactionHistory": false}]),
                )
                .await?;

            if let Some(Some(status)) = resp.value.first() {
                if let Some(err) = &status.err {
                    bail!("instruction error in transaction {signature}: {err}");
                }
                if matches!(
                    status.confirmation_status.as_deref(),
                    Some("confirmed") | Some("finalized")
                ) {
                    return Ok(ConfirmStatus::Confirmed { slot: status.slot });
                }
            }

            let height = self.get_block_height().await?;
            if height > last_valid_block_height {
                return Ok(ConfirmStatus::Expired);
            }

            if started.elapsed().as_millis() as u64 >= timeout_ms {
                bail!("confirmation of {signature} timed out after {timeout_ms}ms");
            }
            if !delay(CONFIRM_POLL_INTERVAL_MS, cancel).await {
                bail!("confirmation of {signature} cancelled");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with(fallbacks: Vec<String>) -> RpcClient {
        RpcClient::new(
            "http://primary.invalid".to_string(),
            fallbacks,
            1_000,
            Arc::new(CrankMetrics::new()),
        )
        .unwrap()
    }

    #[test]
    fn picks_primary_while_healthy() {
        let client = client_with(vec!["http://fb1.invalid".into()]);
        assert_eq!(client.pick_url(), "http://primary.invalid");
        assert!(client.primary_healthy());
    }

    #[test]
    fn fails_over_after_threshold_and_round_robins() {
        let client = client_with(vec!["http://fb1.invalid".into(), "http://fb2.invalid".into()]);

        let transient: anyhow::Error = RpcError {
            method: "getSlot".into(),
            message: "connection reset by peer".into(),
        }
        .into();
        for _ in 0..FAILOVER_THRESHOLD {
            client.note_outcome("http://primary.invalid", Some(&transient));
        }
        assert!(!client.primary_healthy());

        let first = client.pick_url();
        let second = client.pick_url();
        assert_ne!(first, "http://primary.invalid");
        assert_ne!(second, "http://primary.invalid");
        assert_ne!(first, second);
    }

    #[test]
    fn fatal_errors_do_not_trip_failover() {
        let client = client_with(vec!["http://fb1.invalid".into()]);
        let fatal: anyhow::Error = RpcError {
            method: "sendTransaction".into(),
            message: "custom program error: 0x1".into(),
        }
        .into();
        for _ in 0..10 {
            client.note_outcome("http://primary.invalid", Some(&fatal));
        }
        assert!(client.primary_healthy());
    }

    #[test]
    fn success_resets_failure_count() {
        let client = client_with(vec!["http://fb1.invalid".into()]);
        let transient: anyhow::Error = RpcError {
            method: "getSlot".into(),
            message: "HTTP 503 Service Unavailable".into(),
        }
        .into();
        client.note_outcome("http://primary.invalid", Some(&transient));
        client.note_outcome("http://primary.invalid", None);
        assert_eq!(client.state.lock().primary_failures, 0);
    }
}
