//! Crank service.
//!
//! The orchestrator: polls open orders, selects candidates, fans out match
//! attempts, and keeps the pipeline alive through errors with a circuit
//! breaker. One logical poll loop; background tasks (blockhash refresher,
//! order subscription, lock heartbeat, stale-lock releaser, maintenance
//! sweep) run independently.

pub mod executor;
pub mod order_locks;
pub mod selector;

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use solana_sdk::pubkey::Pubkey;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::chain::blockhash::BlockhashCache;
use crate::chain::order::{decode_order, Order, OrderSide, ORDER_ACCOUNT_SIZE};
use crate::chain::rpc::RpcClient;
use crate::chain::subscriber::OrderCache;
use crate::config::CrankConfig;
use crate::crank::executor::{MatchOutcome, SettlementExecutor};
use crate::crank::order_locks::OrderLockManager;
use crate::crank::selector::select_candidates;
use crate::db::dist_lock::{
    AcquireOptions, DistributedLockService, LOCK_DB_MAINTENANCE, LOCK_ORDER_MATCHING, LOCK_STARTUP,
};
use crate::db::pending_ops::{OpType, PendingOpRepo};
use crate::db::settlements::SettlementRepo;
use crate::db::Database;
use crate::metrics::{
    CrankMetrics, STATUS_ERROR, STATUS_PAUSED, STATUS_RUNNING, STATUS_STARTING, STATUS_STOPPED,
};
use crate::mpc::events::MpcEvent;
use crate::util::timeout::{delay, with_timeout, CancelToken};

const STALE_LOCK_SWEEP_INTERVAL_MS: u64 = 60_000;
const MAINTENANCE_INTERVAL_MS: u64 = 24 * 60 * 60 * 1_000;
const RECOVERY_BATCH: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrankStatus {
    Stopped,
    Starting,
    Running,
    Paused,
    Error,
}

impl CrankStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrankStatus::Stopped => "stopped",
            CrankStatus::Starting => "starting",
            CrankStatus::Running => "running",
            CrankStatus::Paused => "paused",
            CrankStatus::Error => "error",
        }
    }

    fn metric_code(&self) -> u8 {
        match self {
            CrankStatus::Stopped => STATUS_STOPPED,
            CrankStatus::Starting => STATUS_STARTING,
            CrankStatus::Running => STATUS_RUNNING,
            CrankStatus::Paused => STATUS_PAUSED,
            CrankStatus::Error => STATUS_ERROR,
        }
    }
}

/// Counter + flag pair: after `threshold` consecutive errors new poll work
/// is suppressed for `pause`; the flag and the counter clear together once
/// the pause elapses.
pub struct CircuitBreaker {
    threshold: u32,
    pause: Duration,
    consecutive_errors: AtomicU32,
    tripped_at: Mutex<Option<Instant>>,
    metrics: Arc<CrankMetrics>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, pause: Duration, metrics: Arc<CrankMetrics>) -> Self {
        Self {
            threshold,
            pause,
            consecutive_errors: AtomicU32::new(0),
            tripped_at: Mutex::new(None),
            metrics,
        }
    }

    pub fn record_error(&self) {
        let count = self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.consecutive_errors.store(count, Ordering::Relaxed);
        if count >= self.threshold {
            let mut tripped = self.tripped_at.lock();
            if tripped.is_none() {
                *tripped = Some(Instant::now());
                self.metrics
                    .circuit_breaker_trips
                    .fetch_add(1, Ordering::Relaxed);
                error!(
                    consecutive_errors = count,
                    pause_ms = self.pause.as_millis() as u64,
                    "🛑 circuit breaker tripped"
                );
            }
        }
    }

    pub fn record_success(&self) {
        self.consecutive_errors.store(0, Ordering::SeqCst);
        self.metrics.consecutive_errors.store(0, Ordering::Relaxed);
    }

    /// True while the pause is in effect. Clears both the flag and the
    /// error counter once the pause duration has fully elapsed.
    pub fn is_open(&self) -> bool {
        let mut tripped = self.tripped_at.lock();
        match *tripped {
            None => false,
            Some(at) if at.elapsed() < self.pause => true,
            Some(_) => {
                *tripped = None;
                drop(tripped);
                self.record_success();
                info!("circuit breaker cleared");
                false
            }
        }
    }

    pub fn reset(&self) {
        *self.tripped_at.lock() = None;
        self.record_success();
    }

    pub fn error_count(&self) -> u32 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    fn backdate_trip(&self, age: Duration) {
        *self.tripped_at.lock() = Some(Instant::now() - age);
    }
}

struct CrankInner {
    config: CrankConfig,
    db: Database,
    rpc: Arc<RpcClient>,
    order_cache: Arc<OrderCache>,
    blockhash: Arc<BlockhashCache>,
    order_locks: Arc<OrderLockManager>,
    dist_locks: DistributedLockService,
    pending_ops: PendingOpRepo,
    settlements: SettlementRepo,
    executor: Arc<SettlementExecutor>,
    metrics: Arc<CrankMetrics>,
    status: RwLock<CrankStatus>,
    breaker: CircuitBreaker,
    cancel: Mutex<CancelToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    wallet_pubkey: Pubkey,
}

#[derive(Clone)]
pub struct CrankService {
    inner: Arc<CrankInner>,
}

impl CrankService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CrankConfig,
        db: Database,
        rpc: Arc<RpcClient>,
        order_cache: Arc<OrderCache>,
        blockhash: Arc<BlockhashCache>,
        order_locks: Arc<OrderLockManager>,
        dist_locks: DistributedLockService,
        pending_ops: PendingOpRepo,
        settlements: SettlementRepo,
        executor: Arc<SettlementExecutor>,
        metrics: Arc<CrankMetrics>,
        wallet_pubkey: Pubkey,
    ) -> Self {
        let breaker = CircuitBreaker::new(
            config.error_threshold,
            Duration::from_millis(config.pause_duration_ms),
            Arc::clone(&metrics),
        );
        Self {
            inner: Arc::new(CrankInner {
                config,
                db,
                rpc,
                order_cache,
                blockhash,
                order_locks,
                dist_locks,
                pending_ops,
                settlements,
                executor,
                metrics,
                status: RwLock::new(CrankStatus::Stopped),
                breaker,
                cancel: Mutex::new(CancelToken::new()),
                tasks: Mutex::new(Vec::new()),
                wallet_pubkey,
            }),
        }
    }

    pub fn status(&self) -> CrankStatus {
        *self.inner.status.read()
    }

    fn set_status(&self, status: CrankStatus) {
        *self.inner.status.write() = status;
        self.inner.metrics.set_status(status.metric_code());
    }

    pub fn metrics(&self) -> Arc<CrankMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    pub fn order_cache(&self) -> Arc<OrderCache> {
        Arc::clone(&self.inner.order_cache)
    }

    /// Start the crank: startup lock, recovery, workload lock, background
    /// tasks, then the poll loop with one immediate tick.
    pub async fn start(&self) -> Result<()> {
        match self.status() {
            CrankStatus::Stopped | CrankStatus::Error => {}
            other => bail!("cannot start from state '{}'", other.as_str()),
        }
        self.set_status(CrankStatus::Starting);
        *self.inner.cancel.lock() = CancelToken::new();

        let startup_opts = AcquireOptions {
            ttl_secs: 120,
            retry: true,
            max_retries: 5,
            retry_delay_ms: 1_000,
            metadata: Some("startup".to_string()),
        };
        let inner = &self.inner;
        let startup = inner
            .dist_locks
            .with_lock(LOCK_STARTUP, &startup_opts, || async move {
                self.recover_pending_operations().await?;

                let matching_opts = AcquireOptions {
                    ttl_secs: ((inner.config.polling_interval_ms * 3) / 1_000).max(60) as i64,
                    retry: true,
                    max_retries: 3,
                    retry_delay_ms: 2_000,
                    metadata: Some("poll loop".to_string()),
                };
                if !inner.dist_locks.acquire(LOCK_ORDER_MATCHING, &matching_opts).await? {
                    bail!("another crank instance holds the order-matching lock");
                }
                Ok(())
            })
            .await;

        if let Err(e) = startup {
            self.set_status(CrankStatus::Error);
            return Err(e).context("crank startup");
        }

        self.inner.dist_locks.start_heartbeat();
        self.inner.blockhash.start();
        self.inner.order_cache.start();
        self.spawn_background_tasks();

        self.set_status(CrankStatus::Running);
        info!(
            interval_ms = self.inner.config.polling_interval_ms,
            max_concurrent = self.inner.config.max_concurrent_matches,
            "🚀 crank running"
        );

        let service = self.clone();
        let cancel = self.inner.cancel.lock().clone();
        let handle = tokio::spawn(async move {
            loop {
                if service.status() == CrankStatus::Running {
                    service.poll_tick().await;
                }
                if !delay(service.inner.config.polling_interval_ms, Some(&cancel)).await {
                    return;
                }
            }
        });
        self.inner.tasks.lock().push(handle);
        Ok(())
    }

    fn spawn_background_tasks(&self) {
        let cancel = self.inner.cancel.lock().clone();
        let mut tasks = self.inner.tasks.lock();

        // Stale pending-op lock releaser.
        let pending_ops = self.inner.pending_ops.clone();
        let sweep_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                if !delay(STALE_LOCK_SWEEP_INTERVAL_MS, Some(&sweep_cancel)).await {
                    return;
                }
                match pending_ops.release_stale_locks(300).await {
                    Ok(0) => {}
                    Ok(released) => warn!(released, "released stale pending-op locks"),
                    Err(e) => warn!(err = %e, "stale lock sweep failed"),
                }
            }
        }));

        // Daily store maintenance, serialized across instances.
        let db = self.inner.db.clone();
        let dist_locks = self.inner.dist_locks.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                if !delay(MAINTENANCE_INTERVAL_MS, Some(&cancel)).await {
                    return;
                }
                let opts = AcquireOptions {
                    ttl_secs: 300,
                    ..Default::default()
                };
                let db = db.clone();
                let result = dist_locks
                    .with_lock(LOCK_DB_MAINTENANCE, &opts, || async move {
                        db.maintenance().await
                    })
                    .await;
                if let Err(e) = result {
                    warn!(err = %e, "maintenance sweep skipped");
                }
            }
        }));
    }

    /// Graceful stop: no new work, drain in-flight tasks up to the
    /// shutdown budget, then release locks best-effort.
    pub async fn stop(&self) {
        if self.status() == CrankStatus::Stopped {
            return;
        }
        self.set_status(CrankStatus::Stopped);
        self.inner.cancel.lock().cancel();

        let handles: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        let drain = with_timeout(
            "shutdown drain",
            self.inner.config.shutdown_timeout_ms,
            async {
                for handle in &handles {
                    while !handle.is_finished() {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
                Ok(())
            },
        )
        .await;
        if drain.is_err() {
            warn!("shutdown budget elapsed, aborting remaining tasks");
        }
        for handle in handles {
            handle.abort();
        }

        self.inner.order_cache.stop();
        self.inner.blockhash.stop();
        self.inner.order_locks.release_all();
        if let Err(e) = self.inner.dist_locks.release_all().await {
            warn!(err = %e, "distributed lock release failed during stop");
        }
        info!("crank stopped");
    }

    /// Pause: keep locks and in-flight work, skip future ticks.
    pub fn pause(&self) -> Result<()> {
        if self.status() != CrankStatus::Running {
            bail!("cannot pause from state '{}'", self.status().as_str());
        }
        self.set_status(CrankStatus::Paused);
        info!("crank paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        if self.status() != CrankStatus::Paused {
            bail!("cannot resume from state '{}'", self.status().as_str());
        }
        self.inner.breaker.reset();
        self.set_status(CrankStatus::Running);
        info!("crank resumed");
        Ok(())
    }

    /// Operator escape hatch: fail every in-progress operation and release
    /// their order locks. No refunds, no on-chain rollback.
    pub async fn skip_pending_mpc(&self) -> Result<usize> {
        let failed = self
            .inner
            .pending_ops
            .fail_all_in_progress("skipped by operator (skip-pending-mpc)")
            .await?;

        for op in &failed {
            if let Ok(payload) = serde_json::from_str::<serde_json::Value>(&op.payload) {
                for side in ["buy_order", "sell_order"] {
                    if let Some(pda) = payload.get(side).and_then(serde_json::Value::as_str) {
                        self.inner.order_locks.release_lock(pda);
                    }
                }
            }
        }
        warn!(count = failed.len(), "⚠️ skip-pending-mpc: in-progress operations failed");
        Ok(failed.len())
    }

    /// One poll tick: circuit breaker gate, order snapshot, selection,
    /// bounded fan-out, metrics.
    pub async fn poll_tick(&self) {
        if self.inner.breaker.is_open() {
            debug!("circuit breaker open, skipping poll");
            return;
        }
        self.inner.metrics.record_poll();

        let orders = match self.fetch_open_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(err = %e, "order fetch failed");
                self.inner.breaker.record_error();
                return;
            }
        };

        let open: Vec<Order> = orders
            .into_iter()
            .filter(Order::is_open_for_matching)
            .collect();
        self.inner
            .metrics
            .open_order_count
            .store(open.len() as u64, Ordering::Relaxed);

        let buys = open.iter().filter(|o| o.side == OrderSide::Buy).count();
        let sells = open.len() - buys;
        if buys == 0 || sells == 0 {
            self.inner.breaker.record_success();
            self.update_gauges().await;
            return;
        }

        let locked: HashSet<String> = self.inner.order_locks.locked_orders();
        let candidates =
            select_candidates(&open, &locked, self.inner.config.max_concurrent_matches);
        debug!(
            open = open.len(),
            buys,
            sells,
            candidates = candidates.len(),
            "poll tick"
        );

        let attempts = candidates
            .iter()
            .map(|candidate| self.inner.executor.execute_match(candidate));
        let outcomes = futures_util::future::join_all(attempts).await;

        for outcome in outcomes {
            match outcome {
                MatchOutcome::Settled { .. } => {
                    self.inner.metrics.record_match_attempt();
                    self.inner.metrics.record_match_success();
                    self.inner.breaker.record_success();
                }
                MatchOutcome::NoMatch => {
                    self.inner.metrics.record_match_attempt();
                    self.inner.metrics.record_match_failure();
                    self.inner.breaker.record_success();
                }
                MatchOutcome::Failed { error, fatal } => {
                    self.inner.metrics.record_match_attempt();
                    self.inner.metrics.record_match_failure();
                    self.inner.breaker.record_error();
                    if fatal {
                        error!(err = %error, "match attempt failed (fatal)");
                    } else {
                        warn!(err = %error, "match attempt failed (will retry)");
                    }
                }
                MatchOutcome::Skipped { reason } => {
                    debug!(reason = %reason, "candidate skipped");
                }
            }
        }

        self.update_gauges().await;
    }

    async fn update_gauges(&self) {
        self.inner.metrics.pending_matches.store(
            self.inner.order_locks.pending_match_count() as u64,
            Ordering::Relaxed,
        );
        if let Ok(counts) = self.inner.pending_ops.count_by_status().await {
            let ready = counts.get("pending").copied().unwrap_or(0)
                + counts.get("in_progress").copied().unwrap_or(0);
            self.inner
                .metrics
                .pending_ops_ready
                .store(ready, Ordering::Relaxed);
        }
        if let Ok(balance) = self.inner.rpc.get_balance(&self.inner.wallet_pubkey).await {
            self.inner
                .metrics
                .wallet_balance_lamports
                .store(balance, Ordering::Relaxed);
        }
    }

    /// Open orders from the push cache when the subscription is live,
    /// otherwise from RPC (refilling the cache).
    async fn fetch_open_orders(&self) -> Result<Vec<Order>> {
        let mut orders = Vec::new();

        if self.inner.order_cache.is_active() {
            let snapshot = self.inner.order_cache.snapshot();
            if !snapshot.is_empty() {
                for (pda, entry) in snapshot {
                    let Ok(pubkey) = Pubkey::from_str(&pda) else {
                        continue;
                    };
                    match decode_order(pubkey, &entry.data, entry.slot) {
                        Ok(order) => orders.push(order),
                        Err(e) => {
                            self.inner.metrics.record_validation_error();
                            debug!(pda = %pda, err = %e, "undecodable cached order");
                        }
                    }
                }
                return Ok(orders);
            }
        }

        let accounts = self
            .inner
            .rpc
            .get_program_accounts(&self.inner.config.dex_program_id, Some(ORDER_ACCOUNT_SIZE as u64))
            .await
            .context("getProgramAccounts")?;
        for account in accounts {
            let pda = account.pubkey.to_string();
            match decode_order(account.pubkey, &account.data, account.slot) {
                Ok(order) => {
                    self.inner.order_cache.set(&pda, account.data, account.slot);
                    orders.push(order);
                }
                Err(e) => {
                    self.inner.metrics.record_validation_error();
                    debug!(pda = %pda, err = %e, "undecodable order account");
                }
            }
        }
        Ok(orders)
    }

    /// Startup recovery: orphan fill callbacks resume settlement; orphan
    /// compare callbacks are completed (the pair is re-proposed by the next
    /// poll). Runs under the startup lock.
    async fn recover_pending_operations(&self) -> Result<()> {
        let callbacks = self
            .inner
            .pending_ops
            .find_ready_to_process(Some(OpType::MpcCallback), RECOVERY_BATCH)
            .await?;

        for op in callbacks {
            let event = match MpcEvent::from_payload(&op.payload) {
                Ok(event) => event,
                Err(e) => {
                    self.inner.metrics.record_validation_error();
                    self.inner
                        .pending_ops
                        .mark_failed(&op.id, &format!("unreadable callback payload: {e}"))
                        .await?;
                    continue;
                }
            };

            match event {
                MpcEvent::PriceCompare(result) => {
                    debug!(
                        prices_match = result.prices_match,
                        "orphan compare callback completed; pair will be re-proposed"
                    );
                    self.inner.pending_ops.mark_completed(&op.id).await?;
                }
                MpcEvent::FillCalculation(fill) => {
                    if !self
                        .inner
                        .pending_ops
                        .mark_in_progress(&op.id, self.inner.dist_locks.owner_id())
                        .await?
                    {
                        continue;
                    }
                    let outcome = match self.pair_of(&fill.buy_order).await {
                        Ok(pair) => {
                            let request = crate::db::settlements::SettlementRequest {
                                request_id: hex::encode(fill.request_id),
                                buy_order: fill.buy_order.to_string(),
                                sell_order: fill.sell_order.to_string(),
                                pair: pair.to_string(),
                                encrypted_fill_amount: fill.encrypted_fill_amount.to_vec(),
                                buy_fully_filled: fill.buy_fully_filled,
                                sell_fully_filled: fill.sell_fully_filled,
                                status: "pending".to_string(),
                                tx_signature: None,
                                created_at: op.created_at,
                                updated_at: op.created_at,
                            };
                            self.inner.executor.settle_from_request(&request).await
                        }
                        Err(e) => MatchOutcome::Failed {
                            error: format!("{e:#}"),
                            fatal: false,
                        },
                    };
                    match outcome {
                        MatchOutcome::Settled { .. } => {
                            info!(op = %op.id, "recovered settlement from orphan callback");
                            self.inner.pending_ops.mark_completed(&op.id).await?;
                        }
                        MatchOutcome::Failed { error, fatal: true } => {
                            self.inner.pending_ops.mark_failed(&op.id, &error).await?;
                        }
                        MatchOutcome::Failed { error, fatal: false } => {
                            self.inner.pending_ops.reset_for_retry(&op.id, &error).await?;
                        }
                        MatchOutcome::NoMatch | MatchOutcome::Skipped { .. } => {
                            self.inner.pending_ops.mark_completed(&op.id).await?;
                        }
                    }
                }
            }
        }

        // Unfinished settlement requests (crash between callback and
        // confirmation) are retried directly.
        let stale_settlements = self.inner.settlements.find_pending(RECOVERY_BATCH).await?;
        for request in stale_settlements {
            let outcome = self.inner.executor.settle_from_request(&request).await;
            if let MatchOutcome::Failed { error, .. } = outcome {
                warn!(request = %request.request_id, err = %error, "settlement recovery failed");
            }
        }
        Ok(())
    }

    async fn pair_of(&self, order_pda: &Pubkey) -> Result<Pubkey> {
        let account = self
            .inner
            .rpc
            .get_account_info(order_pda)
            .await?
            .with_context(|| format!("account not found: {order_pda}"))?;
        let order = decode_order(*order_pda, &account.data, account.slot)?;
        Ok(order.pair)
    }

    /// Status surface for the admin API.
    pub fn status_report(&self) -> serde_json::Value {
        serde_json::json!({
            "state": self.status().as_str(),
            "metrics": self.inner.metrics.snapshot(),
            "config": self.inner.config.summary(),
            "blockhash_cache": self.inner.blockhash.stats(),
            "order_cache": self.inner.order_cache.stats(),
            "held_locks": self.inner.dist_locks.list_held_locks(),
            "circuit_breaker_open": self.inner.breaker.is_open(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, pause_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            threshold,
            Duration::from_millis(pause_ms),
            Arc::new(CrankMetrics::new()),
        )
    }

    #[test]
    fn breaker_trips_at_threshold() {
        let breaker = breaker(3, 60_000);
        breaker.record_error();
        breaker.record_error();
        assert!(!breaker.is_open());
        breaker.record_error();
        assert!(breaker.is_open());
    }

    #[test]
    fn breaker_success_resets_count() {
        let breaker = breaker(3, 60_000);
        breaker.record_error();
        breaker.record_error();
        breaker.record_success();
        assert_eq!(breaker.error_count(), 0);
        breaker.record_error();
        breaker.record_error();
        assert!(!breaker.is_open());
    }

    #[test]
    fn breaker_clears_flag_and_counter_after_pause() {
        let breaker = breaker(2, 60_000);
        breaker.record_error();
        breaker.record_error();
        assert!(breaker.is_open());

        // Still inside the pause window.
        breaker.backdate_trip(Duration::from_millis(100));
        assert!(breaker.is_open());

        // Pause fully elapsed: both the flag and the counter clear.
        breaker.backdate_trip(Duration::from_millis(60_001));
        assert!(!breaker.is_open());
        assert_eq!(breaker.error_count(), 0);
        assert!(!breaker.is_open());
    }

    #[test]
    fn breaker_reset_clears_everything() {
        let breaker = breaker(1, 60_000);
        breaker.record_error();
        assert!(breaker.is_open());
        breaker.reset();
        assert!(!breaker.is_open());
        assert_eq!(breaker.error_count(), 0);
    }
}
