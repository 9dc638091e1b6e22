//! Crank metrics registry.
//!
//! Monotone counters and gauges held in process memory, mutated by the
//! owning service and snapshotted by readers. Rendered to Prometheus text
//! by hand for the /metrics endpoint; reset only on process restart.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Numeric encoding of the crank state for the `crank_status` gauge.
pub const STATUS_STOPPED: u8 = 0;
pub const STATUS_STARTING: u8 = 1;
pub const STATUS_RUNNING: u8 = 2;
pub const STATUS_PAUSED: u8 = 3;
pub const STATUS_ERROR: u8 = 4;

#[derive(Debug)]
pub struct CrankMetrics {
    started_at: Instant,

    // Counters
    pub total_polls: AtomicU64,
    pub total_match_attempts: AtomicU64,
    pub successful_matches: AtomicU64,
    pub failed_matches: AtomicU64,
    pub validation_errors: AtomicU64,
    pub rpc_failovers: AtomicU64,
    pub circuit_breaker_trips: AtomicU64,

    // Gauges
    pub status: AtomicU8,
    pub consecutive_errors: AtomicU32,
    pub open_order_count: AtomicU64,
    pub pending_matches: AtomicU64,
    pub wallet_balance_lamports: AtomicU64,
    pub ws_reconnect_attempts: AtomicU32,
    pub blockhash_cache_size: AtomicU64,
    pub pending_ops_ready: AtomicI64,
}

impl Default for CrankMetrics {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            total_polls: AtomicU64::new(0),
            total_match_attempts: AtomicU64::new(0),
            successful_matches: AtomicU64::new(0),
            failed_matches: AtomicU64::new(0),
            validation_errors: AtomicU64::new(0),
            rpc_failovers: AtomicU64::new(0),
            circuit_breaker_trips: AtomicU64::new(0),
            status: AtomicU8::new(STATUS_STOPPED),
            consecutive_errors: AtomicU32::new(0),
            open_order_count: AtomicU64::new(0),
            pending_matches: AtomicU64::new(0),
            wallet_balance_lamports: AtomicU64::new(0),
            ws_reconnect_attempts: AtomicU32::new(0),
            blockhash_cache_size: AtomicU64::new(0),
            pending_ops_ready: AtomicI64::new(0),
        }
    }
}

/// Point-in-time copy of every metric, serialized into the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub total_polls: u64,
    pub total_match_attempts: u64,
    pub successful_matches: u64,
    pub failed_matches: u64,
    pub validation_errors: u64,
    pub rpc_failovers: u64,
    pub circuit_breaker_trips: u64,
    pub status: u8,
    pub consecutive_errors: u32,
    pub open_order_count: u64,
    pub pending_matches: u64,
    pub wallet_balance_lamports: u64,
    pub ws_reconnect_attempts: u32,
    pub blockhash_cache_size: u64,
    pub pending_ops_ready: i64,
}

impl CrankMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, status: u8) {
        self.status.store(status, Ordering::Relaxed);
    }

    pub fn record_poll(&self) {
        self.total_polls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_match_attempt(&self) {
        self.total_match_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_match_success(&self) {
        self.successful_matches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_match_failure(&self) {
        self.failed_matches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_validation_error(&self) {
        self.validation_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            total_polls: self.total_polls.load(Ordering::Relaxed),
            total_match_attempts: self.total_match_attempts.load(Ordering::Relaxed),
            successful_matches: self.successful_matches.load(Ordering::Relaxed),
            failed_matches: self.failed_matches.load(Ordering::Relaxed),
            validation_errors: self.validation_errors.load(Ordering::Relaxed),
            rpc_failovers: self.rpc_failovers.load(Ordering::Relaxed),
            circuit_breaker_trips: self.circuit_breaker_trips.load(Ordering::Relaxed),
            status: self.status.load(Ordering::Relaxed),
            consecutive_errors: self.consecutive_errors.load(Ordering::Relaxed),
            open_order_count: self.open_order_count.load(Ordering::Relaxed),
            pending_matches: self.pending_matches.load(Ordering::Relaxed),
            wallet_balance_lamports: self.wallet_balance_lamports.load(Ordering::Relaxed),
            ws_reconnect_attempts: self.ws_reconnect_attempts.load(Ordering::Relaxed),
            blockhash_cache_size: self.blockhash_cache_size.load(Ordering::Relaxed),
            pending_ops_ready: self.pending_ops_ready.load(Ordering::Relaxed),
        }
    }

    /// Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::with_capacity(2048);

        let mut counter = |name: &str, help: &str, value: u64| {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
            ));
        };
        counter("crank_polls_total", "Poll loop ticks", s.total_polls);
        counter(
            "crank_match_attempts_total",
            "Match attempts started",
            s.total_match_attempts,
        );
        counter(
            "crank_matches_success_total",
            "Matches settled on chain",
            s.successful_matches,
        );
        counter(
            "crank_matches_failed_total",
            "Match attempts that did not settle",
            s.failed_matches,
        );
        counter(
            "crank_validation_errors_total",
            "Payloads rejected at the boundary",
            s.validation_errors,
        );
        counter(
            "crank_rpc_failovers_total",
            "Primary RPC failovers",
            s.rpc_failovers,
        );
        counter(
            "crank_circuit_breaker_trips_total",
            "Circuit breaker activations",
            s.circuit_breaker_trips,
        );

        let mut gauge = |name: &str, help: &str, value: i64| {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"
            ));
        };
        gauge("crank_status", "0=stopped 1=starting 2=running 3=paused 4=error", s.status as i64);
        gauge(
            "crank_consecutive_errors",
            "Consecutive poll errors",
            s.consecutive_errors as i64,
        );
        gauge(
            "crank_open_orders",
            "Active orders seen last poll",
            s.open_order_count as i64,
        );
        gauge(
            "crank_pending_matches",
            "Order pairs currently locked",
            s.pending_matches as i64,
        );
        gauge(
            "crank_wallet_balance_lamports",
            "Crank wallet balance",
            s.wallet_balance_lamports as i64,
        );
        gauge(
            "crank_ws_reconnect_attempts",
            "Order subscription reconnect attempts",
            s.ws_reconnect_attempts as i64,
        );
        gauge(
            "crank_blockhash_cache_size",
            "Cached blockhashes",
            s.blockhash_cache_size as i64,
        );
        gauge(
            "crank_pending_ops_ready",
            "Pending operations ready to process",
            s.pending_ops_ready,
        );
        gauge("crank_uptime_seconds", "Process uptime", s.uptime_secs as i64);

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotone_and_snapshot_consistent() {
        let m = CrankMetrics::new();
        m.record_poll();
        m.record_poll();
        m.record_match_attempt();
        m.record_match_success();
        m.set_status(STATUS_RUNNING);

        let snap = m.snapshot();
        assert_eq!(snap.total_polls, 2);
        assert_eq!(snap.total_match_attempts, 1);
        assert_eq!(snap.successful_matches, 1);
        assert_eq!(snap.status, STATUS_RUNNING);
    }

    #[test]
    fn prometheus_render_contains_every_series() {
        let m = CrankMetrics::new();
        m.record_match_failure();
        let text = m.render_prometheus();
        for series in [
            "crank_polls_total",
            "crank_matches_failed_total 1",
            "crank_status",
            "crank_pending_matches",
            "crank_wallet_balance_lamports",
        ] {
            assert!(text.contains(series), "missing {series}");
        }
    }
}
