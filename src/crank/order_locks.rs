//! In-process pairwise order locks.
//!
//! Reserves a buy/sell pair for one match attempt within this process; the
//! distributed lock service serializes whole workloads above this. Entries
//! expire after 60 s, or 120 s once an MPC request id is attached, and a
//! sweep runs on every access. The manager's mutex is never held across an
//! await.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

const EXPIRY_UNTRACKED: Duration = Duration::from_secs(60);
const EXPIRY_WITH_REQUEST: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
struct OrderLock {
    locked_at: Instant,
    match_partner: String,
    request_id: Option<String>,
}

impl OrderLock {
    fn expired(&self) -> bool {
        let ttl = if self.request_id.is_some() {
            EXPIRY_WITH_REQUEST
        } else {
            EXPIRY_UNTRACKED
        };
        self.locked_at.elapsed() > ttl
    }
}

#[derive(Default)]
pub struct OrderLockManager {
    locks: Mutex<HashMap<String, OrderLock>>,
}

impl OrderLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn sweep(locks: &mut HashMap<String, OrderLock>) {
        locks.retain(|_, lock| !lock.expired());
    }

    /// All-or-nothing pairwise acquisition. Returns false when either side
    /// is already locked.
    pub fn acquire_locks(&self, buy_pda: &str, sell_pda: &str, request_id: Option<&str>) -> bool {
        let mut locks = self.locks.lock();
        Self::sweep(&mut locks);

        if locks.contains_key(buy_pda) || locks.contains_key(sell_pda) {
            return false;
        }

        let now = Instant::now();
        locks.insert(
            buy_pda.to_string(),
            OrderLock {
                locked_at: now,
                match_partner: sell_pda.to_string(),
                request_id: request_id.map(str::to_string),
            },
        );
        locks.insert(
            sell_pda.to_string(),
            OrderLock {
                locked_at: now,
                match_partner: buy_pda.to_string(),
                request_id: request_id.map(str::to_string),
            },
        );
        debug!(buy = buy_pda, sell = sell_pda, "pair locks acquired");
        true
    }

    /// Attach the MPC request id to both sides, extending their expiry to
    /// cover the finalization wait.
    pub fn attach_request_id(&self, buy_pda: &str, sell_pda: &str, request_id: &str) {
        let mut locks = self.locks.lock();
        let now = Instant::now();
        for pda in [buy_pda, sell_pda] {
            if let Some(lock) = locks.get_mut(pda) {
                lock.request_id = Some(request_id.to_string());
                lock.locked_at = now;
            }
        }
    }

    pub fn release_locks(&self, buy_pda: &str, sell_pda: &str) {
        let mut locks = self.locks.lock();
        locks.remove(buy_pda);
        locks.remove(sell_pda);
    }

    /// Release a single order's lock and its partner's.
    pub fn release_lock(&self, pda: &str) {
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.remove(pda) {
            locks.remove(&lock.match_partner);
        }
    }

    pub fn is_locked(&self, pda: &str) -> bool {
        let mut locks = self.locks.lock();
        Self::sweep(&mut locks);
        locks.contains_key(pda)
    }

    /// Snapshot of currently locked order PDAs, for the match selector.
    pub fn locked_orders(&self) -> HashSet<String> {
        let mut locks = self.locks.lock();
        Self::sweep(&mut locks);
        locks.keys().cloned().collect()
    }

    /// Number of pairs mid-match.
    pub fn pending_match_count(&self) -> usize {
        let mut locks = self.locks.lock();
        Self::sweep(&mut locks);
        locks.len() / 2
    }

    pub fn release_all(&self) {
        self.locks.lock().clear();
    }

    #[cfg(test)]
    fn backdate(&self, pda: &str, age: Duration) {
        if let Some(lock) = self.locks.lock().get_mut(pda) {
            lock.locked_at = Instant::now() - age;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairwise_acquire_is_all_or_nothing() {
        let manager = OrderLockManager::new();
        assert!(manager.acquire_locks("buy1", "sell1", None));
        // Either overlapping side blocks the whole pair.
        assert!(!manager.acquire_locks("buy1", "sell2", None));
        assert!(!manager.acquire_locks("buy2", "sell1", None));
        assert!(manager.acquire_locks("buy2", "sell2", None));
        assert_eq!(manager.pending_match_count(), 2);
    }

    #[test]
    fn acquire_then_release_is_a_noop_on_state() {
        let manager = OrderLockManager::new();
        assert!(manager.acquire_locks("a", "b", None));
        manager.release_locks("a", "b");
        assert!(manager.locked_orders().is_empty());
        assert_eq!(manager.pending_match_count(), 0);
        assert!(manager.acquire_locks("a", "b", None));
    }

    #[test]
    fn releasing_one_side_frees_the_partner() {
        let manager = OrderLockManager::new();
        manager.acquire_locks("a", "b", None);
        manager.release_lock("b");
        assert!(!manager.is_locked("a"));
        assert!(!manager.is_locked("b"));
    }

    #[test]
    fn untracked_locks_expire_after_a_minute() {
        let manager = OrderLockManager::new();
        manager.acquire_locks("a", "b", None);
        manager.backdate("a", Duration::from_secs(61));
        manager.backdate("b", Duration::from_secs(61));
        assert!(!manager.is_locked("a"));
        assert_eq!(manager.pending_match_count(), 0);
    }

    #[test]
    fn request_bound_locks_survive_the_short_expiry() {
        let manager = OrderLockManager::new();
        manager.acquire_locks("a", "b", None);
        manager.attach_request_id("a", "b", "req-1");
        manager.backdate("a", Duration::from_secs(90));
        manager.backdate("b", Duration::from_secs(90));
        // 90s is past the bare expiry but inside the request-bound one.
        assert!(manager.is_locked("a"));

        manager.backdate("a", Duration::from_secs(121));
        manager.backdate("b", Duration::from_secs(121));
        assert!(!manager.is_locked("a"));
    }

    #[test]
    fn locked_orders_reports_both_sides() {
        let manager = OrderLockManager::new();
        manager.acquire_locks("a", "b", None);
        let locked = manager.locked_orders();
        assert!(locked.contains("a") && locked.contains("b"));
    }
}
