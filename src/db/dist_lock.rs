//! Distributed locks.
//!
//! Named mutexes backed by the shared store, used to serialize a workload
//! across crank instances. A write wins only against an expired owner or
//! itself; a background heartbeat extends every lock this process holds.
//! Locks that fail to extend are considered lost.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::future::Future;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use rusqlite::params;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{now_ts, Database};
use crate::util::timeout::{delay, CancelToken};

pub const LOCK_ORDER_MATCHING: &str = "crank:order-matching";
pub const LOCK_MPC_CALLBACKS: &str = "crank:mpc-callbacks";
pub const LOCK_SETTLEMENT: &str = "crank:settlement";
pub const LOCK_STARTUP: &str = "crank:startup";
pub const LOCK_DB_MAINTENANCE: &str = "crank:db-maintenance";

#[derive(Debug, Clone)]
pub struct AcquireOptions {
    pub ttl_secs: i64,
    pub retry: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub metadata: Option<String>,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            ttl_secs: 60,
            retry: false,
            max_retries: 5,
            retry_delay_ms: 1_000,
            metadata: None,
        }
    }
}

#[derive(Debug, Clone)]
struct HeldLock {
    ttl_secs: i64,
    valid: bool,
}

struct LockInner {
    db: Database,
    owner_id: String,
    held: Mutex<HashMap<String, HeldLock>>,
    shut_down: AtomicBool,
    cancel: CancelToken,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    heartbeat_interval_ms: u64,
}

#[derive(Clone)]
pub struct DistributedLockService {
    inner: Arc<LockInner>,
}

impl DistributedLockService {
    pub fn new(db: Database, owner_id: String, heartbeat_interval_ms: u64) -> Self {
        Self {
            inner: Arc::new(LockInner {
                db,
                owner_id,
                held: Mutex::new(HashMap::new()),
                shut_down: AtomicBool::new(false),
                cancel: CancelToken::new(),
                heartbeat: Mutex::new(None),
                heartbeat_interval_ms,
            }),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.inner.owner_id
    }

    /// Launch the heartbeat task that extends held locks. Idempotent.
    pub fn start_heartbeat(&self) {
        let mut slot = self.inner.heartbeat.lock();
        if slot.is_some() {
            return;
        }
        let service = self.clone();
        *slot = Some(tokio::spawn(async move {
            loop {
                if !delay(service.inner.heartbeat_interval_ms, Some(&service.inner.cancel)).await {
                    return;
                }
                if let Err(e) = service.extend_held_locks().await {
                    warn!(err = %e, "lock heartbeat failed");
                }
            }
        }));
    }

    async fn extend_held_locks(&self) -> Result<()> {
        let held: Vec<(String, i64)> = self
            .inner
            .held
            .lock()
            .iter()
            .filter(|(_, lock)| lock.valid)
            .map(|(name, lock)| (name.clone(), lock.ttl_secs))
            .collect();

        for (name, ttl_secs) in held {
            let conn = self.inner.db.conn().await;
            let now = now_ts();
            let extended = conn.execute(
                "UPDATE distributed_locks SET expires_at = ?3
                 WHERE lock_name = ?1 AND owner_id = ?2",
                params![name, self.inner.owner_id, now + ttl_secs],
            )?;
            drop(conn);

            if extended == 0 {
                warn!(lock = %name, "⚠️ distributed lock lost (heartbeat found no row)");
                if let Some(lock) = self.inner.held.lock().get_mut(&name) {
                    lock.valid = false;
                }
            }
        }
        Ok(())
    }

    /// Single acquisition attempt. Wins against an expired owner or a lock
    /// this process already holds.
    pub async fn try_acquire(&self, name: &str, opts: &AcquireOptions) -> Result<bool> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            bail!("lock service is shut down");
        }

        let conn = self.inner.db.conn().await;
        let now = now_ts();
        conn.execute(
            "INSERT INTO distributed_locks (lock_name, owner_id, acquired_at, expires_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(lock_name) DO UPDATE SET
                owner_id = excluded.owner_id,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at,
                metadata = excluded.metadata
             WHERE distributed_locks.expires_at < ?3
                OR distributed_locks.owner_id = excluded.owner_id",
            params![
                name,
                self.inner.owner_id,
                now,
                now + opts.ttl_secs,
                opts.metadata
            ],
        )?;

        // Read back: the row's owner decides who actually won.
        let owner: String = conn.query_row(
            "SELECT owner_id FROM distributed_locks WHERE lock_name = ?1",
            [name],
            |row| row.get(0),
        )?;
        drop(conn);

        let won = owner == self.inner.owner_id;
        if won {
            self.inner.held.lock().insert(
                name.to_string(),
                HeldLock {
                    ttl_secs: opts.ttl_secs,
                    valid: true,
                },
            );
            debug!(lock = name, "distributed lock acquired");
        }
        Ok(won)
    }

    /// Acquire with optional retries.
    pub async fn acquire(&self, name: &str, opts: &AcquireOptions) -> Result<bool> {
        let mut attempts = 0;
        loop {
            if self.try_acquire(name, opts).await? {
                return Ok(true);
            }
            if !opts.retry || attempts >= opts.max_retries {
                return Ok(false);
            }
            attempts += 1;
            if !delay(opts.retry_delay_ms, Some(&self.inner.cancel)).await {
                return Ok(false);
            }
        }
    }

    /// Run `f` under the named lock, releasing on every exit path.
    pub async fn with_lock<T, F, Fut>(&self, name: &str, opts: &AcquireOptions, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.acquire(name, opts).await? {
            bail!("could not acquire distributed lock '{name}'");
        }
        let result = f().await;
        if let Err(e) = self.release(name).await {
            warn!(lock = name, err = %e, "lock release failed");
        }
        result
    }

    /// Release only succeeds for the owning process; a foreign owner's row
    /// is left untouched.
    pub async fn release(&self, name: &str) -> Result<bool> {
        let conn = self.inner.db.conn().await;
        let deleted = conn.execute(
            "DELETE FROM distributed_locks WHERE lock_name = ?1 AND owner_id = ?2",
            params![name, self.inner.owner_id],
        )?;
        drop(conn);
        self.inner.held.lock().remove(name);
        Ok(deleted > 0)
    }

    pub async fn release_all(&self) -> Result<usize> {
        let conn = self.inner.db.conn().await;
        let deleted = conn.execute(
            "DELETE FROM distributed_locks WHERE owner_id = ?1",
            [&self.inner.owner_id],
        )?;
        drop(conn);
        self.inner.held.lock().clear();
        if deleted > 0 {
            info!(count = deleted, "distributed locks released");
        }
        Ok(deleted)
    }

    /// True when this process holds the lock and the heartbeat has not
    /// reported it lost.
    pub fn holds_lock(&self, name: &str) -> bool {
        self.inner
            .held
            .lock()
            .get(name)
            .map(|lock| lock.valid)
            .unwrap_or(false)
    }

    pub fn is_valid(&self, name: &str) -> bool {
        self.holds_lock(name)
    }

    /// True when any live (unexpired) owner holds the lock.
    pub async fn is_locked(&self, name: &str) -> Result<bool> {
        let conn = self.inner.db.conn().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM distributed_locks
             WHERE lock_name = ?1 AND expires_at >= ?2",
            params![name, now_ts()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn list_held_locks(&self) -> Vec<String> {
        self.inner.held.lock().keys().cloned().collect()
    }

    /// Stop the heartbeat, release everything, and refuse further
    /// acquisitions.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.cancel.cancel();
        if let Some(handle) = self.inner.heartbeat.lock().take() {
            handle.abort();
        }
        self.release_all().await?;
        self.inner.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn service(db: &Database, owner: &str) -> DistributedLockService {
        DistributedLockService::new(db.clone(), owner.to_string(), 10_000)
    }

    #[tokio::test]
    async fn exactly_one_owner_wins() {
        let db = db().await;
        let a = service(&db, "owner-a");
        let b = service(&db, "owner-b");
        let opts = AcquireOptions::default();

        let got_a = a.try_acquire(LOCK_ORDER_MATCHING, &opts).await.unwrap();
        let got_b = b.try_acquire(LOCK_ORDER_MATCHING, &opts).await.unwrap();
        assert!(got_a);
        assert!(!got_b);
        assert!(a.holds_lock(LOCK_ORDER_MATCHING));
        assert!(!b.holds_lock(LOCK_ORDER_MATCHING));
        assert!(b.is_locked(LOCK_ORDER_MATCHING).await.unwrap());
    }

    #[tokio::test]
    async fn reacquire_by_same_owner_succeeds() {
        let db = db().await;
        let a = service(&db, "owner-a");
        let opts = AcquireOptions::default();
        assert!(a.try_acquire(LOCK_SETTLEMENT, &opts).await.unwrap());
        assert!(a.try_acquire(LOCK_SETTLEMENT, &opts).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_can_be_stolen() {
        let db = db().await;
        let a = service(&db, "owner-a");
        let b = service(&db, "owner-b");

        let expired = AcquireOptions {
            ttl_secs: -1,
            ..Default::default()
        };
        assert!(a.try_acquire(LOCK_STARTUP, &expired).await.unwrap());
        assert!(b
            .try_acquire(LOCK_STARTUP, &AcquireOptions::default())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn release_honours_ownership() {
        let db = db().await;
        let a = service(&db, "owner-a");
        let b = service(&db, "owner-b");
        let opts = AcquireOptions::default();

        assert!(a.try_acquire(LOCK_MPC_CALLBACKS, &opts).await.unwrap());
        // Wrong owner's release must not delete the row.
        assert!(!b.release(LOCK_MPC_CALLBACKS).await.unwrap());
        assert!(b.is_locked(LOCK_MPC_CALLBACKS).await.unwrap());

        assert!(a.release(LOCK_MPC_CALLBACKS).await.unwrap());
        assert!(!a.is_locked(LOCK_MPC_CALLBACKS).await.unwrap());
    }

    #[tokio::test]
    async fn with_lock_releases_on_error() {
        let db = db().await;
        let a = service(&db, "owner-a");
        let opts = AcquireOptions::default();

        let result: Result<()> = a
            .with_lock(LOCK_DB_MAINTENANCE, &opts, || async {
                bail!("task blew up")
            })
            .await;
        assert!(result.is_err());
        assert!(!a.is_locked(LOCK_DB_MAINTENANCE).await.unwrap());
    }

    #[tokio::test]
    async fn shutdown_blocks_new_acquisitions() {
        let db = db().await;
        let a = service(&db, "owner-a");
        let opts = AcquireOptions::default();
        assert!(a.try_acquire(LOCK_ORDER_MATCHING, &opts).await.unwrap());

        a.shutdown().await.unwrap();
        assert!(!a.is_locked(LOCK_ORDER_MATCHING).await.unwrap());
        assert!(a.try_acquire(LOCK_ORDER_MATCHING, &opts).await.is_err());
    }
}
