//! Embedded store shared by the crank repositories.
//!
//! One SQLite connection behind an async mutex; each repository is the sole
//! writer of its tables. Multi-statement invariants run inside transactions.

pub mod dist_lock;
pub mod migrations;
pub mod pending_ops;
pub mod processed;
pub mod settlements;
pub mod tx_records;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::Connection;
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("open database {path}"))?;
        Self::configure(&conn);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        Self::configure(&conn);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure(conn: &Connection) {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "busy_timeout", 5_000).ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
    }

    pub async fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    /// Apply all pending schema migrations. Called once during startup;
    /// failure aborts the startup sequence.
    pub async fn migrate(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let applied = migrations::run_pending(&mut conn)?;
        if applied > 0 {
            info!(applied, "📦 database migrations applied");
        }
        Ok(())
    }

    /// Daily sweep: prune terminal pending operations and compact the WAL.
    pub async fn maintenance(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        let now = Utc::now().timestamp();

        let completed = conn.execute(
            "DELETE FROM pending_operations
             WHERE status = 'completed' AND updated_at < ?1",
            [now - 7 * 86_400],
        )?;
        let failed = conn.execute(
            "DELETE FROM pending_operations
             WHERE status = 'failed' AND updated_at < ?1",
            [now - 30 * 86_400],
        )?;
        let processed = conn.execute(
            "DELETE FROM mpc_processed_requests WHERE created_at < ?1",
            [now - 30 * 86_400],
        )?;

        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);").ok();
        info!(completed, failed, processed, "🧹 database maintenance sweep done");
        Ok(())
    }
}

pub(crate) fn now_ts() -> i64 {
    Utc::now().timestamp()
}
