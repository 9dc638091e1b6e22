//! Ordered schema migrations.
//!
//! Each step has an idempotent `up` and an optional `down`; applied versions
//! are recorded in `__migrations`. A step and its bookkeeping row commit in
//! one transaction, so a failed step leaves the store untouched.

use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use tracing::info;

pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub up: &'static str,
    pub down: Option<&'static str>,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "pending operations queue",
        up: "
            CREATE TABLE IF NOT EXISTS pending_operations (
                id TEXT PRIMARY KEY,
                op_type TEXT NOT NULL,
                op_key TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                payload TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                last_error TEXT,
                locked_by TEXT,
                locked_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_pending_ops_active_key
                ON pending_operations(op_key)
                WHERE status IN ('pending', 'in_progress');
            CREATE INDEX IF NOT EXISTS idx_pending_ops_status
                ON pending_operations(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_pending_ops_type
                ON pending_operations(op_type, status);
        ",
        down: Some(
            "
            DROP INDEX IF EXISTS idx_pending_ops_type;
            DROP INDEX IF EXISTS idx_pending_ops_status;
            DROP INDEX IF EXISTS idx_pending_ops_active_key;
            DROP TABLE IF EXISTS pending_operations;
        ",
        ),
    },
    Migration {
        version: 2,
        description: "settlement requests",
        up: "
            CREATE TABLE IF NOT EXISTS settlement_requests (
                request_id TEXT PRIMARY KEY,
                buy_order TEXT NOT NULL,
                sell_order TEXT NOT NULL,
                pair TEXT NOT NULL,
                encrypted_fill_amount BLOB NOT NULL,
                buy_fully_filled INTEGER NOT NULL,
                sell_fully_filled INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                tx_signature TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_settlement_requests_status
                ON settlement_requests(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_settlement_requests_pair
                ON settlement_requests(pair, created_at);
        ",
        down: Some(
            "
            DROP INDEX IF EXISTS idx_settlement_requests_pair;
            DROP INDEX IF EXISTS idx_settlement_requests_status;
            DROP TABLE IF EXISTS settlement_requests;
        ",
        ),
    },
    Migration {
        version: 3,
        description: "processed mpc requests (callback idempotency)",
        up: "
            CREATE TABLE IF NOT EXISTS mpc_processed_requests (
                request_key TEXT PRIMARY KEY,
                request_type TEXT NOT NULL,
                status TEXT NOT NULL,
                computation_type TEXT,
                tx_signature TEXT,
                error_message TEXT,
                created_at INTEGER NOT NULL
            );
        ",
        down: Some("DROP TABLE IF EXISTS mpc_processed_requests;"),
    },
    Migration {
        version: 4,
        description: "transaction records",
        up: "
            CREATE TABLE IF NOT EXISTS transaction_records (
                tx_signature TEXT PRIMARY KEY,
                tx_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                buy_order TEXT,
                sell_order TEXT,
                mpc_request_id TEXT,
                slot INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transaction_records_status
                ON transaction_records(status, created_at);
        ",
        down: Some(
            "
            DROP INDEX IF EXISTS idx_transaction_records_status;
            DROP TABLE IF EXISTS transaction_records;
        ",
        ),
    },
    Migration {
        version: 5,
        description: "distributed locks",
        up: "
            CREATE TABLE IF NOT EXISTS distributed_locks (
                lock_name TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                acquired_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                metadata TEXT
            );
        ",
        down: Some("DROP TABLE IF EXISTS distributed_locks;"),
    },
];

fn ensure_bookkeeping(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS __migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        );",
    )
    .context("create __migrations")?;
    Ok(())
}

pub fn applied_versions(conn: &Connection) -> Result<Vec<u32>> {
    ensure_bookkeeping(conn)?;
    let mut stmt = conn.prepare("SELECT version FROM __migrations ORDER BY version ASC")?;
    let versions = stmt
        .query_map([], |row| row.get::<_, u32>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(versions)
}

/// Apply every migration newer than the latest recorded version. Returns
/// the number of steps applied.
pub fn run_pending(conn: &mut Connection) -> Result<usize> {
    ensure_bookkeeping(conn)?;
    let applied = applied_versions(conn)?;
    let mut count = 0;

    for migration in MIGRATIONS {
        if applied.contains(&migration.version) {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(migration.up)
            .with_context(|| format!("migration {:03} up", migration.version))?;
        tx.execute(
            "INSERT INTO __migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                migration.version,
                migration.description,
                super::now_ts()
            ],
        )?;
        tx.commit()
            .with_context(|| format!("migration {:03} commit", migration.version))?;
        info!(
            version = migration.version,
            description = migration.description,
            "migration applied"
        );
        count += 1;
    }

    Ok(count)
}

/// Roll back the most recently applied migration. Fails when the step has
/// no `down`.
pub fn rollback_last(conn: &mut Connection) -> Result<Option<u32>> {
    ensure_bookkeeping(conn)?;
    let Some(&version) = applied_versions(conn)?.last() else {
        return Ok(None);
    };
    let migration = MIGRATIONS
        .iter()
        .find(|m| m.version == version)
        .with_context(|| format!("migration {version:03} not known to this binary"))?;
    let Some(down) = migration.down else {
        bail!("migration {version:03} has no rollback");
    };

    let tx = conn.transaction()?;
    tx.execute_batch(down)
        .with_context(|| format!("migration {version:03} down"))?;
    tx.execute("DELETE FROM __migrations WHERE version = ?1", [version])?;
    tx.commit()?;
    info!(version, "migration rolled back");
    Ok(Some(version))
}

/// Roll back everything, newest first.
pub fn rollback_all(conn: &mut Connection) -> Result<usize> {
    let mut count = 0;
    while rollback_last(conn)?.is_some() {
        count += 1;
    }
    Ok(count)
}
