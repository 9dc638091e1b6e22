//! Durable queue of in-flight operations.
//!
//! A pending operation survives restarts and carries a match across the MPC
//! wait. Rows are claimed with a lock column; a claim older than
//! `STALE_LOCK_SECS` can be stolen by another instance.

use std::collections::HashMap;

use anyhow::{Context, Result};
use rusqlite::{params, Row};
use uuid::Uuid;

use super::{now_ts, Database};

pub const STALE_LOCK_SECS: i64 = 300;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Match,
    Settlement,
    MpcCallback,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Match => "match",
            OpType::Settlement => "settlement",
            OpType::MpcCallback => "mpc_callback",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "match" => Some(OpType::Match),
            "settlement" => Some(OpType::Settlement),
            "mpc_callback" => Some(OpType::MpcCallback),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl OpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpStatus::Pending => "pending",
            OpStatus::InProgress => "in_progress",
            OpStatus::Completed => "completed",
            OpStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub id: String,
    pub op_type: String,
    pub key: String,
    pub status: String,
    pub payload: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub locked_by: Option<String>,
    pub locked_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<PendingOperation> {
    Ok(PendingOperation {
        id: row.get(0)?,
        op_type: row.get(1)?,
        key: row.get(2)?,
        status: row.get(3)?,
        payload: row.get(4)?,
        retry_count: row.get(5)?,
        max_retries: row.get(6)?,
        last_error: row.get(7)?,
        locked_by: row.get(8)?,
        locked_at: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

const COLUMNS: &str = "id, op_type, op_key, status, payload, retry_count, max_retries, \
                       last_error, locked_by, locked_at, created_at, updated_at";

#[derive(Clone)]
pub struct PendingOpRepo {
    db: Database,
}

impl PendingOpRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new operation. Fails when a non-terminal row with the same
    /// key already exists (dedup invariant).
    pub async fn create(
        &self,
        op_type: OpType,
        key: &str,
        payload: &str,
        max_retries: u32,
    ) -> Result<PendingOperation> {
        let conn = self.db.conn().await;
        let now = now_ts();
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO pending_operations
             (id, op_type, op_key, status, payload, retry_count, max_retries,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, 0, ?5, ?6, ?6)",
            params![id, op_type.as_str(), key, payload, max_retries, now],
        )
        .with_context(|| format!("create pending op for key {key}"))?;

        let op = conn.query_row(
            &format!("SELECT {COLUMNS} FROM pending_operations WHERE id = ?1"),
            [&id],
            map_row,
        )?;
        Ok(op)
    }

    /// True when a non-terminal operation with this key exists.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let conn = self.db.conn().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pending_operations
             WHERE op_key = ?1 AND status IN ('pending', 'in_progress')",
            [key],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub async fn get(&self, id: &str) -> Result<Option<PendingOperation>> {
        let conn = self.db.conn().await;
        let op = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM pending_operations WHERE id = ?1"),
                [id],
                map_row,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(op)
    }

    /// Rows ready to process: non-terminal, retries left, unlocked or
    /// stale-locked. FIFO by creation time.
    pub async fn find_ready_to_process(
        &self,
        op_type: Option<OpType>,
        limit: u32,
    ) -> Result<Vec<PendingOperation>> {
        let conn = self.db.conn().await;
        let now = now_ts();
        let mut sql = format!(
            "SELECT {COLUMNS} FROM pending_operations
             WHERE status IN ('pending', 'in_progress')
               AND retry_count < max_retries
               AND (locked_by IS NULL OR locked_at < ?1)"
        );
        if op_type.is_some() {
            sql.push_str(" AND op_type = ?3");
        }
        sql.push_str(" ORDER BY created_at ASC LIMIT ?2");

        let stale_before = now - STALE_LOCK_SECS;
        let mut stmt = conn.prepare(&sql)?;
        let rows = match op_type {
            Some(t) => stmt
                .query_map(params![stale_before, limit, t.as_str()], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map(params![stale_before, limit], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(rows)
    }

    /// Claim a row. Succeeds when the row is unlocked, already ours, or the
    /// existing claim is older than the staleness window.
    pub async fn mark_in_progress(&self, id: &str, locked_by: &str) -> Result<bool> {
        let conn = self.db.conn().await;
        let now = now_ts();
        let updated = conn.execute(
            "UPDATE pending_operations
             SET status = 'in_progress', locked_by = ?2, locked_at = ?3, updated_at = ?3
             WHERE id = ?1
               AND status IN ('pending', 'in_progress')
               AND (locked_by IS NULL OR locked_by = ?2 OR locked_at < ?4)",
            params![id, locked_by, now, now - STALE_LOCK_SECS],
        )?;
        Ok(updated > 0)
    }

    pub async fn mark_completed(&self, id: &str) -> Result<()> {
        let conn = self.db.conn().await;
        conn.execute(
            "UPDATE pending_operations
             SET status = 'completed', locked_by = NULL, locked_at = NULL, updated_at = ?2
             WHERE id = ?1",
            params![id, now_ts()],
        )?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        let conn = self.db.conn().await;
        conn.execute(
            "UPDATE pending_operations
             SET status = 'failed', last_error = ?2, locked_by = NULL, locked_at = NULL,
                 updated_at = ?3
             WHERE id = ?1",
            params![id, error, now_ts()],
        )?;
        Ok(())
    }

    /// Requeue after a transient failure. When retries are exhausted the
    /// row is failed instead. Returns the resulting status.
    pub async fn reset_for_retry(&self, id: &str, error: &str) -> Result<OpStatus> {
        let conn = self.db.conn().await;
        let now = now_ts();
        conn.execute(
            "UPDATE pending_operations
             SET retry_count = retry_count + 1,
                 status = CASE WHEN retry_count + 1 >= max_retries
                               THEN 'failed' ELSE 'pending' END,
                 last_error = ?2, locked_by = NULL, locked_at = NULL, updated_at = ?3
             WHERE id = ?1 AND status IN ('pending', 'in_progress')",
            params![id, error, now],
        )?;
        let status: String = conn.query_row(
            "SELECT status FROM pending_operations WHERE id = ?1",
            [id],
            |row| row.get(0),
        )?;
        Ok(if status == "failed" {
            OpStatus::Failed
        } else {
            OpStatus::Pending
        })
    }

    /// Return claimed rows whose lock aged out to the pending pool.
    pub async fn release_stale_locks(&self, timeout_secs: i64) -> Result<usize> {
        let conn = self.db.conn().await;
        let now = now_ts();
        let released = conn.execute(
            "UPDATE pending_operations
             SET status = 'pending', locked_by = NULL, locked_at = NULL, updated_at = ?1
             WHERE status = 'in_progress' AND locked_at < ?2",
            params![now, now - timeout_secs],
        )?;
        Ok(released)
    }

    /// Escape hatch for stuck MPC flows: fail every in-progress operation
    /// and hand back the rows so the caller can release their order locks.
    pub async fn fail_all_in_progress(&self, reason: &str) -> Result<Vec<PendingOperation>> {
        let conn = self.db.conn().await;
        let now = now_ts();

        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM pending_operations WHERE status = 'in_progress'"
        ))?;
        let rows = stmt
            .query_map([], map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        conn.execute(
            "UPDATE pending_operations
             SET status = 'failed', last_error = ?1, locked_by = NULL, locked_at = NULL,
                 updated_at = ?2
             WHERE status = 'in_progress'",
            params![reason, now],
        )?;
        Ok(rows)
    }

    pub async fn delete_completed(&self, days: i64) -> Result<usize> {
        let conn = self.db.conn().await;
        let deleted = conn.execute(
            "DELETE FROM pending_operations WHERE status = 'completed' AND updated_at < ?1",
            [now_ts() - days * 86_400],
        )?;
        Ok(deleted)
    }

    pub async fn delete_failed(&self, days: i64) -> Result<usize> {
        let conn = self.db.conn().await;
        let deleted = conn.execute(
            "DELETE FROM pending_operations WHERE status = 'failed' AND updated_at < ?1",
            [now_ts() - days * 86_400],
        )?;
        Ok(deleted)
    }

    pub async fn count_by_status(&self) -> Result<HashMap<String, i64>> {
        let conn = self.db.conn().await;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM pending_operations GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repo() -> PendingOpRepo {
        let db = Database::open_in_memory().unwrap();
        db.migrate().await.unwrap();
        PendingOpRepo::new(db)
    }

    #[tokio::test]
    async fn create_and_claim_lifecycle() {
        let repo = repo().await;
        let op = repo
            .create(OpType::Match, "match:a:b", "{}", DEFAULT_MAX_RETRIES)
            .await
            .unwrap();
        assert_eq!(op.status, "pending");
        assert!(repo.exists("match:a:b").await.unwrap());

        assert!(repo.mark_in_progress(&op.id, "crank-1").await.unwrap());
        // A second instance cannot steal a fresh claim.
        assert!(!repo.mark_in_progress(&op.id, "crank-2").await.unwrap());
        // But the owner can re-claim.
        assert!(repo.mark_in_progress(&op.id, "crank-1").await.unwrap());

        repo.mark_completed(&op.id).await.unwrap();
        assert!(!repo.exists("match:a:b").await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_active_key_is_rejected() {
        let repo = repo().await;
        repo.create(OpType::Match, "k", "{}", 3).await.unwrap();
        assert!(repo.create(OpType::Match, "k", "{}", 3).await.is_err());

        // A terminal row frees the key.
        let ops = repo.find_ready_to_process(None, 10).await.unwrap();
        repo.mark_failed(&ops[0].id, "boom").await.unwrap();
        assert!(repo.create(OpType::Match, "k", "{}", 3).await.is_ok());
    }

    #[tokio::test]
    async fn ready_predicate_orders_fifo_and_respects_retries() {
        let repo = repo().await;
        let first = repo.create(OpType::Match, "a", "{}", 2).await.unwrap();
        let second = repo.create(OpType::Settlement, "b", "{}", 2).await.unwrap();

        let ready = repo.find_ready_to_process(None, 10).await.unwrap();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].id, first.id);

        let only_match = repo
            .find_ready_to_process(Some(OpType::Match), 10)
            .await
            .unwrap();
        assert_eq!(only_match.len(), 1);
        assert_eq!(only_match[0].id, first.id);

        // Exhaust retries on the first: it drops out of the ready set.
        assert_eq!(
            repo.reset_for_retry(&first.id, "429").await.unwrap(),
            OpStatus::Pending
        );
        assert_eq!(
            repo.reset_for_retry(&first.id, "429").await.unwrap(),
            OpStatus::Failed
        );
        let ready = repo.find_ready_to_process(None, 10).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, second.id);
    }

    #[tokio::test]
    async fn fresh_claims_hide_rows_from_ready_set() {
        let repo = repo().await;
        let op = repo.create(OpType::Match, "a", "{}", 3).await.unwrap();
        repo.mark_in_progress(&op.id, "crank-1").await.unwrap();
        assert!(repo.find_ready_to_process(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fail_all_in_progress_returns_affected_rows() {
        let repo = repo().await;
        let a = repo.create(OpType::Match, "a", "{}", 3).await.unwrap();
        let b = repo.create(OpType::Match, "b", "{}", 3).await.unwrap();
        repo.mark_in_progress(&a.id, "crank-1").await.unwrap();

        let failed = repo.fail_all_in_progress("operator skip").await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, a.id);

        let counts = repo.count_by_status().await.unwrap();
        assert_eq!(counts.get("failed"), Some(&1));
        assert_eq!(counts.get("pending"), Some(&1));
        let _ = b;
    }
}
