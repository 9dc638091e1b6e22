//! Idempotency ledger for MPC callbacks.
//!
//! Each (request id, event name) pair is processed at most once across
//! restarts and across instances; duplicates are detected here before any
//! side effect runs.

use anyhow::Result;
use rusqlite::params;

use super::{now_ts, Database};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Computation,
    Event,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Computation => "computation",
            RequestType::Event => "event",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessedRequest {
    pub request_key: String,
    pub request_type: String,
    pub status: String,
    pub computation_type: Option<String>,
    pub tx_signature: Option<String>,
    pub error_message: Option<String>,
    pub created_at: i64,
}

#[derive(Clone)]
pub struct MpcProcessedRepo {
    db: Database,
}

impl MpcProcessedRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Canonical dedup key for an event callback.
    pub fn event_key(request_id: &[u8; 32], event_name: &str) -> String {
        format!("{}:{}", hex::encode(request_id), event_name)
    }

    pub async fn is_processed(&self, request_key: &str) -> Result<bool> {
        let conn = self.db.conn().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM mpc_processed_requests WHERE request_key = ?1",
            [request_key],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Record a processed request. Returns false when the key was already
    /// recorded (the duplicate path).
    pub async fn mark_processed(
        &self,
        request_key: &str,
        request_type: RequestType,
        computation_type: Option<&str>,
        tx_signature: Option<&str>,
    ) -> Result<bool> {
        let conn = self.db.conn().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO mpc_processed_requests
             (request_key, request_type, status, computation_type, tx_signature, created_at)
             VALUES (?1, ?2, 'processed', ?3, ?4, ?5)",
            params![
                request_key,
                request_type.as_str(),
                computation_type,
                tx_signature,
                now_ts()
            ],
        )?;
        Ok(inserted > 0)
    }

    pub async fn mark_failed(
        &self,
        request_key: &str,
        request_type: RequestType,
        error: &str,
    ) -> Result<()> {
        let conn = self.db.conn().await;
        conn.execute(
            "INSERT OR REPLACE INTO mpc_processed_requests
             (request_key, request_type, status, error_message, created_at)
             VALUES (?1, ?2, 'failed', ?3, ?4)",
            params![request_key, request_type.as_str(), error, now_ts()],
        )?;
        Ok(())
    }

    pub async fn get(&self, request_key: &str) -> Result<Option<ProcessedRequest>> {
        let conn = self.db.conn().await;
        let row = conn
            .query_row(
                "SELECT request_key, request_type, status, computation_type, tx_signature,
                        error_message, created_at
                 FROM mpc_processed_requests WHERE request_key = ?1",
                [request_key],
                |row| {
                    Ok(ProcessedRequest {
                        request_key: row.get(0)?,
                        request_type: row.get(1)?,
                        status: row.get(2)?,
                        computation_type: row.get(3)?,
                        tx_signature: row.get(4)?,
                        error_message: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repo() -> MpcProcessedRepo {
        let db = Database::open_in_memory().unwrap();
        db.migrate().await.unwrap();
        MpcProcessedRepo::new(db)
    }

    #[tokio::test]
    async fn duplicate_marks_are_detected() {
        let repo = repo().await;
        let key = MpcProcessedRepo::event_key(&[7u8; 32], "PriceCompareResult");

        assert!(!repo.is_processed(&key).await.unwrap());
        assert!(repo
            .mark_processed(&key, RequestType::Event, Some("compare_prices"), None)
            .await
            .unwrap());
        // Second mark is a no-op and reports the duplicate.
        assert!(!repo
            .mark_processed(&key, RequestType::Event, Some("compare_prices"), None)
            .await
            .unwrap());
        assert!(repo.is_processed(&key).await.unwrap());
    }

    #[tokio::test]
    async fn failed_requests_are_recorded_with_reason() {
        let repo = repo().await;
        repo.mark_failed("req:Evt", RequestType::Event, "payload truncated")
            .await
            .unwrap();
        let row = repo.get("req:Evt").await.unwrap().unwrap();
        assert_eq!(row.status, "failed");
        assert_eq!(row.error_message.as_deref(), Some("payload truncated"));
    }

    #[test]
    fn event_key_is_stable() {
        let key = MpcProcessedRepo::event_key(&[0xAB; 32], "FillCalculationResult");
        assert!(key.starts_with("abab"));
        assert!(key.ends_with(":FillCalculationResult"));
    }
}
