//! Transaction record lifecycle.
//!
//! A record is written before submission and updated on confirmation, so a
//! restarted crank can tell which signatures were in flight.

use anyhow::Result;
use rusqlite::{params, Row};

use super::{now_ts, Database};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
    Expired,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Failed => "failed",
            TxStatus::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub tx_signature: String,
    pub tx_type: String,
    pub status: String,
    pub buy_order: Option<String>,
    pub sell_order: Option<String>,
    pub mpc_request_id: Option<String>,
    pub slot: Option<u64>,
    pub created_at: i64,
    pub updated_at: i64,
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<TransactionRecord> {
    Ok(TransactionRecord {
        tx_signature: row.get(0)?,
        tx_type: row.get(1)?,
        status: row.get(2)?,
        buy_order: row.get(3)?,
        sell_order: row.get(4)?,
        mpc_request_id: row.get(5)?,
        slot: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

#[derive(Clone)]
pub struct TxRecordRepo {
    db: Database,
}

impl TxRecordRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn insert_pending(
        &self,
        signature: &str,
        tx_type: &str,
        buy_order: Option<&str>,
        sell_order: Option<&str>,
        mpc_request_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.db.conn().await;
        let now = now_ts();
        conn.execute(
            "INSERT OR IGNORE INTO transaction_records
             (tx_signature, tx_type, status, buy_order, sell_order, mpc_request_id,
              created_at, updated_at)
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?6)",
            params![signature, tx_type, buy_order, sell_order, mpc_request_id, now],
        )?;
        Ok(())
    }

    pub async fn set_status(&self, signature: &str, status: TxStatus, slot: Option<u64>) -> Result<()> {
        let conn = self.db.conn().await;
        conn.execute(
            "UPDATE transaction_records
             SET status = ?2, slot = COALESCE(?3, slot), updated_at = ?4
             WHERE tx_signature = ?1",
            params![signature, status.as_str(), slot, now_ts()],
        )?;
        Ok(())
    }

    pub async fn get(&self, signature: &str) -> Result<Option<TransactionRecord>> {
        let conn = self.db.conn().await;
        let record = conn
            .query_row(
                "SELECT tx_signature, tx_type, status, buy_order, sell_order, mpc_request_id,
                        slot, created_at, updated_at
                 FROM transaction_records WHERE tx_signature = ?1",
                [signature],
                map_row,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(record)
    }

    pub async fn count_with_status(&self, status: TxStatus) -> Result<i64> {
        let conn = self.db.conn().await;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM transaction_records WHERE status = ?1",
            [status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
