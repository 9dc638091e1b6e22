//! Settlement requests.
//!
//! The fill ciphertext arriving in a FillCalculationResult is persisted here
//! before the settlement transaction is built, so a crash between callback
//! and settlement can be resumed without re-running the MPC computation.

use anyhow::Result;
use rusqlite::{params, Row};

use super::{now_ts, Database};

#[derive(Debug, Clone)]
pub struct SettlementRequest {
    pub request_id: String,
    pub buy_order: String,
    pub sell_order: String,
    pub pair: String,
    pub encrypted_fill_amount: Vec<u8>,
    pub buy_fully_filled: bool,
    pub sell_fully_filled: bool,
    pub status: String,
    pub tx_signature: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<SettlementRequest> {
    Ok(SettlementRequest {
        request_id: row.get(0)?,
        buy_order: row.get(1)?,
        sell_order: row.get(2)?,
        pair: row.get(3)?,
        encrypted_fill_amount: row.get(4)?,
        buy_fully_filled: row.get::<_, i64>(5)? != 0,
        sell_fully_filled: row.get::<_, i64>(6)? != 0,
        status: row.get(7)?,
        tx_signature: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

const COLUMNS: &str = "request_id, buy_order, sell_order, pair, encrypted_fill_amount, \
                       buy_fully_filled, sell_fully_filled, status, tx_signature, \
                       created_at, updated_at";

#[derive(Clone)]
pub struct SettlementRepo {
    db: Database,
}

impl SettlementRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_pending(
        &self,
        request_id: &str,
        buy_order: &str,
        sell_order: &str,
        pair: &str,
        encrypted_fill_amount: &[u8],
        buy_fully_filled: bool,
        sell_fully_filled: bool,
    ) -> Result<()> {
        let conn = self.db.conn().await;
        let now = now_ts();
        conn.execute(
            "INSERT INTO settlement_requests
             (request_id, buy_order, sell_order, pair, encrypted_fill_amount,
              buy_fully_filled, sell_fully_filled, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?8)
             ON CONFLICT(request_id) DO UPDATE SET
                encrypted_fill_amount = excluded.encrypted_fill_amount,
                buy_fully_filled = excluded.buy_fully_filled,
                sell_fully_filled = excluded.sell_fully_filled,
                updated_at = excluded.updated_at",
            params![
                request_id,
                buy_order,
                sell_order,
                pair,
                encrypted_fill_amount,
                buy_fully_filled as i64,
                sell_fully_filled as i64,
                now
            ],
        )?;
        Ok(())
    }

    pub async fn mark_settled(&self, request_id: &str, tx_signature: &str) -> Result<()> {
        let conn = self.db.conn().await;
        conn.execute(
            "UPDATE settlement_requests
             SET status = 'settled', tx_signature = ?2, updated_at = ?3
             WHERE request_id = ?1",
            params![request_id, tx_signature, now_ts()],
        )?;
        Ok(())
    }

    pub async fn mark_failed(&self, request_id: &str) -> Result<()> {
        let conn = self.db.conn().await;
        conn.execute(
            "UPDATE settlement_requests SET status = 'failed', updated_at = ?2
             WHERE request_id = ?1",
            params![request_id, now_ts()],
        )?;
        Ok(())
    }

    pub async fn get(&self, request_id: &str) -> Result<Option<SettlementRequest>> {
        let conn = self.db.conn().await;
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM settlement_requests WHERE request_id = ?1"),
                [request_id],
                map_row,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(row)
    }

    /// Oldest unsettled requests, for crash recovery at startup.
    pub async fn find_pending(&self, limit: u32) -> Result<Vec<SettlementRequest>> {
        let conn = self.db.conn().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM settlement_requests
             WHERE status = 'pending' ORDER BY created_at ASC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map([limit], map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
