//! Blockhash cache.
//!
//! Keeps up to `prefetch_count` recently fetched blockhashes so the
//! settlement path never blocks on a fetch. A background refresher runs at
//! `refresh_interval_ms`; concurrent refreshes coalesce onto the in-flight
//! fetch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use solana_sdk::hash::Hash;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::chain::rpc::RpcClient;
use crate::metrics::CrankMetrics;
use crate::util::timeout::{delay, with_timeout, CancelToken};

/// Chain pacing assumption used for validity estimates.
const MS_PER_SLOT: u64 = 400;
/// A blockhash is accepted for roughly this many blocks after issuance.
const MAX_VALID_SLOTS: u64 = 150;
/// Below this many estimated remaining slots an entry is no longer
/// "likely valid".
const LIKELY_VALID_MIN_SLOTS: u64 = 10;
/// A head entry younger than this is treated as the result of an
/// in-flight refresh and returned as-is.
const COALESCE_WINDOW_MS: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct CachedBlockhash {
    pub hash: Hash,
    pub last_valid_block_height: u64,
    pub fetched_at: Instant,
    pub slot: u64,
}

impl CachedBlockhash {
    pub fn age_ms(&self) -> u64 {
        self.fetched_at.elapsed().as_millis() as u64
    }

    /// Remaining validity in slots, estimated from entry age at 400 ms per
    /// slot without touching the chain.
    pub fn estimated_remaining_slots(&self) -> u64 {
        MAX_VALID_SLOTS.saturating_sub(self.age_ms() / MS_PER_SLOT)
    }

    pub fn likely_valid(&self) -> bool {
        self.estimated_remaining_slots() > LIKELY_VALID_MIN_SLOTS
    }
}

/// Refresh decision for `ensure_fresh_blockhash`: refresh once the measured
/// remaining validity drops to `max_slot_age` or below.
pub fn needs_refresh(last_valid_block_height: u64, current_height: u64, max_slot_age: u64) -> bool {
    last_valid_block_height.saturating_sub(current_height) <= max_slot_age
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockhashStats {
    pub entries: usize,
    pub freshest_age_ms: Option<u64>,
    pub likely_valid: bool,
    pub hits: u64,
    pub refreshes: u64,
    pub refresh_failures: u64,
}

#[derive(Debug, Clone)]
pub struct BlockhashConfig {
    pub refresh_interval_ms: u64,
    pub max_age_ms: u64,
    pub prefetch_count: usize,
    pub fetch_timeout_ms: u64,
}

pub struct BlockhashCache {
    rpc: Arc<RpcClient>,
    config: BlockhashConfig,
    entries: Mutex<VecDeque<CachedBlockhash>>,
    refresh_gate: tokio::sync::Mutex<()>,
    cancel: CancelToken,
    refresher: Mutex<Option<JoinHandle<()>>>,
    hits: AtomicU64,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
    metrics: Arc<CrankMetrics>,
}

impl BlockhashCache {
    pub fn new(rpc: Arc<RpcClient>, config: BlockhashConfig, metrics: Arc<CrankMetrics>) -> Self {
        Self {
            rpc,
            config,
            entries: Mutex::new(VecDeque::new()),
            refresh_gate: tokio::sync::Mutex::new(()),
            cancel: CancelToken::new(),
            refresher: Mutex::new(None),
            hits: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
            refresh_failures: AtomicU64::new(0),
            metrics,
        }
    }

    /// Launch the background refresher. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.refresher.lock();
        if slot.is_some() {
            return;
        }
        let cache = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            loop {
                if let Err(e) = cache.refresh().await {
                    warn!(err = %e, "blockhash refresh failed");
                }
                if !delay(cache.config.refresh_interval_ms, Some(&cache.cancel)).await {
                    break;
                }
            }
        }));
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.refresher.lock().take() {
            handle.abort();
        }
    }

    fn prune(&self, entries: &mut VecDeque<CachedBlockhash>) {
        let max_age = self.config.max_age_ms;
        entries.retain(|e| e.age_ms() <= max_age);
        self.metrics
            .blockhash_cache_size
            .store(entries.len() as u64, Ordering::Relaxed);
    }

    fn freshest(&self) -> Option<CachedBlockhash> {
        let mut entries = self.entries.lock();
        self.prune(&mut entries);
        entries.front().cloned()
    }

    /// Fetch a new blockhash from the chain. Concurrent callers coalesce:
    /// whoever loses the race on the gate reuses the winner's result.
    pub async fn refresh(&self) -> Result<CachedBlockhash> {
        let _gate = self.refresh_gate.lock().await;

        if let Some(head) = self.freshest() {
            if head.age_ms() < COALESCE_WINDOW_MS {
                return Ok(head);
            }
        }

        self.refreshes.fetch_add(1, Ordering::Relaxed);
        let fetch = with_timeout("getLatestBlockhash", self.config.fetch_timeout_ms, async {
            self.rpc.get_latest_blockhash("confirmed").await
        })
        .await;

        match fetch {
            Ok(latest) => {
                let entry = CachedBlockhash {
                    hash: latest.blockhash,
                    last_valid_block_height: latest.last_valid_block_height,
                    fetched_at: Instant::now(),
                    slot: latest.slot,
                };
                let mut entries = self.entries.lock();
                entries.push_front(entry.clone());
                entries.truncate(self.config.prefetch_count);
                self.prune(&mut entries);
                debug!(slot = entry.slot, "blockhash refreshed");
                Ok(entry)
            }
            Err(e) => {
                self.refresh_failures.fetch_add(1, Ordering::Relaxed);
                Err(e).context("blockhash refresh")
            }
        }
    }

    /// Freshest cached entry, refreshing when the cache is empty or when
    /// `force` is set. If the refresh fails but an unexpired entry exists,
    /// that entry is served.
    pub async fn get_blockhash(&self, force: bool) -> Result<CachedBlockhash> {
        if !force {
            if let Some(entry) = self.freshest() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry);
            }
        }

        match self.refresh().await {
            Ok(entry) => Ok(entry),
            Err(e) => match self.freshest() {
                Some(entry) => {
                    warn!(err = %e, "serving cached blockhash after failed refresh");
                    Ok(entry)
                }
                None => Err(e),
            },
        }
    }

    /// Entry no older than `max_ms`, refreshing when the head is too old.
    pub async fn get_blockhash_with_max_age(&self, max_ms: u64) -> Result<CachedBlockhash> {
        if let Some(entry) = self.freshest() {
            if entry.age_ms() <= max_ms {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry);
            }
        }
        self.refresh().await
    }

    /// Entry whose measured on-chain validity exceeds `max_slot_age` slots,
    /// force-refreshing otherwise. Used right before settlement submission.
    pub async fn ensure_fresh_blockhash(&self, max_slot_age: u64) -> Result<CachedBlockhash> {
        let entry = self.get_blockhash(false).await?;
        let height = self.rpc.get_block_height().await?;
        if needs_refresh(entry.last_valid_block_height, height, max_slot_age) {
            return self.get_blockhash(true).await;
        }
        Ok(entry)
    }

    pub fn stats(&self) -> BlockhashStats {
        let head = self.freshest();
        BlockhashStats {
            entries: self.entries.lock().len(),
            freshest_age_ms: head.as_ref().map(|e| e.age_ms()),
            likely_valid: head.as_ref().map(|e| e.likely_valid()).unwrap_or(false),
            hits: self.hits.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    fn insert_for_test(&self, entry: CachedBlockhash) {
        self.entries.lock().push_front(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_cache(max_age_ms: u64) -> BlockhashCache {
        let metrics = Arc::new(CrankMetrics::new());
        let rpc = Arc::new(
            RpcClient::new("http://127.0.0.1:1".to_string(), vec![], 200, Arc::clone(&metrics))
                .unwrap(),
        );
        BlockhashCache::new(
            rpc,
            BlockhashConfig {
                refresh_interval_ms: 30_000,
                max_age_ms,
                prefetch_count: 2,
                fetch_timeout_ms: 200,
            },
            metrics,
        )
    }

    fn entry_aged(age: Duration) -> CachedBlockhash {
        CachedBlockhash {
            hash: Hash::new_from_array([7u8; 32]),
            last_valid_block_height: 1_000,
            fetched_at: Instant::now() - age,
            slot: 500,
        }
    }

    #[tokio::test]
    async fn fresh_entry_is_served_without_rpc() {
        let cache = test_cache(60_000);
        let entry = entry_aged(Duration::from_millis(10));
        cache.insert_for_test(entry.clone());

        let got = cache.get_blockhash(false).await.unwrap();
        assert_eq!(got.hash, entry.hash);
        assert_eq!(cache.hits.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn expired_entry_is_never_served() {
        // No reachable RPC: with only an expired entry the error propagates.
        let cache = test_cache(50);
        cache.insert_for_test(entry_aged(Duration::from_secs(10)));

        assert!(cache.get_blockhash(false).await.is_err());
        assert!(cache.freshest().is_none());
    }

    #[test]
    fn needs_refresh_boundary() {
        // remaining = 120 > 100 -> keep
        assert!(!needs_refresh(1_120, 1_000, 100));
        // remaining = 100 <= 100 -> refresh
        assert!(needs_refresh(1_100, 1_000, 100));
        // already past validity
        assert!(needs_refresh(900, 1_000, 150));
    }

    #[test]
    fn validity_estimate_uses_slot_pacing() {
        let fresh = entry_aged(Duration::from_millis(0));
        assert_eq!(fresh.estimated_remaining_slots(), MAX_VALID_SLOTS);
        assert!(fresh.likely_valid());

        // 58 s old -> 145 slots elapsed -> 5 remaining -> not likely valid.
        let old = entry_aged(Duration::from_secs(58));
        assert!(old.estimated_remaining_slots() <= LIKELY_VALID_MIN_SLOTS);
        assert!(!old.likely_valid());
    }

    #[test]
    fn prune_keeps_only_unexpired() {
        let cache = test_cache(1_000);
        cache.insert_for_test(entry_aged(Duration::from_secs(5)));
        cache.insert_for_test(entry_aged(Duration::from_millis(1)));
        assert_eq!(cache.freshest().map(|e| e.age_ms() < 1_000), Some(true));
        assert_eq!(cache.entries.lock().len(), 1);
    }
}
