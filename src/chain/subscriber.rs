//! Order account cache with WebSocket push invalidation.
//!
//! Maps order PDA -> (encrypted payload, slot, cached_at). Writes are
//! slot-monotone: a strictly older slot never overwrites a newer one. When
//! the subscription drops, reconnection backs off exponentially; after
//! `max_reconnect_attempts` the cache degrades to polling-only mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use solana_sdk::pubkey::Pubkey;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::chain::order::ORDER_ACCOUNT_SIZE;
use crate::chain::ws;
use crate::metrics::CrankMetrics;
use crate::util::timeout::{delay, CancelToken};

const INITIAL_RECONNECT_DELAY_MS: u64 = 1_000;
const MAX_RECONNECT_DELAY_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationKind {
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub pda: String,
    pub slot: u64,
    pub kind: InvalidationKind,
}

#[derive(Debug, Clone)]
pub struct CachedOrderData {
    pub data: Vec<u8>,
    pub slot: u64,
    pub cached_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub rejected_writes: u64,
    pub reconnect_attempts: u32,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct OrderCacheConfig {
    pub ws_url: String,
    pub program: Pubkey,
    pub max_ttl_ms: u64,
    pub max_reconnect_attempts: u32,
}

pub struct OrderCache {
    config: OrderCacheConfig,
    entries: RwLock<HashMap<String, CachedOrderData>>,
    update_subscribers: Mutex<Vec<mpsc::UnboundedSender<OrderUpdate>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    rejected_writes: AtomicU64,
    reconnect_attempts: AtomicU32,
    active: AtomicBool,
    cancel: CancelToken,
    task: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<CrankMetrics>,
}

impl OrderCache {
    pub fn new(config: OrderCacheConfig, metrics: Arc<CrankMetrics>) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            update_subscribers: Mutex::new(Vec::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            rejected_writes: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            active: AtomicBool::new(false),
            cancel: CancelToken::new(),
            task: Mutex::new(None),
            metrics,
        }
    }

    /// True while the WebSocket subscription is live; false in polling-only
    /// fallback mode.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn get(&self, pda: &str) -> Option<CachedOrderData> {
        let expired = {
            let entries = self.entries.read();
            match entries.get(pda) {
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(entry) => {
                    if entry.cached_at.elapsed().as_millis() as u64 <= self.config.max_ttl_ms {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Some(entry.clone());
                    }
                    true
                }
            }
        };

        if expired {
            self.entries.write().remove(pda);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    /// Slot-monotone write: returns false (and leaves the entry untouched)
    /// when `slot` is strictly older than the cached slot.
    pub fn set(&self, pda: &str, data: Vec<u8>, slot: u64) -> bool {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(pda) {
            if slot < existing.slot {
                drop(entries);
                self.rejected_writes.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }
        entries.insert(
            pda.to_string(),
            CachedOrderData {
                data,
                slot,
                cached_at: Instant::now(),
            },
        );
        true
    }

    pub fn invalidate(&self, pda: &str, kind: InvalidationKind) {
        // Both kinds drop the entry; the next read goes back to the chain.
        // The kind still reaches update subscribers so they can tell a
        // closed account from a rewritten one.
        self.entries.write().remove(pda);
        self.notify(OrderUpdate {
            pda: pda.to_string(),
            slot: 0,
            kind,
        });
    }

    pub fn invalidate_all(&self) {
        let count = {
            let mut entries = self.entries.write();
            let count = entries.len();
            entries.clear();
            count
        };
        debug!(count, "order cache flushed");
    }

    /// All unexpired entries. Used by the poll loop when the subscription
    /// is live.
    pub fn snapshot(&self) -> Vec<(String, CachedOrderData)> {
        let max_ttl = self.config.max_ttl_ms;
        self.entries
            .read()
            .iter()
            .filter(|(_, e)| e.cached_at.elapsed().as_millis() as u64 <= max_ttl)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn subscribe_updates(&self) -> mpsc::UnboundedReceiver<OrderUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.update_subscribers.lock().push(tx);
        rx
    }

    fn notify(&self, update: OrderUpdate) {
        self.update_subscribers
            .lock()
            .retain(|tx| tx.send(update.clone()).is_ok());
    }

    pub fn stats(&self) -> OrderCacheStats {
        OrderCacheStats {
            entries: self.entries.read().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            rejected_writes: self.rejected_writes.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            active: self.is_active(),
        }
    }

    /// Launch the subscription task with auto-reconnect. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.task.lock();
        if slot.is_some() {
            return;
        }
        let cache = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            cache.run_subscription().await;
        }));
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        self.active.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    async fn run_subscription(self: Arc<Self>) {
        let mut reconnect_delay = INITIAL_RECONNECT_DELAY_MS;

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            match self.connect_and_stream().await {
                Ok(()) => {
                    info!("order subscription closed gracefully");
                    reconnect_delay = INITIAL_RECONNECT_DELAY_MS;
                }
                Err(e) => {
                    self.active.store(false, Ordering::SeqCst);
                    let attempts = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    self.metrics
                        .ws_reconnect_attempts
                        .store(attempts, Ordering::Relaxed);

                    if attempts >= self.config.max_reconnect_attempts {
                        error!(
                            attempts,
                            err = %e,
                            "🛑 order subscription gave up, falling back to polling-only"
                        );
                        return;
                    }

                    warn!(attempts, delay_ms = reconnect_delay, err = %e, "order subscription lost, reconnecting");
                    if !delay(reconnect_delay, Some(&self.cancel)).await {
                        return;
                    }
                    reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY_MS);
                }
            }
        }
    }

    async fn connect_and_stream(&self) -> anyhow::Result<()> {
        info!(url = %self.config.ws_url, "🔌 connecting order subscription");
        let mut stream = ws::connect(&self.config.ws_url).await?;

        stream
            .send(Message::Text(ws::program_subscribe_request(
                1,
                &self.config.program,
                ORDER_ACCOUNT_SIZE as u64,
            )))
            .await?;

        while let Some(frame) = stream.next().await {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let text = match frame? {
                Message::Text(text) => text,
                Message::Ping(payload) => {
                    stream.send(Message::Pong(payload)).await.ok();
                    continue;
                }
                Message::Close(_) => return Ok(()),
                _ => continue,
            };

            match ws::parse_message(&text) {
                Ok(ws::WsMessage::SubscriptionConfirmed { subscription, .. }) => {
                    info!(subscription, "✅ order subscription active");
                    self.active.store(true, Ordering::SeqCst);
                }
                Ok(ws::WsMessage::ProgramNotification {
                    pubkey,
                    slot,
                    data,
                    ..
                }) => {
                    if self.set(&pubkey, data, slot) {
                        self.notify(OrderUpdate {
                            pda: pubkey,
                            slot,
                            kind: InvalidationKind::Update,
                        });
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(err = %e, "unparseable subscription frame");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_cache(max_ttl_ms: u64) -> OrderCache {
        OrderCache::new(
            OrderCacheConfig {
                ws_url: "ws://127.0.0.1:1".to_string(),
                program: Pubkey::new_unique(),
                max_ttl_ms,
                max_reconnect_attempts: 10,
            },
            Arc::new(CrankMetrics::new()),
        )
    }

    #[test]
    fn writes_are_slot_monotone() {
        let cache = test_cache(60_000);
        assert!(cache.set("pda", vec![1], 100));
        assert!(!cache.set("pda", vec![2], 99));
        assert_eq!(cache.get("pda").unwrap().data, vec![1]);

        // Equal slot is allowed (same-slot rewrite).
        assert!(cache.set("pda", vec![3], 100));
        assert!(cache.set("pda", vec![4], 101));
        assert_eq!(cache.get("pda").unwrap().slot, 101);
        assert_eq!(cache.stats().rejected_writes, 1);
    }

    #[test]
    fn reads_evict_expired_entries() {
        let cache = test_cache(0);
        cache.set("pda", vec![1], 1);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("pda").is_none());
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn delete_invalidation_removes_entry() {
        let cache = test_cache(60_000);
        cache.set("pda", vec![1], 1);
        cache.invalidate("pda", InvalidationKind::Delete);
        assert!(cache.get("pda").is_none());
    }

    #[test]
    fn update_invalidation_forces_refetch() {
        let cache = test_cache(60_000);
        cache.set("pda", vec![1], 1);
        cache.invalidate("pda", InvalidationKind::Update);
        assert!(cache.get("pda").is_none());
    }

    #[test]
    fn update_subscribers_see_writes() {
        let cache = test_cache(60_000);
        let mut rx = cache.subscribe_updates();
        cache.invalidate("pda", InvalidationKind::Delete);
        let update = rx.try_recv().unwrap();
        assert_eq!(update.pda, "pda");
        assert_eq!(update.kind, InvalidationKind::Delete);
    }

    #[test]
    fn snapshot_skips_expired() {
        let cache = test_cache(0);
        cache.set("a", vec![1], 1);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.snapshot().is_empty());
    }
}
