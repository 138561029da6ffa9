//! Bounded in-process cache backend.
//!
//! The memory backend is both the default mode and the fallback whenever a
//! remote backend cannot be initialized. It is bounded by an item count and
//! a byte ceiling; admission pressure is relieved by evicting a batch of the
//! least-recently-used entries, and TTLs are enforced lazily on reads plus a
//! periodic sweep.

use super::{CacheBackend, CacheItem, CacheMode, CacheStats, CapacityInfo, HitCountEntry, SetOptions};
use crate::config::CacheConfig;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

/// Share of resident entries dropped when an admission would breach the
/// byte ceiling.
const EVICTION_BATCH_PERCENT: usize = 20;

struct MemoryInner {
    entries: RwLock<LruCache<String, CacheItem>>,
    used_bytes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    max_items: u64,
    max_bytes: u64,
    default_ttl: Duration,
    check_period: Duration,
    closed: AtomicBool,
}

/// Bounded in-process cache backend.
pub struct MemoryBackend {
    inner: Arc<MemoryInner>,
    sweep_stop: watch::Sender<bool>,
    sweep_started: AtomicBool,
}

impl MemoryBackend {
    /// Create a backend from the cache configuration. No tasks start until
    /// [`CacheBackend::initialize`] is called.
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_items as usize).unwrap_or(NonZeroUsize::MIN);
        let (sweep_stop, _) = watch::channel(false);

        Self {
            inner: Arc::new(MemoryInner {
                entries: RwLock::new(LruCache::new(capacity)),
                used_bytes: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                max_items: config.max_items,
                max_bytes: config.max_size,
                default_ttl: config.ttl,
                check_period: config.check_period,
                closed: AtomicBool::new(false),
            }),
            sweep_stop,
            sweep_started: AtomicBool::new(false),
        }
    }

    /// Drop every expired entry. Returns the number removed.
    pub async fn sweep_expired(&self) -> usize {
        Self::sweep(&self.inner).await
    }

    async fn sweep(inner: &MemoryInner) -> usize {
        let now = Utc::now();
        let mut entries = inner.entries.write().await;

        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, item)| item.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(item) = entries.pop(key) {
                inner.used_bytes.fetch_sub(item.size, Ordering::Relaxed);
            }
        }

        if !expired.is_empty() {
            debug!(removed = expired.len(), "Expiry sweep dropped entries");
        }
        expired.len()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn initialize(&self) -> Result<()> {
        if self.sweep_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        let mut stop = self.sweep_stop.subscribe();
        let period = inner.check_period;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::sweep(&inner).await;
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Memory cache sweep task stopped");
        });

        info!(
            max_items = self.inner.max_items,
            max_bytes = self.inner.max_bytes,
            "Memory cache backend initialized"
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Option<CacheItem> {
        let now = Utc::now();
        let mut entries = self.inner.entries.write().await;

        let expired = match entries.get(key) {
            Some(item) => item.is_expired(now),
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired {
            if let Some(item) = entries.pop(key) {
                self.inner.used_bytes.fetch_sub(item.size, Ordering::Relaxed);
            }
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let item = entries.get_mut(key)?;
        item.hit_count += 1;
        self.inner.hits.fetch_add(1, Ordering::Relaxed);
        Some(item.clone())
    }

    async fn set(&self, key: &str, data: Bytes, opts: SetOptions) -> bool {
        let size = data.len() as u64;
        if size > self.inner.max_bytes {
            return false;
        }

        let mut entries = self.inner.entries.write().await;

        // A set replaces any prior item under the key.
        if let Some(old) = entries.pop(key) {
            self.inner.used_bytes.fetch_sub(old.size, Ordering::Relaxed);
        }

        if self.inner.used_bytes.load(Ordering::Relaxed) + size > self.inner.max_bytes {
            let batch = (entries.len() * EVICTION_BATCH_PERCENT / 100).max(1);
            let mut evicted = 0usize;
            for _ in 0..batch {
                match entries.pop_lru() {
                    Some((_, old)) => {
                        self.inner.used_bytes.fetch_sub(old.size, Ordering::Relaxed);
                        evicted += 1;
                    }
                    None => break,
                }
            }
            debug!(evicted, "Admission pressure eviction");
        }

        if self.inner.used_bytes.load(Ordering::Relaxed) + size > self.inner.max_bytes {
            // Still no room after the batch eviction; refuse the item.
            return false;
        }

        let item = CacheItem::new(data, &opts, self.inner.default_ttl);
        self.inner.used_bytes.fetch_add(size, Ordering::Relaxed);
        if let Some((_, displaced)) = entries.push(key.to_string(), item) {
            // Item-count ceiling displaced the LRU entry.
            self.inner
                .used_bytes
                .fetch_sub(displaced.size, Ordering::Relaxed);
        }
        true
    }

    async fn delete(&self, key: &str) -> bool {
        let mut entries = self.inner.entries.write().await;
        match entries.pop(key) {
            Some(item) => {
                self.inner.used_bytes.fetch_sub(item.size, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    async fn exists(&self, key: &str) -> bool {
        let now = Utc::now();
        let entries = self.inner.entries.read().await;
        entries
            .peek(key)
            .map(|item| !item.is_expired(now))
            .unwrap_or(false)
    }

    async fn clear(&self) -> bool {
        let mut entries = self.inner.entries.write().await;
        entries.clear();
        self.inner.used_bytes.store(0, Ordering::Relaxed);
        true
    }

    async fn stats(&self) -> CacheStats {
        let hits = self.inner.hits.load(Ordering::Relaxed);
        let misses = self.inner.misses.load(Ordering::Relaxed);
        let entries = self.inner.entries.read().await;

        CacheStats {
            hits,
            misses,
            errors: self.inner.errors.load(Ordering::Relaxed),
            items: entries.len() as u64,
            size_bytes: self.inner.used_bytes.load(Ordering::Relaxed),
            hit_ratio: CacheStats::ratio(hits, misses),
            connected: !self.inner.closed.load(Ordering::SeqCst),
            mode: self.mode().to_string(),
        }
    }

    async fn is_healthy(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            let _ = self.sweep_stop.send(true);
            self.clear().await;
            info!("Memory cache backend closed");
        }
    }

    async fn capacity(&self) -> CapacityInfo {
        let used_bytes = self.inner.used_bytes.load(Ordering::Relaxed);
        let item_count = self.inner.entries.read().await.len() as u64;

        CapacityInfo {
            used_bytes,
            max_bytes: self.inner.max_bytes,
            used_percentage: CapacityInfo::percentage(used_bytes, self.inner.max_bytes),
            item_count,
            max_items: self.inner.max_items,
        }
    }

    async fn items_by_hit_count(&self, limit: usize) -> Vec<HitCountEntry> {
        let entries = self.inner.entries.read().await;
        let mut listing: Vec<HitCountEntry> = entries
            .iter()
            .map(|(key, item)| HitCountEntry {
                key: key.clone(),
                hit_count: item.hit_count,
                size: item.size,
            })
            .collect();

        listing.sort_by_key(|entry| entry.hit_count);
        listing.truncate(limit);
        listing
    }

    async fn increment_hit_count(&self, key: &str) -> bool {
        let mut entries = self.inner.entries.write().await;
        match entries.get_mut(key) {
            Some(item) => {
                item.hit_count += 1;
                true
            }
            None => false,
        }
    }

    fn mode(&self) -> CacheMode {
        CacheMode::Memory
    }
}
