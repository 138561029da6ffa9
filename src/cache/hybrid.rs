//! Hybrid (L1+L2) cache backend.
//!
//! Composes the fast volatile tier and the persistent tier behind the same
//! [`CacheBackend`] contract:
//!
//! - **Get** reads through: L1 first, then L2. An L2 hit is *promoted* back
//!   into L1 as a detached write carrying the item's remaining TTL, so a
//!   promotion never extends the item's lifetime.
//! - **Set/Delete/Clear/IncrementHitCount** go to both tiers in parallel and
//!   succeed iff at least one tier succeeds.
//! - **Initialize** tolerates one tier failing; only both failing is fatal.
//!
//! Promotions run in a bounded detached group: a semaphore caps how many are
//! in flight, `close()` drains the stragglers, and when no permit is free
//! the promotion is skipped outright; the item is already being served.
//!
//! The backend is generic over its tiers so the composition semantics can be
//! exercised against in-process stores; the production alias pairs Redis
//! with Cassandra.

use super::{
    CacheBackend, CacheItem, CacheMode, CacheStats, CapacityInfo, CassandraBackend, HitCountEntry,
    RedisBackend, SetOptions,
};
use crate::error::{EdgeError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Ceiling on concurrently in-flight L2→L1 promotions.
const MAX_INFLIGHT_PROMOTIONS: u32 = 32;

/// Hybrid (L1+L2) cache backend. Defaults to Redis over Cassandra.
pub struct HybridBackend<L1: CacheBackend = RedisBackend, L2: CacheBackend = CassandraBackend> {
    l1: Arc<L1>,
    l2: Arc<L2>,
    promotions: Arc<Semaphore>,
    skipped_promotions: AtomicU64,
    closed: AtomicBool,
}

impl<L1, L2> HybridBackend<L1, L2>
where
    L1: CacheBackend + 'static,
    L2: CacheBackend + 'static,
{
    pub fn new(l1: L1, l2: L2) -> Self {
        Self {
            l1: Arc::new(l1),
            l2: Arc::new(l2),
            promotions: Arc::new(Semaphore::new(MAX_INFLIGHT_PROMOTIONS as usize)),
            skipped_promotions: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// The fast tier, for tier-level capacity decisions.
    pub fn l1(&self) -> Arc<L1> {
        Arc::clone(&self.l1)
    }

    /// The persistent tier, for tier-level capacity decisions.
    pub fn l2(&self) -> Arc<L2> {
        Arc::clone(&self.l2)
    }

    /// Launch a detached promotion of an L2 hit into L1, carrying the
    /// remaining TTL so the composed lifetime never grows.
    fn promote(&self, key: &str, item: &CacheItem) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let Ok(permit) = Arc::clone(&self.promotions).try_acquire_owned() else {
            self.skipped_promotions.fetch_add(1, Ordering::Relaxed);
            debug!(key, "Promotion skipped, group at capacity");
            return;
        };

        let l1 = Arc::clone(&self.l1);
        let key = key.to_string();
        let opts = SetOptions {
            ttl: Some(item.remaining_ttl(Utc::now())),
            content_type: item.content_type.clone(),
            etag: item.etag.clone(),
            last_modified: item.last_modified,
        };
        let data = item.data.clone();

        tokio::spawn(async move {
            if !l1.set(&key, data, opts).await {
                debug!(key, "Promotion write rejected by L1");
            }
            drop(permit);
        });
    }

    /// Wait for every in-flight promotion to finish.
    async fn drain_promotions(&self) {
        match self.promotions.acquire_many(MAX_INFLIGHT_PROMOTIONS).await {
            Ok(permits) => drop(permits),
            Err(_) => {}
        }
    }
}

#[async_trait]
impl<L1, L2> CacheBackend for HybridBackend<L1, L2>
where
    L1: CacheBackend + 'static,
    L2: CacheBackend + 'static,
{
    async fn initialize(&self) -> Result<()> {
        let (r1, r2) = tokio::join!(self.l1.initialize(), self.l2.initialize());

        match (&r1, &r2) {
            (Err(e1), Err(e2)) => Err(EdgeError::Backend(format!(
                "both tiers failed to initialize: L1: {e1}; L2: {e2}"
            ))),
            (Err(e), Ok(())) => {
                warn!(error = %e, "L1 tier unavailable, serving from L2 only");
                Ok(())
            }
            (Ok(()), Err(e)) => {
                warn!(error = %e, "L2 tier unavailable, serving from L1 only");
                Ok(())
            }
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    async fn get(&self, key: &str) -> Option<CacheItem> {
        if let Some(item) = self.l1.get(key).await {
            return Some(item);
        }

        let item = self.l2.get(key).await?;
        self.promote(key, &item);
        Some(item)
    }

    async fn set(&self, key: &str, data: Bytes, opts: SetOptions) -> bool {
        let (a, b) = tokio::join!(
            self.l1.set(key, data.clone(), opts.clone()),
            self.l2.set(key, data, opts),
        );
        a || b
    }

    async fn delete(&self, key: &str) -> bool {
        let (a, b) = tokio::join!(self.l1.delete(key), self.l2.delete(key));
        a || b
    }

    async fn exists(&self, key: &str) -> bool {
        self.l1.exists(key).await || self.l2.exists(key).await
    }

    async fn clear(&self) -> bool {
        let (a, b) = tokio::join!(self.l1.clear(), self.l2.clear());
        a || b
    }

    async fn stats(&self) -> CacheStats {
        let (l1, l2) = tokio::join!(self.l1.stats(), self.l2.stats());

        let hits = l1.hits + l2.hits;
        let misses = l1.misses + l2.misses;

        CacheStats {
            hits,
            misses,
            errors: l1.errors + l2.errors,
            items: l1.items + l2.items,
            size_bytes: l1.size_bytes + l2.size_bytes,
            hit_ratio: CacheStats::ratio(hits, misses),
            connected: l1.connected || l2.connected,
            mode: self.mode().to_string(),
        }
    }

    async fn is_healthy(&self) -> bool {
        let (a, b) = tokio::join!(self.l1.is_healthy(), self.l2.is_healthy());
        a || b
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.drain_promotions().await;
        tokio::join!(self.l1.close(), self.l2.close());
    }

    async fn capacity(&self) -> CapacityInfo {
        let (l1, l2) = tokio::join!(self.l1.capacity(), self.l2.capacity());

        let used_bytes = l1.used_bytes + l2.used_bytes;
        let max_bytes = l1.max_bytes + l2.max_bytes;

        CapacityInfo {
            used_bytes,
            max_bytes,
            used_percentage: CapacityInfo::percentage(used_bytes, max_bytes),
            item_count: l1.item_count + l2.item_count,
            max_items: l1.max_items + l2.max_items,
        }
    }

    async fn items_by_hit_count(&self, limit: usize) -> Vec<HitCountEntry> {
        let (a, b) = tokio::join!(
            self.l1.items_by_hit_count(limit),
            self.l2.items_by_hit_count(limit),
        );

        let mut merged: HashMap<String, HitCountEntry> = HashMap::new();
        for entry in a.into_iter().chain(b) {
            merged
                .entry(entry.key.clone())
                .and_modify(|existing| {
                    existing.hit_count += entry.hit_count;
                    existing.size = existing.size.max(entry.size);
                })
                .or_insert(entry);
        }

        let mut listing: Vec<HitCountEntry> = merged.into_values().collect();
        listing.sort_by(|x, y| x.hit_count.cmp(&y.hit_count).then(x.key.cmp(&y.key)));
        listing.truncate(limit);
        listing
    }

    async fn increment_hit_count(&self, key: &str) -> bool {
        let (a, b) = tokio::join!(
            self.l1.increment_hit_count(key),
            self.l2.increment_hit_count(key),
        );
        a || b
    }

    fn mode(&self) -> CacheMode {
        CacheMode::Hybrid
    }
}
