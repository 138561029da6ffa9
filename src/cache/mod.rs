//! Multi-tier content cache for vodedge.
//!
//! The proxy accelerates repeat reads with a pluggable cache. Every backend
//! implements the same [`CacheBackend`] contract; the active one is selected
//! at startup by `CACHE_MODE` and can be swapped at runtime.
//!
//! | Mode | Backend | Characteristics |
//! |------|---------|-----------------|
//! | `memory` | [`MemoryBackend`] | In-process, bounded, exact accounting |
//! | `redis` | [`RedisBackend`] | Remote key-value L1, low latency, volatile |
//! | `cassandra` | [`CassandraBackend`] | Wide-column L2, persistent, higher capacity |
//! | `redis-cassandra` | [`HybridBackend`] | L1+L2 read-through with promotion |
//!
//! # Contract
//!
//! Backend operations are *total*: apart from `initialize`, they never
//! surface errors to callers. A fault degrades to a miss (`None`) or `false`
//! and increments the backend's error counter, so a sick Redis or Cassandra
//! never takes the request path down with it.
//!
//! # Keys
//!
//! Cache keys are derived from `(bucket, key, range)` via [`cache_key`]. Two
//! requests share an entry iff that triple matches; the `Accept` and
//! `Accept-Encoding` headers are deliberately excluded because responses do
//! not vary on them.

pub mod cassandra;
pub mod hybrid;
pub mod manager;
pub mod memory;
pub mod redis;

pub use cassandra::CassandraBackend;
pub use hybrid::HybridBackend;
pub use manager::{ActiveBackend, CacheManager};
pub use memory::MemoryBackend;
pub use redis::RedisBackend;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Cache backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    /// Bounded in-process store.
    #[default]
    Memory,
    /// Remote key-value L1 tier.
    Redis,
    /// Persistent wide-column L2 tier.
    Cassandra,
    /// Composed L1+L2 tiers.
    #[serde(rename = "redis-cassandra")]
    Hybrid,
}

impl CacheMode {
    /// Canonical name, as used by `CACHE_MODE` and reported in stats.
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Memory => "memory",
            CacheMode::Redis => "redis",
            CacheMode::Cassandra => "cassandra",
            CacheMode::Hybrid => "redis-cassandra",
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheMode {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(CacheMode::Memory),
            "redis" => Ok(CacheMode::Redis),
            "cassandra" => Ok(CacheMode::Cassandra),
            "redis-cassandra" | "hybrid" => Ok(CacheMode::Hybrid),
            _ => Err(()),
        }
    }
}

/// A cached object with its serving metadata.
#[derive(Debug, Clone)]
pub struct CacheItem {
    /// Raw payload bytes.
    pub data: Bytes,
    /// Byte length of `data`; authoritative for capacity accounting.
    pub size: u64,
    /// MIME type, when known.
    pub content_type: Option<String>,
    /// Origin ETag, when known.
    pub etag: Option<String>,
    /// Origin Last-Modified, when known.
    pub last_modified: Option<DateTime<Utc>>,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
    /// Expiry time; the item is invalid once `now > expires_at`.
    pub expires_at: DateTime<Utc>,
    /// Times this item has been served from this backend.
    pub hit_count: u64,
}

impl CacheItem {
    /// Build a fresh item from payload and options.
    pub fn new(data: Bytes, opts: &SetOptions, default_ttl: Duration) -> Self {
        let now = Utc::now();
        let ttl = opts.ttl.unwrap_or(default_ttl);
        let size = data.len() as u64;
        Self {
            data,
            size,
            content_type: opts.content_type.clone(),
            etag: opts.etag.clone(),
            last_modified: opts.last_modified,
            created_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
            hit_count: 0,
        }
    }

    /// Whether the item has outlived its TTL.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Time left before expiry, floored at one second so a promoted item is
    /// never stored with a zero TTL.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        let remaining = (self.expires_at - now).num_seconds().max(1);
        Duration::from_secs(remaining as u64)
    }
}

/// Options accepted by [`CacheBackend::set`].
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Item TTL; the backend default applies when absent.
    pub ttl: Option<Duration>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl SetOptions {
    /// Options carrying only a TTL.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }
}

/// Counters reported by [`CacheBackend::stats`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    /// Resident item count.
    pub items: u64,
    /// Resident bytes (exact for memory, store-derived for remote tiers).
    pub size_bytes: u64,
    /// `hits / (hits + misses)`, 0.00 with no samples.
    pub hit_ratio: f64,
    /// Whether the backing store is reachable.
    pub connected: bool,
    /// Mode string of the reporting backend.
    pub mode: String,
}

impl CacheStats {
    /// Hit ratio for a pair of counters.
    pub fn ratio(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

/// Capacity snapshot used by the watchdog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapacityInfo {
    pub used_bytes: u64,
    pub max_bytes: u64,
    /// Used share in percent. Derived from bytes where the store reports
    /// them, from row counts otherwise.
    pub used_percentage: f64,
    pub item_count: u64,
    pub max_items: u64,
}

impl CapacityInfo {
    /// Percentage helper guarding the zero-max case.
    pub fn percentage(used: u64, max: u64) -> f64 {
        if max == 0 {
            return 0.0;
        }
        (used as f64 / max as f64) * 100.0
    }
}

/// One entry of a [`CacheBackend::items_by_hit_count`] listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitCountEntry {
    pub key: String,
    pub hit_count: u64,
    pub size: u64,
}

/// Derive the canonical cache key for a request.
///
/// The `Range` header is the only request header that varies the key.
pub fn cache_key(bucket: &str, key: &str, range: Option<&str>) -> String {
    match range {
        Some(range) => format!("{}/{}#range={}", bucket, key, range),
        None => format!("{}/{}", bucket, key),
    }
}

/// Uniform contract implemented by every cache backend.
///
/// Apart from `initialize`, operations must not fail: backends degrade
/// faults to `None`/`false` and record them in their error counter.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Connect and prepare the backing store. The only fallible operation;
    /// the manager reacts to failure by falling back to the memory backend.
    async fn initialize(&self) -> Result<()>;

    /// Look up an item. Expired items are removed and reported as a miss.
    /// A successful lookup increments the stored item's hit count.
    async fn get(&self, key: &str) -> Option<CacheItem>;

    /// Store an item, replacing any prior item under the same key.
    async fn set(&self, key: &str, data: Bytes, opts: SetOptions) -> bool;

    /// Remove an item. `false` when absent or on backend fault.
    async fn delete(&self, key: &str) -> bool;

    /// Whether a live (unexpired) item exists under the key.
    async fn exists(&self, key: &str) -> bool;

    /// Drop every item this backend holds (scoped to this tenant).
    async fn clear(&self) -> bool;

    /// Counter snapshot.
    async fn stats(&self) -> CacheStats;

    /// Cheap liveness probe of the backing store.
    async fn is_healthy(&self) -> bool;

    /// Release connections and stop internal tasks. Idempotent.
    async fn close(&self);

    /// Capacity snapshot for the watchdog.
    async fn capacity(&self) -> CapacityInfo;

    /// Up to `limit` items, ascending by hit count. Best-effort: a backend
    /// may return fewer than requested.
    async fn items_by_hit_count(&self, limit: usize) -> Vec<HitCountEntry>;

    /// Bump an item's hit count. `false` when the key is absent.
    async fn increment_hit_count(&self, key: &str) -> bool;

    /// The mode tag this backend reports in stats.
    fn mode(&self) -> CacheMode;
}
