//! Redis (L1) cache backend.
//!
//! Each item is stored as a Redis hash whose fields mirror [`CacheItem`]:
//! `data` is kept base64-encoded at rest, timestamps are RFC 3339 strings,
//! and the store-native TTL is set alongside the materialized `expires_at`
//! field. All keys carry the configured prefix so `clear()` can enumerate
//! and delete this tenant's entries without touching co-resident data.
//!
//! Every command runs under the configured command timeout; a command that
//! cannot complete in time is reported as a miss (or `false`) and counted
//! in the error statistics, never propagated.

use super::{CacheBackend, CacheItem, CacheMode, CacheStats, CapacityInfo, HitCountEntry, SetOptions};
use crate::config::{CacheConfig, RedisConfig};
use crate::error::{EdgeError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const FIELD_DATA: &str = "data";
const FIELD_SIZE: &str = "size";
const FIELD_CONTENT_TYPE: &str = "content_type";
const FIELD_ETAG: &str = "etag";
const FIELD_LAST_MODIFIED: &str = "last_modified";
const FIELD_CREATED_AT: &str = "created_at";
const FIELD_EXPIRES_AT: &str = "expires_at";
const FIELD_HIT_COUNT: &str = "hit_count";

/// Redis (L1) cache backend.
pub struct RedisBackend {
    config: RedisConfig,
    default_ttl: Duration,
    /// Fraction of the store's `maxmemory` treated as this tenant's budget.
    memory_budget: f64,
    /// Capacity fallback when the store reports no `maxmemory`.
    fallback_max_bytes: u64,
    conn: RwLock<Option<ConnectionManager>>,
    connected: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl RedisBackend {
    pub fn new(config: RedisConfig, cache: &CacheConfig) -> Self {
        Self {
            config,
            default_ttl: cache.ttl,
            memory_budget: cache.redis_memory_threshold,
            fallback_max_bytes: cache.max_size,
            conn: RwLock::new(None),
            connected: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}{}", self.config.prefix, key)
    }

    fn unscoped<'a>(&self, full: &'a str) -> &'a str {
        full.strip_prefix(&self.config.prefix).unwrap_or(full)
    }

    async fn connection(&self) -> Option<ConnectionManager> {
        self.conn.read().await.clone()
    }

    /// Run a command under the command timeout, degrading faults to `None`.
    async fn run<T, F>(&self, what: &str, fut: F) -> Option<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match timeout(self.config.command_timeout, fut).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(command = what, error = %e, "Redis command failed");
                None
            }
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(command = what, "Redis command timed out");
                None
            }
        }
    }

    /// Enumerate this tenant's keys (with prefix) via SCAN.
    async fn scan_keys(&self) -> Option<Vec<String>> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", self.config.prefix);

        let scan = async move {
            let mut keys = Vec::new();
            let mut iter: redis::AsyncIter<String> = conn.scan_match(&pattern).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            Ok::<_, redis::RedisError>(keys)
        };

        self.run("SCAN", scan).await
    }

    fn encode_fields(item: &CacheItem) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            (FIELD_DATA, BASE64.encode(&item.data)),
            (FIELD_SIZE, item.size.to_string()),
            (FIELD_CREATED_AT, item.created_at.to_rfc3339()),
            (FIELD_EXPIRES_AT, item.expires_at.to_rfc3339()),
            (FIELD_HIT_COUNT, item.hit_count.to_string()),
        ];
        if let Some(content_type) = &item.content_type {
            fields.push((FIELD_CONTENT_TYPE, content_type.clone()));
        }
        if let Some(etag) = &item.etag {
            fields.push((FIELD_ETAG, etag.clone()));
        }
        if let Some(last_modified) = item.last_modified {
            fields.push((FIELD_LAST_MODIFIED, last_modified.to_rfc3339()));
        }
        fields
    }

    fn decode_fields(fields: &HashMap<String, String>) -> Option<CacheItem> {
        let data = Bytes::from(BASE64.decode(fields.get(FIELD_DATA)?).ok()?);
        let size = fields.get(FIELD_SIZE)?.parse().ok()?;
        let created_at = parse_rfc3339(fields.get(FIELD_CREATED_AT)?)?;
        let expires_at = parse_rfc3339(fields.get(FIELD_EXPIRES_AT)?)?;

        Some(CacheItem {
            data,
            size,
            content_type: fields.get(FIELD_CONTENT_TYPE).cloned(),
            etag: fields.get(FIELD_ETAG).cloned(),
            last_modified: fields.get(FIELD_LAST_MODIFIED).and_then(|s| parse_rfc3339(s)),
            created_at,
            expires_at,
            hit_count: fields
                .get(FIELD_HIT_COUNT)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        })
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn initialize(&self) -> Result<()> {
        let client = redis::Client::open(self.config.url())
            .map_err(|e| EdgeError::Backend(format!("redis client: {e}")))?;

        let manager = timeout(
            self.config.connect_timeout,
            client.get_connection_manager_with_backoff(2, 100, self.config.max_retries as usize),
        )
        .await
        .map_err(|_| EdgeError::Backend("redis connect timed out".to_string()))?
        .map_err(|e| EdgeError::Backend(format!("redis connect: {e}")))?;

        let mut probe = manager.clone();
        timeout(self.config.connect_timeout, async move {
            redis::cmd("PING").query_async::<_, String>(&mut probe).await
        })
        .await
        .map_err(|_| EdgeError::Backend("redis ping timed out".to_string()))?
        .map_err(|e| EdgeError::Backend(format!("redis ping: {e}")))?;

        *self.conn.write().await = Some(manager);
        self.connected.store(true, Ordering::SeqCst);
        info!(
            host = %self.config.host,
            port = self.config.port,
            prefix = %self.config.prefix,
            "Redis cache backend initialized"
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Option<CacheItem> {
        let Some(mut conn) = self.connection().await else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let full = self.scoped(key);

        let fields: HashMap<String, String> = {
            let full = full.clone();
            self.run("HGETALL", async move { conn.hgetall(&full).await })
                .await?
        };

        if fields.is_empty() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let Some(mut item) = Self::decode_fields(&fields) else {
            // Undecodable entry: drop it and report a miss.
            self.delete(key).await;
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if item.is_expired(Utc::now()) {
            // Store-native TTL should have removed it; schedule the delete
            // off the request path and report a miss.
            if let Some(mut conn) = self.connection().await {
                tokio::spawn(async move {
                    let _: redis::RedisResult<u64> = conn.del(&full).await;
                });
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        if let Some(mut conn) = self.connection().await {
            if let Some(count) = self
                .run("HINCRBY", async move {
                    conn.hincr::<_, _, _, i64>(&full, FIELD_HIT_COUNT, 1).await
                })
                .await
            {
                item.hit_count = count.max(0) as u64;
            }
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    async fn set(&self, key: &str, data: Bytes, opts: SetOptions) -> bool {
        let Some(mut conn) = self.connection().await else {
            return false;
        };

        let item = CacheItem::new(data, &opts, self.default_ttl);
        let ttl_secs = opts.ttl.unwrap_or(self.default_ttl).as_secs().max(1) as i64;
        let fields = Self::encode_fields(&item);
        let full = self.scoped(key);

        let write = async move {
            let mut pipe = redis::pipe();
            pipe.atomic()
                .del(&full)
                .ignore()
                .hset_multiple(&full, &fields)
                .ignore()
                .expire(&full, ttl_secs)
                .ignore();
            pipe.query_async::<_, ()>(&mut conn).await
        };

        self.run("SET", write).await.is_some()
    }

    async fn delete(&self, key: &str) -> bool {
        let Some(mut conn) = self.connection().await else {
            return false;
        };
        let full = self.scoped(key);

        self.run("DEL", async move { conn.del::<_, u64>(&full).await })
            .await
            .map(|removed| removed > 0)
            .unwrap_or(false)
    }

    async fn exists(&self, key: &str) -> bool {
        let Some(mut conn) = self.connection().await else {
            return false;
        };
        let full = self.scoped(key);

        self.run("EXISTS", async move { conn.exists::<_, bool>(&full).await })
            .await
            .unwrap_or(false)
    }

    async fn clear(&self) -> bool {
        let Some(keys) = self.scan_keys().await else {
            return false;
        };
        if keys.is_empty() {
            return true;
        }

        let Some(mut conn) = self.connection().await else {
            return false;
        };
        let removed = self
            .run("DEL", async move { conn.del::<_, u64>(keys).await })
            .await;

        if let Some(removed) = removed {
            debug!(removed, "Cleared Redis cache entries");
            true
        } else {
            false
        }
    }

    async fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let capacity = self.capacity().await;

        CacheStats {
            hits,
            misses,
            errors: self.errors.load(Ordering::Relaxed),
            items: capacity.item_count,
            size_bytes: capacity.used_bytes,
            hit_ratio: CacheStats::ratio(hits, misses),
            connected: self.connected.load(Ordering::SeqCst),
            mode: self.mode().to_string(),
        }
    }

    async fn is_healthy(&self) -> bool {
        let Some(mut conn) = self.connection().await else {
            return false;
        };
        self.run("PING", async move {
            redis::cmd("PING").query_async::<_, String>(&mut conn).await
        })
        .await
        .is_some()
    }

    async fn close(&self) {
        let mut conn = self.conn.write().await;
        if conn.take().is_some() {
            self.connected.store(false, Ordering::SeqCst);
            info!("Redis cache backend closed");
        }
    }

    async fn capacity(&self) -> CapacityInfo {
        let item_count = self
            .scan_keys()
            .await
            .map(|keys| keys.len() as u64)
            .unwrap_or(0);

        let info = match self.connection().await {
            Some(mut conn) => self
                .run("INFO", async move {
                    redis::cmd("INFO").arg("memory").query_async::<_, String>(&mut conn).await
                })
                .await
                .unwrap_or_default(),
            None => String::new(),
        };

        let used_bytes = parse_info_field(&info, "used_memory").unwrap_or(0);
        let maxmemory = parse_info_field(&info, "maxmemory").unwrap_or(0);
        let max_bytes = if maxmemory > 0 {
            (maxmemory as f64 * self.memory_budget) as u64
        } else {
            self.fallback_max_bytes
        };

        CapacityInfo {
            used_bytes,
            max_bytes,
            used_percentage: CapacityInfo::percentage(used_bytes, max_bytes),
            item_count,
            max_items: 0,
        }
    }

    async fn items_by_hit_count(&self, limit: usize) -> Vec<HitCountEntry> {
        let Some(keys) = self.scan_keys().await else {
            return Vec::new();
        };

        let mut listing = Vec::with_capacity(keys.len());
        for full in keys {
            let Some(mut conn) = self.connection().await else {
                break;
            };
            let fetch = {
                let full = full.clone();
                async move {
                    conn.hget::<_, _, (Option<u64>, Option<u64>)>(
                        &full,
                        &[FIELD_HIT_COUNT, FIELD_SIZE],
                    )
                    .await
                }
            };
            if let Some((hit_count, size)) = self.run("HMGET", fetch).await {
                listing.push(HitCountEntry {
                    key: self.unscoped(&full).to_string(),
                    hit_count: hit_count.unwrap_or(0),
                    size: size.unwrap_or(0),
                });
            }
        }

        listing.sort_by_key(|entry| entry.hit_count);
        listing.truncate(limit);
        listing
    }

    async fn increment_hit_count(&self, key: &str) -> bool {
        if !self.exists(key).await {
            return false;
        }
        let Some(mut conn) = self.connection().await else {
            return false;
        };
        let full = self.scoped(key);

        self.run("HINCRBY", async move {
            conn.hincr::<_, _, _, i64>(&full, FIELD_HIT_COUNT, 1).await
        })
        .await
        .is_some()
    }

    fn mode(&self) -> CacheMode {
        CacheMode::Redis
    }
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Pull a numeric field out of an `INFO` section reply.
fn parse_info_field(info: &str, field: &str) -> Option<u64> {
    info.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name == field {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_item() -> CacheItem {
        CacheItem::new(
            Bytes::from_static(b"ts segment payload"),
            &SetOptions {
                ttl: Some(Duration::from_secs(120)),
                content_type: Some("video/mp2t".to_string()),
                etag: Some("\"abc123\"".to_string()),
                last_modified: Some(Utc::now()),
            },
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn test_field_codec_roundtrip() {
        let item = sample_item();
        let fields: HashMap<String, String> = RedisBackend::encode_fields(&item)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        let decoded = RedisBackend::decode_fields(&fields).expect("decodable");
        assert_eq!(decoded.data, item.data);
        assert_eq!(decoded.size, item.size);
        assert_eq!(decoded.content_type, item.content_type);
        assert_eq!(decoded.etag, item.etag);
        assert_eq!(decoded.hit_count, 0);
    }

    #[test]
    fn test_data_is_base64_at_rest() {
        let item = sample_item();
        let fields = RedisBackend::encode_fields(&item);
        let data_field = fields.iter().find(|(k, _)| *k == FIELD_DATA).unwrap();
        assert_eq!(BASE64.decode(&data_field.1).unwrap(), item.data.to_vec());
    }

    #[test]
    fn test_decode_rejects_corrupt_entries() {
        let mut fields = HashMap::new();
        fields.insert(FIELD_DATA.to_string(), "!!! not base64 !!!".to_string());
        fields.insert(FIELD_SIZE.to_string(), "3".to_string());
        fields.insert(FIELD_CREATED_AT.to_string(), Utc::now().to_rfc3339());
        fields.insert(FIELD_EXPIRES_AT.to_string(), Utc::now().to_rfc3339());

        assert!(RedisBackend::decode_fields(&fields).is_none());
    }

    #[test]
    fn test_key_scoping() {
        let backend = RedisBackend::new(RedisConfig::default(), &CacheConfig::default());
        let full = backend.scoped("vod/videos/a.mp4");

        assert!(full.starts_with("vodedge:cache:"));
        assert_eq!(backend.unscoped(&full), "vod/videos/a.mp4");
    }

    #[test]
    fn test_parse_info_field() {
        let info = "# Memory\r\nused_memory:1048576\r\nused_memory_human:1.00M\r\nmaxmemory:2097152\r\n";
        assert_eq!(parse_info_field(info, "used_memory"), Some(1048576));
        assert_eq!(parse_info_field(info, "maxmemory"), Some(2097152));
        assert_eq!(parse_info_field(info, "mem_allocator"), None);
    }
}
