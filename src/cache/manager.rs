//! Cache manager: mode selection, fallback, and runtime switching.
//!
//! The manager owns the process's single active backend. It is constructed
//! explicitly during startup and injected into the request handlers via the
//! server state; no global cache is constructed at import time.
//!
//! Initialization failure of any non-memory mode is not fatal: the manager
//! falls back to the in-process memory backend, records that it did, and
//! the service keeps serving. [`CacheManager::switch_backend`] applies the
//! same policy at runtime: close the current backend, bring up the new one,
//! and fall back to memory as a last resort. Switching never carries items
//! over; it is a clean re-initialization.

use super::{
    CacheBackend, CacheItem, CacheMode, CacheStats, CapacityInfo, CassandraBackend, HitCountEntry,
    HybridBackend, MemoryBackend, RedisBackend, SetOptions,
};
use crate::config::{CacheConfig, CassandraConfig, EdgeConfig, RedisConfig};
use crate::error::Result;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Tagged handle to the selected backend. The tag is fixed after selection,
/// so dispatch is static per process (modulo runtime switches).
#[derive(Clone)]
pub enum ActiveBackend {
    Memory(Arc<MemoryBackend>),
    Redis(Arc<RedisBackend>),
    Cassandra(Arc<CassandraBackend>),
    Hybrid(Arc<HybridBackend>),
}

impl ActiveBackend {
    /// View the tagged backend through the uniform contract.
    pub fn as_backend(&self) -> Arc<dyn CacheBackend> {
        match self {
            ActiveBackend::Memory(b) => Arc::clone(b) as Arc<dyn CacheBackend>,
            ActiveBackend::Redis(b) => Arc::clone(b) as Arc<dyn CacheBackend>,
            ActiveBackend::Cassandra(b) => Arc::clone(b) as Arc<dyn CacheBackend>,
            ActiveBackend::Hybrid(b) => Arc::clone(b) as Arc<dyn CacheBackend>,
        }
    }

    pub fn mode(&self) -> CacheMode {
        match self {
            ActiveBackend::Memory(_) => CacheMode::Memory,
            ActiveBackend::Redis(_) => CacheMode::Redis,
            ActiveBackend::Cassandra(_) => CacheMode::Cassandra,
            ActiveBackend::Hybrid(_) => CacheMode::Hybrid,
        }
    }
}

/// Process-wide cache facade with explicit lifecycle.
pub struct CacheManager {
    cache: CacheConfig,
    redis: RedisConfig,
    cassandra: CassandraConfig,
    backend: RwLock<Option<ActiveBackend>>,
    fell_back: AtomicBool,
}

impl CacheManager {
    /// Capture the configuration; nothing connects until [`init`](Self::init).
    pub fn new(config: &EdgeConfig) -> Self {
        Self {
            cache: config.cache.clone(),
            redis: config.redis.clone(),
            cassandra: config.cassandra.clone(),
            backend: RwLock::new(None),
            fell_back: AtomicBool::new(false),
        }
    }

    /// Bring up the configured backend, falling back to memory on failure.
    pub async fn init(&self) -> Result<()> {
        self.activate(self.cache.mode).await
    }

    fn build(&self, mode: CacheMode) -> ActiveBackend {
        match mode {
            CacheMode::Memory => ActiveBackend::Memory(Arc::new(MemoryBackend::new(&self.cache))),
            CacheMode::Redis => ActiveBackend::Redis(Arc::new(RedisBackend::new(
                self.redis.clone(),
                &self.cache,
            ))),
            CacheMode::Cassandra => ActiveBackend::Cassandra(Arc::new(CassandraBackend::new(
                self.cassandra.clone(),
                &self.cache,
            ))),
            CacheMode::Hybrid => ActiveBackend::Hybrid(Arc::new(HybridBackend::new(
                RedisBackend::new(self.redis.clone(), &self.cache),
                CassandraBackend::new(self.cassandra.clone(), &self.cache),
            ))),
        }
    }

    async fn activate(&self, mode: CacheMode) -> Result<()> {
        let candidate = self.build(mode);
        match candidate.as_backend().initialize().await {
            Ok(()) => {
                *self.backend.write().await = Some(candidate);
                self.fell_back.store(false, Ordering::SeqCst);
                info!(mode = %mode, "Cache backend active");
                Ok(())
            }
            Err(e) if mode != CacheMode::Memory => {
                warn!(mode = %mode, error = %e, "Backend initialization failed, falling back to memory");
                let fallback = self.build(CacheMode::Memory);
                fallback.as_backend().initialize().await?;
                *self.backend.write().await = Some(fallback);
                self.fell_back.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Memory backend failed to initialize");
                Err(e)
            }
        }
    }

    /// Swap backends at runtime. The previous backend is closed first; its
    /// items are not carried over.
    pub async fn switch_backend(&self, mode: CacheMode) -> Result<CacheMode> {
        if let Some(old) = self.backend.write().await.take() {
            old.as_backend().close().await;
        }
        self.activate(mode).await?;
        Ok(self.mode().await)
    }

    /// The tagged handle, for callers that need tier-level access.
    pub async fn active(&self) -> Option<ActiveBackend> {
        self.backend.read().await.clone()
    }

    /// Mode of the backend actually serving (post-fallback).
    pub async fn mode(&self) -> CacheMode {
        match self.backend.read().await.as_ref() {
            Some(active) => active.mode(),
            None => self.cache.mode,
        }
    }

    pub async fn initialized(&self) -> bool {
        self.backend.read().await.is_some()
    }

    /// Whether the last activation fell back to the memory backend.
    pub fn fell_back(&self) -> bool {
        self.fell_back.load(Ordering::SeqCst)
    }

    /// Close the active backend and forget it.
    pub async fn close(&self) {
        if let Some(active) = self.backend.write().await.take() {
            active.as_backend().close().await;
            info!("Cache manager closed");
        }
    }

    // Pass-throughs, short-circuiting to safe defaults when uninitialized.

    pub async fn get(&self, key: &str) -> Option<CacheItem> {
        let active = self.active().await?;
        active.as_backend().get(key).await
    }

    pub async fn set(&self, key: &str, data: Bytes, opts: SetOptions) -> bool {
        match self.active().await {
            Some(active) => active.as_backend().set(key, data, opts).await,
            None => false,
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        match self.active().await {
            Some(active) => active.as_backend().delete(key).await,
            None => false,
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        match self.active().await {
            Some(active) => active.as_backend().exists(key).await,
            None => false,
        }
    }

    pub async fn clear(&self) -> bool {
        match self.active().await {
            Some(active) => active.as_backend().clear().await,
            None => false,
        }
    }

    pub async fn stats(&self) -> CacheStats {
        match self.active().await {
            Some(active) => active.as_backend().stats().await,
            None => CacheStats {
                mode: self.cache.mode.to_string(),
                ..CacheStats::default()
            },
        }
    }

    pub async fn is_healthy(&self) -> bool {
        match self.active().await {
            Some(active) => active.as_backend().is_healthy().await,
            None => false,
        }
    }

    pub async fn capacity(&self) -> CapacityInfo {
        match self.active().await {
            Some(active) => active.as_backend().capacity().await,
            None => CapacityInfo::default(),
        }
    }

    pub async fn items_by_hit_count(&self, limit: usize) -> Vec<HitCountEntry> {
        match self.active().await {
            Some(active) => active.as_backend().items_by_hit_count(limit).await,
            None => Vec::new(),
        }
    }

    pub async fn increment_hit_count(&self, key: &str) -> bool {
        match self.active().await {
            Some(active) => active.as_backend().increment_hit_count(key).await,
            None => false,
        }
    }
}
