//! vodedge - An edge CDN proxy for Video-on-Demand assets.
//!
//! vodedge fronts an S3-compatible object store (MinIO and friends) holding
//! VOD media: HLS playlists, MPEG-TS segments, MP4 containers, WebVTT
//! tracks, and images. It serves bytes with correct HTTP semantics (range
//! requests, conditional metadata headers, MIME classification) and
//! accelerates repeat reads with a multi-tier content cache.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         vodedge                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  HTTP Surface: object routes | cache admin | status          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Fetch Pipeline: range-aware streaming | tee-to-cache |      │
//! │                  HLS playlist rewriting                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Cache: Memory | Redis (L1) | Cassandra (L2) | Hybrid        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Capacity Watchdog: L1→L2 migration | least-use eviction     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Origin: S3-compatible object store client                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use vodedge::config::EdgeConfig;
//!
//! #[tokio::main]
//! async fn main() -> vodedge::Result<()> {
//!     // Configuration comes from the environment.
//!     let config = EdgeConfig::from_env()?;
//!     vodedge::observability::init(&config.server)?;
//!
//!     // Run the edge proxy until SIGINT/SIGTERM.
//!     vodedge::run(config).await
//! }
//! ```

pub mod cache;
pub mod capacity;
pub mod config;
pub mod error;
pub mod observability;
pub mod origin;
pub mod proxy;
pub mod server;
pub mod shutdown;

pub use error::{EdgeError, Result};

use crate::cache::CacheManager;
use crate::capacity::CapacityManager;
use crate::config::EdgeConfig;
use crate::origin::{ObjectStore, S3Origin};
use crate::proxy::FetchPipeline;
use crate::server::AppState;
use crate::shutdown::ShutdownCoordinator;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Run the edge proxy with the given configuration until shutdown.
pub async fn run(config: EdgeConfig) -> Result<()> {
    let shutdown = ShutdownCoordinator::new();
    tokio::spawn(shutdown.clone().listen_for_signals());

    // Cache first: a backend failure degrades to the memory fallback
    // inside init, so the service always comes up.
    let cache = Arc::new(CacheManager::new(&config));
    cache.init().await?;

    let capacity = Arc::new(CapacityManager::new(Arc::clone(&cache), &config.capacity));
    capacity.start();

    let origin: Arc<dyn ObjectStore> = Arc::new(S3Origin::from_config(&config.origin).await);
    let pipeline = Arc::new(FetchPipeline::new(Arc::clone(&cache), origin, &config)?);

    let state = AppState {
        pipeline,
        cache: Arc::clone(&cache),
        capacity: Arc::clone(&capacity),
        default_bucket: config.origin.default_bucket.clone(),
        cdn_base: config.server.cdn_base.clone(),
        proxy_base: config.server.proxy_base.clone(),
        started_at: Instant::now(),
    };

    server::run_server(&config, state, shutdown.clone()).await?;

    // Orderly teardown: stop the watchdog, then release the cache.
    capacity.stop_monitoring();
    cache.close().await;
    info!("Edge proxy stopped");
    Ok(())
}
