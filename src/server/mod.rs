//! HTTP server: router construction and graceful serving.

pub mod handlers;

use crate::cache::CacheManager;
use crate::capacity::CapacityManager;
use crate::config::EdgeConfig;
use crate::error::{EdgeError, Result};
use crate::proxy::FetchPipeline;
use crate::shutdown::ShutdownCoordinator;
use axum::routing::{get, post, put};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<FetchPipeline>,
    pub cache: Arc<CacheManager>,
    pub capacity: Arc<CapacityManager>,
    pub default_bucket: String,
    pub cdn_base: String,
    pub proxy_base: String,
    pub started_at: Instant,
}

/// Build the service router.
pub fn build_router(state: AppState) -> Router {
    let cdn = state.cdn_base.clone();
    let proxy = state.proxy_base.clone();

    Router::new()
        .route("/", get(handlers::service_info))
        // The static passthrough route outranks the object wildcard.
        .route(&format!("/{cdn}/passthrough"), get(handlers::passthrough))
        .route(
            &format!("/{cdn}/*path"),
            get(handlers::get_object).head(handlers::head_object),
        )
        // A bare prefix names no object.
        .route(&format!("/{cdn}"), get(handlers::empty_object_path))
        .route(&format!("/{cdn}/"), get(handlers::empty_object_path))
        .route(&format!("/{proxy}/status"), get(handlers::status))
        .route(&format!("/{proxy}/cache/stats"), get(handlers::cache_stats))
        .route(&format!("/{proxy}/cache/clear"), post(handlers::cache_clear))
        .route(&format!("/{proxy}/cache/switch"), post(handlers::cache_switch))
        .route(&format!("/{proxy}/cache/health"), get(handlers::cache_health))
        .route(
            &format!("/{proxy}/cache/capacity/check"),
            post(handlers::capacity_check),
        )
        .route(
            &format!("/{proxy}/cache/thresholds"),
            put(handlers::update_thresholds),
        )
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until the shutdown coordinator trips.
pub async fn run_server(
    config: &EdgeConfig,
    state: AppState,
    shutdown: ShutdownCoordinator,
) -> Result<()> {
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| EdgeError::Config(format!("invalid bind address: {e}")))?;

    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Edge proxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait_for_shutdown().await })
        .await
        .map_err(|e| EdgeError::Internal(format!("server error: {e}")))?;

    Ok(())
}
