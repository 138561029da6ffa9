//! HTTP request handlers.
//!
//! Object routes delegate to the [`FetchPipeline`]; admin routes expose the
//! cache manager and the capacity watchdog. Every error leaves through
//! [`error_response`], which renders the uniform
//! `{code, message, success, timestamp}` payload.

use super::AppState;
use crate::cache::CacheMode;
use crate::error::EdgeError;
use crate::origin::validate_range;
use crate::proxy::parse_object_path;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use tracing::debug;

/// Render an error as the uniform JSON payload.
pub fn error_response(err: &EdgeError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = json!({
        "code": err.code(),
        "message": err.to_string(),
        "success": false,
        "timestamp": Utc::now().to_rfc3339(),
    });
    (status, Json(body)).into_response()
}

// Service-level routes

pub async fn service_info(State(state): State<AppState>) -> Response {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "description": env!("CARGO_PKG_DESCRIPTION"),
        "endpoints": {
            "objects": format!("/{}/<bucket?>/<key>", state.cdn_base),
            "status": format!("/{}/status", state.proxy_base),
            "cache": format!("/{}/cache/stats", state.proxy_base),
        },
    }))
    .into_response()
}

pub async fn status(State(state): State<AppState>) -> Response {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "memory_rss_bytes": process_rss_bytes(),
        "cache_mode": state.cache.mode().await.to_string(),
    }))
    .into_response()
}

// Object routes

pub async fn get_object(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Response {
    let parsed = match parse_object_path(&path, &state.default_bucket) {
        Ok(parsed) => parsed,
        Err(e) => return error_response(&e),
    };

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(validate_range);

    debug!(bucket = %parsed.bucket, key = %parsed.key, ?range, "GET object");

    let request_path = format!("/{}/{}", state.cdn_base, path);
    match state
        .pipeline
        .serve_get(&parsed.bucket, &parsed.key, range, &request_path)
        .await
    {
        Ok(response) => response,
        Err(e) => error_response(&e),
    }
}

pub async fn head_object(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Response {
    let parsed = match parse_object_path(&path, &state.default_bucket) {
        Ok(parsed) => parsed,
        Err(e) => return error_response(&e),
    };

    debug!(bucket = %parsed.bucket, key = %parsed.key, "HEAD object");

    match state.pipeline.serve_head(&parsed.bucket, &parsed.key).await {
        Ok(response) => response,
        Err(e) => error_response(&e),
    }
}

pub async fn empty_object_path() -> Response {
    error_response(&EdgeError::BadRequest("empty object path".to_string()))
}

#[derive(Deserialize)]
pub struct PassthroughParams {
    url: String,
}

pub async fn passthrough(
    State(state): State<AppState>,
    Query(params): Query<PassthroughParams>,
) -> Response {
    match state.pipeline.serve_passthrough(&params.url).await {
        Ok(response) => response,
        Err(e) => error_response(&e),
    }
}

// Cache admin routes

pub async fn cache_stats(State(state): State<AppState>) -> Response {
    let stats = state.cache.stats().await;
    let capacity = state.cache.capacity().await;
    Json(json!({
        "success": true,
        "stats": stats,
        "capacity": capacity,
    }))
    .into_response()
}

pub async fn cache_clear(State(state): State<AppState>) -> Response {
    let cleared = state.cache.clear().await;
    Json(json!({ "success": cleared })).into_response()
}

#[derive(Deserialize)]
pub struct SwitchRequest {
    mode: String,
}

pub async fn cache_switch(
    State(state): State<AppState>,
    Json(request): Json<SwitchRequest>,
) -> Response {
    let Ok(mode) = CacheMode::from_str(&request.mode) else {
        return error_response(&EdgeError::BadRequest(format!(
            "unknown cache mode '{}'",
            request.mode
        )));
    };

    match state.cache.switch_backend(mode).await {
        Ok(active) => Json(json!({
            "success": true,
            "mode": active.to_string(),
            "fell_back": state.cache.fell_back(),
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn cache_health(State(state): State<AppState>) -> Response {
    Json(json!({
        "healthy": state.cache.is_healthy().await,
        "mode": state.cache.mode().await.to_string(),
        "initialized": state.cache.initialized().await,
    }))
    .into_response()
}

pub async fn capacity_check(State(state): State<AppState>) -> Response {
    let report = state.capacity.force_capacity_check().await;
    Json(json!({
        "success": true,
        "report": report,
    }))
    .into_response()
}

#[derive(Deserialize)]
pub struct ThresholdRequest {
    redis: Option<f64>,
    cassandra: Option<f64>,
}

pub async fn update_thresholds(
    State(state): State<AppState>,
    Json(request): Json<ThresholdRequest>,
) -> Response {
    if let Err(e) = state
        .capacity
        .set_thresholds(request.redis, request.cassandra)
    {
        return error_response(&e);
    }

    let (redis, cassandra) = state.capacity.thresholds();
    Json(json!({
        "success": true,
        "redis": redis,
        "cassandra": cassandra,
    }))
    .into_response()
}

/// Resident set size from procfs, when available.
#[cfg(target_os = "linux")]
fn process_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

#[cfg(not(target_os = "linux"))]
fn process_rss_bytes() -> Option<u64> {
    None
}
