//! Error types for the vodedge proxy.
//!
//! This module provides a unified error type [`EdgeError`] for all proxy
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Request**: malformed client input (empty path, unknown cache mode)
//! - **Origin**: classified upstream failures (missing key/bucket, denied,
//!   timeout, transport)
//! - **Playlist**: M3U8 decode/parse/rewrite failures
//! - **Cache**: backend faults are *recorded*, never surfaced to clients;
//!   request paths degrade them to a miss
//! - **Configuration**: invalid or missing settings
//!
//! # Example
//!
//! ```rust
//! use vodedge::error::{EdgeError, Result};
//!
//! fn parse_mode(s: &str) -> Result<()> {
//!     if s.is_empty() {
//!         return Err(EdgeError::BadRequest("mode cannot be empty".into()));
//!     }
//!     Ok(())
//! }
//!
//! let err = EdgeError::NotFound("videos/a.mp4".into());
//! assert_eq!(err.status_code(), 404);
//! ```

use std::io;
use thiserror::Error;

/// Main error type for vodedge operations.
#[derive(Error, Debug)]
pub enum EdgeError {
    // Request errors
    #[error("Bad request: {0}")]
    BadRequest(String),

    // Origin errors
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Origin request timed out: {0}")]
    OriginTimeout(String),

    #[error("Origin failure: {0}")]
    Origin(String),

    // Playlist errors
    #[error("Playlist rewrite failed: {0}")]
    Rewrite(String),

    // Cache errors (recorded in backend stats, not surfaced to clients)
    #[error("Cache backend error: {0}")]
    Backend(String),

    #[error("Cache not initialized")]
    CacheNotInitialized,

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Infrastructure errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for vodedge operations.
pub type Result<T> = std::result::Result<T, EdgeError>;

impl EdgeError {
    /// HTTP status code this error maps to at the request surface.
    pub fn status_code(&self) -> u16 {
        match self {
            EdgeError::BadRequest(_) => 400,
            EdgeError::NotFound(_) => 404,
            EdgeError::Forbidden(_) => 403,
            EdgeError::OriginTimeout(_) | EdgeError::Origin(_) => 502,
            EdgeError::Rewrite(_) => 500,
            EdgeError::Config(_) | EdgeError::InvalidConfig { .. } => 500,
            EdgeError::Backend(_) | EdgeError::CacheNotInitialized => 500,
            EdgeError::Io(_) | EdgeError::Internal(_) => 500,
        }
    }

    /// Machine-readable error code for the uniform JSON payload.
    pub fn code(&self) -> &'static str {
        match self {
            EdgeError::BadRequest(_) => "bad-request",
            EdgeError::NotFound(_) => "not-found",
            EdgeError::Forbidden(_) => "forbidden",
            EdgeError::OriginTimeout(_) | EdgeError::Origin(_) => "origin-failure",
            EdgeError::Rewrite(_) => "rewrite-failure",
            EdgeError::Backend(_) | EdgeError::CacheNotInitialized => "backend-error",
            EdgeError::Config(_) | EdgeError::InvalidConfig { .. } => "config-error",
            EdgeError::Io(_) | EdgeError::Internal(_) => "internal-error",
        }
    }

    /// Whether the operation may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EdgeError::OriginTimeout(_) | EdgeError::Origin(_) | EdgeError::Backend(_)
        )
    }
}
