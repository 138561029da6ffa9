//! Origin object-store client.
//!
//! The proxy treats the upstream S3-compatible store through the
//! [`ObjectStore`] trait: a `GetObject` that yields a byte stream plus
//! serving metadata, and a `HeadObject` that yields the metadata alone.
//! Errors carry a discriminator so the request surface can map
//! missing-key/missing-bucket to 404, denied access to 403, and everything
//! else to an upstream failure.
//!
//! The production implementation wraps the AWS SDK client with an endpoint
//! override and path-style addressing so MinIO and friends work unchanged.

use crate::config::OriginConfig;
use crate::error::EdgeError;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::fmt;
use std::io;
use std::pin::Pin;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// Streaming body handed to the fetch pipeline.
pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Discriminator for classified origin failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginErrorKind {
    NoSuchKey,
    NoSuchBucket,
    AccessDenied,
    Timeout,
    Other,
}

/// A classified origin failure.
#[derive(Debug)]
pub struct OriginError {
    pub kind: OriginErrorKind,
    pub message: String,
}

impl OriginError {
    pub fn new(kind: OriginErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Map onto the request-surface error taxonomy for the named object.
    pub fn into_edge(self, object: &str) -> EdgeError {
        match self.kind {
            OriginErrorKind::NoSuchKey | OriginErrorKind::NoSuchBucket => {
                EdgeError::NotFound(object.to_string())
            }
            OriginErrorKind::AccessDenied => EdgeError::Forbidden(object.to_string()),
            OriginErrorKind::Timeout => EdgeError::OriginTimeout(self.message),
            OriginErrorKind::Other => EdgeError::Origin(self.message),
        }
    }
}

impl fmt::Display for OriginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for OriginError {}

/// Serving metadata reported by the origin.
#[derive(Debug, Clone, Default)]
pub struct ObjectMetadata {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    /// Present on partial-content responses.
    pub content_range: Option<String>,
    pub accept_ranges: Option<String>,
}

/// A fetched object: metadata plus the streaming body.
pub struct FetchedObject {
    pub meta: ObjectMetadata,
    pub body: BodyStream,
}

/// Contract the proxy holds against the upstream store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<&str>,
    ) -> Result<FetchedObject, OriginError>;

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata, OriginError>;
}

/// AWS-SDK-backed origin client.
pub struct S3Origin {
    client: Client,
}

impl S3Origin {
    /// Build the client from configuration. Credentials are static; the
    /// endpoint override plus path-style addressing make MinIO-style
    /// deployments work.
    pub async fn from_config(config: &OriginConfig) -> Self {
        let credentials = Credentials::new(
            config.access_key_id.clone(),
            config.secret_access_key.clone(),
            None,
            None,
            "vodedge-static",
        );

        let timeouts = aws_config::timeout::TimeoutConfig::builder()
            .operation_timeout(config.request_timeout)
            .operation_attempt_timeout(config.request_timeout)
            .build();

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .timeout_config(timeouts)
            .endpoint_url(endpoint_url(&config.endpoint, config.use_ssl))
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();

        info!(
            endpoint = %config.endpoint,
            region = %config.region,
            default_bucket = %config.default_bucket,
            "Origin client ready"
        );
        Self {
            client: Client::from_conf(s3_config),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Origin {
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<&str>,
    ) -> Result<FetchedObject, OriginError> {
        debug!(bucket, key, ?range, "GetObject");

        let mut request = self.client.get_object().bucket(bucket).key(key);
        if let Some(range) = range {
            request = request.range(range);
        }

        let output = request.send().await.map_err(classify)?;

        let meta = ObjectMetadata {
            content_type: output.content_type().map(str::to_string),
            content_length: output.content_length().and_then(|v| u64::try_from(v).ok()),
            etag: output.e_tag().map(str::to_string),
            last_modified: output.last_modified().and_then(to_chrono),
            content_range: output.content_range().map(str::to_string),
            accept_ranges: output.accept_ranges().map(str::to_string),
        };

        let body: BodyStream = Box::pin(ReaderStream::new(output.body.into_async_read()));
        Ok(FetchedObject { meta, body })
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata, OriginError> {
        debug!(bucket, key, "HeadObject");

        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(classify)?;

        Ok(ObjectMetadata {
            content_type: output.content_type().map(str::to_string),
            content_length: output.content_length().and_then(|v| u64::try_from(v).ok()),
            etag: output.e_tag().map(str::to_string),
            last_modified: output.last_modified().and_then(to_chrono),
            content_range: None,
            accept_ranges: output.accept_ranges().map(str::to_string),
        })
    }
}

/// Classify an SDK failure into the origin error taxonomy.
fn classify<E>(err: SdkError<E>) -> OriginError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::TimeoutError(_) => {
            OriginError::new(OriginErrorKind::Timeout, "origin request timed out")
        }
        SdkError::DispatchFailure(failure) if failure.is_timeout() => {
            OriginError::new(OriginErrorKind::Timeout, "origin dispatch timed out")
        }
        SdkError::ServiceError(service) => {
            let code = service.err().meta().code().unwrap_or_default().to_string();
            let kind = classify_code(&code, service.raw().status().as_u16());
            OriginError::new(kind, format!("{code}: {err}"))
        }
        _ => OriginError::new(OriginErrorKind::Other, err.to_string()),
    }
}

/// Map an S3 error code (or bare status) onto the discriminator.
fn classify_code(code: &str, status: u16) -> OriginErrorKind {
    match code {
        "NoSuchKey" => OriginErrorKind::NoSuchKey,
        "NoSuchBucket" => OriginErrorKind::NoSuchBucket,
        "AccessDenied" => OriginErrorKind::AccessDenied,
        // HEAD failures surface no body, so no code; fall back to status.
        _ => match status {
            404 => OriginErrorKind::NoSuchKey,
            403 => OriginErrorKind::AccessDenied,
            _ => OriginErrorKind::Other,
        },
    }
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

fn endpoint_url(endpoint: &str, use_ssl: bool) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else if use_ssl {
        format!("https://{endpoint}")
    } else {
        format!("http://{endpoint}")
    }
}

/// A parsed HTTP `Range` header, validated just enough to forward.
pub fn validate_range(header: &str) -> Option<&str> {
    let spec = header.strip_prefix("bytes=")?;
    let mut parts = spec.splitn(2, '-');
    let start = parts.next()?;
    let end = parts.next()?;
    if start.is_empty() && end.is_empty() {
        return None;
    }
    let numeric = |s: &str| s.is_empty() || s.chars().all(|c| c.is_ascii_digit());
    if numeric(start) && numeric(end) {
        Some(header)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_codes() {
        assert_eq!(classify_code("NoSuchKey", 404), OriginErrorKind::NoSuchKey);
        assert_eq!(classify_code("NoSuchBucket", 404), OriginErrorKind::NoSuchBucket);
        assert_eq!(classify_code("AccessDenied", 403), OriginErrorKind::AccessDenied);
        assert_eq!(classify_code("SlowDown", 503), OriginErrorKind::Other);
        // Bare statuses from HEAD responses.
        assert_eq!(classify_code("", 404), OriginErrorKind::NoSuchKey);
        assert_eq!(classify_code("", 403), OriginErrorKind::AccessDenied);
        assert_eq!(classify_code("", 500), OriginErrorKind::Other);
    }

    #[test]
    fn test_error_surface_mapping() {
        let not_found = OriginError::new(OriginErrorKind::NoSuchKey, "gone");
        assert_eq!(not_found.into_edge("videos/a.mp4").status_code(), 404);

        let denied = OriginError::new(OriginErrorKind::AccessDenied, "nope");
        assert_eq!(denied.into_edge("videos/a.mp4").status_code(), 403);

        let timeout = OriginError::new(OriginErrorKind::Timeout, "slow");
        assert_eq!(timeout.into_edge("videos/a.mp4").status_code(), 502);
    }

    #[test]
    fn test_endpoint_url_scheme() {
        assert_eq!(endpoint_url("http://minio:9000", false), "http://minio:9000");
        assert_eq!(endpoint_url("minio:9000", false), "http://minio:9000");
        assert_eq!(endpoint_url("minio:9000", true), "https://minio:9000");
    }

    #[test]
    fn test_validate_range() {
        assert_eq!(validate_range("bytes=0-1023"), Some("bytes=0-1023"));
        assert_eq!(validate_range("bytes=100-"), Some("bytes=100-"));
        assert_eq!(validate_range("bytes=-500"), Some("bytes=-500"));
        assert_eq!(validate_range("bytes=-"), None);
        assert_eq!(validate_range("items=0-10"), None);
        assert_eq!(validate_range("bytes=a-b"), None);
    }
}
