//! Streaming object fetch pipeline.
//!
//! The pipeline turns `(bucket, key, range)` into an HTTP response:
//!
//! 1. Rangeless requests consult the cache first; a hit is served straight
//!    from the stored item with `X-Cache: HIT`.
//! 2. Misses fetch from the origin, passing any `Range` header through.
//! 3. HLS playlists are buffered whole, rewritten to re-anchor every
//!    reference at this edge, and cached when small enough.
//! 4. Everything else streams to the client through a tee that buffers up
//!    to the cacheable ceiling; when the stream ends cleanly and the
//!    request was rangeless, the buffer is admitted to the cache. A buffer
//!    that outgrows the ceiling is discarded mid-flight and the stream
//!    continues uncached, as does a stream the client abandons.
//!
//! Cache faults never surface here: a failed lookup is a miss, a failed
//! admission is forgotten. Origin faults map to 404/403/502 before headers
//! are flushed; afterwards they simply terminate the stream.

use crate::cache::{cache_key, CacheItem, CacheManager, SetOptions};
use crate::config::{EdgeConfig, MAX_PLAYLIST_CACHE_BYTES};
use crate::error::{EdgeError, Result};
use crate::origin::{BodyStream, FetchedObject, ObjectMetadata, ObjectStore};
use crate::proxy::mime;
use crate::proxy::playlist::{rewrite_playlist, RewriteContext};
use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, warn};

const CACHE_CONTROL_VALUE: &str = "public, max-age=3600";
static X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// The request-serving core shared by the object handlers.
pub struct FetchPipeline {
    cache: Arc<CacheManager>,
    origin: Arc<dyn ObjectStore>,
    http: reqwest::Client,
    max_cacheable_bytes: u64,
    public_base: url::Url,
    cdn_base: String,
}

impl FetchPipeline {
    pub fn new(
        cache: Arc<CacheManager>,
        origin: Arc<dyn ObjectStore>,
        config: &EdgeConfig,
    ) -> Result<Self> {
        let public_base = url::Url::parse(&config.server.public_base())
            .map_err(|e| EdgeError::Config(format!("invalid public base URL: {e}")))?;

        let http = reqwest::Client::builder()
            .timeout(config.origin.request_timeout)
            .build()
            .map_err(|e| EdgeError::Config(format!("passthrough client: {e}")))?;

        Ok(Self {
            cache,
            origin,
            http,
            max_cacheable_bytes: config.cache.max_cacheable_bytes,
            public_base,
            cdn_base: config.server.cdn_base.clone(),
        })
    }

    /// Serve a GET for an object.
    pub async fn serve_get(
        &self,
        bucket: &str,
        key: &str,
        range: Option<&str>,
        request_path: &str,
    ) -> Result<Response> {
        let cache_key = cache_key(bucket, key, range);

        if range.is_none() {
            if let Some(item) = self.cache.get(&cache_key).await {
                debug!(key = %cache_key, "Serving from cache");
                return Ok(self.cached_response(item, key));
            }
        }

        let fetched = self
            .origin
            .get_object(bucket, key, range)
            .await
            .map_err(|e| e.into_edge(&format!("{bucket}/{key}")))?;

        if range.is_none() && mime::is_hls_playlist(fetched.meta.content_type.as_deref(), key) {
            return self.serve_playlist(fetched, cache_key, request_path).await;
        }

        self.serve_stream(fetched, cache_key, key, range.is_some())
            .await
    }

    /// Serve a HEAD for an object: GET semantics minus the body.
    pub async fn serve_head(&self, bucket: &str, key: &str) -> Result<Response> {
        let meta = self
            .origin
            .head_object(bucket, key)
            .await
            .map_err(|e| e.into_edge(&format!("{bucket}/{key}")))?;

        let content_type = mime::resolve(meta.content_type.as_deref(), key, &[]);
        let headers = self.object_headers(&meta, &content_type, meta.content_length, None);

        Ok((StatusCode::OK, headers, Body::empty()).into_response())
    }

    /// Stream a wrapped external playlist reference. Never cached.
    pub async fn serve_passthrough(&self, raw_url: &str) -> Result<Response> {
        let url = url::Url::parse(raw_url)
            .map_err(|_| EdgeError::BadRequest(format!("invalid passthrough url: {raw_url}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(EdgeError::BadRequest(format!(
                "unsupported passthrough scheme: {}",
                url.scheme()
            )));
        }

        let upstream = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| EdgeError::Origin(format!("passthrough fetch: {e}")))?;

        let status = StatusCode::from_u16(upstream.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);

        let mut headers = HeaderMap::new();
        for name in [header::CONTENT_TYPE, header::CONTENT_LENGTH] {
            if let Some(value) = upstream.headers().get(&name) {
                headers.insert(name, value.clone());
            }
        }
        insert_header(&mut headers, header::CACHE_CONTROL, "no-store");

        let body = upstream
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e)));
        Ok((status, headers, Body::from_stream(body)).into_response())
    }

    fn cached_response(&self, item: CacheItem, key: &str) -> Response {
        let content_type = match &item.content_type {
            Some(content_type) => content_type.clone(),
            None => mime::resolve(None, key, &item.data),
        };
        let meta = ObjectMetadata {
            etag: item.etag.clone(),
            last_modified: item.last_modified,
            ..ObjectMetadata::default()
        };
        let headers = self.object_headers(&meta, &content_type, Some(item.size), Some("HIT"));

        (StatusCode::OK, headers, Body::from(item.data)).into_response()
    }

    async fn serve_playlist(
        &self,
        fetched: FetchedObject,
        cache_key: String,
        request_path: &str,
    ) -> Result<Response> {
        let meta = fetched.meta;
        let raw = collect_body(fetched.body)
            .await
            .map_err(|e| EdgeError::Origin(format!("reading playlist body: {e}")))?;
        let text = std::str::from_utf8(&raw)
            .map_err(|e| EdgeError::Rewrite(format!("playlist is not UTF-8: {e}")))?;

        let ctx = self.rewrite_context(request_path)?;
        let rewritten = Bytes::from(rewrite_playlist(text, &ctx)?);

        let content_type = match meta.content_type.as_deref() {
            Some(ct) if !mime::is_generic(ct) => ct.to_string(),
            _ => mime::HLS_MIME_TYPES[0].to_string(),
        };

        if (rewritten.len() as u64) < MAX_PLAYLIST_CACHE_BYTES {
            let opts = SetOptions {
                ttl: None,
                content_type: Some(content_type.clone()),
                etag: meta.etag.clone(),
                last_modified: meta.last_modified,
            };
            self.cache.set(&cache_key, rewritten.clone(), opts).await;
        }

        // Content-Length reflects the rewritten body, not the origin's.
        let headers =
            self.object_headers(&meta, &content_type, Some(rewritten.len() as u64), Some("MISS"));
        Ok((StatusCode::OK, headers, Body::from(rewritten)).into_response())
    }

    async fn serve_stream(
        &self,
        fetched: FetchedObject,
        cache_key: String,
        key: &str,
        ranged: bool,
    ) -> Result<Response> {
        let meta = fetched.meta;
        let mut body = fetched.body;

        // Resolve the served type, peeking at the first chunk only when
        // neither the origin nor the extension says anything useful.
        let origin_type = meta.content_type.as_deref();
        let needs_sniff =
            origin_type.map(mime::is_generic).unwrap_or(true) && mime::from_extension(key).is_none();
        let (content_type, body): (String, BodyStream) = if needs_sniff {
            let first = body.next().await;
            let head = match &first {
                Some(Ok(chunk)) => chunk.clone(),
                _ => Bytes::new(),
            };
            let content_type = mime::resolve(origin_type, key, &head);
            (content_type, Box::pin(futures::stream::iter(first).chain(body)))
        } else {
            (mime::resolve(origin_type, key, &[]), body)
        };

        let status = if meta.content_range.is_some() {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        };

        // Tee into the cache when the response is a cacheable candidate.
        let advertised_fits = meta
            .content_length
            .map(|len| len <= self.max_cacheable_bytes)
            .unwrap_or(true);
        let body: BodyStream = if !ranged && advertised_fits {
            let cache = Arc::clone(&self.cache);
            let opts = SetOptions {
                ttl: None,
                content_type: Some(content_type.clone()),
                etag: meta.etag.clone(),
                last_modified: meta.last_modified,
            };
            let expected_len = meta.content_length;
            let fill_key = cache_key.clone();

            Box::pin(TeeStream::new(
                body,
                self.max_cacheable_bytes as usize,
                move |bytes: Bytes| {
                    if let Some(expected) = expected_len {
                        if bytes.len() as u64 != expected {
                            debug!(key = %fill_key, "Truncated stream, skipping cache fill");
                            return;
                        }
                    }
                    tokio::spawn(async move {
                        if !cache.set(&fill_key, bytes, opts).await {
                            debug!(key = %fill_key, "Cache fill rejected");
                        }
                    });
                },
            ))
        } else {
            body
        };

        let headers =
            self.object_headers(&meta, &content_type, meta.content_length, Some("MISS"));
        Ok((status, headers, Body::from_stream(body)).into_response())
    }

    /// Compose the standard object response headers.
    fn object_headers(
        &self,
        meta: &ObjectMetadata,
        content_type: &str,
        content_length: Option<u64>,
        x_cache: Option<&str>,
    ) -> HeaderMap {
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, header::CONTENT_TYPE, content_type);
        if let Some(length) = content_length {
            insert_header(&mut headers, header::CONTENT_LENGTH, &length.to_string());
        }
        insert_header(&mut headers, header::ACCEPT_RANGES, "bytes");
        insert_header(&mut headers, header::CACHE_CONTROL, CACHE_CONTROL_VALUE);
        if let Some(x_cache) = x_cache {
            insert_header(&mut headers, X_CACHE.clone(), x_cache);
        }
        if let Some(etag) = &meta.etag {
            insert_header(&mut headers, header::ETAG, etag);
        }
        if let Some(last_modified) = meta.last_modified {
            insert_header(&mut headers, header::LAST_MODIFIED, &httpdate(last_modified));
        }
        if let Some(content_range) = &meta.content_range {
            insert_header(&mut headers, header::CONTENT_RANGE, content_range);
        }
        headers
    }

    fn rewrite_context(&self, request_path: &str) -> Result<RewriteContext> {
        let playlist_url = self
            .public_base
            .join(request_path)
            .map_err(|e| EdgeError::Rewrite(format!("playlist URL: {e}")))?;
        let passthrough_url = self
            .public_base
            .join(&format!("/{}/passthrough", self.cdn_base))
            .map_err(|e| EdgeError::Rewrite(format!("passthrough URL: {e}")))?;
        Ok(RewriteContext::new(playlist_url, passthrough_url))
    }
}

/// Insert a header, skipping values the wire format cannot carry.
fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => warn!(header = %name, "Dropping malformed header value"),
    }
}

/// HTTP-date formatting for `Last-Modified`.
fn httpdate(dt: DateTime<Utc>) -> String {
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

async fn collect_body(mut body: BodyStream) -> io::Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// Stream adapter that forwards chunks while teeing them into a bounded
/// buffer. A clean end of stream hands the buffer to `on_complete`; growing
/// past the limit, a stream error, or being dropped early all discard it.
struct TeeStream<F: FnOnce(Bytes) + Send + Unpin> {
    inner: BodyStream,
    buffer: Option<BytesMut>,
    limit: usize,
    on_complete: Option<F>,
}

impl<F: FnOnce(Bytes) + Send + Unpin> TeeStream<F> {
    fn new(inner: BodyStream, limit: usize, on_complete: F) -> Self {
        Self {
            inner,
            buffer: Some(BytesMut::new()),
            limit,
            on_complete: Some(on_complete),
        }
    }
}

impl<F: FnOnce(Bytes) + Send + Unpin> Stream for TeeStream<F> {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(buffer) = this.buffer.as_mut() {
                    if buffer.len() + chunk.len() > this.limit {
                        // Advertised length was wrong; stop buffering but
                        // keep streaming.
                        this.buffer = None;
                        this.on_complete = None;
                    } else {
                        buffer.extend_from_slice(&chunk);
                    }
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.buffer = None;
                this.on_complete = None;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if let (Some(buffer), Some(on_complete)) =
                    (this.buffer.take(), this.on_complete.take())
                {
                    on_complete(buffer.freeze());
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn body_of(chunks: Vec<io::Result<Bytes>>) -> BodyStream {
        Box::pin(stream::iter(chunks))
    }

    #[tokio::test]
    async fn test_tee_stream_hands_over_complete_body() {
        let captured = Arc::new(tokio::sync::Mutex::new(None));
        let sink = Arc::clone(&captured);

        let tee = TeeStream::new(
            body_of(vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cd"))]),
            1024,
            move |bytes| {
                *sink.try_lock().unwrap() = Some(bytes);
            },
        );

        let forwarded: Vec<Bytes> = tee.map(|c| c.unwrap()).collect().await;
        assert_eq!(forwarded, vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cd")]);
        assert_eq!(captured.lock().await.as_deref(), Some(b"abcd".as_slice()));
    }

    #[tokio::test]
    async fn test_tee_stream_discards_over_limit() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);

        let tee = TeeStream::new(
            body_of(vec![Ok(Bytes::from_static(b"abcd")), Ok(Bytes::from_static(b"efgh"))]),
            5,
            move |_| flag.store(true, Ordering::SeqCst),
        );

        // All bytes still reach the client.
        let forwarded: Vec<Bytes> = tee.map(|c| c.unwrap()).collect().await;
        assert_eq!(forwarded.concat(), b"abcdefgh");
        // But the over-limit buffer never reaches the cache.
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_tee_stream_discards_on_error() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);

        let tee = TeeStream::new(
            body_of(vec![
                Ok(Bytes::from_static(b"ab")),
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "origin died")),
            ]),
            1024,
            move |_| flag.store(true, Ordering::SeqCst),
        );

        let results: Vec<io::Result<Bytes>> = tee.collect().await;
        assert!(results[1].is_err());
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_tee_stream_discards_when_dropped_early() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);

        let mut tee = TeeStream::new(
            body_of(vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cd"))]),
            1024,
            move |_| flag.store(true, Ordering::SeqCst),
        );

        // Client disconnects after the first chunk.
        let _ = tee.next().await;
        drop(tee);

        assert!(!called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_httpdate_format() {
        let dt = DateTime::parse_from_rfc3339("2026-03-01T12:30:45Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(httpdate(dt), "Sun, 01 Mar 2026 12:30:45 GMT");
    }

    #[test]
    fn test_insert_header_skips_malformed() {
        let mut headers = HeaderMap::new();
        insert_header(&mut headers, header::ETAG, "\"ok\"");
        insert_header(&mut headers, header::CONTENT_TYPE, "bad\nvalue");

        assert_eq!(headers.get(header::ETAG).unwrap(), "\"ok\"");
        assert!(headers.get(header::CONTENT_TYPE).is_none());
    }
}
