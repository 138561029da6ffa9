//! A scripted in-process origin for exercising the fetch pipeline.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use vodedge::origin::{
    FetchedObject, ObjectMetadata, ObjectStore, OriginError, OriginErrorKind,
};

/// One scripted object.
#[derive(Clone)]
pub struct ScriptedObject {
    pub body: Bytes,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    /// Chunk size the body streams in; exercises multi-chunk tees.
    pub chunk_size: usize,
}

impl ScriptedObject {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            content_type: None,
            etag: Some("\"scripted-etag\"".to_string()),
            last_modified: Some(Utc::now()),
            chunk_size: 16 * 1024,
        }
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }
}

/// ObjectStore double: serves scripted objects, counts origin round trips,
/// and honors byte ranges the way an S3 origin would.
pub struct ScriptedOrigin {
    objects: Mutex<HashMap<String, ScriptedObject>>,
    get_calls: AtomicU64,
}

impl ScriptedOrigin {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            get_calls: AtomicU64::new(0),
        }
    }

    pub fn put(&self, bucket: &str, key: &str, object: ScriptedObject) {
        self.objects
            .lock()
            .unwrap()
            .insert(format!("{bucket}/{key}"), object);
    }

    /// Number of GetObject round trips served so far.
    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::SeqCst)
    }

    fn lookup(&self, bucket: &str, key: &str) -> Result<ScriptedObject, OriginError> {
        self.objects
            .lock()
            .unwrap()
            .get(&format!("{bucket}/{key}"))
            .cloned()
            .ok_or_else(|| OriginError::new(OriginErrorKind::NoSuchKey, format!("{bucket}/{key}")))
    }
}

impl Default for ScriptedOrigin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for ScriptedOrigin {
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<&str>,
    ) -> Result<FetchedObject, OriginError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let object = self.lookup(bucket, key)?;
        let total = object.body.len() as u64;

        let (slice, content_range) = match range {
            Some(range) => {
                let (start, end) = parse_range(range, total)
                    .ok_or_else(|| OriginError::new(OriginErrorKind::Other, "bad range"))?;
                (
                    object.body.slice(start as usize..=end as usize),
                    Some(format!("bytes {start}-{end}/{total}")),
                )
            }
            None => (object.body.clone(), None),
        };

        let meta = ObjectMetadata {
            content_type: object.content_type.clone(),
            content_length: Some(slice.len() as u64),
            etag: object.etag.clone(),
            last_modified: object.last_modified,
            content_range,
            accept_ranges: Some("bytes".to_string()),
        };

        let chunks: Vec<io::Result<Bytes>> = slice
            .chunks(object.chunk_size.max(1))
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        Ok(FetchedObject {
            meta,
            body: Box::pin(stream::iter(chunks)),
        })
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata, OriginError> {
        let object = self.lookup(bucket, key)?;
        Ok(ObjectMetadata {
            content_type: object.content_type.clone(),
            content_length: Some(object.body.len() as u64),
            etag: object.etag.clone(),
            last_modified: object.last_modified,
            content_range: None,
            accept_ranges: Some("bytes".to_string()),
        })
    }
}

fn parse_range(header: &str, total: u64) -> Option<(u64, u64)> {
    let spec = header.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = if end.is_empty() {
        total.checked_sub(1)?
    } else {
        end.parse().ok()?
    };
    (start <= end && end < total).then_some((start, end))
}
