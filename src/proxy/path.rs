// Request path to (bucket, key) mapping

use crate::error::{EdgeError, Result};

/// A parsed object reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPath {
    pub bucket: String,
    pub key: String,
}

/// Split a request path into `(bucket, key)`.
///
/// A single segment is a key in the default bucket. With multiple segments,
/// a first segment carrying no file extension is taken as the bucket name;
/// otherwise the whole path is a key in the default bucket. Empty paths are
/// rejected.
pub fn parse_object_path(path: &str, default_bucket: &str) -> Result<ObjectPath> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match segments.as_slice() {
        [] => Err(EdgeError::BadRequest("empty object path".to_string())),
        [key] => Ok(ObjectPath {
            bucket: default_bucket.to_string(),
            key: (*key).to_string(),
        }),
        [first, rest @ ..] => {
            if has_extension(first) {
                Ok(ObjectPath {
                    bucket: default_bucket.to_string(),
                    key: segments.join("/"),
                })
            } else {
                Ok(ObjectPath {
                    bucket: (*first).to_string(),
                    key: rest.join("/"),
                })
            }
        }
    }
}

fn has_extension(segment: &str) -> bool {
    match segment.rsplit_once('.') {
        Some((stem, ext)) => !stem.is_empty() && !ext.is_empty(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_segment_uses_default_bucket() {
        let parsed = parse_object_path("video.mp4", "vod").unwrap();
        assert_eq!(parsed.bucket, "vod");
        assert_eq!(parsed.key, "video.mp4");
    }

    #[test]
    fn test_first_segment_without_extension_is_bucket() {
        let parsed = parse_object_path("media/films/video.mp4", "vod").unwrap();
        assert_eq!(parsed.bucket, "media");
        assert_eq!(parsed.key, "films/video.mp4");
    }

    #[test]
    fn test_first_segment_with_extension_stays_in_key() {
        let parsed = parse_object_path("films.old/video.mp4", "vod").unwrap();
        assert_eq!(parsed.bucket, "vod");
        assert_eq!(parsed.key, "films.old/video.mp4");
    }

    #[test]
    fn test_empty_path_rejected() {
        assert!(parse_object_path("", "vod").is_err());
        assert!(parse_object_path("///", "vod").is_err());
    }

    #[test]
    fn test_leading_and_doubled_slashes_ignored() {
        let parsed = parse_object_path("/v//index.m3u8", "vod").unwrap();
        assert_eq!(parsed.bucket, "v");
        assert_eq!(parsed.key, "index.m3u8");
    }

    #[test]
    fn test_dotfile_segment_is_not_an_extension() {
        // ".hidden" has an empty stem, so it does not count as a file name.
        let parsed = parse_object_path(".hidden/video.mp4", "vod").unwrap();
        assert_eq!(parsed.bucket, ".hidden");
        assert_eq!(parsed.key, "video.mp4");
    }
}
