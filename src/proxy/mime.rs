// MIME classification for VOD assets

/// HLS playlist MIME types, as announced by origins in the wild.
pub const HLS_MIME_TYPES: [&str; 2] = ["application/vnd.apple.mpegurl", "application/x-mpegURL"];

const OCTET_STREAM: &str = "application/octet-stream";

/// MPEG-TS packet size; the sync byte repeats at this stride.
const TS_PACKET_SIZE: usize = 188;

/// Whether this response should go through the playlist rewriter.
pub fn is_hls_playlist(content_type: Option<&str>, key: &str) -> bool {
    if let Some(content_type) = content_type {
        let lowered = content_type.to_ascii_lowercase();
        if HLS_MIME_TYPES.iter().any(|m| lowered.contains(&m.to_ascii_lowercase())) {
            return true;
        }
    }
    key.to_ascii_lowercase().ends_with(".m3u8")
}

/// Whether the origin-reported type carries no real information.
pub fn is_generic(content_type: &str) -> bool {
    let trimmed = content_type.trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case(OCTET_STREAM)
}

/// Classify by file extension.
pub fn from_extension(key: &str) -> Option<&'static str> {
    let ext = key.rsplit('.').next()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "m3u8" => "application/vnd.apple.mpegurl",
        "ts" => "video/mp2t",
        "mp4" | "m4v" => "video/mp4",
        "m4s" => "video/iso.segment",
        "m4a" => "audio/mp4",
        "mp3" => "audio/mpeg",
        "aac" => "audio/aac",
        "vtt" | "webvtt" => "text/vtt",
        "srt" => "application/x-subrip",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "json" => "application/json",
        "xml" => "application/xml",
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        _ => return None,
    };
    Some(mime)
}

/// Upgrade a generic type from the payload's leading bytes: MPEG-TS sync
/// pattern, gzip, and zstd magics.
pub fn sniff(head: &[u8]) -> Option<&'static str> {
    if head.len() >= 2 && head[0] == 0x1F && head[1] == 0x8B {
        return Some("application/gzip");
    }
    if head.len() >= 4 && head[..4] == [0x28, 0xB5, 0x2F, 0xFD] {
        return Some("application/zstd");
    }
    if looks_like_transport_stream(head) {
        return Some("video/mp2t");
    }
    None
}

fn looks_like_transport_stream(head: &[u8]) -> bool {
    if head.len() < TS_PACKET_SIZE * 2 + 1 {
        return head.first() == Some(&0x47) && head.len() >= TS_PACKET_SIZE;
    }
    (0..3).all(|i| head.get(i * TS_PACKET_SIZE) == Some(&0x47))
}

/// Decide the served content type: a meaningful origin type wins, then the
/// key's extension, then a signature sniff of the leading bytes.
pub fn resolve(origin_type: Option<&str>, key: &str, head: &[u8]) -> String {
    if let Some(content_type) = origin_type {
        if !is_generic(content_type) {
            return content_type.to_string();
        }
    }
    if let Some(by_ext) = from_extension(key) {
        return by_ext.to_string();
    }
    if let Some(by_magic) = sniff(head) {
        return by_magic.to_string();
    }
    OCTET_STREAM.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hls_detection() {
        assert!(is_hls_playlist(Some("application/vnd.apple.mpegurl"), "x"));
        assert!(is_hls_playlist(Some("application/x-mpegURL"), "x"));
        assert!(is_hls_playlist(None, "v/index.m3u8"));
        assert!(is_hls_playlist(None, "v/INDEX.M3U8"));
        assert!(!is_hls_playlist(Some("video/mp4"), "v/video.mp4"));
    }

    #[test]
    fn test_extension_map() {
        assert_eq!(from_extension("a/b/seg0.ts"), Some("video/mp2t"));
        assert_eq!(from_extension("movie.MP4"), Some("video/mp4"));
        assert_eq!(from_extension("subs.vtt"), Some("text/vtt"));
        assert_eq!(from_extension("noext"), None);
    }

    #[test]
    fn test_sniff_ts_sync_pattern() {
        let mut packet = vec![0u8; TS_PACKET_SIZE * 3];
        packet[0] = 0x47;
        packet[TS_PACKET_SIZE] = 0x47;
        packet[TS_PACKET_SIZE * 2] = 0x47;
        assert_eq!(sniff(&packet), Some("video/mp2t"));

        packet[TS_PACKET_SIZE] = 0x00;
        assert_eq!(sniff(&packet), None);
    }

    #[test]
    fn test_sniff_compression_magics() {
        assert_eq!(sniff(&[0x1F, 0x8B, 0x08, 0x00]), Some("application/gzip"));
        assert_eq!(sniff(&[0x28, 0xB5, 0x2F, 0xFD, 0x00]), Some("application/zstd"));
        assert_eq!(sniff(b"plain text"), None);
    }

    #[test]
    fn test_resolve_precedence() {
        // A real origin type wins over everything.
        assert_eq!(resolve(Some("video/mp4"), "a.ts", &[]), "video/mp4");
        // Generic types defer to the extension.
        assert_eq!(resolve(Some("application/octet-stream"), "a.ts", &[]), "video/mp2t");
        // Extension beats sniffing.
        assert_eq!(resolve(None, "a.mp4", &[0x1F, 0x8B]), "video/mp4");
        // Sniffing is the last resort before octet-stream.
        assert_eq!(resolve(None, "blob", &[0x1F, 0x8B]), "application/gzip");
        assert_eq!(resolve(None, "blob", b"??"), "application/octet-stream");
    }
}
