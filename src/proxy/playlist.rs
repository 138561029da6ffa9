//! HLS playlist rewriting.
//!
//! For a stream to keep playing through this edge, every URI a playlist
//! references has to be re-anchored here: segment and variant lines, and the
//! `URI="..."` attributes carried by tags such as `#EXT-X-KEY` and
//! `#EXT-X-MEDIA`. The rewriter tokenizes the playlist line by line,
//! classifies each line by the HLS grammar (tag, comment, blank, bare URI),
//! resolves references against the playlist's own URL, and serializes the
//! result. Unknown tags pass through untouched.
//!
//! References that resolve to this edge's own host are emitted directly;
//! references to foreign hosts are wrapped through the passthrough route
//! with the original absolute URL percent-encoded, so even third-party
//! segments flow through the proxy. Because both forms land on the edge
//! host, rewriting an already rewritten playlist changes nothing.

use crate::error::{EdgeError, Result};
use url::Url;

const URI_ATTRIBUTE: &str = "URI=\"";

/// Everything the rewriter needs to know about where a playlist lives.
#[derive(Debug, Clone)]
pub struct RewriteContext {
    /// The playlist's URL as seen at this edge; relative references resolve
    /// against it.
    pub playlist_url: Url,
    /// Absolute URL of the passthrough route wrapping foreign references.
    pub passthrough_url: Url,
}

impl RewriteContext {
    pub fn new(playlist_url: Url, passthrough_url: Url) -> Self {
        Self {
            playlist_url,
            passthrough_url,
        }
    }

    fn is_local(&self, resolved: &Url) -> bool {
        resolved.scheme() == self.playlist_url.scheme()
            && resolved.host() == self.playlist_url.host()
            && resolved.port_or_known_default() == self.playlist_url.port_or_known_default()
    }
}

/// Rewrite a playlist body so every reference resolves through this edge.
pub fn rewrite_playlist(body: &str, ctx: &RewriteContext) -> Result<String> {
    let mut out = String::with_capacity(body.len() + body.len() / 4);

    for line in body.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let trimmed = line.trim();

        if trimmed.is_empty() {
            out.push('\n');
            continue;
        }

        if trimmed.starts_with('#') {
            if trimmed.contains(URI_ATTRIBUTE) {
                out.push_str(&rewrite_tag_line(line, ctx)?);
            } else {
                // Comment or tag without a URI attribute; pass through.
                out.push_str(line);
            }
        } else {
            out.push_str(&rewrite_uri(trimmed, ctx)?);
        }
        out.push('\n');
    }

    // split('\n') yields one piece more than the body has newlines, so the
    // loop always appends one terminator too many.
    out.pop();
    Ok(out)
}

/// Rewrite every `URI="..."` attribute inside a tag line.
fn rewrite_tag_line(line: &str, ctx: &RewriteContext) -> Result<String> {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;

    while let Some(idx) = rest.find(URI_ATTRIBUTE) {
        let value_start = idx + URI_ATTRIBUTE.len();
        out.push_str(&rest[..value_start]);

        let Some(value_len) = rest[value_start..].find('"') else {
            return Err(EdgeError::Rewrite(format!(
                "unterminated URI attribute in tag line: {line}"
            )));
        };

        let uri = &rest[value_start..value_start + value_len];
        out.push_str(&rewrite_uri(uri, ctx)?);
        rest = &rest[value_start + value_len..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Resolve a single reference and re-anchor it at this edge.
fn rewrite_uri(uri: &str, ctx: &RewriteContext) -> Result<String> {
    let resolved = ctx
        .playlist_url
        .join(uri)
        .map_err(|e| EdgeError::Rewrite(format!("cannot resolve '{uri}': {e}")))?;

    if ctx.is_local(&resolved) {
        return Ok(resolved.to_string());
    }

    let mut wrapped = ctx.passthrough_url.clone();
    wrapped
        .query_pairs_mut()
        .clear()
        .append_pair("url", resolved.as_str());
    Ok(wrapped.to_string())
}
