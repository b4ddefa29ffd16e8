//! Line-oriented playlist rewriting.
//!
//! The playlist is never parsed into a model and re-serialized: players are
//! picky about tags a parser might drop or reformat, so every line that does
//! not carry a reference is emitted byte-for-byte.

use crate::upstream::SpoofIdentity;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tracing::debug;
use url::Url;

/// Characters left unescaped in a query component (same set as `encodeURIComponent`)
const QUERY_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Proxy endpoint a rewritten reference is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyEndpoint {
    Manifest,
    Segment,
}

impl ProxyEndpoint {
    pub fn path(self) -> &'static str {
        match self {
            ProxyEndpoint::Manifest => "/manifest-proxy",
            ProxyEndpoint::Segment => "/segment-proxy",
        }
    }
}

/// Classification of one playlist line, decided from the line alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestLine {
    Blank,
    Comment,
    TagStreamInf,
    TagKey,
    TagMedia,
    Reference,
}

impl ManifestLine {
    pub fn classify(raw: &str) -> Self {
        let line = trim_line(raw);
        if line.is_empty() {
            return ManifestLine::Blank;
        }
        if !line.starts_with('#') {
            return ManifestLine::Reference;
        }
        if starts_with_ignore_case(line, "#EXT-X-STREAM-INF") {
            ManifestLine::TagStreamInf
        } else if starts_with_ignore_case(line, "#EXT-X-KEY:") {
            ManifestLine::TagKey
        } else if starts_with_ignore_case(line, "#EXT-X-MEDIA:") {
            ManifestLine::TagMedia
        } else {
            ManifestLine::Comment
        }
    }
}

/// Everything a single rewrite pass needs
#[derive(Debug, Clone)]
pub struct RewriteContext {
    /// URL the playlist was fetched from; relative references resolve against it
    pub base_url: Url,
    pub identity: SpoofIdentity,
    /// This service's public address, without trailing slash
    pub proxy_base_url: String,
    /// Percent-encoded identity JSON, computed once per pass
    headers_param: String,
}

impl RewriteContext {
    pub fn new(base_url: Url, identity: SpoofIdentity, proxy_base_url: &str) -> Self {
        let headers_param = utf8_percent_encode(&identity.to_json(), QUERY_COMPONENT).to_string();
        Self {
            base_url,
            identity,
            proxy_base_url: proxy_base_url.trim_end_matches('/').to_string(),
            headers_param,
        }
    }

    /// Link to `endpoint` on this proxy carrying `absolute` and the identity
    pub fn proxy_url(&self, endpoint: ProxyEndpoint, absolute: &str) -> String {
        format!(
            "{}{}?url={}&headers={}",
            self.proxy_base_url,
            endpoint.path(),
            utf8_percent_encode(absolute, QUERY_COMPONENT),
            self.headers_param
        )
    }

    /// Resolve a playlist reference against the playlist URL.
    /// Unresolvable references are returned untouched.
    pub fn resolve(&self, reference: &str) -> String {
        self.base_url
            .join(reference)
            .map(String::from)
            .unwrap_or_else(|_| reference.to_string())
    }
}

/// Rewrite every reference in `body` to route through this proxy.
///
/// Lines are split on `\r?\n` and re-joined with `\n`.
pub fn rewrite(body: &str, ctx: &RewriteContext) -> String {
    let mut out = String::with_capacity(body.len() * 2);
    let mut rewritten = 0usize;

    for (idx, raw) in body.split('\n').enumerate() {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        if idx > 0 {
            out.push('\n');
        }

        match rewrite_line(raw, ctx) {
            Some(line) => {
                rewritten += 1;
                out.push_str(&line);
            }
            None => out.push_str(raw),
        }
    }

    debug!("Rewrote {} playlist references", rewritten);
    out
}

/// Rewritten form of `raw`, or `None` when the line passes through verbatim.
fn rewrite_line(raw: &str, ctx: &RewriteContext) -> Option<String> {
    match ManifestLine::classify(raw) {
        ManifestLine::Blank | ManifestLine::Comment | ManifestLine::TagStreamInf => None,
        ManifestLine::TagKey => rewrite_tag_uri(raw, ctx, ProxyEndpoint::Segment),
        ManifestLine::TagMedia => rewrite_tag_uri(raw, ctx, ProxyEndpoint::Manifest),
        ManifestLine::Reference => {
            let absolute = ctx.resolve(trim_line(raw));
            let endpoint = if is_playlist(&absolute) {
                ProxyEndpoint::Manifest
            } else {
                ProxyEndpoint::Segment
            };
            Some(ctx.proxy_url(endpoint, &absolute))
        }
    }
}

/// Replace the quoted `URI="..."` value of a tag line with a proxy link
fn rewrite_tag_uri(raw: &str, ctx: &RewriteContext, endpoint: ProxyEndpoint) -> Option<String> {
    let (uri, value_start, value_end) = extract_quoted_uri(raw)?;
    let absolute = ctx.resolve(uri);
    let proxied = ctx.proxy_url(endpoint, &absolute);

    let mut line = String::with_capacity(raw.len() + proxied.len());
    line.push_str(&raw[..value_start]);
    line.push_str(&proxied);
    line.push_str(&raw[value_end..]);
    Some(line)
}

/// Locate a non-empty `URI="..."` attribute (name matched case-insensitively).
///
/// Returns the value and the byte range it occupies between the quotes.
pub fn extract_quoted_uri(line: &str) -> Option<(&str, usize, usize)> {
    const MARKER: &str = "uri=\"";
    let lower = line.to_ascii_lowercase();

    let mut search_from = 0;
    while let Some(found) = lower[search_from..].find(MARKER) {
        let marker_pos = search_from + found;
        search_from = marker_pos + MARKER.len();

        // Must be a whole attribute name, not the tail of e.g. `XURI=`
        let standalone = marker_pos == 0
            || matches!(line.as_bytes()[marker_pos - 1], b':' | b',' | b' ' | b'\t');
        if !standalone {
            continue;
        }

        let value_start = marker_pos + MARKER.len();
        let closing = line[value_start..].find('"')?;
        if closing == 0 {
            return None;
        }
        let value_end = value_start + closing;
        return Some((&line[value_start..value_end], value_start, value_end));
    }

    None
}

/// Sub-playlists are recognised by a `.m3u8` marker in the resolved path
fn is_playlist(absolute: &str) -> bool {
    let path = match Url::parse(absolute) {
        Ok(url) => url.path().to_ascii_lowercase(),
        Err(_) => absolute.to_ascii_lowercase(),
    };
    path.contains(".m3u8")
}

/// Whitespace and byte-order marks are ignored at both ends of a line
fn trim_line(raw: &str) -> &str {
    raw.trim_matches(|c: char| c.is_whitespace() || c == '\u{FEFF}')
}

fn starts_with_ignore_case(line: &str, prefix: &str) -> bool {
    line.len() >= prefix.len()
        && line.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}
