//! Outbound header forging.
//!
//! Origins that gate HLS content on `Referer`/`Origin`/`User-Agent` only see
//! the header set built here, never the client's raw request headers.

use crate::config::IdentityDefaults;
use crate::error::{RelayError, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Accept value sent when fetching playlists
pub const MANIFEST_ACCEPT: &str = "application/vnd.apple.mpegurl, application/x-mpegURL, text/plain, */*";
/// Accept value sent when fetching segments, keys, subtitles, thumbnails
pub const SEGMENT_ACCEPT: &str = "*/*";

const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9,ar;q=0.8";
const ACCEPT_ENCODING: &str = "gzip, deflate, br";

/// Which kind of upstream resource a header set is built for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Manifest,
    Segment,
}

impl FetchMode {
    pub fn accept(self) -> &'static str {
        match self {
            FetchMode::Manifest => MANIFEST_ACCEPT,
            FetchMode::Segment => SEGMENT_ACCEPT,
        }
    }
}

/// Header overrides supplied by the caller through the `headers` query parameter.
///
/// Lookups are case-insensitive and empty values count as absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundHeaders {
    entries: Vec<(String, String)>,
}

impl InboundHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Parse the JSON object carried in the `headers` query parameter.
    /// Non-string values are skipped.
    pub fn from_json(raw: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| RelayError::BadRequest(format!("Invalid headers parameter: {e}")))?;

        let serde_json::Value::Object(map) = value else {
            return Err(RelayError::BadRequest(
                "Invalid headers parameter: expected a JSON object".to_string(),
            ));
        };

        Ok(Self::from_pairs(map.into_iter().filter_map(|(k, v)| match v {
            serde_json::Value::String(s) => Some((k, s)),
            _ => None,
        })))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, v)| k.eq_ignore_ascii_case(name) && !v.is_empty())
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ordered header list sent to the origin. Names are unique, case-insensitively.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundHeaders {
    entries: Vec<(String, String)>,
}

impl OutboundHeaders {
    /// Append `name: value` unless the value is empty or the name is already present.
    fn push_if_absent(&mut self, name: &str, value: &str) {
        if value.is_empty() || self.contains(name) {
            return;
        }
        self.entries.push((name.to_string(), value.to_string()));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Convert to a reqwest header map, dropping names or values that are not valid HTTP.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.entries.len());
        for (name, value) in &self.entries {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(n), Ok(v)) => {
                    map.insert(n, v);
                }
                _ => warn!("Dropping invalid outbound header: {}", name),
            }
        }
        map
    }
}

/// Build the header set sent upstream.
///
/// Precedence: identity (inbound override or default), fixed protocol headers,
/// segment-only `Cookie`/`Range`, then every other inbound header except
/// `Host` and `Content-Length`.
pub fn build(
    inbound: &InboundHeaders,
    mode: FetchMode,
    client_range: Option<&str>,
    defaults: &IdentityDefaults,
) -> OutboundHeaders {
    let mut out = OutboundHeaders::default();

    out.push_if_absent(
        "User-Agent",
        inbound.get("user-agent").unwrap_or(&defaults.user_agent),
    );
    out.push_if_absent("Referer", inbound.get("referer").unwrap_or(&defaults.referer));
    out.push_if_absent("Origin", inbound.get("origin").unwrap_or(&defaults.origin));

    out.push_if_absent("Accept", mode.accept());
    out.push_if_absent("Accept-Language", ACCEPT_LANGUAGE);
    out.push_if_absent("Accept-Encoding", ACCEPT_ENCODING);

    match mode {
        FetchMode::Manifest => {
            out.push_if_absent("Cache-Control", "no-cache");
            out.push_if_absent("Pragma", "no-cache");
            out.push_if_absent("Connection", "keep-alive");
            out.push_if_absent("Sec-Fetch-Site", "cross-site");
            out.push_if_absent("Sec-Fetch-Mode", "cors");
            out.push_if_absent("Sec-Fetch-Dest", "video");
        }
        FetchMode::Segment => {
            out.push_if_absent("Connection", "keep-alive");
            if let Some(cookie) = inbound.get("cookie") {
                out.push_if_absent("Cookie", cookie);
            }
            if let Some(range) = client_range {
                out.push_if_absent("Range", range);
            }
        }
    }

    for (name, value) in inbound.iter() {
        if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        out.push_if_absent(name, value);
    }

    out
}

/// Identity re-embedded into every rewritten playlist reference, so follow-up
/// requests to this proxy rebuild the same outbound header set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpoofIdentity {
    #[serde(rename = "Referer")]
    pub referer: String,
    #[serde(rename = "Origin")]
    pub origin: String,
    #[serde(rename = "User-Agent")]
    pub user_agent: String,
    #[serde(rename = "Cookie", skip_serializing_if = "Option::is_none", default)]
    pub cookie: Option<String>,
}

impl SpoofIdentity {
    /// Resolve the identity for one manifest response.
    ///
    /// A cookie freshly harvested from the origin beats the inbound one.
    pub fn resolve(
        inbound: &InboundHeaders,
        harvested_cookie: &str,
        defaults: &IdentityDefaults,
    ) -> Self {
        let cookie = if harvested_cookie.is_empty() {
            inbound.get("cookie").map(str::to_string)
        } else {
            Some(harvested_cookie.to_string())
        };

        Self {
            referer: inbound.get("referer").unwrap_or(&defaults.referer).to_string(),
            origin: inbound.get("origin").unwrap_or(&defaults.origin).to_string(),
            user_agent: inbound
                .get("user-agent")
                .unwrap_or(&defaults.user_agent)
                .to_string(),
            cookie,
        }
    }

    pub fn to_json(&self) -> String {
        // Only string fields, serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn defaults() -> IdentityDefaults {
        IdentityDefaults::default()
    }

    #[test]
    fn defaults_used_when_identity_missing() {
        let out = build(&InboundHeaders::new(), FetchMode::Manifest, None, &defaults());
        assert_eq!(out.get("User-Agent"), Some(crate::config::DEFAULT_USER_AGENT));
        assert_eq!(out.get("Referer"), Some(crate::config::DEFAULT_REFERER));
        assert_eq!(out.get("Origin"), Some(crate::config::DEFAULT_ORIGIN));
    }

    #[test]
    fn inbound_identity_used_verbatim() {
        let inbound = InboundHeaders::from_pairs([
            ("user-agent", "Custom/1.0"),
            ("REFERER", "https://a.example/page"),
            ("Origin", "https://a.example"),
        ]);
        let out = build(&inbound, FetchMode::Segment, None, &defaults());
        assert_eq!(out.get("user-agent"), Some("Custom/1.0"));
        assert_eq!(out.get("referer"), Some("https://a.example/page"));
        assert_eq!(out.get("origin"), Some("https://a.example"));
    }

    #[test]
    fn empty_inbound_value_treated_as_absent() {
        let inbound = InboundHeaders::from_pairs([("Referer", "")]);
        let out = build(&inbound, FetchMode::Manifest, None, &defaults());
        assert_eq!(out.get("Referer"), Some(crate::config::DEFAULT_REFERER));
    }

    #[test]
    fn accept_depends_on_mode() {
        let inbound = InboundHeaders::new();
        let manifest = build(&inbound, FetchMode::Manifest, None, &defaults());
        let segment = build(&inbound, FetchMode::Segment, None, &defaults());
        assert_eq!(manifest.get("Accept"), Some(MANIFEST_ACCEPT));
        assert_eq!(segment.get("Accept"), Some("*/*"));
        assert_eq!(manifest.get("Sec-Fetch-Mode"), Some("cors"));
        assert!(!segment.contains("Sec-Fetch-Mode"));
    }

    #[test]
    fn range_forwarded_in_segment_mode_only() {
        let inbound = InboundHeaders::new();
        let segment = build(&inbound, FetchMode::Segment, Some("bytes=0-999"), &defaults());
        let manifest = build(&inbound, FetchMode::Manifest, Some("bytes=0-999"), &defaults());
        assert_eq!(segment.get("Range"), Some("bytes=0-999"));
        assert!(!manifest.contains("Range"));
    }

    #[test]
    fn cookie_forwarded_for_segments() {
        let inbound = InboundHeaders::from_pairs([("cookie", "sid=abc")]);
        let out = build(&inbound, FetchMode::Segment, None, &defaults());
        assert_eq!(out.get("Cookie"), Some("sid=abc"));
    }

    #[test]
    fn host_and_content_length_never_forwarded() {
        let inbound = InboundHeaders::from_pairs([
            ("Host", "evil.example"),
            ("content-length", "42"),
            ("X-Token", "t"),
        ]);
        let out = build(&inbound, FetchMode::Segment, None, &defaults());
        assert!(!out.contains("host"));
        assert!(!out.contains("content-length"));
        assert_eq!(out.get("x-token"), Some("t"));
    }

    #[test]
    fn no_duplicate_names_for_colliding_input() {
        let inbound = InboundHeaders::from_pairs([
            ("accept", "text/html"),
            ("ACCEPT-LANGUAGE", "fr"),
            ("Connection", "close"),
            ("x-a", "1"),
            ("X-A", "2"),
            ("cookie", "a=1"),
            ("Cookie", "b=2"),
        ]);
        for mode in [FetchMode::Manifest, FetchMode::Segment] {
            let out = build(&inbound, mode, Some("bytes=0-"), &defaults());
            let mut seen = HashSet::new();
            for (name, _) in out.iter() {
                assert!(
                    seen.insert(name.to_ascii_lowercase()),
                    "duplicate header {name} in {mode:?}"
                );
            }
        }
    }

    #[test]
    fn fixed_headers_win_over_inbound_duplicates() {
        let inbound = InboundHeaders::from_pairs([("Accept", "text/html")]);
        let out = build(&inbound, FetchMode::Segment, None, &defaults());
        assert_eq!(out.get("accept"), Some("*/*"));
    }

    #[test]
    fn header_map_skips_invalid_entries() {
        let inbound = InboundHeaders::from_pairs([("bad header", "x"), ("X-Ok", "yes")]);
        let map = build(&inbound, FetchMode::Segment, None, &defaults()).to_header_map();
        assert_eq!(map.get("x-ok").unwrap(), "yes");
        assert!(map.get("user-agent").is_some());
        assert_eq!(map.len(), 8);
    }

    #[test]
    fn inbound_from_json_object() {
        let parsed =
            InboundHeaders::from_json(r#"{"Referer":"https://r.example/","n":5,"Cookie":"a=1"}"#)
                .unwrap();
        assert_eq!(parsed.get("referer"), Some("https://r.example/"));
        assert_eq!(parsed.get("cookie"), Some("a=1"));
        assert_eq!(parsed.get("n"), None);
    }

    #[test]
    fn inbound_from_json_rejects_non_objects() {
        assert!(InboundHeaders::from_json("[1,2]").is_err());
        assert!(InboundHeaders::from_json("{not json").is_err());
    }

    #[test]
    fn identity_prefers_harvested_cookie() {
        let inbound = InboundHeaders::from_pairs([("Cookie", "old=1")]);
        let identity = SpoofIdentity::resolve(&inbound, "fresh=2", &defaults());
        assert_eq!(identity.cookie.as_deref(), Some("fresh=2"));

        let identity = SpoofIdentity::resolve(&inbound, "", &defaults());
        assert_eq!(identity.cookie.as_deref(), Some("old=1"));
    }

    #[test]
    fn identity_json_shape() {
        let identity = SpoofIdentity::resolve(&InboundHeaders::new(), "", &defaults());
        let json: serde_json::Value = serde_json::from_str(&identity.to_json()).unwrap();
        assert_eq!(json["Referer"], crate::config::DEFAULT_REFERER);
        assert_eq!(json["Origin"], crate::config::DEFAULT_ORIGIN);
        assert_eq!(json["User-Agent"], crate::config::DEFAULT_USER_AGENT);
        assert!(json.get("Cookie").is_none());
    }
}
