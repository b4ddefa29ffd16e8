//! Origin HTTP fetches.
//!
//! Manifests are buffered whole; segments are exposed as a byte stream so the
//! relay never holds a full segment in memory.

use crate::config::UpstreamLimits;
use crate::error::{RelayError, Result};
use crate::upstream::headers::OutboundHeaders;
use axum::body::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::{Client, Method, StatusCode, header::HeaderMap, redirect};
use std::pin::Pin;
use tracing::{error, info};
use url::Url;

/// Segment body as it arrives from the origin
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Origin response headers, lower-cased names, first occurrence wins.
///
/// Every `Set-Cookie` line is kept separately since cookies are commonly
/// split over several header lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OriginHeaders {
    entries: Vec<(String, String)>,
    set_cookies: Vec<String>,
}

impl OriginHeaders {
    pub fn from_header_map(map: &HeaderMap) -> Self {
        let mut headers = OriginHeaders::default();
        for (name, value) in map {
            let value = String::from_utf8_lossy(value.as_bytes()).trim().to_string();
            headers.push(name.as_str(), value);
        }
        headers
    }

    fn push(&mut self, name: &str, value: String) {
        let name = name.to_ascii_lowercase();
        if name == "set-cookie" {
            self.set_cookies.push(value.clone());
        }
        if !self.entries.iter().any(|(k, _)| *k == name) {
            self.entries.push((name, value));
        }
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

    /// All `Set-Cookie` values folded into one comma-joined string
    pub fn set_cookie(&self) -> Option<String> {
        if self.set_cookies.is_empty() {
            None
        } else {
            Some(self.set_cookies.join(", "))
        }
    }
}

/// Fully buffered manifest response
#[derive(Debug)]
pub struct ManifestResponse {
    /// Final URL after redirects; relative playlist references resolve against it
    pub url: Url,
    pub status: StatusCode,
    pub headers: OriginHeaders,
    pub body: Bytes,
}

impl ManifestResponse {
    /// Decode the buffered body as UTF-8 playlist text
    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(&self.body).map_err(|e| RelayError::ManifestDecode(e.to_string()))
    }
}

/// Streaming segment response
pub struct SegmentResponse {
    pub status: StatusCode,
    pub headers: OriginHeaders,
    pub body: BodyStream,
}

impl std::fmt::Debug for SegmentResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Performs origin requests with verified TLS, bounded redirects and no
/// idle connection reuse: each fetch owns its connection, which is closed
/// once the response (or its body stream) is dropped.
#[derive(Clone, Debug)]
pub struct OriginFetcher {
    client: Client,
    limits: UpstreamLimits,
}

impl OriginFetcher {
    pub fn new(limits: UpstreamLimits) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(limits.connect_timeout)
            .redirect(redirect::Policy::limited(limits.max_redirects))
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| RelayError::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, limits })
    }

    pub fn limits(&self) -> &UpstreamLimits {
        &self.limits
    }

    /// Fetch a playlist and buffer its body.
    ///
    /// # Errors
    /// [`RelayError::UpstreamUnreachable`] on any transport failure, including
    /// a timeout while reading the body.
    pub async fn fetch_manifest(
        &self,
        url: &Url,
        headers: &OutboundHeaders,
    ) -> Result<ManifestResponse> {
        info!("Fetching manifest from origin: {}", url);

        let response = self
            .client
            .get(url.clone())
            .headers(headers.to_header_map())
            .timeout(self.limits.manifest_timeout)
            .send()
            .await
            .map_err(|e| transport_error(url, e))?;

        let final_url = response.url().clone();
        let status = response.status();
        let origin_headers = OriginHeaders::from_header_map(response.headers());
        let body = response.bytes().await.map_err(|e| transport_error(url, e))?;

        info!("Manifest fetched: {} ({} bytes)", status, body.len());

        Ok(ManifestResponse {
            url: final_url,
            status,
            headers: origin_headers,
            body,
        })
    }

    /// Start a segment fetch and return as soon as the origin's headers arrive.
    ///
    /// `HEAD` suppresses the body transfer.
    pub async fn fetch_segment(
        &self,
        url: &Url,
        headers: &OutboundHeaders,
        method: Method,
    ) -> Result<SegmentResponse> {
        if method != Method::GET && method != Method::HEAD {
            return Err(RelayError::BadRequest(format!(
                "Method {method} not supported for segments"
            )));
        }

        info!("Fetching segment from origin: {} {}", method, url);

        let response = self
            .client
            .request(method, url.clone())
            .headers(headers.to_header_map())
            .timeout(self.limits.segment_timeout)
            .send()
            .await
            .map_err(|e| transport_error(url, e))?;

        let status = response.status();
        let origin_headers = OriginHeaders::from_header_map(response.headers());
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(RelayError::from))
            .boxed();

        Ok(SegmentResponse {
            status,
            headers: origin_headers,
            body,
        })
    }
}

fn transport_error(url: &Url, err: reqwest::Error) -> RelayError {
    error!("Origin fetch failed for {}: {}", url, err);
    RelayError::from(err)
}
