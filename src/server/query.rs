use crate::error::{RelayError, Result};
use crate::upstream::InboundHeaders;
use serde::Deserialize;
use url::Url;

/// Query string of `/manifest-proxy` and `/segment-proxy`
#[derive(Debug, Default, Deserialize)]
pub struct ProxyParams {
    pub url: Option<String>,
    /// JSON object of header overrides
    pub headers: Option<String>,
}

impl ProxyParams {
    /// The absolute origin URL to fetch
    pub fn target(&self) -> Result<Url> {
        let raw = self
            .url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| RelayError::BadRequest("Missing url parameter".to_string()))?;

        Url::parse(raw).map_err(|e| RelayError::BadRequest(format!("Invalid url parameter: {e}")))
    }

    pub fn inbound_headers(&self) -> Result<InboundHeaders> {
        match self.headers.as_deref().map(str::trim) {
            None | Some("") => Ok(InboundHeaders::new()),
            Some(raw) => InboundHeaders::from_json(raw),
        }
    }
}
