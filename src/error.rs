use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{error, warn};

use crate::server::cors;

/// Maximum number of origin body bytes echoed back in a non-success envelope.
pub const UPSTREAM_BODY_PREVIEW_LIMIT: usize = 1200;

/// Errors surfaced by the relay while serving a proxied request
#[derive(Error, Debug)]
pub enum RelayError {
    /// Missing or unusable `url` / `headers` query parameter
    #[error("{0}")]
    BadRequest(String),

    /// Transport-level failure talking to the origin (DNS, TLS, timeout, reset)
    #[error("Upstream error: {0}")]
    UpstreamUnreachable(String),

    /// Origin answered a manifest request with a non-2xx status
    #[error("Upstream ({status})")]
    UpstreamNonSuccess { status: StatusCode, body: String },

    /// Manifest body was not valid UTF-8
    #[error("Manifest decode error: {0}")]
    ManifestDecode(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// Build an [`RelayError::UpstreamNonSuccess`] keeping at most
    /// [`UPSTREAM_BODY_PREVIEW_LIMIT`] bytes of the origin body.
    pub fn upstream_non_success(status: StatusCode, body: &[u8]) -> Self {
        let mut end = body.len().min(UPSTREAM_BODY_PREVIEW_LIMIT);
        // Don't split a character that straddles the limit
        if let Err(e) = std::str::from_utf8(&body[..end])
            && e.error_len().is_none()
        {
            end = e.valid_up_to();
        }

        // Replacement characters can grow invalid input, so cap again
        let mut preview = String::from_utf8_lossy(&body[..end]).into_owned();
        if preview.len() > UPSTREAM_BODY_PREVIEW_LIMIT {
            let mut cut = UPSTREAM_BODY_PREVIEW_LIMIT;
            while !preview.is_char_boundary(cut) {
                cut -= 1;
            }
            preview.truncate(cut);
        }

        RelayError::UpstreamNonSuccess {
            status,
            body: preview,
        }
    }

    /// HTTP status the client sees for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            RelayError::UpstreamNonSuccess { status, .. } => *status,
            RelayError::ManifestDecode(_) | RelayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        RelayError::UpstreamUnreachable(err.to_string())
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = match &self {
            RelayError::UpstreamNonSuccess { status, body } => {
                warn!("Origin returned {}", status);
                format!("Upstream ({})\n{}", status.as_u16(), body)
            }
            RelayError::BadRequest(msg) => {
                warn!("Bad request: {}", msg);
                msg.clone()
            }
            other => {
                error!("{}", other);
                other.to_string()
            }
        };

        let mut response = (status, body).into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        cors::apply(headers);
        response
    }
}
