use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;

use crate::client::TransportError;
use crate::headers::Headers;

/// Why a single endpoint attempt failed, when the failure is routing-retryable.
///
/// This is a value, not an exception: selector loops inspect it to decide
/// whether to try another candidate. Request-shape problems (bad body, unknown
/// model) never take this form — they short-circuit as client responses.
#[derive(Debug)]
pub enum FailureKind {
    Transport(TransportError),
    /// Non-success response from the backend, kept verbatim so the last
    /// chance candidate can be proxied as-is.
    Upstream {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
    BreakerOpen,
    BulkheadFull,
    /// The host is inside a learned 429 backoff window; no network call was
    /// made.
    BackoffActive { retry_after: Duration },
}

#[derive(Debug)]
pub struct AttemptError {
    pub endpoint: String,
    pub kind: FailureKind,
}

impl AttemptError {
    pub fn new(endpoint: impl Into<String>, kind: FailureKind) -> Self {
        Self {
            endpoint: endpoint.into(),
            kind,
        }
    }

    /// Status a synthesized client response should carry if this failure ends
    /// up being terminal.
    pub fn status_hint(&self) -> StatusCode {
        match &self.kind {
            FailureKind::Transport(err) => match err.kind {
                crate::client::TransportErrorKind::Timeout
                | crate::client::TransportErrorKind::ReadTimeout => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            },
            FailureKind::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            FailureKind::BreakerOpen => StatusCode::SERVICE_UNAVAILABLE,
            FailureKind::BulkheadFull => StatusCode::TOO_MANY_REQUESTS,
            FailureKind::BackoffActive { .. } => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            FailureKind::Transport(err) => {
                write!(f, "endpoint {}: transport failure: {err}", self.endpoint)
            }
            FailureKind::Upstream { status, .. } => {
                write!(f, "endpoint {}: upstream status {status}", self.endpoint)
            }
            FailureKind::BreakerOpen => write!(f, "endpoint {}: circuit open", self.endpoint),
            FailureKind::BulkheadFull => write!(f, "endpoint {}: too busy", self.endpoint),
            FailureKind::BackoffActive { retry_after } => write!(
                f,
                "endpoint {}: backing off for {}s",
                self.endpoint,
                retry_after.as_secs()
            ),
        }
    }
}
