//! Unified HTTP error type for axum request handlers, plus the taxonomy of
//! error *kinds* the proxy state machine (see [`crate::router`]) needs to
//! distinguish when deciding whether to fall back, surface, or swallow.
//!
//! [`AppError`] wraps [`anyhow::Error`] and converts it into an appropriate
//! HTTP response automatically via [`IntoResponse`]. This means every handler
//! that can fail can return `Result<T, AppError>` and propagate errors with
//! `?` — no manual `map_err`, no boilerplate.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Wraps [`anyhow::Error`] so it can be returned from axum handlers.
#[derive(Debug)]
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self.0, "handler error");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": { "message": self.0.to_string() } })),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

/// The error taxonomy the proxy state machine distinguishes.
///
/// Unlike [`AppError`] (a handler-boundary catch-all), [`ProxyError`] is
/// constructed deliberately at the point a failure is recognised, so
/// `router::route` can decide fallback-vs-surface without string-matching
/// an opaque `anyhow::Error`. String matching is reserved for classifying
/// an *upstream* error body into the retryable pattern table (see
/// `router::classify_upstream_error`) — never for distinguishing our own
/// error kinds.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// No model in the chosen tier (or its fallback chain) is reachable
    /// with the currently configured keys. Fails fast, no fallback.
    #[error("no provider configured for this request")]
    NoProviderConfigured,

    /// The classifier failed on a malformed body. The caller should forward
    /// the request verbatim to the client-named model if reachable, else
    /// treat as [`ProxyError::NoProviderConfigured`].
    #[error("routing classification failed: {0}")]
    Routing(String),

    /// An upstream HTTP call failed in a way that is eligible for fallback
    /// (retryable status + matching error-class pattern, or any timeout).
    #[error("upstream provider error ({status}): {body}")]
    Upstream { status: u16, body: String },

    /// The upstream connection timed out or was aborted mid-flight.
    #[error("upstream timed out")]
    UpstreamTimeout,

    /// Malformed bytes from upstream that the dialect adapter could not
    /// translate into the client-facing dialect.
    #[error("bad upstream response: {0}")]
    BadUpstream(String),

    /// Any other internal failure; surfaced the same way as
    /// [`ProxyError::BadUpstream`].
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ProxyError {
    /// Whether this error kind is eligible for the FALLBACK_NEXT transition.
    ///
    /// Client disconnect is intentionally absent from this enum — it is
    /// handled as task cancellation, never constructed as an error value.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProxyError::Upstream { .. } | ProxyError::UpstreamTimeout)
    }

    /// Map this error to the `(status, json body)` pair the client sees
    /// when no more fallback is possible.
    pub fn into_response_parts(self) -> (StatusCode, serde_json::Value) {
        match self {
            ProxyError::NoProviderConfigured => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": { "code": "no_provider_configured", "message": self.to_string() } }),
            ),
            ProxyError::Routing(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": { "code": "no_provider_configured", "message": self.to_string() } }),
            ),
            ProxyError::Upstream { status, .. } => (
                StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                json!({ "error": { "code": "upstream_error", "message": self.to_string() } }),
            ),
            ProxyError::UpstreamTimeout => (
                StatusCode::GATEWAY_TIMEOUT,
                json!({ "error": { "code": "upstream_timeout", "message": self.to_string() } }),
            ),
            ProxyError::BadUpstream(_) => (
                StatusCode::BAD_GATEWAY,
                json!({ "error": { "code": "bad_upstream", "message": self.to_string() } }),
            ),
            ProxyError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": { "code": "internal", "message": self.to_string() } }),
            ),
        }
    }
}
