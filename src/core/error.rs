//! Error types and handling for the gateway.
//!
//! This module provides a unified error type [`GatewayError`] covering every
//! failure the request pipeline distinguishes, plus conversion into
//! protocol-shaped HTTP responses (OpenAI and Anthropic clients expect
//! differently shaped error envelopes).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::core::config::Protocol;

/// Maximum number of upstream body bytes echoed back in error messages.
pub const UPSTREAM_PREVIEW_BYTES: usize = 200;

/// Main error type for the request pipeline.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Client body unparseable or missing a required field
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// No credential or unknown credential
    #[error("Unauthorized")]
    Unauthenticated,

    /// Known credential but the owning principal has exhausted its quota
    #[error("Quota exceeded")]
    QuotaExhausted,

    /// No service matches the requested model name
    #[error("Model not found: {0}")]
    UnknownModel(String),

    /// Request body exceeded the peek cap
    #[error("Request body too large")]
    PayloadTooLarge,

    /// Connection-level failure talking to the upstream
    #[error("Upstream connection failed: {0}")]
    UpstreamTransport(String),

    /// Non-2xx response from the upstream (slow path only; the fast path
    /// relays upstream statuses verbatim)
    #[error("Upstream returned {status}: {preview}")]
    Upstream { status: u16, preview: String },

    /// Generic internal server errors with custom message
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Build an `Upstream` error from a status code and raw body bytes,
    /// truncating the body to a short preview.
    pub fn upstream(status: u16, body: &[u8]) -> Self {
        GatewayError::Upstream {
            status,
            preview: preview_bytes(body),
        }
    }

    /// HTTP status the pipeline surfaces for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
            GatewayError::QuotaExhausted => StatusCode::FORBIDDEN,
            GatewayError::UnknownModel(_) => StatusCode::NOT_FOUND,
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Upstream { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code for OpenAI-shaped bodies.
    fn openai_code(&self) -> &'static str {
        match self {
            GatewayError::BadRequest(_) => "invalid_request_error",
            GatewayError::Unauthenticated => "invalid_api_key",
            GatewayError::QuotaExhausted => "insufficient_quota",
            GatewayError::UnknownModel(_) => "model_not_found",
            GatewayError::PayloadTooLarge => "payload_too_large",
            GatewayError::UpstreamTransport(_) => "bad_gateway",
            GatewayError::Upstream { .. } => "upstream_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// Error type tag for Anthropic-shaped bodies.
    fn anthropic_type(&self) -> &'static str {
        match self {
            GatewayError::BadRequest(_) => "invalid_request_error",
            GatewayError::Unauthenticated => "authentication_error",
            GatewayError::QuotaExhausted => "permission_error",
            GatewayError::UnknownModel(_) => "not_found_error",
            GatewayError::PayloadTooLarge => "invalid_request_error",
            GatewayError::UpstreamTransport(_)
            | GatewayError::Upstream { .. }
            | GatewayError::Internal(_) => "api_error",
        }
    }

    /// Convert into an HTTP response shaped for the given ingress protocol.
    ///
    /// OpenAI clients expect `{"error":{"message","type","code"}}`;
    /// Anthropic clients expect `{"type":"error","error":{"type","message"}}`.
    pub fn into_protocol_response(self, protocol: Protocol) -> Response {
        let status = self.status_code();
        let message = self.to_string();

        let body = match protocol {
            Protocol::Anthropic => json!({
                "type": "error",
                "error": {
                    "type": self.anthropic_type(),
                    "message": message,
                }
            }),
            _ => json!({
                "error": {
                    "message": message,
                    "type": "invalid_request_error",
                    "code": self.openai_code(),
                }
            }),
        };

        (status, Json(body)).into_response()
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.into_protocol_response(Protocol::OpenAI)
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::BadRequest(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::UpstreamTransport(err.to_string())
    }
}

/// Truncate raw body bytes to a lossy UTF-8 preview.
pub fn preview_bytes(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() <= UPSTREAM_PREVIEW_BYTES {
        return text.into_owned();
    }
    let mut end = UPSTREAM_PREVIEW_BYTES;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Convenience type alias for Results using [`GatewayError`].
pub type Result<T> = std::result::Result<T, GatewayError>;
