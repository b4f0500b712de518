//! Caller-facing gateway errors.
//!
//! Every failure a caller can observe maps to one of a few fixed detail
//! strings. The underlying cause is logged where it happens and never
//! rendered into a response body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::inference::types::UpstreamError;

pub const INVALID_CREDENTIALS: &str = "Invalid API credentials.";
pub const GENERATE_FAILED: &str = "Failed to generate LLM response.";
pub const STREAM_FAILED: &str = "Failed to generate stream.";
pub const STREAM_CONNECTION_ERROR: &str = "Connection error during streaming.";

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Missing or mismatched caller API key.
    #[error("invalid API credentials")]
    Auth,

    /// Prompt construction rejected the request. Nothing produces this yet.
    #[error("prompt construction failed: {0}")]
    Prompt(String),

    /// The synchronous generation call failed.
    #[error("generation failed: {0}")]
    Generate(#[source] UpstreamError),

    /// The token stream could not be opened.
    #[error("stream setup failed: {0}")]
    Stream(#[source] UpstreamError),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Auth => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The fixed message shown to the caller.
    pub fn detail(&self) -> &'static str {
        match self {
            GatewayError::Auth => INVALID_CREDENTIALS,
            GatewayError::Prompt(_) | GatewayError::Generate(_) => GENERATE_FAILED,
            GatewayError::Stream(_) => STREAM_FAILED,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "detail": self.detail() }))).into_response()
    }
}

/// Detail for the error event that ends a stream which already started.
pub fn mid_stream_detail(err: &UpstreamError) -> &'static str {
    if err.is_connection() {
        STREAM_CONNECTION_ERROR
    } else {
        STREAM_FAILED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(GatewayError::Auth.status(), StatusCode::FORBIDDEN);
        let upstream = UpstreamError::Http {
            status: 502,
            body: "watsonx internals".to_string(),
        };
        let err = GatewayError::Generate(upstream);
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.detail(), GENERATE_FAILED);
    }

    #[test]
    fn test_detail_never_contains_cause() {
        let err = GatewayError::Stream(UpstreamError::InvalidPayload("secret detail".into()));
        assert_eq!(err.detail(), STREAM_FAILED);
        assert!(!err.detail().contains("secret"));
    }

    #[test]
    fn test_mid_stream_detail() {
        let reset = UpstreamError::Connection {
            endpoint: "e".into(),
            reason: "connection reset".into(),
        };
        assert_eq!(mid_stream_detail(&reset), STREAM_CONNECTION_ERROR);
        let timeout = UpstreamError::Timeout(std::time::Duration::from_secs(1));
        assert_eq!(mid_stream_detail(&timeout), STREAM_FAILED);
    }
}
