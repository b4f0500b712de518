//! Caller authentication.
//!
//! Every LLM route requires the shared secret in the `LLM_REST_API_KEY`
//! header. The check runs as an extractor, so a rejected request never
//! reaches its handler body and never touches the upstream model.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use tracing::warn;

use crate::error::GatewayError;
use crate::server::api::AppState;

/// Header carrying the caller's API key (matched case-insensitively).
pub const API_KEY_HEADER: &str = "llm_rest_api_key";

/// Validates caller API keys against the configured secret.
#[derive(Debug, Clone)]
pub struct AccessGuard {
    secret: Option<String>,
}

/// Proof that the request carried a valid API key.
#[derive(Debug, Clone, Copy)]
pub struct Authenticated;

impl AccessGuard {
    /// With no secret configured every key is rejected.
    pub fn new(secret: Option<String>) -> Self {
        Self { secret }
    }

    pub fn authenticate(&self, provided: Option<&str>) -> Result<Authenticated, GatewayError> {
        let (Some(secret), Some(provided)) = (self.secret.as_deref(), provided) else {
            return Err(GatewayError::Auth);
        };
        if provided.is_empty() || !constant_time_eq(provided.as_bytes(), secret.as_bytes()) {
            return Err(GatewayError::Auth);
        }
        Ok(Authenticated)
    }
}

/// Byte comparison whose running time depends only on the lengths.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl FromRequestParts<Arc<AppState>> for Authenticated {
    type Rejection = GatewayError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let provided = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok());

        state.guard.authenticate(provided).inspect_err(|_| {
            warn!(path = %parts.uri.path(), "Rejected request with invalid API credentials");
            state.metrics.record_request(parts.uri.path(), "rejected");
        })
    }
}
