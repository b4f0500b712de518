//! Model configuration and upstream payload types.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::ModelSettings;

/// Stop reason the provider reports on the final chunk of a generation.
pub const EOS_STOP_REASON: &str = "eos_token";

/// Decoding parameters sent with every generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodingParams {
    /// "greedy" or "sample".
    pub decoding_method: String,
    pub min_new_tokens: u32,
    pub max_new_tokens: u32,
    pub temperature: f64,
    pub repetition_penalty: f64,
}

impl Default for DecodingParams {
    fn default() -> Self {
        Self {
            decoding_method: "greedy".to_string(),
            min_new_tokens: 30,
            max_new_tokens: 2000,
            temperature: 1.0,
            repetition_penalty: 1.0,
        }
    }
}

/// A configured handle description for one remote model.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model_id: String,
    pub project_id: Option<String>,
    pub params: DecodingParams,
}

impl ModelConfig {
    /// Model config with default decoding parameters.
    pub fn from_settings(settings: &ModelSettings) -> Self {
        Self {
            model_id: settings.model_id.clone(),
            project_id: settings.project_id.clone(),
            params: DecodingParams::default(),
        }
    }
}

/// Body of a text generation call.
#[derive(Debug, Serialize)]
pub struct TextGenerationRequest<'a> {
    pub model_id: &'a str,
    pub input: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<&'a str>,
    pub parameters: &'a DecodingParams,
}

/// Per-result fields of a generation payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    #[serde(default)]
    pub generated_text: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,

    /// Provider fields the gateway does not interpret (token counts, seeds...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Synchronous generation response.
#[derive(Debug, Clone, Deserialize)]
pub struct TextGenerationResponse {
    #[serde(default)]
    pub results: Vec<GenerationResult>,
}

/// One decoded increment of an upstream token stream.
///
/// Chunks decoded from the wire keep their original payload, which is what
/// gets forwarded to callers; the typed fields are only a view over it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub results: Vec<GenerationResult>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,

    #[serde(skip)]
    raw: Option<String>,
}

impl StreamChunk {
    /// A chunk carrying a single text delta.
    pub fn text(delta: impl Into<String>, stop_reason: Option<&str>) -> Self {
        Self {
            results: vec![GenerationResult {
                generated_text: delta.into(),
                stop_reason: stop_reason.map(str::to_string),
                extra: Map::new(),
            }],
            extra: Map::new(),
            raw: None,
        }
    }

    /// Decode one upstream `data:` payload.
    pub fn from_payload(payload: &str) -> Result<Self, serde_json::Error> {
        let mut chunk: Self = serde_json::from_str(payload)?;
        chunk.raw = Some(payload.to_string());
        Ok(chunk)
    }

    /// JSON forwarded to callers: the upstream payload byte for byte when
    /// this chunk came off the wire.
    pub fn to_payload(&self) -> Cow<'_, str> {
        match &self.raw {
            Some(raw) => Cow::Borrowed(raw),
            None => Cow::Owned(serde_json::to_string(self).unwrap_or_default()),
        }
    }

    pub fn stop_reason(&self) -> Option<&str> {
        self.results.first().and_then(|r| r.stop_reason.as_deref())
    }

    /// Whether this is the terminal chunk of the generation.
    pub fn is_eos(&self) -> bool {
        self.stop_reason() == Some(EOS_STOP_REASON)
    }
}

/// Transport or provider failure while talking to the model endpoint.
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// The connection broke or could not be established.
    #[error("connection to {endpoint} failed: {reason}")]
    Connection { endpoint: String, reason: String },

    /// The provider answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The provider answered with something we could not decode.
    #[error("invalid upstream payload: {0}")]
    InvalidPayload(String),

    /// No response (or no next stream increment) within the deadline.
    #[error("upstream timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// The upstream token exchange failed.
    #[error("upstream authentication failed: {0}")]
    Auth(String),
}

impl UpstreamError {
    /// Whether the failure is a broken or reset transport rather than a
    /// provider-side fault.
    pub fn is_connection(&self) -> bool {
        matches!(self, UpstreamError::Connection { .. })
    }
}

/// One step of a generation stream.
#[derive(Debug)]
pub enum StreamEvent {
    /// The next upstream increment.
    Chunk(StreamChunk),
    /// The upstream sequence broke; nothing follows.
    Fault(UpstreamError),
}
