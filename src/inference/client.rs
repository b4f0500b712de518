//! Model client: single-shot and streamed text generation.
//!
//! [`ModelClient`] is the seam the gateway endpoints program against.
//! [`WatsonxClient`] implements it over the watsonx.ai REST API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::{Client as HttpClient, RequestBuilder, Response};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::{Config, Credentials, ModelSettings};
use crate::inference::auth::TokenProvider;
use crate::inference::streaming::{decode_sse_chunks, spawn_relay};
use crate::inference::types::{
    ModelConfig, StreamEvent, TextGenerationRequest, TextGenerationResponse, UpstreamError,
};

/// TCP connection timeout for upstream calls.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A configured handle to one remote model.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Identifier of the model behind this client.
    fn model_id(&self) -> &str;

    /// Generate the complete answer for `prompt`.
    async fn generate(&self, prompt: &str) -> Result<String, UpstreamError>;

    /// Open a token stream for `prompt`.
    ///
    /// Failures while opening (authentication, non-success status) are
    /// returned directly. Once open, every upstream increment arrives in
    /// order as [`StreamEvent::Chunk`]; the channel closes after the
    /// end-of-sequence chunk, or after a single [`StreamEvent::Fault`].
    /// Dropping the receiver stops the upstream call.
    async fn generate_stream(
        &self,
        prompt: &str,
    ) -> Result<mpsc::Receiver<StreamEvent>, UpstreamError>;
}

/// watsonx.ai text generation client.
pub struct WatsonxClient {
    http: HttpClient,
    tokens: TokenProvider,
    credentials: Arc<Credentials>,
    model: ModelConfig,
    api_version: String,
    timeout: Option<Duration>,
}

impl WatsonxClient {
    /// Build a client for the configured model with default decoding
    /// parameters.
    pub fn from_config(config: &Config) -> Result<Self, UpstreamError> {
        Self::new(
            config.credentials.clone(),
            ModelConfig::from_settings(&config.model),
            &config.model,
        )
    }

    pub fn new(
        credentials: Credentials,
        model: ModelConfig,
        settings: &ModelSettings,
    ) -> Result<Self, UpstreamError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| UpstreamError::Connection {
                endpoint: credentials.url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let credentials = Arc::new(credentials);
        let tokens = TokenProvider::new(http.clone(), credentials.clone(), settings.upstream_timeout);

        debug!(model_params = ?model.params, "Model parameters");

        Ok(Self {
            http,
            tokens,
            credentials,
            model,
            api_version: settings.api_version.clone(),
            timeout: settings.upstream_timeout,
        })
    }

    pub fn model_config(&self) -> &ModelConfig {
        &self.model
    }

    fn endpoint(&self, operation: &str) -> String {
        format!(
            "{}/ml/v1/{operation}?version={}",
            self.credentials.url, self.api_version
        )
    }

    async fn request(&self, endpoint: &str, prompt: &str) -> Result<RequestBuilder, UpstreamError> {
        let token = self.tokens.bearer().await?;
        let body = TextGenerationRequest {
            model_id: &self.model.model_id,
            input: prompt,
            project_id: self.model.project_id.as_deref(),
            parameters: &self.model.params,
        };
        Ok(self.http.post(endpoint).bearer_auth(token).json(&body))
    }

    fn send_error(&self, endpoint: &str, err: reqwest::Error) -> UpstreamError {
        match self.timeout {
            Some(limit) if err.is_timeout() => UpstreamError::Timeout(limit),
            _ => connection_error(endpoint, err),
        }
    }
}

#[async_trait]
impl ModelClient for WatsonxClient {
    fn model_id(&self) -> &str {
        &self.model.model_id
    }

    async fn generate(&self, prompt: &str) -> Result<String, UpstreamError> {
        let endpoint = self.endpoint("text/generation");
        info!(model = %self.model.model_id, "Sending request to model");

        let mut request = self.request(&endpoint, prompt).await?;
        if let Some(limit) = self.timeout {
            request = request.timeout(limit);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.send_error(&endpoint, e))?;
        let response = ensure_success(response).await?;
        let body: TextGenerationResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                self.send_error(&endpoint, e)
            } else {
                UpstreamError::InvalidPayload(e.to_string())
            }
        })?;

        let text = body
            .results
            .into_iter()
            .next()
            .map(|r| r.generated_text)
            .ok_or_else(|| UpstreamError::InvalidPayload("response contained no results".to_string()))?;

        info!(model = %self.model.model_id, "Received response from model");
        Ok(text)
    }

    async fn generate_stream(
        &self,
        prompt: &str,
    ) -> Result<mpsc::Receiver<StreamEvent>, UpstreamError> {
        let endpoint = self.endpoint("text/generation_stream");
        info!(model = %self.model.model_id, "Opening generation stream");

        let send = self
            .request(&endpoint, prompt)
            .await?
            .header(ACCEPT, "text/event-stream")
            .send();

        // Only the wait for headers is bounded here; the body is bounded
        // per increment by the decoder.
        let response = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, send)
                .await
                .map_err(|_| UpstreamError::Timeout(limit))?,
            None => send.await,
        }
        .map_err(|e| self.send_error(&endpoint, e))?;
        let response = ensure_success(response).await?;

        let chunks = decode_sse_chunks(response.bytes_stream(), endpoint, self.timeout);
        Ok(spawn_relay(chunks))
    }
}

/// Map a transport failure to [`UpstreamError::Connection`].
pub(crate) fn connection_error(endpoint: &str, err: reqwest::Error) -> UpstreamError {
    UpstreamError::Connection {
        endpoint: endpoint.to_string(),
        reason: err.to_string(),
    }
}

/// Turn a non-success response into [`UpstreamError::Http`], keeping the
/// body for the server-side log.
pub(crate) async fn ensure_success(response: Response) -> Result<Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(UpstreamError::Http {
        status: status.as_u16(),
        body,
    })
}
