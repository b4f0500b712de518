//! Bearer tokens for the upstream model endpoint.
//!
//! The hosted platform trades the API key for an IAM access token; a
//! dedicated instance authorizes username + API key against its own
//! gateway. Either way the token is cached and shared by all requests
//! until shortly before it expires.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{Credentials, PlatformAuth};
use crate::inference::client::{connection_error, ensure_success};
use crate::inference::types::UpstreamError;

/// Tokens are refreshed this long before their reported expiry.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Dedicated-instance tokens do not report a lifetime; assume this one.
const ON_PREMISE_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

const IAM_GRANT_TYPE: &str = "urn:ibm:params:oauth:grant-type:apikey";

#[derive(Debug, Deserialize)]
struct IamTokenResponse {
    access_token: String,
    /// Lifetime in seconds.
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct AuthorizeResponse {
    token: String,
}

#[derive(Debug, Clone)]
struct BearerToken {
    value: String,
    expires_at: Instant,
}

impl BearerToken {
    fn new(value: String, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_fresh(&self) -> bool {
        Instant::now() + REFRESH_MARGIN < self.expires_at
    }
}

/// Shared, lazily refreshed upstream bearer token.
pub struct TokenProvider {
    http: HttpClient,
    credentials: Arc<Credentials>,
    cached: RwLock<Option<BearerToken>>,
    /// Bound on one token exchange; the write lock is held for at most this long.
    timeout: Option<Duration>,
}

impl TokenProvider {
    pub fn new(http: HttpClient, credentials: Arc<Credentials>, timeout: Option<Duration>) -> Self {
        Self {
            http,
            credentials,
            cached: RwLock::new(None),
            timeout,
        }
    }

    /// Current bearer token, fetching a new one when the cache is empty or
    /// about to expire.
    pub async fn bearer(&self) -> Result<String, UpstreamError> {
        {
            let cached = self.cached.read().await;
            if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
                return Ok(token.value.clone());
            }
        }

        let mut slot = self.cached.write().await;
        // Another request may have refreshed while we waited for the lock.
        if let Some(token) = slot.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.value.clone());
        }

        let token = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.fetch()).await.map_err(|_| {
                warn!(timeout_secs = limit.as_secs_f64(), "Token exchange timed out");
                UpstreamError::Timeout(limit)
            })??,
            None => self.fetch().await?,
        };
        let value = token.value.clone();
        *slot = Some(token);
        Ok(value)
    }

    async fn fetch(&self) -> Result<BearerToken, UpstreamError> {
        match &self.credentials.auth {
            PlatformAuth::Saas { iam_url } => {
                let endpoint = format!("{iam_url}/identity/token");
                debug!(endpoint, "Requesting IAM token");

                let response = self
                    .http
                    .post(&endpoint)
                    .form(&[
                        ("grant_type", IAM_GRANT_TYPE),
                        ("apikey", self.credentials.api_key.as_str()),
                    ])
                    .send()
                    .await
                    .map_err(|e| connection_error(&endpoint, e))?;
                let response = ensure_success(response).await.map_err(auth_error)?;
                let body: IamTokenResponse = response
                    .json()
                    .await
                    .map_err(|e| UpstreamError::Auth(format!("invalid IAM token response: {e}")))?;

                info!(expires_in = body.expires_in, "Obtained IAM access token");
                Ok(BearerToken::new(body.access_token, Duration::from_secs(body.expires_in)))
            }
            PlatformAuth::OnPremise { username, .. } => {
                let endpoint = format!("{}/icp4d-api/v1/authorize", self.credentials.url);
                debug!(endpoint, username, "Requesting platform token");

                let response = self
                    .http
                    .post(&endpoint)
                    .json(&json!({
                        "username": username,
                        "api_key": self.credentials.api_key,
                    }))
                    .send()
                    .await
                    .map_err(|e| connection_error(&endpoint, e))?;
                let response = ensure_success(response).await.map_err(auth_error)?;
                let body: AuthorizeResponse = response
                    .json()
                    .await
                    .map_err(|e| UpstreamError::Auth(format!("invalid authorize response: {e}")))?;

                info!("Obtained platform access token");
                Ok(BearerToken::new(body.token, ON_PREMISE_TOKEN_TTL))
            }
        }
    }
}

fn auth_error(err: UpstreamError) -> UpstreamError {
    match err {
        UpstreamError::Http { status, body } => UpstreamError::Auth(format!("HTTP {status}: {body}")),
        other => other,
    }
}
