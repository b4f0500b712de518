//! Runtime configuration for llm-gateway.
//!
//! Configuration is read from environment variables once at startup,
//! optionally seeded from a dotenv file. Values already present in the
//! process environment take precedence over the file. The resulting
//! [`Config`] is immutable and shared read-only by every request.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

/// Default model served when `WX_LLM_MODEL` is unset.
pub const DEFAULT_MODEL_ID: &str = "meta-llama/llama-3-1-70b-instruct";

/// Default IBM Cloud IAM endpoint used by the hosted platform.
pub const DEFAULT_IAM_URL: &str = "https://iam.cloud.ibm.com";

/// Default watsonx.ai REST API version date.
pub const DEFAULT_API_VERSION: &str = "2023-05-29";

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "llm-gateway", about = "Authenticated LLM inference gateway")]
pub struct Cli {
    /// Path to a dotenv file with configuration variables.
    #[arg(short, long, default_value = ".env")]
    pub env_file: PathBuf,

    /// HTTP listen address (overrides HOST and PORT).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,
}

/// Fatal configuration problems. The process must not serve traffic when
/// any of these is returned.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid WX_PLATFORM value {0:?}; use 'onpremise' or 'saas'")]
    InvalidPlatform(String),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("failed to read env file {path}: {reason}")]
    EnvFile { path: String, reason: String },
}

/// Upstream deployment mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Hosted multi-tenant IBM Cloud.
    Saas,
    /// Dedicated Cloud Pak for Data instance.
    OnPremise,
}

impl FromStr for Platform {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "saas" => Ok(Platform::Saas),
            "onpremise" => Ok(Platform::OnPremise),
            _ => Err(ConfigError::InvalidPlatform(s.to_string())),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Saas => write!(f, "saas"),
            Platform::OnPremise => write!(f, "onpremise"),
        }
    }
}

/// Platform-specific half of the upstream credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformAuth {
    Saas {
        /// IAM base URL used for the API-key token exchange.
        iam_url: String,
    },
    OnPremise {
        username: String,
        instance_id: String,
        version: String,
    },
}

/// Upstream authentication object.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Base URL of the watsonx.ai endpoint.
    pub url: String,
    pub api_key: String,
    pub auth: PlatformAuth,
}

impl Credentials {
    /// Build credentials from raw configuration values.
    ///
    /// URL and API key are required for both platforms; the on-premise
    /// platform additionally needs a username.
    pub fn resolve<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let platform = non_empty(&lookup, "WX_PLATFORM").ok_or(ConfigError::Missing("WX_PLATFORM"))?;
        let api_key =
            non_empty(&lookup, "IBM_CLOUD_API_KEY").ok_or(ConfigError::Missing("IBM_CLOUD_API_KEY"))?;
        let url = non_empty(&lookup, "WX_URL").ok_or(ConfigError::Missing("WX_URL"))?;
        let url = url.trim_end_matches('/').to_string();

        let auth = match platform.parse::<Platform>()? {
            Platform::Saas => PlatformAuth::Saas {
                iam_url: non_empty(&lookup, "WX_IAM_URL")
                    .unwrap_or_else(|| DEFAULT_IAM_URL.to_string())
                    .trim_end_matches('/')
                    .to_string(),
            },
            Platform::OnPremise => PlatformAuth::OnPremise {
                username: non_empty(&lookup, "WX_USER").ok_or(ConfigError::Missing("WX_USER"))?,
                instance_id: "openshift".to_string(),
                version: "5.0".to_string(),
            },
        };

        Ok(Self { url, api_key, auth })
    }

    pub fn platform(&self) -> Platform {
        match self.auth {
            PlatformAuth::Saas { .. } => Platform::Saas,
            PlatformAuth::OnPremise { .. } => Platform::OnPremise,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .field("auth", &self.auth)
            .finish()
    }
}

/// Prompt token bounds.
///
/// Read at startup and kept for future use; nothing in the request
/// pipeline enforces them yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenLimits {
    pub min_token_limit: usize,
    pub max_token_limit: usize,
}

impl Default for TokenLimits {
    fn default() -> Self {
        Self {
            min_token_limit: 6000,
            max_token_limit: 7000,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Allowed CORS origins; `*` allows any origin.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            cors_origins: vec!["*".to_string()],
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Model selection and upstream call settings.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub model_id: String,
    pub project_id: Option<String>,

    /// watsonx.ai API version date sent as the `version` query parameter.
    pub api_version: String,

    /// Deadline for a synchronous call and for each stream increment.
    /// `None` waits forever.
    pub upstream_timeout: Option<Duration>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            project_id: None,
            api_version: DEFAULT_API_VERSION.to_string(),
            upstream_timeout: Some(Duration::from_secs(120)),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub credentials: Credentials,
    pub model: ModelSettings,

    /// Secret callers must present in the `LLM_REST_API_KEY` header.
    pub gateway_api_key: Option<String>,

    pub token_limits: TokenLimits,
}

impl Config {
    /// Load configuration from the process environment, seeded from the
    /// dotenv file at `env_file` when it exists.
    pub fn load(env_file: &Path) -> Result<Self, ConfigError> {
        Self::load_layered(env_file, |key| std::env::var(key).ok())
    }

    /// Like [`Config::load`], with `env` standing in for the process
    /// environment. `env` wins over the file.
    pub fn load_layered<F>(env_file: &Path, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file_vars = read_env_file(env_file)?;
        Self::from_lookup(|key| env(key).or_else(|| file_vars.get(key).cloned()))
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let credentials = Credentials::resolve(&lookup)?;

        let defaults = ServerConfig::default();
        let server = ServerConfig {
            host: non_empty(&lookup, "HOST").unwrap_or(defaults.host),
            port: parse_or(&lookup, "PORT", defaults.port)?,
            cors_origins: non_empty(&lookup, "CORS_ORIGINS")
                .map(|raw| {
                    raw.split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.cors_origins),
        };

        let timeout_secs: u64 = parse_or(&lookup, "UPSTREAM_TIMEOUT_SECS", 120)?;
        let model = ModelSettings {
            model_id: non_empty(&lookup, "WX_LLM_MODEL").unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
            project_id: non_empty(&lookup, "WX_PROJECT_ID"),
            api_version: non_empty(&lookup, "WX_API_VERSION")
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            upstream_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
        };

        let limits = TokenLimits::default();
        let token_limits = TokenLimits {
            min_token_limit: parse_or(&lookup, "MIN_TOKEN_LIMIT", limits.min_token_limit)?,
            max_token_limit: parse_or(&lookup, "MAX_TOKEN_LIMIT", limits.max_token_limit)?,
        };

        Ok(Self {
            server,
            credentials,
            model,
            gateway_api_key: non_empty(&lookup, "LLM_REST_API_KEY"),
            token_limits,
        })
    }
}

fn read_env_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    if !path.exists() {
        tracing::debug!("Env file not found at {:?}, using process environment only", path);
        return Ok(HashMap::new());
    }

    let iter = dotenvy::from_path_iter(path).map_err(|e| ConfigError::EnvFile {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    iter.map(|item| {
        item.map_err(|e| ConfigError::EnvFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    })
    .collect()
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).filter(|v| !v.trim().is_empty())
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match non_empty(lookup, key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        None => Ok(default),
    }
}
