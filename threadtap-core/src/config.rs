//! TOML configuration with serde-backed defaults.
//!
//! Every field has a default so an absent or partial config file still
//! yields a working setup. Credentials are never stored here; the provider
//! section names the environment variable that holds the API key.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level configuration, usually loaded from `threadtap.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThreadtapConfig {
    pub upstream: UpstreamConfig,
    pub replay: ReplayConfig,
    pub provider: ProviderConfig,
    pub agent: AgentConfig,
}

/// Identity of the upstream site whose traffic is observed and replayed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Substring that marks an observation as upstream API traffic.
    pub api_url_filter: String,
    /// Endpoint replayed requests are posted to.
    pub api_endpoint: String,
    /// Name of the header whose value identifies the browsing session.
    pub session_header: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_url_filter: default_api_url_filter(),
            api_endpoint: default_api_endpoint(),
            session_header: default_session_header(),
        }
    }
}

/// Pacing and bounds for replayed search runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReplayConfig {
    /// Pause between consecutive detail fetches, in milliseconds.
    pub inter_request_delay_ms: u64,
    /// How long a body observation waits for its header half, in seconds.
    pub pending_capture_ttl_secs: u64,
    /// Item cap applied to agent-triggered searches.
    pub tool_item_limit: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            inter_request_delay_ms: DEFAULT_INTER_REQUEST_DELAY_MS,
            pending_capture_ttl_secs: DEFAULT_PENDING_CAPTURE_TTL_SECS,
            tool_item_limit: DEFAULT_TOOL_ITEM_LIMIT,
        }
    }
}

/// Model backend selection and request parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    /// Backend name: `openai`, `anthropic`, or `ollama`.
    pub backend: String,
    pub model: String,
    /// Environment variable the API key is read from.
    pub api_key_env: String,
    /// Base URL override; each backend has a sensible default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            base_url: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

impl ProviderConfig {
    /// API key resolved from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }
}

/// Chat loop behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Upper bound on tool-call rounds within one chat turn.
    pub max_tool_rounds: usize,
    /// Characters per streamed slice of a non-incremental reply.
    pub stream_slice_chars: usize,
    /// Replaces the built-in guidance text when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            stream_slice_chars: DEFAULT_STREAM_SLICE_CHARS,
            guidance: None,
        }
    }
}

pub const DEFAULT_INTER_REQUEST_DELAY_MS: u64 = 1_500;
pub const DEFAULT_PENDING_CAPTURE_TTL_SECS: u64 = 5;
pub const DEFAULT_TOOL_ITEM_LIMIT: usize = 10;
pub const DEFAULT_MAX_TOKENS: u32 = 1_024;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 3;
pub const DEFAULT_STREAM_SLICE_CHARS: usize = 48;

const KNOWN_BACKENDS: &[&str] = &["openai", "anthropic", "ollama"];

fn default_api_url_filter() -> String {
    "/api/gql".to_string()
}

fn default_api_endpoint() -> String {
    "https://neighborhood.example/api/gql".to_string()
}

fn default_session_header() -> String {
    "x-csrftoken".to_string()
}

fn default_backend() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

impl ThreadtapConfig {
    /// Rejects values that would make a run misbehave in confusing ways.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !KNOWN_BACKENDS.contains(&self.provider.backend.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "unknown provider backend `{}`; expected one of {}",
                self.provider.backend,
                KNOWN_BACKENDS.join(", ")
            )));
        }
        if self.upstream.api_endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "upstream.api_endpoint must not be empty".to_string(),
            ));
        }
        if self.agent.max_tool_rounds == 0 {
            return Err(ConfigError::Invalid(
                "agent.max_tool_rounds must be at least 1".to_string(),
            ));
        }
        if self.agent.stream_slice_chars == 0 {
            return Err(ConfigError::Invalid(
                "agent.stream_slice_chars must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads the config file, falling back to defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<ThreadtapConfig, ConfigError> {
    if !path.exists() {
        return Ok(ThreadtapConfig::default());
    }
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let config: ThreadtapConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}
