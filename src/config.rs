//! Configuration management for the Perplexity MCP Server
//!
//! Handles the API credential, upstream endpoint and request bounds.

use std::time::Duration;

use crate::config::perplexity::{API_BASE_URL, DEFAULT_TIMEOUT_SECS, TRANSPORT_RETRIES};

/// Environment variable holding the Perplexity API key
pub const API_KEY_ENV: &str = "PERPLEXITY_API_KEY";

/// Configuration for the Perplexity MCP Server
///
/// Built once at startup and shared read-only by every invocation.
#[derive(Clone)]
pub struct Config {
    /// Bearer credential for the upstream API
    pub api_key: Option<String>,

    /// Upstream base URL (without trailing slash)
    pub base_url: String,

    /// Bound on a single invocation, transport retries included
    pub request_timeout: Duration,

    /// Transport-level retries for failed connection attempts
    pub transport_retries: u32,
}

impl Config {
    /// Create a configuration from the process environment
    pub fn from_env() -> Self {
        let api_key = std::env::var(API_KEY_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty());

        Self {
            api_key,
            ..Self::default()
        }
    }

    /// Set the API key
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the upstream base URL
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the invocation timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the transport retry count
    pub fn with_transport_retries(mut self, retries: u32) -> Self {
        self.transport_retries = retries;
        self
    }

    /// Full URL of the chat completions endpoint
    pub fn chat_completions_url(&self) -> String {
        format!("{}{}", self.base_url, perplexity::CHAT_COMPLETIONS_PATH)
    }

    /// Check if an API key is configured
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: API_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            transport_retries: TRANSPORT_RETRIES,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("request_timeout", &self.request_timeout)
            .field("transport_retries", &self.transport_retries)
            .finish()
    }
}

/// Perplexity API constants
pub mod perplexity {
    /// Base URL for Perplexity API
    pub const API_BASE_URL: &str = "https://api.perplexity.ai";

    /// Chat completions endpoint path
    pub const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

    /// Timeout for one invocation, in seconds
    pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

    /// Retries for failed connection attempts
    pub const TRANSPORT_RETRIES: u32 = 2;

    /// The only tool this server exposes
    pub const TOOL_NAME: &str = "ask_perplexity";

    /// Models advertised in the tool's input schema.
    ///
    /// Larger sonar models time out too often to advertise.
    pub const MODELS: &[&str] = &["llama-3.1-sonar-small-128k-online"];
}
