//! Upstream HTTP transport
//!
//! The executor talks to the upstream through the [`Transport`] trait so the
//! request lifecycle can be exercised against stubs. [`HttpTransport`] is the
//! reqwest-backed implementation used by the server.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use thiserror::Error;

use crate::config::Config;
use crate::error::Result;

/// One outbound POST to the upstream API
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    /// Absolute endpoint URL
    pub url: String,

    /// Bearer credential (may be empty)
    pub bearer_token: String,

    /// JSON body, sent as-is
    pub body: Value,
}

/// Raw upstream response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamResponse {
    /// HTTP status code
    pub status: u16,

    /// Canonical reason phrase for the status, if known
    pub reason: Option<String>,

    /// Response body text
    pub body: String,
}

impl UpstreamResponse {
    /// Whether the status is 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Status line used in error messages, e.g. `HTTP 401 Unauthorized`
    pub fn status_line(&self) -> String {
        match &self.reason {
            Some(reason) => format!("HTTP {} {}", self.status, reason),
            None => format!("HTTP {}", self.status),
        }
    }
}

/// Failures below the HTTP status level
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection failed after {attempts} attempt(s): {message}")]
    Connect { attempts: u32, message: String },

    #[error("request failed: {message}")]
    Request { message: String },

    #[error("failed to read response body: {message}")]
    Body { message: String },
}

/// Sends a request upstream and returns the raw response
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: UpstreamRequest,
    ) -> std::result::Result<UpstreamResponse, TransportError>;
}

/// reqwest-backed transport with retry on failed connection attempts
pub struct HttpTransport {
    /// HTTP client
    http_client: reqwest::Client,

    /// Retries after the first failed connection attempt
    retries: u32,
}

impl HttpTransport {
    /// Create a new transport from configuration
    pub fn new(config: &Config) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("perplexity-mcp-server/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http_client,
            retries: config.transport_retries,
        })
    }

    /// Delay before retry number `attempt` (1-based): immediate, then doubling from 500ms
    fn retry_delay(attempt: u32) -> Duration {
        if attempt <= 1 {
            Duration::ZERO
        } else {
            Duration::from_millis(500) * 2u32.saturating_pow(attempt - 2)
        }
    }

    async fn send_once(
        &self,
        request: &UpstreamRequest,
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        self.http_client
            .post(&request.url)
            .header(AUTHORIZATION, format!("Bearer {}", request.bearer_token))
            .header(CONTENT_TYPE, "application/json")
            .json(&request.body)
            .send()
            .await
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: UpstreamRequest,
    ) -> std::result::Result<UpstreamResponse, TransportError> {
        let mut attempt = 0;

        let response = loop {
            match self.send_once(&request).await {
                Ok(response) => break response,
                // Only connection failures are safe to resend: nothing reached the upstream.
                Err(e) if e.is_connect() && attempt < self.retries => {
                    attempt += 1;
                    tracing::warn!(
                        "Connection to upstream failed (attempt {} of {}): {}",
                        attempt,
                        self.retries + 1,
                        e
                    );
                    tokio::time::sleep(Self::retry_delay(attempt)).await;
                }
                Err(e) if e.is_connect() => {
                    return Err(TransportError::Connect {
                        attempts: attempt + 1,
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    return Err(TransportError::Request {
                        message: e.to_string(),
                    });
                }
            }
        };

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Body {
                message: e.to_string(),
            })?;

        Ok(UpstreamResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().map(str::to_string),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay() {
        assert_eq!(HttpTransport::retry_delay(1), Duration::ZERO);
        assert_eq!(HttpTransport::retry_delay(2), Duration::from_millis(500));
        assert_eq!(HttpTransport::retry_delay(3), Duration::from_millis(1000));
    }

    #[test]
    fn test_status_line() {
        let response = UpstreamResponse {
            status: 401,
            reason: Some("Unauthorized".to_string()),
            body: String::new(),
        };
        assert_eq!(response.status_line(), "HTTP 401 Unauthorized");
        assert!(!response.is_success());

        let response = UpstreamResponse {
            status: 299,
            reason: None,
            body: String::new(),
        };
        assert_eq!(response.status_line(), "HTTP 299");
        assert!(response.is_success());
    }

    #[tokio::test]
    async fn test_connect_failure_exhausts_retries() {
        // Port 9 (discard) is closed on test hosts, so every attempt is refused.
        let config = Config::default().with_transport_retries(1);
        let transport = HttpTransport::new(&config).unwrap();

        let err = transport
            .send(UpstreamRequest {
                url: "http://127.0.0.1:9/chat/completions".to_string(),
                bearer_token: String::new(),
                body: serde_json::json!({}),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Connect { attempts: 2, .. }));
    }
}
