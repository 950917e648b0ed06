//! Perplexity tool type definitions
//!
//! Typed view of the `ask_perplexity` arguments and the classified result of
//! one invocation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{McpError, PerplexityMcpError, Result};

/// Speaker of one message in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn of the conversation sent upstream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The contents of the message
    pub content: String,

    /// Who said it
    pub role: Role,
}

/// Arguments of the `ask_perplexity` tool
///
/// Only used to check the shape of incoming arguments. The upstream request
/// body is always the caller's original JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskPerplexityArgs {
    /// Model that completes the prompt
    pub model: String,

    /// Conversation so far
    pub messages: Vec<ChatMessage>,
}

impl AskPerplexityArgs {
    /// Check that `args` has the shape the upstream expects
    pub fn validate(args: &Value) -> Result<Self> {
        Self::deserialize(args).map_err(|e| {
            PerplexityMcpError::Mcp(McpError::InvalidArguments {
                message: e.to_string(),
            })
        })
    }
}

/// Classified result of one invocation
///
/// Every invocation produces exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    /// 2xx response; raw body text, untouched
    Success(String),

    /// No response within the configured bound
    TimedOut { after: Duration },

    /// The host cancelled the invocation first
    Cancelled,

    /// Non-2xx response
    UpstreamError {
        message: String,
        body: Option<String>,
    },

    /// Anything else (connection failure, unreadable body, task panic)
    UnexpectedError { message: String },
}

impl InvocationOutcome {
    /// Short label used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            InvocationOutcome::Success(_) => "success",
            InvocationOutcome::TimedOut { .. } => "timed_out",
            InvocationOutcome::Cancelled => "cancelled",
            InvocationOutcome::UpstreamError { .. } => "upstream_error",
            InvocationOutcome::UnexpectedError { .. } => "unexpected_error",
        }
    }
}
