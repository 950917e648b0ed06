//! Error types for the Perplexity MCP Server
//!
//! This module defines the error hierarchy for all operations in the server.

use thiserror::Error;

/// Main error type for the Perplexity MCP Server
#[derive(Error, Debug)]
pub enum PerplexityMcpError {
    /// MCP protocol errors
    #[error("MCP protocol error: {0}")]
    Mcp(#[from] McpError),

    /// Tool execution failures reported back to the host as errors
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// MCP protocol errors
#[derive(Error, Debug)]
pub enum McpError {
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("Invalid tool arguments: {message}")]
    InvalidArguments { message: String },
}

/// Failed `ask_perplexity` invocations that are raised instead of returned as text
#[derive(Error, Debug)]
pub enum ToolError {
    /// Upstream answered with a non-2xx status
    #[error("API error: {message}{}", render_body(.body))]
    Upstream {
        message: String,
        body: Option<String>,
    },

    #[error("Unexpected error: {message}")]
    Unexpected { message: String },
}

fn render_body(body: &Option<String>) -> String {
    match body {
        Some(body) => format!("\nResponse: {}", body),
        None => String::new(),
    }
}

impl PerplexityMcpError {
    /// Upstream response body carried by this error, if any
    pub fn response_body(&self) -> Option<&str> {
        match self {
            PerplexityMcpError::Tool(ToolError::Upstream { body, .. }) => body.as_deref(),
            _ => None,
        }
    }
}

/// Result type alias for Perplexity MCP operations
pub type Result<T> = std::result::Result<T, PerplexityMcpError>;
