//! Perplexity MCP Server Library
//!
//! A Model Context Protocol (MCP) server exposing the Perplexity chat
//! completions API as a single `ask_perplexity` tool.

pub mod config;
pub mod error;
pub mod mcp;
pub mod perplexity;

pub use config::Config;
pub use error::{PerplexityMcpError, Result};
