//! Perplexity API module
//!
//! Contains the tool argument types, the upstream transport, and the request
//! executor for the Perplexity chat completions API.

pub mod executor;
pub mod transport;
pub mod types;
