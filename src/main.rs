//! Perplexity MCP Server - Rust Implementation
//!
//! A Model Context Protocol (MCP) server that lets agents ask Perplexity
//! source-backed questions through the `ask_perplexity` tool.

use std::sync::Arc;

use clap::{Parser, Subcommand};

use perplexity_mcp_server_rust::config::{Config, API_KEY_ENV};
use perplexity_mcp_server_rust::error::Result;
use perplexity_mcp_server_rust::mcp::server::McpServer;
use perplexity_mcp_server_rust::mcp::tools::{list_tools, ToolHandler};
use perplexity_mcp_server_rust::perplexity::executor::RequestExecutor;
use perplexity_mcp_server_rust::perplexity::transport::HttpTransport;

/// Perplexity MCP Server
#[derive(Parser)]
#[command(name = "perplexity-mcp-server")]
#[command(author, version, about = "Perplexity MCP Server - A Model Context Protocol server for Perplexity")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the tool definitions as JSON and exit
    Tools,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the protocol
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Tools) => {
            println!("{}", serde_json::to_string_pretty(&list_tools())?);
        }
        None => {
            run_server(Config::from_env()).await?;
        }
    }

    Ok(())
}

async fn run_server(config: Config) -> Result<()> {
    if !config.has_api_key() {
        tracing::warn!(
            "{} is not set; requests will be rejected by the Perplexity API",
            API_KEY_ENV
        );
    }
    tracing::debug!("Starting with {:?}", config);

    let config = Arc::new(config);
    let transport = Arc::new(HttpTransport::new(&config)?);
    let executor = RequestExecutor::new(transport, config);

    let mut server = McpServer::new(Arc::new(ToolHandler::new(executor)));
    server.run_stdio().await?;

    Ok(())
}
