//! MCP Server implementation
//!
//! Implements the Model Context Protocol server for stdio transport.
//! `tools/call` requests run concurrently, each with its own cancellation
//! token, while a single writer task serializes responses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{PerplexityMcpError, Result};
use crate::mcp::tools::ToolHandler;
use crate::mcp::types::*;

/// MCP Server info
const SERVER_NAME: &str = "mcp-server-perplexity";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Cancellation tokens of `tools/call` requests still running
#[derive(Default)]
struct InFlight {
    tokens: Mutex<HashMap<RequestId, CancellationToken>>,
}

impl InFlight {
    /// Register a request; false if the ID is already running
    fn register(&self, id: &RequestId, token: CancellationToken) -> bool {
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        if tokens.contains_key(id) {
            return false;
        }
        tokens.insert(id.clone(), token);
        true
    }

    fn finish(&self, id: &RequestId) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// Cancel a running request; false if it isn't running
    fn cancel(&self, id: &RequestId) -> bool {
        match self
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
        {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// MCP Server for Perplexity
pub struct McpServer {
    /// Tool handler
    tool_handler: Arc<ToolHandler>,

    /// Running tool calls
    in_flight: Arc<InFlight>,

    /// Tracks spawned tool calls so shutdown can wait for them
    tracker: TaskTracker,

    /// Whether initialized
    initialized: bool,
}

impl McpServer {
    /// Create a new MCP server
    pub fn new(tool_handler: Arc<ToolHandler>) -> Self {
        Self {
            tool_handler,
            in_flight: Arc::new(InFlight::default()),
            tracker: TaskTracker::new(),
            initialized: false,
        }
    }

    /// Run the server on stdio
    pub async fn run_stdio(&mut self) -> Result<()> {
        let stdin = BufReader::new(tokio::io::stdin());
        let stdout = tokio::io::stdout();
        self.run(stdin, stdout).await
    }

    /// Serve newline-delimited JSON-RPC from `reader`, writing responses to `writer`.
    ///
    /// Returns once `reader` hits EOF and every running tool call has finished.
    pub async fn run<R, W>(&mut self, mut reader: R, writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_responses(writer, rx));

        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("Failed to read input: {}", e);
                    break;
                }
            }

            let response = match std::str::from_utf8(&buf) {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => self.handle_message(line, &tx),
                Err(e) => {
                    tracing::warn!("Received a line that is not valid UTF-8: {}", e);
                    Some(JsonRpcResponse::error(
                        RequestId::Number(0),
                        JsonRpcError::parse_error(format!("Invalid UTF-8: {}", e)),
                    ))
                }
            };

            if let Some(response) = response {
                if tx.send(response).is_err() {
                    break;
                }
            }
        }

        tracing::debug!("Input closed, waiting for {} running call(s)", self.tracker.len());
        self.tracker.close();
        self.tracker.wait().await;
        drop(tx);

        writer_task
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
    }

    /// Handle an incoming JSON-RPC message
    fn handle_message(
        &mut self,
        message: &str,
        tx: &UnboundedSender<JsonRpcResponse>,
    ) -> Option<JsonRpcResponse> {
        // Try to parse as request
        let request: JsonRpcRequest = match serde_json::from_str(message) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!("Failed to parse message: {}", e);
                return Some(JsonRpcResponse::error(
                    RequestId::Number(0),
                    JsonRpcError::parse_error(e.to_string()),
                ));
            }
        };

        let Some(id) = request.id else {
            self.handle_notification(&request.method, request.params);
            return None;
        };

        if request.jsonrpc != JSONRPC_VERSION {
            return Some(JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_request(format!(
                    "Unsupported JSON-RPC version: {}",
                    request.jsonrpc
                )),
            ));
        }

        match request.method.as_str() {
            methods::INITIALIZE => Some(self.handle_initialize(id, request.params)),
            methods::PING => Some(JsonRpcResponse::success(id, json!({}))),
            methods::LIST_TOOLS => Some(self.handle_list_tools(id)),
            methods::CALL_TOOL => {
                if !self.initialized {
                    tracing::warn!("tools/call received before initialization completed");
                }
                self.handle_call_tool(id, request.params, tx)
            }
            _ => Some(JsonRpcResponse::error(
                id,
                JsonRpcError::method_not_found(&request.method),
            )),
        }
    }

    fn handle_notification(&mut self, method: &str, params: Option<Value>) {
        match method {
            methods::INITIALIZED => {
                self.initialized = true;
                tracing::info!("Client initialized");
            }
            methods::CANCELLED => {
                let params: CancelledParams =
                    match params.map(serde_json::from_value).transpose() {
                        Ok(Some(p)) => p,
                        Ok(None) => {
                            tracing::warn!("Cancellation notification without params");
                            return;
                        }
                        Err(e) => {
                            tracing::warn!("Invalid cancellation params: {}", e);
                            return;
                        }
                    };

                if self.in_flight.cancel(&params.request_id) {
                    tracing::info!(
                        "Cancelling request {:?} ({})",
                        params.request_id,
                        params.reason.as_deref().unwrap_or("no reason given")
                    );
                } else {
                    tracing::debug!(
                        "Cancellation for unknown or finished request {:?}",
                        params.request_id
                    );
                }
            }
            other => tracing::debug!("Ignoring notification: {}", other),
        }
    }

    /// Handle initialize request
    fn handle_initialize(&self, id: RequestId, params: Option<Value>) -> JsonRpcResponse {
        if let Some(Ok(init)) = params.map(serde_json::from_value::<InitializeParams>) {
            tracing::info!(
                "Initializing for {} {} (protocol {})",
                init.client_info.name,
                init.client_info.version,
                init.protocol_version
            );
        }

        let result = InitializeResult {
            protocol_version: MCP_VERSION.to_string(),
            server_info: ServerInfo {
                name: SERVER_NAME.to_string(),
                version: SERVER_VERSION.to_string(),
            },
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: true }),
                ..Default::default()
            },
        };

        to_response(id, result)
    }

    /// Handle list tools request
    fn handle_list_tools(&self, id: RequestId) -> JsonRpcResponse {
        let result = ListToolsResult {
            tools: self.tool_handler.list_tools(),
        };

        to_response(id, result)
    }

    /// Spawn a tool call; its response is sent on `tx` when it finishes
    fn handle_call_tool(
        &self,
        id: RequestId,
        params: Option<Value>,
        tx: &UnboundedSender<JsonRpcResponse>,
    ) -> Option<JsonRpcResponse> {
        let params: CallToolParams = match params.map(serde_json::from_value).transpose() {
            Ok(Some(params)) => params,
            Ok(None) => {
                return Some(JsonRpcResponse::error(
                    id,
                    JsonRpcError::invalid_params("Missing tool parameters"),
                ));
            }
            Err(e) => {
                return Some(JsonRpcResponse::error(
                    id,
                    JsonRpcError::invalid_params(format!("Invalid tool parameters: {}", e)),
                ));
            }
        };

        // Registered before spawning so a cancel read right after this line finds it.
        let cancel = CancellationToken::new();
        if !self.in_flight.register(&id, cancel.clone()) {
            return Some(JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_request("Request ID is already in use"),
            ));
        }

        let handler = Arc::clone(&self.tool_handler);
        let in_flight = Arc::clone(&self.in_flight);
        let tx = tx.clone();

        self.tracker.spawn(async move {
            let result = handler
                .call_tool(&params.name, params.arguments, cancel)
                .await;
            in_flight.finish(&id);

            let response = match result {
                Ok(result) => to_response(id, result),
                Err(e) => error_response(id, e),
            };
            let _ = tx.send(response);
        });

        None
    }
}

fn to_response(id: RequestId, result: impl serde::Serialize) -> JsonRpcResponse {
    match serde_json::to_value(result) {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::error(id, JsonRpcError::internal_error(e.to_string())),
    }
}

/// Map a failed tool call to a JSON-RPC error
fn error_response(id: RequestId, err: PerplexityMcpError) -> JsonRpcResponse {
    let error = match &err {
        PerplexityMcpError::Mcp(e) => JsonRpcError::invalid_params(e.to_string()),
        _ => match err.response_body() {
            Some(body) => JsonRpcError::internal_error(err.to_string())
                .with_data(json!({ "responseBody": body })),
            None => JsonRpcError::internal_error(err.to_string()),
        },
    };

    JsonRpcResponse::error(id, error)
}

/// Write each response as one line, flushing after every message
async fn write_responses<W>(mut writer: W, mut rx: UnboundedReceiver<JsonRpcResponse>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let mut line = serde_json::to_vec(&response)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }

    Ok(())
}
