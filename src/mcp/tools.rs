//! MCP Tool definitions and handlers
//!
//! Declares the `ask_perplexity` tool and turns invocation outcomes into
//! protocol results.

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::config::perplexity::{MODELS, TOOL_NAME};
use crate::error::{McpError, PerplexityMcpError, Result, ToolError};
use crate::mcp::types::{CallToolResult, Tool};
use crate::perplexity::executor::RequestExecutor;
use crate::perplexity::types::{AskPerplexityArgs, InvocationOutcome};

/// Text returned when the host cancels an invocation
pub const CANCELLED_TEXT: &str = "Request was cancelled by the client.";

const DESCRIPTION: &str = "\
Perplexity equips agents with a specialized tool for efficiently gathering \
source-backed information from the internet, ideal for scenarios requiring \
research, fact-checking, or contextual data to inform decisions and responses.

Each response includes citations, which provide transparent references to the \
sources used for the generated answer, and choices, which contain the model's \
suggested responses, enabling users to access reliable information and diverse \
perspectives.

This function may encounter timeout errors due to long processing times, but \
retrying the operation is safe and can lead to successful completion.

[Response structure]
- id: An ID generated uniquely for each response.
- model: The model used to generate the response.
- object: The object type, which always equals `chat.completion`.
- created: The Unix timestamp (in seconds) of when the completion was created.
- citations[]: Citations for the generated answer.
- choices[]: The list of completion choices the model generated for the input prompt.
- usage: Usage statistics for the completion request.
";

/// Tool handler
pub struct ToolHandler {
    executor: RequestExecutor,
}

impl ToolHandler {
    /// Create a new tool handler
    pub fn new(executor: RequestExecutor) -> Self {
        Self { executor }
    }

    /// List all available tools
    pub fn list_tools(&self) -> Vec<Tool> {
        list_tools()
    }

    /// Call a tool by name.
    ///
    /// Unknown tools and malformed arguments fail before any request is made.
    pub async fn call_tool(
        &self,
        name: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> Result<CallToolResult> {
        if name != TOOL_NAME {
            return Err(McpError::UnknownTool {
                name: name.to_string(),
            }
            .into());
        }

        AskPerplexityArgs::validate(&args)?;

        let outcome = self.executor.execute(args, cancel).await;
        render_outcome(outcome)
    }
}

/// The tools this server exposes
pub fn list_tools() -> Vec<Tool> {
    vec![Tool {
        name: TOOL_NAME.to_string(),
        description: Some(DESCRIPTION.to_string()),
        input_schema: ask_perplexity_schema(),
    }]
}

/// Render an outcome as a tool result, or as an error for the host to relay
pub fn render_outcome(outcome: InvocationOutcome) -> Result<CallToolResult> {
    match outcome {
        InvocationOutcome::Success(body) => Ok(CallToolResult::text(body)),
        InvocationOutcome::TimedOut { after } => Ok(CallToolResult::text(format!(
            "Request timed out after {:.1} seconds. Please try again.",
            after.as_secs_f64()
        ))),
        InvocationOutcome::Cancelled => Ok(CallToolResult::text(CANCELLED_TEXT)),
        InvocationOutcome::UpstreamError { message, body } => {
            Err(PerplexityMcpError::Tool(ToolError::Upstream { message, body }))
        }
        InvocationOutcome::UnexpectedError { message } => {
            Err(PerplexityMcpError::Tool(ToolError::Unexpected { message }))
        }
    }
}

// ==================== Tool Schemas ====================

fn ask_perplexity_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "model": {
                "type": "string",
                "description": "The name of the model that will complete your prompt.",
                "enum": MODELS
            },
            "messages": {
                "type": "array",
                "description": "A list of messages comprising the conversation so far.",
                "items": {
                    "type": "object",
                    "properties": {
                        "content": {
                            "type": "string",
                            "description": "The contents of the message in this turn of conversation."
                        },
                        "role": {
                            "type": "string",
                            "description": "The role of the speaker in this turn of conversation. After the (optional) system message, user and assistant roles should alternate with user then assistant, ending in user.",
                            "enum": ["system", "user", "assistant"]
                        }
                    },
                    "required": ["content", "role"]
                }
            }
        },
        "required": ["model", "messages"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    #[test]
    fn test_list_tools_is_single_ask_perplexity() {
        let tools = list_tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "ask_perplexity");

        let description = tools[0].description.as_deref().unwrap();
        assert!(description.contains("retrying"));
        assert!(description.contains("citations"));
    }

    #[test]
    fn test_list_tools_is_idempotent() {
        assert_eq!(list_tools(), list_tools());
    }

    #[test]
    fn test_schema_shape() {
        let schema = ask_perplexity_schema();
        assert_eq!(schema["required"], json!(["model", "messages"]));
        assert_eq!(
            schema["properties"]["model"]["enum"],
            json!(["llama-3.1-sonar-small-128k-online"])
        );
        assert_eq!(
            schema["properties"]["messages"]["items"]["properties"]["role"]["enum"],
            json!(["system", "user", "assistant"])
        );
        assert_eq!(
            schema["properties"]["messages"]["items"]["required"],
            json!(["content", "role"])
        );
    }

    #[test]
    fn test_render_timeout_and_cancel_as_text() {
        let result = render_outcome(InvocationOutcome::TimedOut {
            after: Duration::from_secs(60),
        })
        .unwrap();
        assert_eq!(
            result.first_text(),
            Some("Request timed out after 60.0 seconds. Please try again.")
        );

        let result = render_outcome(InvocationOutcome::Cancelled).unwrap();
        assert_eq!(result.first_text(), Some(CANCELLED_TEXT));
    }

    #[test]
    fn test_render_failures_as_errors() {
        let err = render_outcome(InvocationOutcome::UpstreamError {
            message: "HTTP 429 Too Many Requests".to_string(),
            body: Some("slow down".to_string()),
        })
        .unwrap_err();
        assert_eq!(err.response_body(), Some("slow down"));
        assert!(err.to_string().contains("429"));

        let err = render_outcome(InvocationOutcome::UnexpectedError {
            message: "boom".to_string(),
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "Unexpected error: boom");
    }
}
