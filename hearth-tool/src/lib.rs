#![deny(missing_docs)]
//! Tool interface and call transport for hearth.
//!
//! Defines the object-safe [`ToolDyn`] trait, [`ToolServer`] for grouping
//! related tools (a server carries whatever scoped context its tools
//! share, e.g. which automation is being scheduled), and [`ToolRouter`],
//! the transport the tool loop dispatches through.
//!
//! The router never raises for anything the model caused: timeouts,
//! unknown names, and handler failures all come back as structured JSON
//! the model can read and react to on its next turn.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use hearth_types::ToolSchema;
use thiserror::Error;

/// Default bound on a single tool call.
pub const TOOL_EXECUTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors from tool handlers.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ToolError {
    /// The input provided to the tool was invalid. The message is shown
    /// to the model so it can self-correct.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Tool execution failed.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Object-safe trait for tool implementations.
///
/// Tools are stored as `Arc<dyn ToolDyn>` inside a [`ToolServer`]. The
/// handler returns the JSON that becomes the `tool_result` content.
pub trait ToolDyn: Send + Sync {
    /// The tool's unique name.
    fn name(&self) -> &str;

    /// Human-readable description of what the tool does.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's input parameters.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given input.
    fn call(
        &self,
        input: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, ToolError>> + Send + '_>>;
}

/// A named group of related tools sharing scoped context.
pub struct ToolServer {
    name: String,
    tools: Vec<Arc<dyn ToolDyn>>,
}

impl ToolServer {
    /// Create an empty server with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: Vec::new(),
        }
    }

    /// Add a tool to this server.
    #[must_use]
    pub fn with_tool(mut self, tool: Arc<dyn ToolDyn>) -> Self {
        self.tools.push(tool);
        self
    }

    /// The server's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tools grouped under this server.
    pub fn tools(&self) -> &[Arc<dyn ToolDyn>] {
        &self.tools
    }
}

/// Routes tool calls from the loop to handlers across one or more servers.
///
/// Dispatch is synchronous from the loop's point of view; handlers may
/// suspend. Each call is bounded by a timeout (default
/// [`TOOL_EXECUTION_TIMEOUT`]).
pub struct ToolRouter {
    tools: HashMap<String, Arc<dyn ToolDyn>>,
    server_names: Vec<String>,
    timeout: Duration,
}

impl ToolRouter {
    /// Build a router over the given servers.
    ///
    /// Later servers win on name collision, matching registry overwrite
    /// semantics.
    pub fn new(servers: Vec<ToolServer>) -> Self {
        let mut tools = HashMap::new();
        let mut server_names = Vec::new();
        for server in servers {
            server_names.push(server.name.clone());
            for tool in server.tools {
                tools.insert(tool.name().to_string(), tool);
            }
        }
        Self {
            tools,
            server_names,
            timeout: TOOL_EXECUTION_TIMEOUT,
        }
    }

    /// Override the per-call timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Names of the servers this router was built from.
    pub fn server_names(&self) -> &[String] {
        &self.server_names
    }

    /// Schemas for every routed tool, for the provider request.
    pub fn list_tools(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Whether the router has no tools at all.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Dispatch one call and return the `tool_result` content.
    ///
    /// Returns `(content, is_error)`. Unknown tools, timeouts, and handler
    /// failures are reported as structured JSON with `is_error = true`;
    /// nothing the model caused escapes as a Rust error.
    pub async fn dispatch(&self, name: &str, input: serde_json::Value) -> (String, bool) {
        let Some(tool) = self.tools.get(name) else {
            tracing::warn!(tool = name, "model called unknown tool");
            return (
                serde_json::json!({"kind": "tool-not-found", "tool": name}).to_string(),
                true,
            );
        };

        match tokio::time::timeout(self.timeout, tool.call(input)).await {
            Ok(Ok(output)) => (output.to_string(), false),
            Ok(Err(ToolError::InvalidInput(detail))) => (
                serde_json::json!({"error": "invalid input", "detail": detail}).to_string(),
                true,
            ),
            Ok(Err(err)) => {
                tracing::warn!(tool = name, error = %err, "tool handler failed");
                (
                    serde_json::json!({"kind": "tool-error", "detail": err.to_string()})
                        .to_string(),
                    true,
                )
            }
            Err(_elapsed) => {
                tracing::warn!(tool = name, timeout_ms = self.timeout.as_millis() as u64, "tool call timed out");
                (
                    serde_json::json!({
                        "kind": "tool-timeout",
                        "tool": name,
                        "timeout_ms": self.timeout.as_millis() as u64,
                    })
                    .to_string(),
                    true,
                )
            }
        }
    }
}
