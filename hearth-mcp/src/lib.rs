#![deny(missing_docs)]
//! MCP server: expose a [`ToolRouter`] over stdio JSON-RPC.
//!
//! `hearth mcp` wraps the scheduling and execution suites in this server
//! so external tool hosts can drive the same tools the internal loops
//! use — same validation, same structured error results.

use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;

use rmcp::handler::server::ServerHandler;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, Content, ErrorData, Implementation, ListToolsResult,
    PaginatedRequestParams, ServerCapabilities, ServerInfo, Tool as RmcpTool, ToolsCapability,
};
use rmcp::service::{RequestContext, RoleServer};
use thiserror::Error;

use hearth_tool::ToolRouter;

/// Errors from serving MCP.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum McpError {
    /// Failed to establish the stdio transport.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The transport failed mid-session.
    #[error("transport failed: {0}")]
    Transport(String),
}

/// MCP server over a [`ToolRouter`].
pub struct McpServer {
    router: Arc<ToolRouter>,
    name: String,
    version: String,
}

impl McpServer {
    /// Wrap a router.
    pub fn new(router: Arc<ToolRouter>) -> Self {
        Self {
            router,
            name: "hearth".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Override the advertised server name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Serve via stdio until the client disconnects.
    pub async fn serve_stdio(self) -> Result<(), McpError> {
        use rmcp::transport::io::stdio;
        use rmcp::ServiceExt;

        let transport = stdio();
        let service = self
            .serve(transport)
            .await
            .map_err(|e| McpError::Connection(e.to_string()))?;

        service
            .waiting()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;

        Ok(())
    }
}

impl ServerHandler for McpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: Some(false),
                }),
                ..Default::default()
            },
            server_info: Implementation {
                name: self.name.clone(),
                title: None,
                version: self.version.clone(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Scheduling and execution tools of a hearth automation engine.".into(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListToolsResult, ErrorData>> + Send + '_ {
        async {
            let tools: Vec<RmcpTool> = self
                .router
                .list_tools()
                .into_iter()
                .map(|schema| {
                    let input_schema = match schema.input_schema {
                        serde_json::Value::Object(m) => Arc::new(m),
                        _ => Arc::new(serde_json::Map::new()),
                    };
                    RmcpTool {
                        name: Cow::Owned(schema.name),
                        title: None,
                        description: Some(Cow::Owned(schema.description)),
                        input_schema,
                        output_schema: None,
                        annotations: None,
                        execution: None,
                        icons: None,
                        meta: None,
                    }
                })
                .collect();

            Ok(ListToolsResult::with_all_items(tools))
        }
    }

    fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<CallToolResult, ErrorData>> + Send + '_ {
        async move {
            let input = match request.arguments {
                Some(args) => serde_json::Value::Object(args),
                None => serde_json::Value::Object(serde_json::Map::new()),
            };

            // The router already folds unknown tools, timeouts, and
            // handler failures into structured result content.
            let (content, is_error) = self.router.dispatch(request.name.as_ref(), input).await;

            Ok(CallToolResult {
                content: vec![Content::text(content)],
                structured_content: None,
                is_error: if is_error { Some(true) } else { None },
                meta: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_tool::ToolServer;

    #[test]
    fn server_advertises_tools_capability() {
        let router = Arc::new(ToolRouter::new(vec![ToolServer::new("empty")]));
        let server = McpServer::new(router).with_name("hearth-test");
        let info = server.get_info();
        assert_eq!(info.server_info.name, "hearth-test");
        assert!(info.capabilities.tools.is_some());
    }
}
