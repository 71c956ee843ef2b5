//! MCP server handler implementation.
//!
//! This module defines the main server handler that
//! routes tool calls to the appropriate implementations.
use std::sync::Arc;

use crate::runtime::ServerRuntime;
use crate::tools::cache::{CacheClearParams, CacheInvalidateParams, clear_impl, invalidate_impl};
use crate::tools::page::{PageOpenParams, PagePreloadParams, open_impl, preload_impl};

use quickpage_client::{Engine, FetchClient};
use rmcp::{
    ErrorData as McpError, ServerHandler,
    handler::server::{
        tool::{ToolCallContext, ToolRouter},
        wrapper::Parameters,
    },
    model::{
        CallToolRequestParam, CallToolResult, Implementation, ListToolsResult, PaginatedRequestParam, ProtocolVersion,
        ServerCapabilities, ServerInfo,
    },
    service::{RequestContext, RoleServer},
    tool, tool_router,
};

/// The main MCP server handler for quickpage.
#[derive(Clone)]
pub struct QuickpageServer {
    engine: Arc<Engine>,
    runtime: Arc<ServerRuntime>,
    fetch: Arc<FetchClient>,
    tool_router: ToolRouter<Self>,
}

/// Tool router implementation using the #[tool_router] macro.
///
/// This macro generates the routing logic that maps tool names to handler methods.
#[tool_router]
impl QuickpageServer {
    /// Create a new server handler.
    pub fn new(engine: Arc<Engine>, runtime: Arc<ServerRuntime>, fetch: Arc<FetchClient>) -> Self {
        Self { engine, runtime, fetch, tool_router: Self::tool_router() }
    }

    /// Open a page through its cache session.
    #[tool(
        description = "Open a page through its local cache session. Returns the document shown, how it was obtained (cache, data update, template change, first load) and timings."
    )]
    async fn page_open(&self, params: Parameters<PageOpenParams>) -> Result<CallToolResult, McpError> {
        open_impl(&self.engine, &self.runtime, &self.fetch, params.0).await
    }

    #[tool(description = "Start a session for a page ahead of opening it, warming its cache.")]
    async fn page_preload(&self, params: Parameters<PagePreloadParams>) -> Result<CallToolResult, McpError> {
        preload_impl(&self.engine, params.0).await
    }

    #[tool(description = "Drop the cached copy of one page. Fails while the page is open.")]
    async fn cache_invalidate(&self, params: Parameters<CacheInvalidateParams>) -> Result<CallToolResult, McpError> {
        invalidate_impl(&self.engine, params.0).await
    }

    #[tool(description = "Drop every cached page and preloaded session. Fails while any page is open.")]
    async fn cache_clear(&self, params: Parameters<CacheClearParams>) -> Result<CallToolResult, McpError> {
        clear_impl(&self.engine, params.0).await
    }
}

impl ServerHandler for QuickpageServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "quickpage-mcp".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                ..Default::default()
            },
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self, _request: Option<PaginatedRequestParam>, _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, rmcp::model::ErrorData> {
        Ok(ListToolsResult { meta: None, tools: self.tool_router.list_all(), next_cursor: None })
    }

    async fn call_tool(
        &self, request: CallToolRequestParam, context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, rmcp::model::ErrorData> {
        self.tool_router
            .call(ToolCallContext::new(self, request, context))
            .await
    }
}
