//! MCP tool implementations.
//!
//! This module contains all tools exposed by the quickpage server.

pub mod cache;
pub mod page;

use quickpage_core::Error;
use rmcp::{
    ErrorData as McpError,
    model::{CallToolResult, Content},
};
use serde::Serialize;

/// Wrap a tool output as pretty-printed JSON text content.
fn json_result<T: Serialize>(output: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(output)
        .map_err(|e| Error::InvalidInput(format!("Failed to serialize output: {e}")))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}
