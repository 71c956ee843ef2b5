//! cache_invalidate tool implementation.
//!
//! Drops the cached page and any preloaded session for one URL.

use quickpage_client::Engine;
use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::tools::json_result;

/// Parameters for the cache_invalidate tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheInvalidateParams {
    /// The page URL whose cache entry should be dropped.
    pub url: String,
}

/// Output from the cache_invalidate tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheInvalidateOutput {
    pub url: String,
    /// Session key the URL maps to for the current account.
    pub key: String,
    /// False when a session for the page is running.
    pub invalidated: bool,
}

/// Implementation of the cache_invalidate tool.
pub async fn invalidate_impl(engine: &Engine, params: CacheInvalidateParams) -> Result<CallToolResult, McpError> {
    let key = engine.session_key(&params.url, &engine.config().session)?;
    let invalidated = engine.invalidate(&key).await?;
    tracing::info!(url = %params.url, key, invalidated, "cache_invalidate");

    json_result(&CacheInvalidateOutput { url: params.url, key, invalidated })
}
