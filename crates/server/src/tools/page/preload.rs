//! page_preload tool implementation.
//!
//! Starts a session for a URL ahead of the page_open call that will adopt it.

use quickpage_client::Engine;
use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::tools::json_result;

/// Parameters for the page_preload tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PagePreloadParams {
    /// The page URL to preload.
    pub url: String,
}

/// Output from the page_preload tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PagePreloadOutput {
    pub url: String,
    /// False when the page is already preloaded or running, the pool is
    /// full, the origin is cooling down, or the network is unavailable.
    pub preloaded: bool,
    /// Sessions now waiting in the preload pool.
    pub pool_size: usize,
}

/// Implementation of the page_preload tool.
pub async fn preload_impl(engine: &Engine, params: PagePreloadParams) -> Result<CallToolResult, McpError> {
    let preloaded = engine.preload(&params.url, None).await?;
    let pool_size = engine.preload_count().await;
    tracing::info!(url = %params.url, preloaded, pool_size, "page_preload");

    json_result(&PagePreloadOutput { url: params.url, preloaded, pool_size })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::{engine, output_json};

    #[tokio::test]
    async fn test_preload_once_per_page() {
        let t = engine().await;
        let params = PagePreloadParams { url: "https://pages.example/inbox".into() };

        let first = output_json(&preload_impl(&t.engine, params.clone()).await.unwrap());
        assert_eq!(first["preloaded"], true);
        assert_eq!(first["pool_size"], 1);

        let second = output_json(&preload_impl(&t.engine, params).await.unwrap());
        assert_eq!(second["preloaded"], false);
        assert_eq!(second["pool_size"], 1);
    }

    #[tokio::test]
    async fn test_preload_empty_url() {
        let t = engine().await;
        let result = preload_impl(&t.engine, PagePreloadParams { url: String::new() }).await;
        assert!(result.is_err());
    }
}
