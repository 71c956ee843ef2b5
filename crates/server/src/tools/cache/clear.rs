//! cache_clear tool implementation.
//!
//! Drops every preloaded session and the whole page cache.

use quickpage_client::Engine;
use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::tools::json_result;

/// Parameters for the cache_clear tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CacheClearParams {}

/// Output from the cache_clear tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheClearOutput {
    /// False when any session is running.
    pub cleared: bool,
}

/// Implementation of the cache_clear tool.
pub async fn clear_impl(engine: &Engine, _params: CacheClearParams) -> Result<CallToolResult, McpError> {
    let cleared = engine.clear_all().await?;
    tracing::info!(cleared, "cache_clear");
    json_result(&CacheClearOutput { cleared })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::{engine, output_json};
    use quickpage_core::SaveRequest;

    #[tokio::test]
    async fn test_clear_removes_everything() {
        let t = engine().await;
        for key in ["a", "b"] {
            t.store
                .save(key, SaveRequest { html: "<title>x</title>".into(), ..Default::default() })
                .await
                .unwrap();
        }

        let result = clear_impl(&t.engine, CacheClearParams::default()).await.unwrap();
        assert_eq!(output_json(&result)["cleared"], true);
        assert!(t.store.session_data("a").await.unwrap().is_none());
        assert!(t.store.session_data("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_drops_preloaded_sessions() {
        let t = engine().await;
        assert!(t.engine.preload("https://pages.example/inbox", None).await.unwrap());

        let result = clear_impl(&t.engine, CacheClearParams::default()).await.unwrap();
        assert_eq!(output_json(&result)["cleared"], true);
        assert_eq!(t.engine.preload_count().await, 0);
    }
}
