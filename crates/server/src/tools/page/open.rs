//! page_open tool implementation.
//!
//! Opens a page through a session the way an embedding application would:
//! adopt or create the session, bind a headless surface, signal readiness and
//! report the document the surface ends up showing.

use std::sync::Arc;
use std::time::Duration;

use quickpage_client::{Engine, FetchClient, SessionState, StatisticsSummary, UpdateListener, UpdateNotice};
use quickpage_core::Error;
use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::PageError;
use crate::runtime::ServerRuntime;
use crate::surface::{HeadlessSurface, PageSource};
use crate::tools::json_result;

/// Input parameters for page_open tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PageOpenParams {
    /// The page URL to open.
    pub url: String,

    /// Upper bound on the whole load in milliseconds (default: 30000).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// How long to wait for the session's update notice once the flow has
    /// finished, in milliseconds (default: 500).
    #[serde(default = "default_notice_wait_ms")]
    pub notice_wait_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_notice_wait_ms() -> u64 {
    500
}

/// Output structure for page_open tool.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct PageOpenOutput {
    pub url: String,
    /// The document the surface ended up showing.
    pub html: String,
    pub source: PageSource,
    /// Whether the session came from the preload pool.
    pub preloaded: bool,
    /// Response headers the session handed out with the document.
    pub headers: Vec<(String, String)>,
    /// The session's update notice, if one arrived.
    pub update: Option<serde_json::Value>,
    pub statistics: StatisticsSummary,
    /// Error codes the session reported while loading.
    pub errors: Vec<i32>,
    pub notices: Vec<String>,
}

/// Implementation of the page_open tool.
pub async fn open_impl(
    engine: &Engine, runtime: &Arc<ServerRuntime>, fetch: &Arc<FetchClient>, params: PageOpenParams,
) -> Result<CallToolResult, McpError> {
    if params.url.trim().is_empty() {
        return Err(Error::InvalidInput("url cannot be empty".into()).into());
    }

    let session = engine
        .create_or_adopt(&params.url, None)
        .await?
        .ok_or_else(|| PageError::Busy(params.url.clone()))?;

    let surface = HeadlessSurface::new(&session, fetch.clone(), runtime.clone());
    if !session.bind_client(surface.clone()) {
        session.destroy(false);
        return Err(PageError::Busy(params.url).into());
    }

    let (tx, mut notices) = mpsc::unbounded_channel::<UpdateNotice>();
    let listener: Arc<dyn UpdateListener> = Arc::new(move |notice: &UpdateNotice| {
        let _ = tx.send(notice.clone());
    });
    session.on_web_ready(listener);
    session.on_consumer_ready();

    let timeout = Duration::from_millis(params.timeout_ms);
    let deadline = tokio::time::Instant::now() + timeout;
    while matches!(session.state(), SessionState::None | SessionState::Running)
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let update = tokio::time::timeout(Duration::from_millis(params.notice_wait_ms), notices.recv())
        .await
        .ok()
        .flatten();

    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
    let page = surface.wait_settled(remaining.max(Duration::from_millis(params.notice_wait_ms))).await;

    let statistics = session.statistics().summary();
    let errors = runtime.take_errors(&session.src_url());
    let notices = runtime.take_notices();
    let preloaded = session.is_preloaded();
    session.destroy(false);

    let Some(page) = page else {
        let reason = surface.last_error().unwrap_or_else(|| "timed out waiting for a document".into());
        return Err(PageError::NoDocument(reason).into());
    };

    tracing::info!(
        url = %params.url,
        source = ?page.source,
        src_code = statistics.src_code,
        final_code = statistics.final_code,
        "page_open"
    );

    json_result(&PageOpenOutput {
        url: params.url,
        html: page.html,
        source: page.source,
        preloaded,
        headers: page.headers,
        update: update.and_then(|n| serde_json::to_value(&n).ok()),
        statistics,
        errors,
        notices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::{engine_with, output_json};

    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use quickpage_client::{ConnectRequest, Connector, FetchConfig, ResponseHead, SessionConnection};

    const PAGE: &str = "<html><head><title>Inbox</title></head><body>\
        <!--sonicdiff-list--><ul><li>a</li></ul><!--sonicdiff-list-end--></body></html>";

    /// Serves `PAGE`, or 304 to a request carrying its etag.
    struct StaticConnector;

    struct StaticConnection {
        body: Mutex<Option<Bytes>>,
    }

    impl Connector for StaticConnector {
        fn open(&self) -> Arc<dyn SessionConnection> {
            Arc::new(StaticConnection { body: Mutex::new(Some(Bytes::from_static(PAGE.as_bytes()))) })
        }
    }

    #[async_trait]
    impl SessionConnection for StaticConnection {
        async fn connect(&self, request: &ConnectRequest) -> Result<ResponseHead, Error> {
            if request.etag.as_deref() == Some("v1") {
                self.body.lock().take();
                return Ok(ResponseHead::new(304));
            }
            Ok(ResponseHead::new(200).with_header("etag", "v1").with_header("template-tag", "t1"))
        }

        async fn read_chunk(&self) -> Result<Option<Bytes>, Error> {
            Ok(self.body.lock().take())
        }

        fn disconnect(&self) {}
    }

    fn params(url: &str) -> PageOpenParams {
        PageOpenParams { url: url.into(), timeout_ms: 5_000, notice_wait_ms: 200 }
    }

    fn fetch() -> Arc<FetchClient> {
        Arc::new(FetchClient::new(FetchConfig::default()).unwrap())
    }

    async fn wait_idle(engine: &Engine) {
        for _ in 0..200 {
            if engine.active_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session was not torn down");
    }

    #[tokio::test]
    async fn test_open_empty_url() {
        let t = engine_with(|ctx| ctx).await;
        let result = open_impl(&t.engine, &t.runtime, &fetch(), params("  ")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_open_then_reopen_from_cache() {
        let t = engine_with(|ctx| ctx.with_connector(Arc::new(StaticConnector))).await;
        let url = "https://pages.example/inbox";

        let first = output_json(&open_impl(&t.engine, &t.runtime, &fetch(), params(url)).await.unwrap());
        assert_eq!(first["html"], PAGE);
        assert_eq!(first["statistics"]["src_code"], 1000);
        assert_eq!(first["preloaded"], false);
        wait_idle(&t.engine).await;

        let second = output_json(&open_impl(&t.engine, &t.runtime, &fetch(), params(url)).await.unwrap());
        assert_eq!(second["html"], PAGE);
        assert_eq!(second["source"], "data");
        assert_eq!(second["statistics"]["src_code"], 304);
        assert_eq!(second["update"]["srcCode"], 304);
        assert!(second["errors"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_adopts_preloaded_session() {
        let t = engine_with(|ctx| ctx.with_connector(Arc::new(StaticConnector))).await;
        let url = "https://pages.example/inbox";
        assert!(t.engine.preload(url, None).await.unwrap());

        let output = output_json(&open_impl(&t.engine, &t.runtime, &fetch(), params(url)).await.unwrap());
        assert_eq!(output["preloaded"], true);
        assert_eq!(output["html"], PAGE);
        assert_eq!(t.engine.preload_count().await, 0);
    }
}
