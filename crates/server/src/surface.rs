//! Headless rendering surface.
//!
//! Stands in for a browser view: `load_url` pulls the main document through
//! the session's resource rendezvous and falls back to a plain fetch,
//! `load_data` shows the document it is handed. The last document shown is
//! what a tool call reports.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use quickpage_client::{FetchClient, HostRuntime, Session, SessionClient};
use schemars::JsonSchema;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Notify;

use crate::runtime::ServerRuntime;

/// Where the shown document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PageSource {
    /// Validated cache entry served by the session.
    Cache,
    /// Network body streamed by the session.
    Session,
    /// Document pushed by the session with `load_data`.
    Data,
    /// Plain fetch outside the session.
    Direct,
}

#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub html: String,
    pub source: PageSource,
    pub headers: Vec<(String, String)>,
}

pub struct HeadlessSurface {
    me: Weak<HeadlessSurface>,
    session: Weak<Session>,
    fetch: Arc<FetchClient>,
    runtime: Arc<ServerRuntime>,
    handle: Handle,
    page: Mutex<Option<RenderedPage>>,
    last_error: Mutex<Option<String>>,
    in_flight: AtomicUsize,
    changed: Notify,
}

impl HeadlessSurface {
    /// Must be called from within a tokio runtime.
    pub fn new(session: &Arc<Session>, fetch: Arc<FetchClient>, runtime: Arc<ServerRuntime>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            session: Arc::downgrade(session),
            fetch,
            runtime,
            handle: Handle::current(),
            page: Mutex::new(None),
            last_error: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            changed: Notify::new(),
        })
    }

    pub fn page(&self) -> Option<RenderedPage> {
        self.page.lock().clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Wait until a document is shown and no load is in flight.
    pub async fn wait_settled(&self, timeout: Duration) -> Option<RenderedPage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight.load(Ordering::Acquire) == 0 {
                if let Some(page) = self.page() {
                    return Some(page);
                }
                if self.last_error().is_some() {
                    return None;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.page();
            }
        }
    }

    fn show(&self, page: RenderedPage) {
        tracing::debug!(source = ?page.source, bytes = page.html.len(), "Showing document");
        *self.page.lock() = Some(page);
        self.changed.notify_waiters();
    }

    fn fail(&self, message: String) {
        tracing::warn!(error = %message, "Loading document failed");
        *self.last_error.lock() = Some(message);
    }

    async fn load(&self, url: &str) {
        let session = self.session.upgrade();

        if let Some(session) = &session
            && let Some(resource) = session.request_resource(url).await
        {
            let source = if resource.body.is_from_cache() { PageSource::Cache } else { PageSource::Session };
            match resource.body.read_to_end().await {
                Ok(bytes) => {
                    self.show(RenderedPage {
                        html: String::from_utf8_lossy(&bytes).into_owned(),
                        source,
                        headers: resource.headers,
                    });
                    session.on_page_finished(url);
                    return;
                }
                Err(e) => tracing::warn!(url, error = %e, "Session stream failed, fetching directly"),
            }
        }

        let cookie = self.runtime.cookie(url);
        match self.fetch.fetch(url, cookie.as_deref()).await {
            Ok(response) => {
                if !response.set_cookies.is_empty() {
                    self.runtime.set_cookies(response.final_url.as_str(), &response.set_cookies);
                }
                let headers = response
                    .content_type
                    .map(|ct| vec![("content-type".to_string(), ct)])
                    .unwrap_or_default();
                self.show(RenderedPage {
                    html: String::from_utf8_lossy(&response.bytes).into_owned(),
                    source: PageSource::Direct,
                    headers,
                });
            }
            Err(e) => self.fail(e.to_string()),
        }
        if let Some(session) = session {
            session.on_page_finished(url);
        }
    }
}

impl SessionClient for HeadlessSurface {
    fn load_url(&self, url: &str) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let url = url.to_string();
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.handle.spawn(async move {
            me.load(&url).await;
            me.in_flight.fetch_sub(1, Ordering::AcqRel);
            me.changed.notify_waiters();
        });
    }

    fn load_data(&self, _base_url: &str, data: &str, _mime_type: &str, _encoding: &str) {
        self.show(RenderedPage { html: data.to_string(), source: PageSource::Data, headers: Vec::new() });
    }
}
