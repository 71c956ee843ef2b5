//! Shared fixtures: a scripted connector, a recording host and a recording
//! rendering surface.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use quickpage_client::{
    ConnectRequest, Connector, Engine, HostRuntime, ResponseHead, SessionClient, SessionConnection, SessionContext,
    UpdateNotice, ValidatorChain,
};
use quickpage_core::{AppConfig, CacheDb, CacheStore, Error, NoticeCode};

pub const URL: &str = "https://pages.test/inbox";

pub const PAGE_V1: &str = "<html><head><title>Inbox (3)</title></head><body>\
    <!--sonicdiff-list--><ul><li>a</li></ul><!--sonicdiff-list-end-->\
    <p>static</p><!--sonicdiff-footer--><i>v1</i><!--sonicdiff-footer-end--></body></html>";

pub const PAGE_V2_TEMPLATE: &str = "<html><head><title>Inbox</title></head><body>\
    <div class=\"new\"><!--sonicdiff-list--><ol><li>z</li></ol><!--sonicdiff-list-end--></div></body></html>";

/// One scripted exchange.
#[derive(Clone)]
pub struct Script {
    head: Result<ResponseHead, String>,
    chunks: Vec<Bytes>,
    gate: Option<Arc<Notify>>,
    body_gate: Option<Arc<Notify>>,
}

impl Script {
    pub fn ok(head: ResponseHead, body: &str) -> Self {
        let bytes = body.as_bytes();
        let mid = bytes.len() / 2;
        Self {
            head: Ok(head),
            chunks: vec![Bytes::copy_from_slice(&bytes[..mid]), Bytes::copy_from_slice(&bytes[mid..])],
            gate: None,
            body_gate: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self { head: Ok(ResponseHead::new(status)), chunks: Vec::new(), gate: None, body_gate: None }
    }

    pub fn fail(message: &str) -> Self {
        Self { head: Err(message.to_string()), chunks: Vec::new(), gate: None, body_gate: None }
    }

    /// Hold `connect` until the returned gate is notified.
    pub fn gated(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.gate = Some(gate.clone());
        (self, gate)
    }

    /// Hold the read after the first body chunk until the returned gate is
    /// notified.
    pub fn gated_body(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.body_gate = Some(gate.clone());
        (self, gate)
    }
}

pub fn page_head(etag: &str, template_tag: &str) -> ResponseHead {
    ResponseHead::new(200)
        .with_header("etag", etag)
        .with_header("template-tag", template_tag)
        .with_header("content-security-policy", "default-src 'self'")
}

#[derive(Default)]
pub struct ConnectLog {
    pub requests: Mutex<Vec<ConnectRequest>>,
    pub chunks_read: AtomicUsize,
}

/// Hands out scripted connections in order. Runs out into 304s.
#[derive(Default)]
pub struct FakeConnector {
    scripts: Mutex<VecDeque<Script>>,
    pub log: Arc<ConnectLog>,
}

impl FakeConnector {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self { scripts: Mutex::new(scripts.into()), log: Arc::default() })
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().push_back(script);
    }

    pub fn requests(&self) -> Vec<ConnectRequest> {
        self.log.requests.lock().clone()
    }

    pub fn chunks_read(&self) -> usize {
        self.log.chunks_read.load(Ordering::SeqCst)
    }
}

impl Connector for FakeConnector {
    fn open(&self) -> Arc<dyn SessionConnection> {
        let script = self.scripts.lock().pop_front().unwrap_or_else(|| Script::status(304));
        Arc::new(FakeConnection {
            script: Mutex::new(Some(script)),
            chunks: Mutex::default(),
            body_gate: Mutex::default(),
            reads: AtomicUsize::new(0),
            log: self.log.clone(),
        })
    }
}

struct FakeConnection {
    script: Mutex<Option<Script>>,
    chunks: Mutex<VecDeque<Bytes>>,
    body_gate: Mutex<Option<Arc<Notify>>>,
    reads: AtomicUsize,
    log: Arc<ConnectLog>,
}

#[async_trait]
impl SessionConnection for FakeConnection {
    async fn connect(&self, request: &ConnectRequest) -> Result<ResponseHead, Error> {
        let script = self.script.lock().take().ok_or_else(|| Error::Connect("already connected".into()))?;
        self.log.requests.lock().push(request.clone());
        if let Some(gate) = &script.gate {
            gate.notified().await;
        }
        *self.chunks.lock() = script.chunks.into();
        *self.body_gate.lock() = script.body_gate;
        script.head.map_err(Error::Connect)
    }

    async fn read_chunk(&self) -> Result<Option<Bytes>, Error> {
        tokio::task::yield_now().await;
        if self.reads.fetch_add(1, Ordering::SeqCst) == 1 {
            let gate = self.body_gate.lock().take();
            if let Some(gate) = gate {
                gate.notified().await;
            }
        }
        let chunk = self.chunks.lock().pop_front();
        if chunk.is_some() {
            self.log.chunks_read.fetch_add(1, Ordering::SeqCst);
        }
        Ok(chunk)
    }

    fn disconnect(&self) {
        self.chunks.lock().clear();
    }
}

pub struct RecordingHost {
    pub network: AtomicBool,
    pub account: Mutex<String>,
    pub errors: Mutex<Vec<NoticeCode>>,
    pub notices: Mutex<Vec<String>>,
    pub cookies: Mutex<Vec<String>>,
}

impl Default for RecordingHost {
    fn default() -> Self {
        Self {
            network: AtomicBool::new(true),
            account: Mutex::default(),
            errors: Mutex::default(),
            notices: Mutex::default(),
            cookies: Mutex::default(),
        }
    }
}

impl RecordingHost {
    pub fn errors(&self) -> Vec<NoticeCode> {
        self.errors.lock().clone()
    }
}

impl HostRuntime for RecordingHost {
    fn current_account(&self) -> String {
        self.account.lock().clone()
    }

    fn cookie(&self, _url: &str) -> Option<String> {
        Some("sid=1".to_string())
    }

    fn set_cookies(&self, _url: &str, cookies: &[String]) {
        self.cookies.lock().extend_from_slice(cookies);
    }

    fn is_network_valid(&self) -> bool {
        self.network.load(Ordering::SeqCst)
    }

    fn show_notice(&self, message: &str) {
        self.notices.lock().push(message.to_string());
    }

    fn notify_error(&self, _url: &str, code: NoticeCode) {
        self.errors.lock().push(code);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientCall {
    LoadUrl(String),
    LoadData(String),
}

#[derive(Default)]
pub struct RecordingClient {
    pub calls: Mutex<Vec<ClientCall>>,
}

impl RecordingClient {
    pub fn calls(&self) -> Vec<ClientCall> {
        self.calls.lock().clone()
    }

    pub fn loaded_data(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ClientCall::LoadData(html) => Some(html),
                ClientCall::LoadUrl(_) => None,
            })
            .collect()
    }
}

impl SessionClient for RecordingClient {
    fn load_url(&self, url: &str) {
        self.calls.lock().push(ClientCall::LoadUrl(url.to_string()));
    }

    fn load_data(&self, _base_url: &str, data: &str, _mime_type: &str, _encoding: &str) {
        self.calls.lock().push(ClientCall::LoadData(data.to_string()));
    }
}

/// Collects update notices.
pub fn notice_sink() -> (Arc<dyn quickpage_client::UpdateListener>, Arc<Mutex<Vec<UpdateNotice>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let listener = move |notice: &UpdateNotice| sink.lock().push(notice.clone());
    (Arc::new(listener), seen)
}

pub struct Harness {
    pub engine: Engine,
    pub host: Arc<RecordingHost>,
    pub connector: Arc<FakeConnector>,
    pub store: CacheStore,
    _dir: tempfile::TempDir,
}

pub async fn harness(scripts: Vec<Script>) -> Harness {
    harness_with(scripts, |_| {}).await
}

pub async fn harness_with(scripts: Vec<Script>, tweak: impl FnOnce(&mut AppConfig)) -> Harness {
    build(scripts, tweak, None).await
}

/// Harness whose sessions validate the cache with `validators`.
pub async fn harness_with_validators(scripts: Vec<Script>, validators: ValidatorChain) -> Harness {
    build(scripts, |_| {}, Some(validators)).await
}

async fn build(scripts: Vec<Script>, tweak: impl FnOnce(&mut AppConfig), validators: Option<ValidatorChain>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.engine.cache_dir = dir.path().to_path_buf();
    config.session.destroy_grace_ms = 300;
    config.session.rendezvous_timeout_ms = 2_000;
    tweak(&mut config);

    let db = CacheDb::open_in_memory().await.unwrap();
    let store = CacheStore::new(db, dir.path()).await.unwrap();
    let host = Arc::new(RecordingHost::default());
    let connector = FakeConnector::new(scripts);
    let mut ctx = SessionContext::new(store.clone(), host.clone(), &config).with_connector(connector.clone());
    if let Some(validators) = validators {
        ctx = ctx.with_validators(validators);
    }

    Harness { engine: Engine::new(config, ctx), host, connector, store, _dir: dir }
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Poll until the key has a stored entry.
pub async fn wait_for_cache(store: &CacheStore, key: &str) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if store.session_data(key).await.unwrap().is_some() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
