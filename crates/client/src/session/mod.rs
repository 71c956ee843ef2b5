//! Per-URL session: lifecycle state machine, network flow and consumer
//! rendezvous.
//!
//! A session runs its network flow exactly once, on a spawned task. Commands
//! for the bound rendering surface go through a per-session control task so
//! they are applied one at a time and in order. The consumer meets the flow
//! in [`Session::request_resource`], which waits (bounded) for the flow to
//! hand over a stream.

mod control;
mod flow;
mod state;
mod stats;
mod stream;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use quickpage_core::{AppConfig, CacheStore, DataMap, SessionConfig, SessionData};
use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use crate::connection::{Connector, HEADER_CSP, HEADER_CSP_REPORT_ONLY, HttpConnector, ResponseHead, SessionConnection};
use crate::fetch::{add_session_param, is_same_page, mime_type_for};
use crate::host::{HostRuntime, SessionClient, StateListener, UpdateListener};
use crate::validator::ValidatorChain;

use control::ControlMessage;

pub use state::{Outcome, SessionState, UpdateNotice};
pub use stats::{SessionStatistics, StatisticsSummary};
pub use stream::{CloseHook, SessionStream};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Shared collaborators every session of one engine uses.
pub struct SessionContext {
    pub store: CacheStore,
    pub runtime: Arc<dyn HostRuntime>,
    pub connector: Arc<dyn Connector>,
    pub validators: ValidatorChain,
    pub user_agent: String,
    pub verify_cache_with_hash: bool,
    pub unavailable_duration: Duration,
}

impl SessionContext {
    /// Context with the reqwest connector and the default validator.
    pub fn new(store: CacheStore, runtime: Arc<dyn HostRuntime>, config: &AppConfig) -> Self {
        Self {
            store,
            runtime,
            connector: Arc::new(HttpConnector),
            validators: ValidatorChain::new(),
            user_agent: config.user_agent.clone(),
            verify_cache_with_hash: config.engine.verify_cache_with_hash,
            unavailable_duration: config.engine.unavailable_duration(),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_validators(mut self, validators: ValidatorChain) -> Self {
        self.validators = validators;
        self
    }
}

/// What the consumer receives from a successful rendezvous.
#[derive(Debug)]
pub struct ResourceResponse {
    pub mime_type: &'static str,
    pub encoding: &'static str,
    pub headers: Vec<(String, String)>,
    pub body: SessionStream,
}

struct PendingDiff {
    data: DataMap,
    received: Instant,
}

pub struct Session {
    id: u64,
    key: String,
    config: SessionConfig,
    ctx: Arc<SessionContext>,
    created_at: Instant,
    src_url: RwLock<String>,
    current_url: RwLock<String>,

    state: AtomicU8,
    state_changed: Notify,
    destroy_pending: AtomicBool,
    waiting_for_save: AtomicBool,
    persist_claimed: AtomicBool,
    preloaded: AtomicBool,
    consumer_ready: AtomicBool,
    resource_requested: AtomicBool,
    page_finished: AtomicBool,
    load_url_invoked: AtomicBool,
    load_data_invoked: AtomicBool,
    offline_notice_pending: AtomicBool,

    pending_stream: Mutex<Option<SessionStream>>,
    pending_diff: Mutex<Option<PendingDiff>>,
    parked: Mutex<Option<ControlMessage>>,
    client: Mutex<Option<Arc<dyn SessionClient>>>,
    update_listener: Mutex<Option<Arc<dyn UpdateListener>>>,
    listeners: Mutex<Vec<Arc<dyn StateListener>>>,
    connection: Mutex<Option<Arc<dyn SessionConnection>>>,
    response_head: Mutex<Option<ResponseHead>>,
    cached_meta: Mutex<Option<SessionData>>,
    grace_timer: Mutex<Option<JoinHandle<()>>>,
    stats: Mutex<SessionStatistics>,

    control: mpsc::UnboundedSender<ControlMessage>,
    handle: Handle,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Create a session in state `None`.
    ///
    /// Must be called from within a tokio runtime; the session's control task
    /// and flow run on that runtime.
    pub fn new(key: impl Into<String>, url: &str, config: SessionConfig, ctx: Arc<SessionContext>) -> Arc<Self> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Handle::current();

        let session = Arc::new(Self {
            id,
            key: key.into(),
            config,
            ctx,
            created_at: Instant::now(),
            src_url: RwLock::new(url.to_string()),
            current_url: RwLock::new(add_session_param(url, id)),
            state: AtomicU8::new(SessionState::None as u8),
            state_changed: Notify::new(),
            destroy_pending: AtomicBool::new(false),
            waiting_for_save: AtomicBool::new(false),
            persist_claimed: AtomicBool::new(false),
            preloaded: AtomicBool::new(false),
            consumer_ready: AtomicBool::new(false),
            resource_requested: AtomicBool::new(false),
            page_finished: AtomicBool::new(false),
            load_url_invoked: AtomicBool::new(false),
            load_data_invoked: AtomicBool::new(false),
            offline_notice_pending: AtomicBool::new(false),
            pending_stream: Mutex::new(None),
            pending_diff: Mutex::new(None),
            parked: Mutex::new(None),
            client: Mutex::new(None),
            update_listener: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            connection: Mutex::new(None),
            response_head: Mutex::new(None),
            cached_meta: Mutex::new(None),
            grace_timer: Mutex::new(None),
            stats: Mutex::new(SessionStatistics::new(url)),
            control: tx,
            handle: handle.clone(),
        });

        handle.spawn(control::run(Arc::downgrade(&session), rx));
        tracing::debug!(session = id, url, "Created session");
        session
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn src_url(&self) -> String {
        self.src_url.read().clone()
    }

    /// Source URL tagged with this session's id.
    pub fn current_url(&self) -> String {
        self.current_url.read().clone()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == SessionState::Destroyed || self.destroy_pending.load(Ordering::Acquire)
    }

    pub fn is_preloaded(&self) -> bool {
        self.preloaded.load(Ordering::Acquire)
    }

    /// True once the session has outlived its preload expiry.
    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.config.preload_expiry()
    }

    /// `(source outcome, final outcome)`.
    pub fn outcome(&self) -> (Outcome, Outcome) {
        let stats = self.stats.lock();
        (stats.src_outcome, stats.final_outcome)
    }

    pub fn statistics(&self) -> SessionStatistics {
        self.stats.lock().clone()
    }

    /// Mark as adopted from the preload pool and re-stamp the URL the caller used.
    pub fn set_preloaded(&self, url: &str) {
        self.preloaded.store(true, Ordering::Release);
        *self.src_url.write() = url.to_string();
        *self.current_url.write() = add_session_param(url, self.id);
        self.stats.lock().src_url = url.to_string();
    }

    pub fn add_state_listener(&self, listener: Arc<dyn StateListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn remove_state_listener(&self, listener: &Arc<dyn StateListener>) {
        self.listeners.lock().retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Attach the rendering surface. Fails if one is already bound.
    pub fn bind_client(&self, client: Arc<dyn SessionClient>) -> bool {
        let mut slot = self.client.lock();
        if slot.is_some() || self.is_destroyed() {
            return false;
        }
        *slot = Some(client);
        true
    }

    /// Start the network flow. No-op unless the session is in state `None`.
    pub fn start(self: &Arc<Self>) {
        if !self.switch_state(SessionState::None, SessionState::Running, true) {
            tracing::debug!(session = self.id, state = ?self.state(), "Start ignored");
            return;
        }
        tracing::info!(session = self.id, key = %self.key, "Session started");
        let session = self.clone();
        self.handle.spawn(async move { session.run_flow().await });
    }

    /// The consumer is initialized: replay a parked command or start the flow.
    pub fn on_consumer_ready(&self) {
        self.post(ControlMessage::ConsumerReady);
    }

    /// Register the listener that receives the session's [`UpdateNotice`].
    pub fn on_web_ready(&self, listener: Arc<dyn UpdateListener>) {
        self.post(ControlMessage::WebReady(listener));
    }

    /// The consumer finished loading `url`.
    pub fn on_page_finished(&self, url: &str) {
        if self.matches_url(url) {
            self.page_finished.store(true, Ordering::Release);
            self.wake();
        }
    }

    /// Hand the flow's pending stream to the consumer.
    ///
    /// Only the first call for this session's page can succeed. While the flow
    /// is running the call waits up to the rendezvous timeout for a stream.
    /// `None` tells the consumer to fetch the resource itself.
    pub async fn request_resource(self: &Arc<Self>, url: &str) -> Option<ResourceResponse> {
        if self.resource_requested.load(Ordering::Acquire) || !self.matches_url(url) {
            return None;
        }
        if self
            .resource_requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        self.stats.lock().resource_requested = Some(Instant::now());

        if self.state() == SessionState::Running {
            let started = Instant::now();
            let deadline = tokio::time::Instant::now() + self.config.rendezvous_timeout();
            loop {
                let notified = self.state_changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.pending_stream.lock().is_some() || self.state() != SessionState::Running {
                    break;
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    tracing::warn!(session = self.id, "Timed out waiting for the session flow");
                    break;
                }
            }
            tracing::debug!(
                session = self.id,
                cost_ms = started.elapsed().as_millis() as u64,
                "Rendezvous wait finished"
            );
        }

        let stream = self.pending_stream.lock().take();
        if self.is_destroyed() {
            return None;
        }
        let body = stream?;

        tracing::info!(session = self.id, from_cache = body.is_from_cache(), live = body.is_live(), "Serving resource");
        Some(ResourceResponse {
            mime_type: mime_type_for(url),
            encoding: "utf-8",
            headers: self.response_headers(),
            body,
        })
    }

    /// Tear the session down.
    ///
    /// Without `force`, a session whose flow or background save is still
    /// outstanding is only marked pending and finalized when that work drains
    /// or the grace period elapses.
    pub fn destroy(self: &Arc<Self>, force: bool) {
        if self.state() == SessionState::Destroyed {
            return;
        }

        let stream = self.pending_stream.lock().take();
        drop(stream);
        self.pending_diff.lock().take();

        if !force && !self.can_destroy() {
            if self.destroy_pending.swap(true, Ordering::AcqRel) {
                return;
            }
            self.wake();
            let grace = self.config.destroy_grace();
            tracing::debug!(session = self.id, grace_ms = grace.as_millis() as u64, "Destroy deferred");
            let weak = Arc::downgrade(self);
            let timer = self.handle.spawn(async move {
                tokio::time::sleep(grace).await;
                if let Some(session) = weak.upgrade() {
                    tracing::debug!(session = session.id, "Destroy grace elapsed");
                    session.destroy(true);
                }
            });
            *self.grace_timer.lock() = Some(timer);
            return;
        }

        let old = SessionState::from_u8(self.state.swap(SessionState::Destroyed as u8, Ordering::AcqRel));
        if old == SessionState::Destroyed {
            return;
        }
        self.destroy_pending.store(false, Ordering::Release);

        if let Some(conn) = self.connection.lock().take() {
            conn.disconnect();
        }
        if let Some(timer) = self.grace_timer.lock().take() {
            timer.abort();
        }
        self.wake();
        self.notify_state_listeners(old, SessionState::Destroyed);

        self.client.lock().take();
        self.update_listener.lock().take();
        self.parked.lock().take();
        self.listeners.lock().clear();
        tracing::info!(session = self.id, key = %self.key, "Session destroyed");
    }

    /// True when neither the flow nor a background save is outstanding.
    pub fn can_destroy(&self) -> bool {
        self.state() != SessionState::Running && !self.waiting_for_save.load(Ordering::Acquire)
    }

    pub(crate) fn post_force_destroy_if_needed(&self) -> bool {
        if self.destroy_pending.load(Ordering::Acquire) && self.can_destroy() {
            self.post(ControlMessage::ForceDestroy);
            return true;
        }
        false
    }

    fn matches_url(&self, url: &str) -> bool {
        is_same_page(url, &self.current_url.read()) || is_same_page(url, &self.src_url.read())
    }

    fn switch_state(self: &Arc<Self>, from: SessionState, to: SessionState, notify: bool) -> bool {
        if self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.wake();
        if notify {
            self.notify_state_listeners(from, to);
        }
        true
    }

    fn notify_state_listeners(self: &Arc<Self>, old: SessionState, new: SessionState) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.on_state_change(self, old, new);
        }
    }

    fn wake(&self) {
        self.state_changed.notify_waiters();
    }

    fn post(&self, message: ControlMessage) {
        if self.control.send(message).is_err() {
            tracing::debug!(session = self.id, "Control task gone, message dropped");
        }
    }

    fn set_pending_stream(&self, stream: SessionStream) {
        if self.is_destroyed() {
            return;
        }
        let previous = self.pending_stream.lock().replace(stream);
        drop(previous);
        self.wake();
    }

    /// Replace a still-unclaimed stream with newer content.
    fn refresh_pending_stream(&self, bytes: Vec<u8>) {
        let mut slot = self.pending_stream.lock();
        if slot.is_some() {
            let previous = slot.replace(SessionStream::complete(bytes));
            drop(slot);
            drop(previous);
        }
    }

    fn clear_pending_stream(&self) {
        let previous = self.pending_stream.lock().take();
        drop(previous);
    }

    fn response_headers(&self) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        let (csp, report_only) = match self.response_head.lock().as_ref() {
            Some(head) => (
                head.header(HEADER_CSP).map(str::to_string),
                head.header(HEADER_CSP_REPORT_ONLY).map(str::to_string),
            ),
            None => match self.cached_meta.lock().as_ref() {
                Some(meta) => (meta.csp.clone(), meta.csp_report_only.clone()),
                None => (None, None),
            },
        };
        if let Some(csp) = csp {
            headers.push((HEADER_CSP.to_string(), csp));
        }
        if let Some(report_only) = report_only {
            headers.push((HEADER_CSP_REPORT_ONLY.to_string(), report_only));
        }
        headers
    }

    /// Record outcome codes and optionally notify the update listener.
    fn set_result(&self, src: Outcome, final_outcome: Outcome, notify: bool) {
        {
            let mut stats = self.stats.lock();
            stats.src_outcome = src;
            stats.final_outcome = final_outcome;
        }
        tracing::info!(session = self.id, src = src.code(), final_code = final_outcome.code(), "Session result");
        if notify {
            self.notify_update();
        }
    }

    fn notify_update(&self) {
        let Some(listener) = self.update_listener.lock().clone() else {
            return;
        };
        let (src, final_outcome) = self.outcome();
        if final_outcome == Outcome::Unknown {
            return;
        }

        let mut result = None;
        let mut local_refresh_ms = 0;
        if final_outcome == Outcome::DataUpdate
            && let Some(pending) = self.pending_diff.lock().take()
        {
            let age = pending.received.elapsed();
            if age > self.config.update_notice_window() {
                tracing::warn!(session = self.id, age_ms = age.as_millis() as u64, "Dropping stale data update");
            } else {
                result = Some(pending.data);
                local_refresh_ms = age.as_millis() as u64;
            }
        }

        listener.on_update(&UpdateNotice {
            code: final_outcome.code(),
            src_code: src.code(),
            result,
            local_refresh_ms,
        });
    }
}
