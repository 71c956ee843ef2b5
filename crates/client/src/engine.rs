//! Session registry.
//!
//! The engine owns two pools. The preload pool holds sessions created ahead
//! of a consumer, bounded in size and age. The active pool holds one session
//! per key while it runs; it is maintained only by the state listener every
//! session created here is subscribed to.

use std::collections::HashMap;
use std::sync::Arc;

use quickpage_core::cache::hash;
use quickpage_core::{AppConfig, CacheDb, CacheStore, Error, SessionConfig};

use crate::fetch::{canonicalize, key_url};
use crate::host::{HostRuntime, StateListener};
use crate::session::{Session, SessionContext, SessionState};

/// Sessions currently running, keyed by session key.
#[derive(Default)]
struct ActivePool {
    sessions: parking_lot::Mutex<HashMap<String, Arc<Session>>>,
}

impl ActivePool {
    fn contains(&self, key: &str) -> bool {
        self.sessions.lock().contains_key(key)
    }

    fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    fn get(&self, key: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(key).cloned()
    }
}

impl StateListener for ActivePool {
    fn on_state_change(&self, session: &Arc<Session>, _old: SessionState, new: SessionState) {
        match new {
            SessionState::Running => {
                let mut sessions = self.sessions.lock();
                match sessions.get(session.key()) {
                    Some(existing) if !Arc::ptr_eq(existing, session) => {
                        tracing::warn!(
                            key = session.key(),
                            running = existing.id(),
                            session = session.id(),
                            "Another session is already running for this key"
                        );
                    }
                    Some(_) => {}
                    None => {
                        sessions.insert(session.key().to_string(), session.clone());
                    }
                }
            }
            SessionState::Destroyed => {
                let mut sessions = self.sessions.lock();
                if sessions.get(session.key()).is_some_and(|s| Arc::ptr_eq(s, session)) {
                    sessions.remove(session.key());
                }
            }
            SessionState::None | SessionState::Ready => {}
        }
    }
}

/// Process-wide directory of preloaded and running sessions.
pub struct Engine {
    config: AppConfig,
    ctx: Arc<SessionContext>,
    /// Also serializes registry operations.
    preload: tokio::sync::Mutex<HashMap<String, Arc<Session>>>,
    active: Arc<ActivePool>,
}

impl Engine {
    pub fn new(config: AppConfig, ctx: SessionContext) -> Self {
        Self {
            config,
            ctx: Arc::new(ctx),
            preload: tokio::sync::Mutex::new(HashMap::new()),
            active: Arc::new(ActivePool::default()),
        }
    }

    /// Open the cache database and directory named by `config` and build an
    /// engine using HTTP connections.
    pub async fn open(config: AppConfig, runtime: Arc<dyn HostRuntime>) -> Result<Self, Error> {
        let db = CacheDb::open(&config.db_path).await?;
        let store = CacheStore::new(db, &config.engine.cache_dir).await?;
        let ctx = SessionContext::new(store, runtime, &config);
        tracing::info!(
            db = %config.db_path.display(),
            cache_dir = %config.engine.cache_dir.display(),
            "Engine opened"
        );
        Ok(Self::new(config, ctx))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Key for `url`, scoped to the host's current account when configured.
    ///
    /// Query parameters not listed in `key_params` do not affect the key.
    pub fn session_key(&self, url: &str, config: &SessionConfig) -> Result<String, Error> {
        let canonical = canonicalize(url).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        let account = if config.account_scoped { self.ctx.runtime.current_account() } else { String::new() };
        Ok(hash::session_key(&key_url(&canonical, &config.key_params), &account))
    }

    /// False while the key is inside an unavailability window.
    pub async fn is_available(&self, key: &str) -> bool {
        match self.ctx.store.unavailable_until(key).await {
            Ok(until) => until <= chrono::Utc::now().timestamp_millis(),
            Err(e) => {
                tracing::error!(key, error = %e, "Failed to read cooldown");
                true
            }
        }
    }

    /// Create a session ahead of its consumer and park it in the preload pool.
    pub async fn preload(&self, url: &str, config: Option<SessionConfig>) -> Result<bool, Error> {
        let config = config.unwrap_or_else(|| self.config.session.clone());
        let key = self.session_key(url, &config)?;
        let mut preload = self.preload.lock().await;

        if Self::lookup(&mut preload, &key, &config, false).is_some() {
            tracing::debug!(key, "Already preloaded");
            return Ok(false);
        }
        if self.active.contains(&key) {
            tracing::debug!(key, "Already running");
            return Ok(false);
        }
        if preload.len() >= self.config.engine.max_preload_sessions {
            tracing::debug!(key, size = preload.len(), "Preload pool is full");
            return Ok(false);
        }
        if !self.is_available(&key).await {
            tracing::info!(key, "Key is cooling down, not preloading");
            return Ok(false);
        }
        if !self.ctx.runtime.is_network_valid() {
            tracing::debug!(key, "Network unavailable, not preloading");
            return Ok(false);
        }

        match self.create_session(&key, url, config) {
            Some(session) => {
                tracing::info!(key, session = session.id(), "Preloaded session");
                preload.insert(key, session);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Adopt a valid preloaded session for `url`, or create a fresh one.
    ///
    /// Returns `None` during a cooldown, or when a session for the key is
    /// already running and none was preloaded.
    pub async fn create_or_adopt(&self, url: &str, config: Option<SessionConfig>) -> Result<Option<Arc<Session>>, Error> {
        let config = config.unwrap_or_else(|| self.config.session.clone());
        let key = self.session_key(url, &config)?;

        if !self.is_available(&key).await {
            tracing::info!(key, "Key is cooling down");
            return Ok(None);
        }

        let mut preload = self.preload.lock().await;
        if let Some(session) = Self::lookup(&mut preload, &key, &config, true) {
            tracing::info!(key, session = session.id(), "Adopted preloaded session");
            session.set_preloaded(url);
            return Ok(Some(session));
        }
        Ok(self.create_session(&key, url, config))
    }

    /// Drop any preloaded session for `key` and purge its cache.
    ///
    /// Fails while a session for the key is running.
    pub async fn invalidate(&self, key: &str) -> Result<bool, Error> {
        let mut preload = self.preload.lock().await;
        if let Some(session) = preload.remove(key) {
            session.destroy(false);
        }
        if self.active.contains(key) {
            tracing::info!(key, "Session is running, cannot invalidate");
            return Ok(false);
        }
        self.ctx.store.purge(key).await?;
        Ok(true)
    }

    /// Drop every preloaded session and purge the whole cache.
    ///
    /// Fails while any session is running.
    pub async fn clear_all(&self) -> Result<bool, Error> {
        let mut preload = self.preload.lock().await;
        for (_, session) in preload.drain() {
            session.destroy(false);
        }
        if self.active.len() > 0 {
            tracing::info!(running = self.active.len(), "Sessions running, cannot clear cache");
            return Ok(false);
        }
        self.ctx.store.purge_all().await?;
        Ok(true)
    }

    pub async fn preload_count(&self) -> usize {
        self.preload.lock().await.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// The running session for `key`, if any.
    pub fn active_session(&self, key: &str) -> Option<Arc<Session>> {
        self.active.get(key)
    }

    /// Find a preloaded session. Stale or incompatible entries are destroyed.
    fn lookup(
        preload: &mut HashMap<String, Arc<Session>>, key: &str, config: &SessionConfig, pick: bool,
    ) -> Option<Arc<Session>> {
        let session = preload.get(key)?.clone();

        if session.config() != config {
            tracing::debug!(key, session = session.id(), "Preloaded session has a different config");
            preload.remove(key);
            session.destroy(false);
            return None;
        }
        if session.is_expired() {
            tracing::debug!(key, session = session.id(), "Preloaded session expired");
            preload.remove(key);
            session.destroy(false);
            return None;
        }

        if pick {
            preload.remove(key);
        }
        Some(session)
    }

    fn create_session(&self, key: &str, url: &str, config: SessionConfig) -> Option<Arc<Session>> {
        if self.active.contains(key) {
            tracing::debug!(key, "A session is already running for this key");
            return None;
        }
        let auto_start = config.auto_start;
        let session = Session::new(key, url, config, self.ctx.clone());
        session.add_state_listener(self.active.clone());
        if auto_start {
            session.start();
        }
        Some(session)
    }
}
