//! The network flow: validate cache, issue the conditional request and
//! reconcile the response with what is stored.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Instant;

use quickpage_core::cache::hash::content_hash;
use quickpage_core::{DataMap, Error, NoticeCode, SaveRequest, template};

use super::control::ControlMessage;
use super::{Outcome, Session, SessionState, SessionStream};
use crate::connection::{
    CacheOffline, ConnectRequest, HEADER_CSP, HEADER_CSP_REPORT_ONLY, HEADER_ETAG, HEADER_TEMPLATE_CHANGE,
    HEADER_TEMPLATE_TAG, ResponseHead, SessionConnection,
};
use crate::validator::{CachedPage, LookupContext};

/// Content to persist once a body is known.
enum SaveJob {
    /// Full document that still needs separating.
    Document(String),
    /// Rebuilt document with its already known template and data.
    Split { html: String, template: String, data: DataMap },
}

impl Session {
    pub(super) async fn run_flow(self: Arc<Self>) {
        let started = Instant::now();
        self.stats.lock().flow_start = Some(started);

        let src_url = self.src_url();
        let cached = {
            let ctx = LookupContext {
                key: &self.key,
                url: &src_url,
                store: &self.ctx.store,
                runtime: self.ctx.runtime.as_ref(),
                verify_with_hash: self.ctx.verify_cache_with_hash,
            };
            self.ctx.validators.lookup(&ctx).await
        };
        self.stats.lock().cache_verified = Some(Instant::now());
        tracing::debug!(
            session = self.id,
            hit = cached.is_some(),
            cost_ms = started.elapsed().as_millis() as u64,
            "Cache verified"
        );

        if let Some(page) = &cached {
            *self.cached_meta.lock() = Some(page.meta.clone());
            self.set_pending_stream(SessionStream::from_cache(page.html.clone().into_bytes()));
        }
        self.post(ControlMessage::PreLoad { cache: cached.as_ref().map(|p| p.html.clone()) });

        if self.ctx.runtime.is_network_valid() {
            self.handle_connection(cached).await;
        } else {
            tracing::info!(session = self.id, "Network unavailable, skipping request");
            if cached.is_some() && self.config.offline_notice.is_some() {
                self.post(ControlMessage::OfflineNotice);
            }
        }

        self.stats.lock().flow_finish = Some(Instant::now());
        if self.switch_state(SessionState::Running, SessionState::Ready, true) {
            tracing::info!(session = self.id, cost_ms = started.elapsed().as_millis() as u64, "Session flow finished");
        }
        self.post_force_destroy_if_needed();
    }

    async fn handle_connection(self: &Arc<Self>, cached: Option<CachedPage>) {
        let src_url = self.src_url();
        let runtime = self.ctx.runtime.clone();
        let meta = cached.as_ref().map(|p| &p.meta);
        let direct_address = runtime.host_direct_address(&src_url);

        let request = ConnectRequest {
            url: self.current_url(),
            etag: meta.map(|m| m.etag.clone()),
            template_tag: meta.map(|m| m.template_tag.clone()),
            accept_diff: self.config.accept_diff,
            cookie: runtime.cookie(&src_url),
            user_agent: self.ctx.user_agent.clone(),
            direct_address,
            connect_timeout: self.config.connect_timeout(),
            read_timeout: self.config.read_timeout(),
        };
        {
            let mut stats = self.stats.lock();
            stats.connection_flow_start = Some(Instant::now());
            stats.used_direct_address = direct_address.is_some();
        }

        let conn = self.ctx.connector.open();
        *self.connection.lock() = Some(conn.clone());

        let head = match conn.connect(&request).await {
            Ok(head) => head,
            Err(e) => {
                tracing::warn!(session = self.id, error = %e, "Connection failed");
                self.stats.lock().connection_flow_finish = Some(Instant::now());
                runtime.notify_error(&src_url, e.notice_code());
                self.on_http_error();
                return;
            }
        };
        self.stats.lock().connected = Some(Instant::now());
        tracing::info!(session = self.id, status = head.status, "Session response");

        if !head.set_cookies.is_empty() {
            runtime.set_cookies(&self.current_url(), &head.set_cookies);
        }
        if self.is_destroyed() {
            tracing::warn!(session = self.id, "Destroyed before the response arrived");
            return;
        }
        *self.response_head.lock() = Some(head.clone());

        if head.status == 304 {
            self.mark_first_byte();
            self.post(ControlMessage::NotifyResult { src: Outcome::HitCache, final_outcome: Outcome::HitCache });
        } else if head.status != 200 {
            runtime.notify_error(&src_url, NoticeCode::Http(head.status));
            self.on_http_error();
        } else if head.cache_offline() == CacheOffline::Http {
            self.on_service_unavailable(cached.is_some()).await;
        } else {
            match cached {
                None => self.first_load(conn, &head).await,
                Some(cached) => self.dispatch_cached(conn, &head, &cached).await,
            }
        }
        // paths that hand the body over or never read it
        self.mark_first_byte();
        self.stats.lock().connection_flow_finish = Some(Instant::now());
    }

    fn mark_first_byte(&self) {
        self.stats.lock().first_byte.get_or_insert_with(Instant::now);
    }

    async fn dispatch_cached(self: &Arc<Self>, conn: Arc<dyn SessionConnection>, head: &ResponseHead, cached: &CachedPage) {
        match head.header(HEADER_TEMPLATE_CHANGE) {
            Some("false" | "0") => self.data_update(conn, head).await,
            Some(_) => self.template_change(conn, head).await,
            None => match head.header(HEADER_TEMPLATE_TAG) {
                Some(tag) if tag != cached.meta.template_tag => {
                    tracing::warn!(
                        session = self.id,
                        stored = %cached.meta.template_tag,
                        received = tag,
                        "Template tag changed without a template-change flag, treating as template change"
                    );
                    self.template_change(conn, head).await;
                }
                tag => {
                    tracing::error!(session = self.id, tag = ?tag, "Response has no template-change flag and an unchanged tag");
                    self.purge().await;
                    self.ctx.runtime.notify_error(&self.src_url(), NoticeCode::ServerDataException);
                }
            },
        }
    }

    fn on_http_error(&self) {
        if self.config.reload_in_bad_network {
            self.post(ControlMessage::ConnectionError);
        }
    }

    async fn on_service_unavailable(&self, had_cache: bool) {
        if had_cache {
            self.purge().await;
        }
        let window = i64::try_from(self.ctx.unavailable_duration.as_millis()).unwrap_or(i64::MAX);
        let until = chrono::Utc::now().timestamp_millis().saturating_add(window);
        if let Err(e) = self.ctx.store.set_unavailable_until(&self.key, until).await {
            tracing::error!(session = self.id, error = %e, "Failed to record cooldown");
        }
        tracing::info!(session = self.id, until, "Origin unavailable, cooling down");
        self.clear_pending_stream();
        self.post(ControlMessage::ServiceUnavailable);
    }

    async fn first_load(self: &Arc<Self>, conn: Arc<dyn SessionConnection>, head: &ResponseHead) {
        let stop = |s: &Session| s.resource_requested.load(Ordering::Acquire);
        let (body, complete) = match self.read_body(&conn, Vec::new(), stop).await {
            Ok(read) => read,
            Err(e) => return self.on_read_error(&e),
        };
        if self.is_destroyed() {
            return;
        }

        if !complete {
            tracing::debug!(session = self.id, buffered = body.len(), "Page requested mid-read, handing over live stream");
            let hook = self.stream_close_hook(head.clone());
            self.set_pending_stream(SessionStream::live(body, conn, hook));
            self.post(ControlMessage::FirstLoad { html: None });
            return;
        }

        let html = String::from_utf8(body.clone()).ok();
        self.set_pending_stream(SessionStream::complete(body));
        if !self.resource_requested.load(Ordering::Acquire) {
            self.post(ControlMessage::FirstLoad { html: html.clone() });
        }

        let offline = head.cache_offline();
        match html {
            Some(html) if offline.needs_save() => self.spawn_save(SaveJob::Document(html), head.clone()),
            Some(_) if offline == CacheOffline::False => self.purge().await,
            Some(_) => {}
            None => tracing::warn!(session = self.id, "Response body is not utf-8, not caching"),
        }
    }

    async fn template_change(self: &Arc<Self>, conn: Arc<dyn SessionConnection>, head: &ResponseHead) {
        let started = Instant::now();
        // the stored document is stale now
        self.clear_pending_stream();

        let stop = |s: &Session| s.page_finished.load(Ordering::Acquire);
        let (body, complete) = match self.read_body(&conn, Vec::new(), stop).await {
            Ok(read) => read,
            Err(e) => return self.on_read_error(&e),
        };
        if self.is_destroyed() {
            return;
        }
        let offline = head.cache_offline();

        let html = if complete { String::from_utf8(body.clone()).ok() } else { None };
        if complete && !self.resource_requested.load(Ordering::Acquire) {
            self.set_pending_stream(SessionStream::complete(body.clone()));
        }
        self.post(ControlMessage::TemplateChange { html: html.clone(), refresh: offline.needs_refresh() });

        if !complete {
            let stop = |s: &Session| s.resource_requested.load(Ordering::Acquire);
            let (body, complete) = match self.read_body(&conn, body, stop).await {
                Ok(read) => read,
                Err(e) => return self.on_read_error(&e),
            };
            if self.is_destroyed() {
                return;
            }
            if complete {
                let html = String::from_utf8(body.clone()).ok();
                self.set_pending_stream(SessionStream::complete(body));
                if let Some(html) = html
                    && offline.needs_save()
                {
                    self.spawn_save(SaveJob::Document(html), head.clone());
                }
            } else {
                let hook = self.stream_close_hook(head.clone());
                self.set_pending_stream(SessionStream::live(body, conn, hook));
            }
            return;
        }

        tracing::debug!(session = self.id, cost_ms = started.elapsed().as_millis() as u64, "Template change read");
        match html {
            Some(html) if offline.needs_save() => self.spawn_save(SaveJob::Document(html), head.clone()),
            _ if offline == CacheOffline::False => self.purge().await,
            _ => {}
        }
    }

    async fn data_update(self: &Arc<Self>, conn: Arc<dyn SessionConnection>, head: &ResponseHead) {
        let (body, complete) = match self.read_body(&conn, Vec::new(), |_| false).await {
            Ok(read) => read,
            Err(e) => return self.on_read_error(&e),
        };
        if !complete || self.is_destroyed() {
            tracing::debug!(session = self.id, read = body.len(), "Destroyed during data update read, keeping cache");
            return;
        }
        let offline = head.cache_offline();
        let src_url = self.src_url();

        let rebuilt = match self.rebuild_from_update(&body).await {
            Ok(rebuilt) => rebuilt,
            Err(e) => {
                tracing::error!(session = self.id, error = %e, "Data update failed");
                self.ctx.runtime.notify_error(&src_url, e.notice_code());
                self.purge().await;
                self.post(ControlMessage::TemplateChange { html: None, refresh: true });
                return;
            }
        };
        let (html, template, fresh, diff) = rebuilt;

        if self.load_data_invoked.load(Ordering::Acquire) {
            let diff = if offline.needs_refresh() { diff } else { None };
            self.post(ControlMessage::DataUpdate { html: None, diff });
        } else {
            self.refresh_pending_stream(html.clone().into_bytes());
            self.post(ControlMessage::DataUpdate { html: Some(html.clone()), diff });
        }

        if offline.needs_save() {
            self.spawn_save(SaveJob::Split { html, template, data: fresh }, head.clone());
        } else {
            self.purge().await;
        }
    }

    /// Merge a data-update body into the stored split.
    ///
    /// Returns the rebuilt document, its template, the fresh data and the
    /// changed regions.
    async fn rebuild_from_update(&self, body: &[u8]) -> Result<(String, String, DataMap, Option<DataMap>), Error> {
        let update = template::parse_update(body)?;
        let cached_data = self.ctx.store.read_data(&self.key).await?;
        let cached_template = self.ctx.store.read_template(&self.key).await?;
        let (Some(cached_data), Some(cached_template)) = (cached_data, cached_template) else {
            return Err(Error::MergeDiff("no stored template/data split for this page".into()));
        };

        let fresh = template::overlay(&cached_data, &update);
        let diff = template::diff(&cached_data, &fresh);
        let merged = template::merge(&cached_template, &fresh)?;
        tracing::debug!(
            session = self.id,
            changed = diff.as_ref().map_or(0, |d| d.len()),
            hash = %merged.hash,
            "Rebuilt document from data update"
        );
        Ok((merged.html, cached_template, fresh, diff))
    }

    fn on_read_error(&self, error: &Error) {
        tracing::warn!(session = self.id, error = %error, "Reading response body failed");
        self.ctx.runtime.notify_error(&self.src_url(), error.notice_code());
        self.on_http_error();
    }

    /// Read until the body ends or `stop` holds. Returns the bytes and whether
    /// the body was read to the end.
    async fn read_body(
        &self, conn: &Arc<dyn SessionConnection>, mut buffer: Vec<u8>, stop: impl Fn(&Session) -> bool,
    ) -> Result<(Vec<u8>, bool), Error> {
        buffer.reserve(self.config.read_buffer_size);
        loop {
            if stop(self) || self.is_destroyed() {
                return Ok((buffer, false));
            }
            let chunk = conn.read_chunk().await?;
            self.mark_first_byte();
            match chunk {
                Some(chunk) => buffer.extend_from_slice(&chunk),
                None => return Ok((buffer, true)),
            }
        }
    }

    fn stream_close_hook(self: &Arc<Self>, head: ResponseHead) -> super::CloseHook {
        let weak: Weak<Session> = Arc::downgrade(self);
        Box::new(move |complete, bytes| {
            let Some(session) = weak.upgrade() else {
                return;
            };
            session.on_stream_closed(complete, bytes, head);
        })
    }

    fn on_stream_closed(self: &Arc<Self>, complete: bool, bytes: Vec<u8>, head: ResponseHead) {
        if !complete {
            tracing::debug!(session = self.id, "Stream closed before the end, not caching");
            return;
        }
        if self.state() == SessionState::Destroyed || !head.cache_offline().needs_save() {
            return;
        }
        match String::from_utf8(bytes) {
            Ok(html) => self.spawn_save(SaveJob::Document(html), head),
            Err(_) => tracing::warn!(session = self.id, "Streamed body is not utf-8, not caching"),
        }
    }

    /// Persist on a background task, at most once per session.
    fn spawn_save(self: &Arc<Self>, job: SaveJob, head: ResponseHead) {
        if self.persist_claimed.swap(true, Ordering::AcqRel) {
            tracing::debug!(session = self.id, "Cache already persisted for this flow");
            return;
        }
        self.waiting_for_save.store(true, Ordering::Release);
        let session = self.clone();
        self.handle.spawn(async move {
            let started = Instant::now();
            session.persist(job, &head).await;
            tracing::debug!(session = session.id, cost_ms = started.elapsed().as_millis() as u64, "Save finished");
            session.waiting_for_save.store(false, Ordering::Release);
            session.post_force_destroy_if_needed();
        });
    }

    async fn persist(&self, job: SaveJob, head: &ResponseHead) {
        let src_url = self.src_url();
        let (html, template, data) = match job {
            SaveJob::Document(html) => match template::separate(&html) {
                Ok(split) => (html, split.template, split.data),
                Err(e) => {
                    tracing::warn!(session = self.id, error = %e, "Separating document failed, not caching");
                    self.ctx.runtime.notify_error(&src_url, NoticeCode::SplitHtmlFail);
                    return;
                }
            },
            SaveJob::Split { html, template, data } => (html, template, data),
        };

        let request = SaveRequest {
            etag: head.header(HEADER_ETAG).map_or_else(|| content_hash(html.as_bytes()), str::to_string),
            template_tag: head
                .header(HEADER_TEMPLATE_TAG)
                .map_or_else(|| content_hash(template.as_bytes()), str::to_string),
            csp: head.header(HEADER_CSP).map(str::to_string),
            csp_report_only: head.header(HEADER_CSP_REPORT_ONLY).map(str::to_string),
            html,
            template: Some(template),
            data: Some(data),
        };

        if let Err(e) = self.ctx.store.save(&self.key, request).await {
            tracing::error!(session = self.id, error = %e, "Saving cache failed");
            self.ctx.runtime.notify_error(&src_url, NoticeCode::WriteFileFail);
        }
    }

    async fn purge(&self) {
        if let Err(e) = self.ctx.store.purge(&self.key).await {
            tracing::error!(session = self.id, error = %e, "Purging cache failed");
        }
    }
}
