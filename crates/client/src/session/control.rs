//! The per-session control sequence.
//!
//! Every command aimed at the rendering surface is posted here and applied
//! in order by one task. Content commands that arrive before the consumer is
//! ready are parked; only the latest is kept and it is replayed by
//! `on_consumer_ready`.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Instant;

use quickpage_core::DataMap;
use tokio::sync::mpsc;

use super::{Outcome, PendingDiff, Session, SessionState};
use crate::host::UpdateListener;

pub(super) enum ControlMessage {
    /// Validated cache (or none) is known.
    PreLoad { cache: Option<String> },
    /// No cache existed. `html` is set when the body was read before the consumer asked for it.
    FirstLoad { html: Option<String> },
    TemplateChange { html: Option<String>, refresh: bool },
    DataUpdate { html: Option<String>, diff: Option<DataMap> },
    /// Transport or HTTP failure with direct reload enabled.
    ConnectionError,
    /// The origin asked for a cooldown.
    ServiceUnavailable,
    NotifyResult { src: Outcome, final_outcome: Outcome },
    WebReady(Arc<dyn UpdateListener>),
    ConsumerReady,
    OfflineNotice,
    ForceDestroy,
}

impl ControlMessage {
    fn name(&self) -> &'static str {
        match self {
            ControlMessage::PreLoad { .. } => "pre_load",
            ControlMessage::FirstLoad { .. } => "first_load",
            ControlMessage::TemplateChange { .. } => "template_change",
            ControlMessage::DataUpdate { .. } => "data_update",
            ControlMessage::ConnectionError => "connection_error",
            ControlMessage::ServiceUnavailable => "service_unavailable",
            ControlMessage::NotifyResult { .. } => "notify_result",
            ControlMessage::WebReady(_) => "web_ready",
            ControlMessage::ConsumerReady => "consumer_ready",
            ControlMessage::OfflineNotice => "offline_notice",
            ControlMessage::ForceDestroy => "force_destroy",
        }
    }

    /// Commands that drive the surface and must wait for the consumer.
    fn needs_consumer(&self) -> bool {
        matches!(
            self,
            ControlMessage::PreLoad { .. }
                | ControlMessage::FirstLoad { .. }
                | ControlMessage::TemplateChange { .. }
                | ControlMessage::DataUpdate { .. }
                | ControlMessage::ConnectionError
                | ControlMessage::ServiceUnavailable
        )
    }
}

pub(super) async fn run(session: Weak<Session>, mut rx: mpsc::UnboundedReceiver<ControlMessage>) {
    while let Some(message) = rx.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        session.handle_control(message);
    }
}

impl Session {
    fn handle_control(self: &Arc<Self>, message: ControlMessage) {
        if self.state() == SessionState::Destroyed {
            tracing::debug!(session = self.id, message = message.name(), "Ignoring message for destroyed session");
            return;
        }
        if message.needs_consumer() && !self.consumer_ready.load(Ordering::Acquire) {
            tracing::debug!(session = self.id, message = message.name(), "Consumer not ready, parking message");
            *self.parked.lock() = Some(message);
            return;
        }

        match message {
            ControlMessage::PreLoad { cache } => self.on_pre_load(cache),
            ControlMessage::FirstLoad { html } => self.on_first_load(html),
            ControlMessage::TemplateChange { html, refresh } => self.on_template_change(html, refresh),
            ControlMessage::DataUpdate { html, diff } => self.on_data_update(html, diff),
            ControlMessage::ConnectionError | ControlMessage::ServiceUnavailable => self.load_source_directly(),
            ControlMessage::NotifyResult { src, final_outcome } => self.set_result(src, final_outcome, true),
            ControlMessage::WebReady(listener) => {
                *self.update_listener.lock() = Some(listener);
                if self.outcome().1 != Outcome::Unknown {
                    self.notify_update();
                }
            }
            ControlMessage::ConsumerReady => self.on_consumer_ready_message(),
            ControlMessage::OfflineNotice => {
                if self.consumer_ready.load(Ordering::Acquire) {
                    self.show_offline_notice();
                } else {
                    self.offline_notice_pending.store(true, Ordering::Release);
                }
            }
            ControlMessage::ForceDestroy => self.destroy(true),
        }
    }

    fn on_consumer_ready_message(self: &Arc<Self>) {
        self.consumer_ready.store(true, Ordering::Release);
        if self.offline_notice_pending.swap(false, Ordering::AcqRel) {
            self.show_offline_notice();
        }

        let parked = self.parked.lock().take();
        match parked {
            Some(message) => {
                tracing::debug!(session = self.id, message = message.name(), "Replaying parked message");
                self.handle_control(message);
            }
            None if self.state() == SessionState::None => self.start(),
            None => {}
        }
    }

    fn show_offline_notice(&self) {
        if let Some(text) = &self.config.offline_notice {
            self.ctx.runtime.show_notice(text);
        }
    }

    fn client_load_url(&self, url: &str) {
        match self.client.lock().clone() {
            Some(client) => client.load_url(url),
            None => tracing::warn!(session = self.id, "No client bound, load_url dropped"),
        }
    }

    fn client_load_data(&self, html: &str) {
        self.load_data_invoked.store(true, Ordering::Release);
        let base_url = self.current_url();
        match self.client.lock().clone() {
            Some(client) => client.load_data(&base_url, html, "text/html", "utf-8"),
            None => tracing::warn!(session = self.id, "No client bound, load_data dropped"),
        }
    }

    fn claim_load_url(&self) -> bool {
        self.load_url_invoked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn on_pre_load(&self, cache: Option<String>) {
        match cache {
            None => {
                if self.claim_load_url() {
                    tracing::debug!(session = self.id, "No cache, loading url");
                    self.client_load_url(&self.current_url());
                }
            }
            Some(html) => {
                if self
                    .load_data_invoked
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    tracing::debug!(session = self.id, "Loading cached document");
                    self.client_load_data(&html);
                }
            }
        }
    }

    fn on_first_load(&self, html: Option<String>) {
        match html {
            None => {
                if self.resource_requested.load(Ordering::Acquire) {
                    self.set_result(Outcome::FirstLoad, Outcome::FirstLoad, true);
                } else {
                    tracing::warn!(session = self.id, "First load finished but the page was never requested");
                }
            }
            Some(html) => {
                if self.claim_load_url() {
                    self.client_load_data(&html);
                    self.set_result(Outcome::FirstLoad, Outcome::HitCache, true);
                } else {
                    self.set_result(Outcome::FirstLoad, Outcome::FirstLoad, true);
                }
            }
        }
    }

    fn on_data_update(&self, html: Option<String>, diff: Option<DataMap>) {
        if self.load_data_invoked.load(Ordering::Acquire) {
            match diff {
                Some(diff) => {
                    *self.pending_diff.lock() = Some(PendingDiff { data: diff, received: Instant::now() });
                    self.set_result(Outcome::DataUpdate, Outcome::DataUpdate, true);
                }
                None => {
                    tracing::info!(session = self.id, "Data update without diff, keeping current page");
                    self.set_result(Outcome::DataUpdate, Outcome::HitCache, true);
                }
            }
            return;
        }

        match html {
            Some(html) => {
                self.pending_diff.lock().take();
                self.client_load_data(&html);
                self.set_result(Outcome::DataUpdate, Outcome::HitCache, true);
            }
            None => {
                if self.claim_load_url() {
                    self.client_load_url(&self.src_url());
                }
                self.set_result(Outcome::DataUpdate, Outcome::FirstLoad, true);
            }
        }
    }

    fn on_template_change(&self, html: Option<String>, refresh: bool) {
        if self.load_data_invoked.load(Ordering::Acquire) {
            if !refresh {
                self.set_result(Outcome::TemplateChange, Outcome::HitCache, true);
                return;
            }
            match html {
                Some(html) => self.client_load_data(&html),
                None => self.client_load_url(&self.src_url()),
            }
            self.set_result(Outcome::TemplateChange, Outcome::TemplateChange, true);
        } else {
            match html {
                Some(html) => {
                    self.client_load_data(&html);
                    self.set_result(Outcome::TemplateChange, Outcome::HitCache, true);
                }
                None => {
                    if self.claim_load_url() {
                        self.client_load_url(&self.src_url());
                    }
                    self.set_result(Outcome::TemplateChange, Outcome::FirstLoad, true);
                }
            }
        }
        // the page was replaced, so its listener is gone
        self.update_listener.lock().take();
    }

    fn load_source_directly(&self) {
        self.clear_pending_stream();
        if self.claim_load_url() {
            let url = self.src_url();
            tracing::info!(session = self.id, url, "Loading source url directly");
            self.client_load_url(&url);
        }
    }
}
