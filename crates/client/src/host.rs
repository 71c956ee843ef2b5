//! Capabilities the embedding application supplies to the engine.
//!
//! `HostRuntime` is process-wide (account, cookies, network state, notices).
//! `SessionClient` is the rendering surface bound to one session, and
//! `UpdateListener` receives the result notice once a session settles.

use std::net::IpAddr;
use std::sync::Arc;

use quickpage_core::NoticeCode;

use crate::session::{Session, SessionState, UpdateNotice};

/// Process-wide host services.
pub trait HostRuntime: Send + Sync {
    /// Identity used to scope session keys. Empty when no one is signed in.
    fn current_account(&self) -> String;

    /// Cookie header value to send for `url`.
    fn cookie(&self, url: &str) -> Option<String>;

    /// Store `Set-Cookie` values received for `url`.
    fn set_cookies(&self, url: &str, cookies: &[String]);

    fn is_network_valid(&self) -> bool;

    /// Show a user-visible message.
    fn show_notice(&self, message: &str);

    /// Report a recoverable session failure.
    fn notify_error(&self, url: &str, code: NoticeCode);

    /// Address the request for `url` should connect to instead of resolving DNS.
    fn host_direct_address(&self, _url: &str) -> Option<IpAddr> {
        None
    }
}

/// The rendering surface a session drives.
pub trait SessionClient: Send + Sync {
    /// Load `url` through the surface's own transport. The surface is expected
    /// to route the main document request through `Session::request_resource`.
    fn load_url(&self, url: &str);

    /// Show `data` directly, using `base_url` for relative references.
    fn load_data(&self, base_url: &str, data: &str, mime_type: &str, encoding: &str);
}

/// Receives the session's result once it is known.
pub trait UpdateListener: Send + Sync {
    fn on_update(&self, notice: &UpdateNotice);
}

impl<F> UpdateListener for F
where
    F: Fn(&UpdateNotice) + Send + Sync,
{
    fn on_update(&self, notice: &UpdateNotice) {
        self(notice)
    }
}

/// Observes lifecycle transitions.
pub trait StateListener: Send + Sync {
    fn on_state_change(&self, session: &Arc<Session>, old: SessionState, new: SessionState);
}
