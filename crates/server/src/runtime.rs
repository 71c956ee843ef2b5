//! Host services for the headless server.
//!
//! Cookies are kept per origin host for the life of the process. Notices and
//! error codes are collected so a tool call can report what happened to the
//! page it opened.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use quickpage_client::HostRuntime;
use quickpage_core::NoticeCode;

pub struct ServerRuntime {
    account: String,
    cookies: Mutex<HashMap<String, BTreeMap<String, String>>>,
    errors: Mutex<HashMap<String, Vec<i32>>>,
    notices: Mutex<Vec<String>>,
}

impl ServerRuntime {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            cookies: Mutex::default(),
            errors: Mutex::default(),
            notices: Mutex::default(),
        }
    }

    /// Error codes reported for `url` since the last call.
    pub fn take_errors(&self, url: &str) -> Vec<i32> {
        self.errors.lock().remove(url).unwrap_or_default()
    }

    /// Notices shown since the last call.
    pub fn take_notices(&self) -> Vec<String> {
        std::mem::take(&mut *self.notices.lock())
    }
}

fn cookie_host(url: &str) -> Option<String> {
    url::Url::parse(url).ok()?.host_str().map(str::to_lowercase)
}

/// `name=value` from a `Set-Cookie` header, attributes dropped.
fn parse_set_cookie(header: &str) -> Option<(String, String)> {
    let pair = header.split(';').next()?.trim();
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

impl HostRuntime for ServerRuntime {
    fn current_account(&self) -> String {
        self.account.clone()
    }

    fn cookie(&self, url: &str) -> Option<String> {
        let host = cookie_host(url)?;
        let cookies = self.cookies.lock();
        let jar = cookies.get(&host).filter(|jar| !jar.is_empty())?;
        Some(jar.iter().map(|(name, value)| format!("{name}={value}")).collect::<Vec<_>>().join("; "))
    }

    fn set_cookies(&self, url: &str, cookies: &[String]) {
        let Some(host) = cookie_host(url) else {
            return;
        };
        let mut jars = self.cookies.lock();
        let jar = jars.entry(host).or_default();
        for (name, value) in cookies.iter().filter_map(|c| parse_set_cookie(c)) {
            if value.is_empty() {
                jar.remove(&name);
            } else {
                jar.insert(name, value);
            }
        }
    }

    fn is_network_valid(&self) -> bool {
        true
    }

    fn show_notice(&self, message: &str) {
        tracing::info!(message, "Notice");
        self.notices.lock().push(message.to_string());
    }

    fn notify_error(&self, url: &str, code: NoticeCode) {
        tracing::warn!(url, code = code.code(), "Session reported an error");
        self.errors.lock().entry(url.to_string()).or_default().push(code.code());
    }
}
