//! Session connections: the one HTTP exchange a network flow performs.
//!
//! A `Connector` hands out a fresh `SessionConnection` per flow. The default
//! `HttpConnector` speaks HTTP through reqwest; tests and hosts with their own
//! transport plug in a different connector.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use quickpage_core::Error;
use reqwest::{Client, header};

/// Response header carrying the ETag-equivalent validation tag.
pub const HEADER_ETAG: &str = "etag";
/// Request and response header carrying the template identity tag.
pub const HEADER_TEMPLATE_TAG: &str = "template-tag";
/// Response header flagging whether the template changed (`false`/`0` means data only).
pub const HEADER_TEMPLATE_CHANGE: &str = "template-change";
/// Response header with the persistence directive, see [`CacheOffline`].
pub const HEADER_CACHE_OFFLINE: &str = "cache-offline";
/// Request header telling the origin a data-only diff is acceptable.
pub const HEADER_ACCEPT_DIFF: &str = "accept-diff";
pub const HEADER_CSP: &str = "content-security-policy";
pub const HEADER_CSP_REPORT_ONLY: &str = "content-security-policy-report-only";

/// Everything a connection needs to issue the conditional request.
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    /// Session-tagged URL to request.
    pub url: String,
    /// Stored validation tag, sent as `If-None-Match`.
    pub etag: Option<String>,
    /// Stored template tag, sent as `template-tag`.
    pub template_tag: Option<String>,
    pub accept_diff: bool,
    pub cookie: Option<String>,
    pub user_agent: String,
    /// Pin DNS resolution of the URL's host to this address.
    pub direct_address: Option<IpAddr>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

/// Status and headers of a session response.
///
/// Header names are stored lowercase; repeated headers are joined with `, `
/// except `Set-Cookie`, which is kept as a list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    headers: HashMap<String, String>,
    pub set_cookies: Vec<String>,
}

impl ResponseHead {
    pub fn new(status: u16) -> Self {
        Self { status, ..Default::default() }
    }

    /// Add a header, builder style.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        let name = name.to_ascii_lowercase();
        if name == "set-cookie" {
            self.set_cookies.push(value.to_string());
            return;
        }
        self.headers
            .entry(name)
            .and_modify(|v| {
                v.push_str(", ");
                v.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    /// Header value by case-insensitive name. Empty values count as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
            .filter(|v| !v.is_empty())
    }

    pub fn cache_offline(&self) -> CacheOffline {
        CacheOffline::parse(self.header(HEADER_CACHE_OFFLINE))
    }
}

/// The origin's `cache-offline` directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOffline {
    /// Origin is unavailable: purge, start a cooldown and load directly.
    Http,
    /// Persist, but do not refresh what the consumer shows.
    Store,
    /// Persist and refresh. Also used when the header is missing or unknown.
    True,
    /// Refresh, but purge instead of persisting.
    False,
}

impl CacheOffline {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("http") => CacheOffline::Http,
            Some("store") => CacheOffline::Store,
            Some("false") => CacheOffline::False,
            _ => CacheOffline::True,
        }
    }

    pub fn needs_save(self) -> bool {
        matches!(self, CacheOffline::Store | CacheOffline::True)
    }

    pub fn needs_refresh(self) -> bool {
        !matches!(self, CacheOffline::Store)
    }
}

/// One HTTP exchange: connect, then read the body chunk by chunk.
#[async_trait]
pub trait SessionConnection: Send + Sync {
    /// Send the request and return the response head.
    async fn connect(&self, request: &ConnectRequest) -> Result<ResponseHead, Error>;

    /// Next body chunk, `None` at end of body or after `disconnect`.
    async fn read_chunk(&self) -> Result<Option<Bytes>, Error>;

    /// Abort the exchange and release the underlying response.
    fn disconnect(&self);
}

/// Produces a connection for each network flow.
pub trait Connector: Send + Sync {
    fn open(&self) -> Arc<dyn SessionConnection>;
}

/// Connector backed by reqwest.
#[derive(Debug, Clone, Default)]
pub struct HttpConnector;

impl Connector for HttpConnector {
    fn open(&self) -> Arc<dyn SessionConnection> {
        Arc::new(HttpConnection::default())
    }
}

/// reqwest-backed [`SessionConnection`].
#[derive(Default)]
pub struct HttpConnection {
    response: tokio::sync::Mutex<Option<reqwest::Response>>,
    closed: AtomicBool,
}

fn map_reqwest_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::FetchTimeout(err.to_string())
    } else if err.is_connect() {
        Error::Connect(err.to_string())
    } else {
        Error::HttpError(err.to_string())
    }
}

#[async_trait]
impl SessionConnection for HttpConnection {
    async fn connect(&self, request: &ConnectRequest) -> Result<ResponseHead, Error> {
        let url = reqwest::Url::parse(&request.url).map_err(|e| Error::InvalidUrl(e.to_string()))?;

        let mut builder = Client::builder()
            .user_agent(&request.user_agent)
            .connect_timeout(request.connect_timeout)
            .read_timeout(request.read_timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .use_rustls_tls()
            .gzip(true)
            .brotli(true)
            .deflate(true);

        if let (Some(ip), Some(host)) = (request.direct_address, url.host_str()) {
            let port = url.port_or_known_default().unwrap_or(443);
            builder = builder.resolve(host, SocketAddr::new(ip, port));
        }

        let client = builder
            .build()
            .map_err(|e| Error::Connect(format!("failed to build HTTP client: {e}")))?;

        let mut req = client
            .get(url)
            .header(header::ACCEPT, "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .header(HEADER_ACCEPT_DIFF, if request.accept_diff { "true" } else { "false" });
        if let Some(etag) = &request.etag {
            req = req.header(header::IF_NONE_MATCH, etag);
        }
        if let Some(tag) = &request.template_tag {
            req = req.header(HEADER_TEMPLATE_TAG, tag);
        }
        if let Some(cookie) = &request.cookie {
            req = req.header(header::COOKIE, cookie);
        }

        let response = req.send().await.map_err(map_reqwest_error)?;

        let mut head = ResponseHead::new(response.status().as_u16());
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                head.insert(name.as_str(), value);
            }
        }

        *self.response.lock().await = Some(response);
        Ok(head)
    }

    async fn read_chunk(&self) -> Result<Option<Bytes>, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        let mut guard = self.response.lock().await;
        let Some(response) = guard.as_mut() else {
            return Ok(None);
        };
        match response.chunk().await {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                guard.take();
                Ok(None)
            }
            Err(e) => {
                guard.take();
                Err(map_reqwest_error(e))
            }
        }
    }

    fn disconnect(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut guard) = self.response.try_lock() {
            guard.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_offline_parse() {
        assert_eq!(CacheOffline::parse(Some("http")), CacheOffline::Http);
        assert_eq!(CacheOffline::parse(Some("STORE")), CacheOffline::Store);
        assert_eq!(CacheOffline::parse(Some("false")), CacheOffline::False);
        assert_eq!(CacheOffline::parse(Some("true")), CacheOffline::True);
        assert_eq!(CacheOffline::parse(None), CacheOffline::True);
        assert_eq!(CacheOffline::parse(Some("bogus")), CacheOffline::True);
    }

    #[test]
    fn test_cache_offline_policy() {
        assert!(CacheOffline::Store.needs_save());
        assert!(!CacheOffline::Store.needs_refresh());
        assert!(CacheOffline::True.needs_save());
        assert!(CacheOffline::True.needs_refresh());
        assert!(!CacheOffline::False.needs_save());
        assert!(CacheOffline::False.needs_refresh());
        assert!(!CacheOffline::Http.needs_save());
    }

    #[test]
    fn test_response_head_headers() {
        let head = ResponseHead::new(200)
            .with_header("ETag", "abc")
            .with_header("Set-Cookie", "a=1")
            .with_header("set-cookie", "b=2")
            .with_header("Vary", "Accept")
            .with_header("vary", "Cookie")
            .with_header("template-tag", "");

        assert_eq!(head.header("etag"), Some("abc"));
        assert_eq!(head.header("VARY"), Some("Accept, Cookie"));
        assert_eq!(head.set_cookies, vec!["a=1".to_string(), "b=2".to_string()]);
        assert_eq!(head.header("template-tag"), None);
        assert_eq!(head.cache_offline(), CacheOffline::True);
    }

    #[tokio::test]
    async fn test_http_connection_reads_nothing_before_connect() {
        let conn = HttpConnector.open();
        assert!(conn.read_chunk().await.unwrap().is_none());
        conn.disconnect();
        assert!(conn.read_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_http_connection_invalid_url() {
        let conn = HttpConnection::default();
        let request = ConnectRequest { url: "not a url".into(), ..Default::default() };
        assert!(matches!(conn.connect(&request).await, Err(Error::InvalidUrl(_))));
    }
}
