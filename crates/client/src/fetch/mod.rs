//! Direct HTTP fetch used when a session cannot serve a page.
//!
//! ### URL Canonicalization
//! - Trim whitespace, ensure scheme (default: `https`)
//! - Lowercase host, remove fragments and the session parameter
//! - Preserve the rest of the query string
//!
//! ### Limits
//! - Max redirects: 5
//! - Max body bytes: 5MB (configurable)

pub mod url;

use bytes::Bytes;
use reqwest::Url;
use reqwest::{Client, header};
use std::time::{Duration, Instant};

pub use url::{SESSION_ID_PARAM, UrlError, add_session_param, canonicalize, is_same_page, key_url, mime_type_for};

use quickpage_core::{AppConfig, Error};

/// Configuration for the fetch client.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    /// Responses larger than this are refused.
    pub max_bytes: usize,
    pub timeout: Duration,
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "quickpage/0.1".to_string(),
            max_bytes: 5 * 1024 * 1024,
            timeout: Duration::from_millis(20000),
            max_redirects: 5,
        }
    }
}

impl From<&AppConfig> for FetchConfig {
    /// Same identity as session requests; the timeout covers connect plus read.
    fn from(config: &AppConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            timeout: config.session.connect_timeout() + config.session.read_timeout(),
            ..Default::default()
        }
    }
}

/// A page loaded outside any session.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// The URL after redirects.
    pub final_url: Url,
    pub content_type: Option<String>,
    /// Raw `Set-Cookie` values, for the host's cookie store.
    pub set_cookies: Vec<String>,
    pub bytes: Bytes,
    pub fetch_ms: u64,
}

/// Plain HTTP client for direct loads.
///
/// Requests carry neither cache validators nor the session parameter, so the
/// origin always answers with a full document.
pub struct FetchClient {
    http: Client,
    config: FetchConfig,
}

impl FetchClient {
    pub fn new(config: FetchConfig) -> Result<Self, Error> {
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .use_rustls_tls()
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(|e| Error::Connect(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { http, config })
    }

    /// Load `url` directly, sending `cookie` when the host has one.
    pub async fn fetch(&self, url_str: &str, cookie: Option<&str>) -> Result<FetchResponse, Error> {
        let start = Instant::now();
        let url = canonicalize(url_str).map_err(|e| Error::InvalidUrl(e.to_string()))?;

        let mut request = self
            .http
            .get(url.as_str())
            .header(header::ACCEPT, "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8");
        if let Some(cookie) = cookie {
            request = request.header(header::COOKIE, cookie);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::FetchTimeout(e.to_string())
            } else {
                Error::HttpError(format!("network error: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpError(format!("status {}", status.as_u16())));
        }

        if let Some(len) = response.content_length()
            && len as usize > self.config.max_bytes
        {
            return Err(Error::FetchTooLarge(format!("{} bytes exceeds {}", len, self.config.max_bytes)));
        }

        let final_url = response.url().clone();
        let headers = response.headers();
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let set_cookies: Vec<String> = headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::HttpError(format!("failed to read response: {e}")))?;

        if bytes.len() > self.config.max_bytes {
            return Err(Error::FetchTooLarge(format!("{} bytes exceeds {}", bytes.len(), self.config.max_bytes)));
        }

        let fetch_ms = start.elapsed().as_millis() as u64;
        tracing::debug!(url = %url, final_url = %final_url, fetch_ms, bytes = bytes.len(), "Direct fetch finished");

        Ok(FetchResponse { final_url, content_type, set_cookies, bytes, fetch_ms })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_config_follows_app_config() {
        let mut app = AppConfig::default();
        app.user_agent = "host/2".into();
        app.session.connect_timeout_ms = 1_000;
        app.session.read_timeout_ms = 2_000;

        let config = FetchConfig::from(&app);
        assert_eq!(config.user_agent, "host/2");
        assert_eq!(config.timeout, Duration::from_millis(3_000));
        assert_eq!(config.max_redirects, 5);
    }

    #[tokio::test]
    async fn test_fetch_rejects_bad_scheme() {
        let client = FetchClient::new(FetchConfig::default()).unwrap();
        let result = client.fetch("ftp://example.com/file", None).await;
        assert!(matches!(result, Err(Error::InvalidUrl(_))));
    }
}
