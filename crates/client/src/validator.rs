//! Cache validation.
//!
//! A validator decides whether the locally stored document for a key can be
//! served. Validators form an ordered chain; the first one returning content
//! wins, and an empty chain behaves like [`DefaultValidator`].

use std::sync::Arc;

use async_trait::async_trait;
use quickpage_core::cache::hash::content_hash;
use quickpage_core::{CacheStore, NoticeCode, SessionData};

use crate::host::HostRuntime;

/// What a validator gets to look at.
pub struct LookupContext<'a> {
    pub key: &'a str,
    pub url: &'a str,
    pub store: &'a CacheStore,
    pub runtime: &'a dyn HostRuntime,
    /// Compare content hashes instead of sizes.
    pub verify_with_hash: bool,
}

/// A validated cache hit.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedPage {
    pub html: String,
    pub meta: SessionData,
}

#[async_trait]
pub trait CacheValidator: Send + Sync {
    /// Cached document for the key, or `None` to decline.
    async fn lookup(&self, ctx: &LookupContext<'_>) -> Option<CachedPage>;
}

/// Checks stored tags, then content integrity by hash or size.
///
/// An entry without tags is treated as absent and left alone. An entry whose
/// content is missing or fails the check is purged and reported to the host
/// as [`NoticeCode::DataVerifyFail`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultValidator;

impl DefaultValidator {
    async fn reject(ctx: &LookupContext<'_>, reason: &str) -> Option<CachedPage> {
        tracing::warn!(key = ctx.key, reason, "cache verification failed, purging");
        if let Err(e) = ctx.store.purge(ctx.key).await {
            tracing::error!(key = ctx.key, error = %e, "failed to purge cache");
        }
        ctx.runtime.notify_error(ctx.url, NoticeCode::DataVerifyFail);
        None
    }
}

#[async_trait]
impl CacheValidator for DefaultValidator {
    async fn lookup(&self, ctx: &LookupContext<'_>) -> Option<CachedPage> {
        let meta = match ctx.store.session_data(ctx.key).await {
            Ok(Some(meta)) if meta.has_tags() => meta,
            Ok(_) => return None,
            Err(e) => {
                tracing::error!(key = ctx.key, error = %e, "failed to read session data");
                return None;
            }
        };

        let bytes = match ctx.store.read_html(ctx.key).await {
            Ok(Some(bytes)) if !bytes.is_empty() => bytes,
            Ok(_) => return Self::reject(ctx, "content file missing").await,
            Err(e) => {
                tracing::error!(key = ctx.key, error = %e, "failed to read cached html");
                return Self::reject(ctx, "content file unreadable").await;
            }
        };

        if ctx.verify_with_hash {
            if content_hash(&bytes) != meta.html_hash {
                return Self::reject(ctx, "hash mismatch").await;
            }
        } else if bytes.len() as u64 != meta.html_size {
            return Self::reject(ctx, "size mismatch").await;
        }

        match String::from_utf8(bytes) {
            Ok(html) => Some(CachedPage { html, meta }),
            Err(_) => Self::reject(ctx, "content is not utf-8").await,
        }
    }
}

/// Ordered list of validators.
#[derive(Clone, Default)]
pub struct ValidatorChain {
    validators: Vec<Arc<dyn CacheValidator>>,
}

impl ValidatorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, validator: Arc<dyn CacheValidator>) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub async fn lookup(&self, ctx: &LookupContext<'_>) -> Option<CachedPage> {
        if self.validators.is_empty() {
            return DefaultValidator.lookup(ctx).await;
        }
        for validator in &self.validators {
            if let Some(page) = validator.lookup(ctx).await {
                return Some(page);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use quickpage_core::{CacheDb, SaveRequest};

    #[derive(Default)]
    struct Host {
        errors: Mutex<Vec<NoticeCode>>,
    }

    impl HostRuntime for Host {
        fn current_account(&self) -> String {
            String::new()
        }
        fn cookie(&self, _url: &str) -> Option<String> {
            None
        }
        fn set_cookies(&self, _url: &str, _cookies: &[String]) {}
        fn is_network_valid(&self) -> bool {
            true
        }
        fn show_notice(&self, _message: &str) {}
        fn notify_error(&self, _url: &str, code: NoticeCode) {
            self.errors.lock().push(code);
        }
    }

    async fn store(dir: &tempfile::TempDir) -> CacheStore {
        let db = CacheDb::open_in_memory().await.unwrap();
        CacheStore::new(db, dir.path()).await.unwrap()
    }

    fn request(html: &str) -> SaveRequest {
        SaveRequest {
            html: html.to_string(),
            etag: "e1".into(),
            template_tag: "t1".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_valid_entry_is_served() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        store.save("k", request("<p>hi</p>")).await.unwrap();
        let host = Host::default();
        let ctx = LookupContext { key: "k", url: "https://a.test/", store: &store, runtime: &host, verify_with_hash: true };

        let page = ValidatorChain::new().lookup(&ctx).await.unwrap();
        assert_eq!(page.html, "<p>hi</p>");
        assert_eq!(page.meta.etag, "e1");
        assert!(host.errors.lock().is_empty());
    }

    #[tokio::test]
    async fn test_hash_mismatch_purges() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        store.save("k", request("<p>hi</p>")).await.unwrap();
        tokio::fs::write(store.html_path("k"), b"<p>ho</p>").await.unwrap();
        let host = Host::default();
        let ctx = LookupContext { key: "k", url: "https://a.test/", store: &store, runtime: &host, verify_with_hash: true };

        assert!(DefaultValidator.lookup(&ctx).await.is_none());
        assert!(store.session_data("k").await.unwrap().is_none());
        assert!(!store.html_path("k").exists());
        assert_eq!(*host.errors.lock(), vec![NoticeCode::DataVerifyFail]);
    }

    #[tokio::test]
    async fn test_size_check_ignores_same_length_edit() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        store.save("k", request("<p>hi</p>")).await.unwrap();
        tokio::fs::write(store.html_path("k"), b"<p>ho</p>").await.unwrap();
        let host = Host::default();
        let ctx = LookupContext { key: "k", url: "u", store: &store, runtime: &host, verify_with_hash: false };

        assert_eq!(DefaultValidator.lookup(&ctx).await.unwrap().html, "<p>ho</p>");

        tokio::fs::write(store.html_path("k"), b"<p>longer</p>").await.unwrap();
        assert!(DefaultValidator.lookup(&ctx).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_entry_is_not_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let host = Host::default();
        let ctx = LookupContext { key: "none", url: "u", store: &store, runtime: &host, verify_with_hash: true };

        assert!(ValidatorChain::new().lookup(&ctx).await.is_none());
        assert!(host.errors.lock().is_empty());
    }

    struct Fixed(Option<&'static str>);

    #[async_trait]
    impl CacheValidator for Fixed {
        async fn lookup(&self, _ctx: &LookupContext<'_>) -> Option<CachedPage> {
            self.0.map(|html| CachedPage {
                html: html.to_string(),
                meta: SessionData {
                    session_key: "k".into(),
                    etag: "e".into(),
                    template_tag: "t".into(),
                    html_hash: String::new(),
                    html_size: 0,
                    csp: None,
                    csp_report_only: None,
                    updated_at: String::new(),
                },
            })
        }
    }

    #[tokio::test]
    async fn test_chain_first_hit_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let host = Host::default();
        let ctx = LookupContext { key: "k", url: "u", store: &store, runtime: &host, verify_with_hash: true };

        let chain = ValidatorChain::new()
            .with(Arc::new(Fixed(None)))
            .with(Arc::new(Fixed(Some("second"))))
            .with(Arc::new(Fixed(Some("third"))));
        assert_eq!(chain.lookup(&ctx).await.unwrap().html, "second");

        let declining = ValidatorChain::new().with(Arc::new(Fixed(None)));
        assert!(declining.lookup(&ctx).await.is_none());
    }
}
