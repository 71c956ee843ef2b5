//! URL helpers: canonicalisation and key URLs for session keys, the session
//! query parameter, page matching and MIME lookup.

/// Query parameter that tags a URL with the session that produced it.
pub const SESSION_ID_PARAM: &str = "_session_id";

/// Error type for URL canonicalization failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UrlError {
    #[error("empty URL")]
    Empty,

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

/// Canonicalize a URL string so equivalent spellings share a session key.
///
/// Normalization steps:
/// 1. Trim leading/trailing whitespace
/// 2. Default scheme to https:// if missing
/// 3. Lowercase the host
/// 4. Remove fragment (#...)
/// 5. Drop the session query parameter, keep the rest in order
pub fn canonicalize(input: &str) -> Result<url::Url, UrlError> {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return Err(UrlError::Empty);
    }

    let url_str = if trimmed.contains("://") { trimmed.to_string() } else { format!("https://{trimmed}") };

    let mut parsed = url::Url::parse(&url_str).map_err(|e| UrlError::InvalidUrl(e.to_string()))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlError::UnsupportedScheme(scheme.to_string())),
    }

    if let Some(host) = parsed.host_str() {
        let lower = host.to_lowercase();
        parsed.set_host(Some(&lower)).map_err(|e| UrlError::InvalidUrl(e.to_string()))?;
    }

    parsed.set_fragment(None);
    strip_session_param(&mut parsed);

    Ok(parsed)
}

fn strip_session_param(url: &mut url::Url) {
    if url.query().is_none() {
        return;
    }
    let kept: Vec<(String, String)> =
        url.query_pairs().filter(|(k, _)| k != SESSION_ID_PARAM).map(|(k, v)| (k.into_owned(), v.into_owned())).collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
}

/// Tag `url` with `_session_id=<id>`, replacing any previous tag.
///
/// Unparseable input is returned unchanged.
pub fn add_session_param(url: &str, session_id: u64) -> String {
    match url::Url::parse(url.trim()) {
        Ok(mut parsed) => {
            strip_session_param(&mut parsed);
            parsed.query_pairs_mut().append_pair(SESSION_ID_PARAM, &session_id.to_string());
            parsed.into()
        }
        Err(_) => url.to_string(),
    }
}

/// The part of a canonical URL a session key is derived from: scheme, host
/// and path, plus the query parameters named in `keep`, in their original
/// order.
pub fn key_url(canonical: &url::Url, keep: &[String]) -> String {
    let mut url = canonical.clone();
    let kept: Vec<(String, String)> = canonical
        .query_pairs()
        .filter(|(k, _)| keep.iter().any(|name| name == k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    url.into()
}

/// True when both URLs point at the same page.
///
/// Host and path compare case-insensitively, ignoring scheme and a trailing
/// slash. Query parameters must match as a set, except the session tag.
/// Fragments are ignored.
pub fn is_same_page(a: &str, b: &str) -> bool {
    let (Ok(a), Ok(b)) = (url::Url::parse(a.trim()), url::Url::parse(b.trim())) else {
        return false;
    };
    let (Some(host_a), Some(host_b)) = (a.host_str(), b.host_str()) else {
        return false;
    };
    if !host_a.eq_ignore_ascii_case(host_b) {
        return false;
    }
    if !a.path().trim_end_matches('/').eq_ignore_ascii_case(b.path().trim_end_matches('/')) {
        return false;
    }
    page_query(&a) == page_query(&b)
}

fn page_query(url: &url::Url) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != SESSION_ID_PARAM)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    pairs
}

/// MIME type for a resource, from its path extension. Defaults to HTML.
pub fn mime_type_for(url: &str) -> &'static str {
    let path = url::Url::parse(url.trim()).map(|u| u.path().to_string()).unwrap_or_default();
    let ext = path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()).unwrap_or_default();
    match ext.as_str() {
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        _ => "text/html",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_basic() {
        let url = canonicalize("https://example.com").unwrap();
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.host_str(), Some("example.com"));
    }

    #[test]
    fn test_canonicalize_default_scheme() {
        let url = canonicalize("example.com").unwrap();
        assert_eq!(url.scheme(), "https");
    }

    #[test]
    fn test_canonicalize_lowercase_host() {
        let url = canonicalize("https://EXAMPLE.COM").unwrap();
        assert_eq!(url.host_str(), Some("example.com"));
    }

    #[test]
    fn test_canonicalize_remove_fragment() {
        let url = canonicalize("https://example.com#section").unwrap();
        assert_eq!(url.fragment(), None);
        assert_eq!(url.path(), "/");
    }

    #[test]
    fn test_canonicalize_preserve_query() {
        let url = canonicalize("https://example.com?a=1&b=2").unwrap();
        assert_eq!(url.query(), Some("a=1&b=2"));
    }

    #[test]
    fn test_canonicalize_drops_session_param() {
        let url = canonicalize("https://example.com/p?a=1&_session_id=7").unwrap();
        assert_eq!(url.query(), Some("a=1"));
        let bare = canonicalize("https://example.com/p?_session_id=7").unwrap();
        assert_eq!(bare.as_str(), "https://example.com/p");
    }

    #[test]
    fn test_canonicalize_unsupported_scheme() {
        let result = canonicalize("file:///etc/passwd");
        assert!(matches!(result, Err(UrlError::UnsupportedScheme(_))));
    }

    #[test]
    fn test_canonicalize_empty() {
        assert!(matches!(canonicalize("   "), Err(UrlError::Empty)));
    }

    #[test]
    fn test_add_session_param() {
        assert_eq!(add_session_param("https://example.com/p", 3), "https://example.com/p?_session_id=3");
        assert_eq!(
            add_session_param("https://example.com/p?a=1&_session_id=1", 4),
            "https://example.com/p?a=1&_session_id=4"
        );
        assert_eq!(add_session_param("not a url", 4), "not a url");
    }

    #[test]
    fn test_key_url_keeps_named_params() {
        let url = canonicalize("https://example.com/p?from=push&id=7&_session_id=3#top").unwrap();
        assert_eq!(key_url(&url, &[]), "https://example.com/p");
        assert_eq!(key_url(&url, &["id".to_string()]), "https://example.com/p?id=7");
    }

    #[test]
    fn test_is_same_page() {
        assert!(is_same_page("https://Example.com/a/", "http://example.com/A"));
        assert!(is_same_page("https://example.com", "https://example.com/?_session_id=2"));
        assert!(is_same_page("https://e.com/a?x=1&y=2#f", "https://e.com/a?y=2&_session_id=5&x=1"));
        assert!(!is_same_page("https://example.com/a", "https://example.com/b"));
        assert!(!is_same_page("https://example.com/a", "https://other.com/a"));
        assert!(!is_same_page("garbage", "https://example.com/a"));
        assert!(!is_same_page("https://example.com/a?id=1", "https://example.com/a?id=2"));
        assert!(!is_same_page("https://example.com/a?id=1", "https://example.com/a"));
    }

    #[test]
    fn test_mime_type_for() {
        assert_eq!(mime_type_for("https://example.com/"), "text/html");
        assert_eq!(mime_type_for("https://example.com/app.JS?v=1"), "application/javascript");
        assert_eq!(mime_type_for("https://example.com/a/b.css"), "text/css");
        assert_eq!(mime_type_for("https://example.com/page.html"), "text/html");
    }
}
