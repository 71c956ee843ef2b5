//! Unified error types for quickpage.
//!
//! `Error` is what library calls return. `NoticeCode` is the numeric code the
//! host receives through its error notification hook; session flows convert
//! their failures into notices instead of propagating them.

use rmcp::model::{ErrorCode, ErrorData as McpError};
use tokio_rusqlite::rusqlite;

/// Unified error types for quickpage.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input parameters (e.g., empty URL).
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// Invalid URL.
    #[error("INVALID_URL: {0}")]
    InvalidUrl(String),

    /// Connecting to the origin failed.
    #[error("CONNECT_FAILED: {0}")]
    Connect(String),

    /// Connect or read timed out.
    #[error("FETCH_TIMEOUT: {0}")]
    FetchTimeout(String),

    /// Fetch response too large.
    #[error("FETCH_TOO_LARGE: {0}")]
    FetchTooLarge(String),

    /// HTTP error response or a broken body stream.
    #[error("HTTP_ERROR: {0}")]
    HttpError(String),

    /// Document does not follow the template/data convention.
    #[error("SPLIT_HTML_FAILED: {0}")]
    SplitHtml(String),

    /// Server data could not be diffed against the cached data.
    #[error("MERGE_DIFF_FAILED: {0}")]
    MergeDiff(String),

    /// Template and data did not produce a document.
    #[error("BUILD_HTML_FAILED: {0}")]
    BuildHtml(String),

    /// Database operation failed.
    #[error("CACHE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// Migration failed to apply.
    #[error("CACHE_ERROR: migration failed: {0}")]
    MigrationFailed(String),

    /// Reading or writing a content file failed.
    #[error("CACHE_ERROR: io: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data blob is not valid JSON.
    #[error("CACHE_ERROR: corrupt data: {0}")]
    CorruptData(#[from] serde_json::Error),
}

impl Error {
    /// Host-facing notice code for this failure.
    pub fn notice_code(&self) -> NoticeCode {
        match self {
            Error::FetchTimeout(_) => NoticeCode::ConnectTimeout,
            Error::Connect(_) | Error::HttpError(_) | Error::FetchTooLarge(_) | Error::InvalidUrl(_) => {
                NoticeCode::ConnectFail
            }
            Error::SplitHtml(_) => NoticeCode::SplitHtmlFail,
            Error::MergeDiff(_) | Error::CorruptData(_) => NoticeCode::MergeDiffDataFail,
            Error::BuildHtml(_) => NoticeCode::BuildHtmlError,
            Error::Io(_) | Error::Database(_) | Error::MigrationFailed(_) => NoticeCode::WriteFileFail,
            Error::InvalidInput(_) => NoticeCode::Unknown,
        }
    }
}

/// Numeric codes delivered to the host's error hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeCode {
    Unknown,
    ConnectFail,
    ConnectTimeout,
    DataVerifyFail,
    SplitHtmlFail,
    MergeDiffDataFail,
    ServerDataException,
    BuildHtmlError,
    WriteFileFail,
    /// Non-2xx, non-304 origin status.
    Http(u16),
}

impl NoticeCode {
    pub fn code(self) -> i32 {
        match self {
            NoticeCode::Unknown => -1,
            NoticeCode::ConnectFail => -901,
            NoticeCode::ConnectTimeout => -902,
            NoticeCode::DataVerifyFail => -1001,
            NoticeCode::SplitHtmlFail => -1002,
            NoticeCode::MergeDiffDataFail => -1003,
            NoticeCode::ServerDataException => -1004,
            NoticeCode::BuildHtmlError => -1005,
            NoticeCode::WriteFileFail => -1006,
            NoticeCode::Http(status) => i32::from(status),
        }
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Error::Database(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}

impl From<Error> for McpError {
    fn from(err: Error) -> Self {
        let (code, message) = match &err {
            Error::InvalidInput(msg) => (-32602, msg.clone()),
            Error::InvalidUrl(msg) => (-32003, msg.clone()),
            Error::Connect(msg) => (-32008, msg.clone()),
            Error::FetchTimeout(msg) => (-32006, msg.clone()),
            Error::FetchTooLarge(msg) => (-32007, msg.clone()),
            Error::HttpError(msg) => (-32008, msg.clone()),
            Error::SplitHtml(msg) | Error::MergeDiff(msg) | Error::BuildHtml(msg) => (-32000, msg.clone()),
            Error::Database(e) => (-32002, e.to_string()),
            Error::MigrationFailed(msg) => (-32002, msg.clone()),
            Error::Io(e) => (-32002, e.to_string()),
            Error::CorruptData(e) => (-32002, e.to_string()),
        };

        McpError { code: ErrorCode(code), message: message.into(), data: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::SplitHtml("no dynamic regions found".to_string());
        assert!(err.to_string().contains("SPLIT_HTML_FAILED"));
        assert!(err.to_string().contains("no dynamic regions"));
    }

    #[test]
    fn test_error_to_mcp_error() {
        let err = Error::InvalidUrl("ftp://x".to_string());
        let mcp_err: McpError = err.into();
        assert_eq!(mcp_err.code.0, -32003);
        assert_eq!(mcp_err.message, "ftp://x");
    }

    #[test]
    fn test_notice_codes() {
        assert_eq!(Error::FetchTimeout("t".into()).notice_code(), NoticeCode::ConnectTimeout);
        assert_eq!(Error::SplitHtml("x".into()).notice_code().code(), -1002);
        assert_eq!(NoticeCode::Http(503).code(), 503);
    }
}
