//! Errors specific to the page tools.
//!
//! Library failures arrive as `quickpage_core::Error` and convert on their own.

use rmcp::model::{ErrorCode, ErrorData as McpError};

#[derive(Debug, thiserror::Error)]
pub enum PageError {
    /// A session for the page is already running, or the key is cooling down.
    #[error("SESSION_BUSY: {0}")]
    Busy(String),

    /// Neither the session nor a direct fetch produced a document in time.
    #[error("NO_DOCUMENT: {0}")]
    NoDocument(String),
}

impl From<PageError> for McpError {
    fn from(err: PageError) -> Self {
        let code = match &err {
            PageError::Busy(_) => -32001,
            PageError::NoDocument(_) => -32004,
        };

        McpError { code: ErrorCode(code), message: err.to_string().into(), data: None }
    }
}
