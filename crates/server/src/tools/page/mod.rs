//! Page MCP tools.
//!
//! These drive the session engine the way an embedding application would.

pub mod open;
pub mod preload;

pub use open::{PageOpenParams, open_impl};
pub use preload::{PagePreloadParams, preload_impl};
