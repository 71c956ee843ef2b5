//! Cache-related MCP tools.
//!
//! This module provides tools for dropping cached pages.

pub mod clear;
pub mod invalidate;

pub use clear::{CacheClearParams, clear_impl};
pub use invalidate::{CacheInvalidateParams, invalidate_impl};
