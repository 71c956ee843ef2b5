//! Persistent per-session cache.
//!
//! Metadata (validation tags, content hash and size, CSP headers) and the
//! unavailability ledger live in SQLite via tokio-rusqlite. Content files
//! (full document, template, data) live in a cache directory, one set per
//! session key. `CacheStore` ties the two together.

pub mod connection;
pub mod hash;
pub mod migrations;
pub mod session_data;
pub mod store;

pub use crate::Error;

pub use connection::CacheDb;
pub use session_data::SessionData;
pub use store::{CacheStore, SaveRequest};
