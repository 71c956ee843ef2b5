//! Core types and shared functionality for quickpage.
//!
//! This crate provides:
//! - Persistent session cache (SQLite metadata plus content files)
//! - Template/data separation, diff and merge
//! - Unified error types
//! - Layered configuration

pub mod cache;
pub mod config;
pub mod error;
pub mod template;

pub use cache::{CacheDb, CacheStore, SaveRequest, SessionData};
pub use config::{AppConfig, ConfigError, EngineConfig, SessionConfig};
pub use error::{Error, NoticeCode};
pub use template::{DataMap, MergedDocument, Separated};
