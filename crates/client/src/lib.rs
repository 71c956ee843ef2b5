//! Session engine for quickpage.
//!
//! This crate provides the per-URL session state machine, the session
//! registry, cache validation, the HTTP connection used by session flows and
//! a plain fetch client for direct loads.

pub mod connection;
pub mod engine;
pub mod fetch;
pub mod host;
pub mod session;
pub mod validator;

pub use connection::{CacheOffline, ConnectRequest, Connector, HttpConnector, ResponseHead, SessionConnection};
pub use engine::Engine;
pub use fetch::{FetchClient, FetchConfig, FetchResponse};
pub use host::{HostRuntime, SessionClient, StateListener, UpdateListener};
pub use session::{
    Outcome, ResourceResponse, Session, SessionContext, SessionState, SessionStatistics, SessionStream,
    StatisticsSummary, UpdateNotice,
};
pub use validator::{CacheValidator, CachedPage, DefaultValidator, LookupContext, ValidatorChain};
