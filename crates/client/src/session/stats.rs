//! Per-session timing record.

use std::time::Instant;

use serde::Serialize;

use super::state::Outcome;

/// Monotonic timestamps for each phase of a session.
#[derive(Debug, Clone)]
pub struct SessionStatistics {
    pub src_url: String,
    pub start: Instant,
    pub flow_start: Option<Instant>,
    pub cache_verified: Option<Instant>,
    pub connection_flow_start: Option<Instant>,
    pub connected: Option<Instant>,
    /// First body byte, or the end of a response without one.
    pub first_byte: Option<Instant>,
    pub connection_flow_finish: Option<Instant>,
    pub flow_finish: Option<Instant>,
    pub resource_requested: Option<Instant>,
    pub used_direct_address: bool,
    pub src_outcome: Outcome,
    pub final_outcome: Outcome,
}

/// Millisecond offsets from session creation, for logs and tool output.
#[derive(Debug, Clone, Serialize, schemars::JsonSchema)]
pub struct StatisticsSummary {
    pub src_url: String,
    pub flow_start_ms: Option<u64>,
    pub cache_verified_ms: Option<u64>,
    pub connected_ms: Option<u64>,
    pub first_byte_ms: Option<u64>,
    pub connection_flow_finish_ms: Option<u64>,
    pub flow_finish_ms: Option<u64>,
    pub resource_requested_ms: Option<u64>,
    pub used_direct_address: bool,
    pub src_code: i32,
    pub final_code: i32,
}

impl SessionStatistics {
    pub fn new(src_url: impl Into<String>) -> Self {
        Self {
            src_url: src_url.into(),
            start: Instant::now(),
            flow_start: None,
            cache_verified: None,
            connection_flow_start: None,
            connected: None,
            first_byte: None,
            connection_flow_finish: None,
            flow_finish: None,
            resource_requested: None,
            used_direct_address: false,
            src_outcome: Outcome::Unknown,
            final_outcome: Outcome::Unknown,
        }
    }

    fn offset(&self, at: Option<Instant>) -> Option<u64> {
        at.map(|t| t.saturating_duration_since(self.start).as_millis() as u64)
    }

    pub fn summary(&self) -> StatisticsSummary {
        StatisticsSummary {
            src_url: self.src_url.clone(),
            flow_start_ms: self.offset(self.flow_start),
            cache_verified_ms: self.offset(self.cache_verified),
            connected_ms: self.offset(self.connected),
            first_byte_ms: self.offset(self.first_byte),
            connection_flow_finish_ms: self.offset(self.connection_flow_finish),
            flow_finish_ms: self.offset(self.flow_finish),
            resource_requested_ms: self.offset(self.resource_requested),
            used_direct_address: self.used_direct_address,
            src_code: self.src_outcome.code(),
            final_code: self.final_outcome.code(),
        }
    }
}
