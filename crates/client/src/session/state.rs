use serde::Serialize;

use quickpage_core::DataMap;

/// Lifecycle state of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    None = 0,
    Running = 1,
    Ready = 2,
    Destroyed = 3,
}

impl SessionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Running,
            2 => SessionState::Ready,
            3 => SessionState::Destroyed,
            _ => SessionState::None,
        }
    }
}

/// How a session's content was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Unknown,
    FirstLoad,
    TemplateChange,
    DataUpdate,
    HitCache,
}

impl Outcome {
    pub fn code(self) -> i32 {
        match self {
            Outcome::Unknown => -1,
            Outcome::FirstLoad => 1000,
            Outcome::TemplateChange => 2000,
            Outcome::DataUpdate => 200,
            Outcome::HitCache => 304,
        }
    }
}

/// Result notice delivered to an [`UpdateListener`](crate::host::UpdateListener).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateNotice {
    /// Final outcome code.
    pub code: i32,
    /// Outcome code of the server response itself.
    #[serde(rename = "srcCode")]
    pub src_code: i32,
    /// Changed data regions, only for data updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<DataMap>,
    /// Milliseconds between the update arriving and the notice being sent.
    pub local_refresh_ms: u64,
}

impl UpdateNotice {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
