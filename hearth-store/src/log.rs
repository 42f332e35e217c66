//! Automation log and service-call log models.

use chrono::{DateTime, Utc};
use hearth_types::Message;
use serde::{Deserialize, Serialize};

use crate::signal::SignalData;

/// What produced an automation log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogType {
    /// The interactive chat path.
    Manual,
    /// A scheduling pass deriving signals from prose.
    DetermineSignal,
    /// An execution pass driven by a fired signal.
    ExecuteSignal,
}

impl LogType {
    /// The discriminant as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Manual => "manual",
            LogType::DetermineSignal => "determine-signal",
            LogType::ExecuteSignal => "execute-signal",
        }
    }

    /// Parse the stored discriminant.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(LogType::Manual),
            "determine-signal" => Some(LogType::DetermineSignal),
            "execute-signal" => Some(LogType::ExecuteSignal),
            _ => None,
        }
    }
}

/// A new automation log row, before insertion.
#[derive(Debug, Clone)]
pub struct NewAutomationLog {
    /// Content hash of the automation, if the entry belongs to one.
    pub automation_hash: Option<String>,
    /// What produced the entry.
    pub log_type: LogType,
    /// The conversation transcript.
    pub messages: Vec<Message>,
    /// The signal that fired, for `execute-signal` entries.
    pub signaled_by: Option<SignalData>,
}

/// A stored automation log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationLogEntry {
    /// Row id.
    pub id: i64,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
    /// Content hash of the automation, if any.
    pub automation_hash: Option<String>,
    /// What produced the entry.
    pub log_type: LogType,
    /// The conversation transcript.
    pub messages: Vec<Message>,
    /// The signal that fired, for `execute-signal` entries.
    pub signaled_by: Option<SignalData>,
}

/// A stored service-call row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallServiceLogEntry {
    /// When the call was made.
    pub created_at: DateTime<Utc>,
    /// The automation log entry the call belongs to.
    pub automation_log_id: i64,
    /// `domain.service`.
    pub service: String,
    /// The call target.
    pub target: serde_json::Value,
    /// The service data payload.
    pub data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_type_round_trips() {
        for log_type in [LogType::Manual, LogType::DetermineSignal, LogType::ExecuteSignal] {
            assert_eq!(LogType::parse(log_type.as_str()), Some(log_type));
        }
        assert_eq!(LogType::parse("bogus"), None);
    }
}
