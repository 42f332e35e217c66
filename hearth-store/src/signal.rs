//! Signal model: the durable triggers derived from automation prose.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind-specific payload of a signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SignalData {
    /// Standard 5-field cron expression, evaluated in the configured
    /// timezone.
    Cron {
        /// The cron expression.
        expr: String,
    },
    /// Fires when any listed entity's new state matches the regex
    /// (unanchored). Alive across fires.
    State {
        /// Entities to watch.
        entity_ids: Vec<String>,
        /// Pattern matched against the new state string.
        regex: String,
    },
    /// Fires at `anchor + offset`, then every `offset` thereafter iff
    /// `repeat_forever`.
    Offset {
        /// Offset from the anchor, in seconds.
        offset_seconds: i64,
        /// Whether to re-arm after each fire.
        repeat_forever: bool,
        /// The instant the offset counts from.
        anchor: DateTime<Utc>,
    },
    /// Fires once at an absolute instant.
    Time {
        /// The instant to fire at.
        at: DateTime<Utc>,
    },
    /// Fires when the numeric state stays continuously within
    /// `[min, max]` for at least `for_seconds`; re-arms only after the
    /// state leaves the range.
    StateRange {
        /// Entity to watch.
        entity_id: String,
        /// Lower bound (inclusive), if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        /// Upper bound (inclusive), if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
        /// Required continuous residency, in seconds.
        for_seconds: u64,
    },
}

impl SignalData {
    /// The kind discriminant as stored in the database.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalData::Cron { .. } => "cron",
            SignalData::State { .. } => "state",
            SignalData::Offset { .. } => "offset",
            SignalData::Time { .. } => "time",
            SignalData::StateRange { .. } => "state-range",
        }
    }

    /// Whether this signal dies after its first fire.
    pub fn is_one_shot(&self) -> bool {
        match self {
            SignalData::Time { .. } => true,
            SignalData::Offset { repeat_forever, .. } => !repeat_forever,
            _ => false,
        }
    }

    /// Short human-readable description, used by `list-scheduled-triggers`.
    pub fn describe(&self) -> String {
        match self {
            SignalData::Cron { expr } => format!("cron `{expr}`"),
            SignalData::State { entity_ids, regex } => {
                format!("state of {} matching /{regex}/", entity_ids.join(", "))
            }
            SignalData::Offset {
                offset_seconds,
                repeat_forever,
                ..
            } => {
                if *repeat_forever {
                    format!("every {offset_seconds} s")
                } else {
                    format!("once in {offset_seconds} s")
                }
            }
            SignalData::Time { at } => format!("once at {}", at.to_rfc3339()),
            SignalData::StateRange {
                entity_id,
                min,
                max,
                for_seconds,
            } => {
                let lo = min.map_or("-inf".into(), |v| v.to_string());
                let hi = max.map_or("+inf".into(), |v| v.to_string());
                format!("{entity_id} within [{lo}, {hi}] for {for_seconds} s")
            }
        }
    }
}

/// A durably stored signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Row id.
    pub id: i64,
    /// Content hash of the automation this signal belongs to.
    pub automation_hash: String,
    /// Kind-specific payload.
    pub data: SignalData,
    /// Whether the signal has been retired.
    pub is_dead: bool,
    /// When the signal was created.
    pub created_at: DateTime<Utc>,
}
