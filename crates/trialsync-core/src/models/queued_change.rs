//! Queued change model

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Dot-path → value mapping describing the minimal write for one entity.
pub type FieldChanges = BTreeMap<String, Value>;

/// Transmission priority. Lower variants are sent first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SyncPriority {
    /// Patient records and baseline assessments
    Critical = 1,
    /// Follow-up assessments
    High = 2,
    /// Drafts and routine edits
    #[default]
    Normal = 3,
    /// Archival data
    Low = 4,
}

impl SyncPriority {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    pub const fn rank(self) -> i64 {
        self as i64
    }

    pub const fn from_rank(rank: i64) -> Self {
        match rank {
            1 => Self::Critical,
            2 => Self::High,
            4 => Self::Low,
            _ => Self::Normal,
        }
    }
}

impl fmt::Display for SyncPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncPriority {
    type Err = crate::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown sync priority: {other}"
            ))),
        }
    }
}

/// A pending write waiting in the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedChange {
    /// Unique queue entry id
    pub change_id: String,
    /// Entity the change applies to
    pub form_id: String,
    /// Entity type / remote collection
    pub form_type: String,
    /// Changed fields
    pub delta: FieldChanges,
    pub priority: SyncPriority,
    /// Unix ms
    pub enqueued_at: i64,
    /// Local entity version after the change was applied
    pub version: u64,
    /// Failed transmission attempts so far
    pub retries: u32,
    pub last_error: Option<String>,
}

impl QueuedChange {
    /// Resource key used for locking and deduplication.
    pub fn resource_key(&self) -> String {
        format!("{}:{}", self.form_type, self.form_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_critical_first() {
        let mut priorities = vec![
            SyncPriority::Low,
            SyncPriority::Critical,
            SyncPriority::Normal,
            SyncPriority::High,
        ];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![
                SyncPriority::Critical,
                SyncPriority::High,
                SyncPriority::Normal,
                SyncPriority::Low
            ]
        );
    }

    #[test]
    fn priority_round_trips_through_rank_and_str() {
        for priority in [
            SyncPriority::Critical,
            SyncPriority::High,
            SyncPriority::Normal,
            SyncPriority::Low,
        ] {
            assert_eq!(SyncPriority::from_rank(priority.rank()), priority);
            assert_eq!(priority.as_str().parse::<SyncPriority>().unwrap(), priority);
        }
        assert!("urgent".parse::<SyncPriority>().is_err());
    }
}
