//! Shared sync status types.

use serde::{Deserialize, Serialize};

/// Sync status published to subscribers by the engine and the connectivity monitor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SyncStatus {
    /// Nothing to do
    Idle,
    /// Flush in progress
    Syncing { done: usize, total: usize },
    /// Every pending change was transmitted
    Success { synced: usize },
    /// Some changes failed and remain queued
    Partial { synced: usize, failed: usize },
    /// The flush itself failed
    Error { message: String },
    /// Connectivity lost
    Offline,
}

impl SyncStatus {
    /// Short human-readable description.
    pub fn message(&self) -> String {
        match self {
            Self::Idle => "No changes to sync".to_string(),
            Self::Syncing { done, total } => format!("Syncing {done}/{total}"),
            Self::Success { synced } => format!("Synced {synced} items"),
            Self::Partial { synced, failed } => format!("Synced {synced}, failed {failed}"),
            Self::Error { message } => format!("Sync failed: {message}"),
            Self::Offline => "Offline".to_string(),
        }
    }

    pub const fn is_syncing(&self) -> bool {
        matches!(self, Self::Syncing { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_with_tag() {
        let json = serde_json::to_value(SyncStatus::Syncing { done: 1, total: 3 }).unwrap();
        assert_eq!(json["status"], "syncing");
        assert_eq!(json["total"], 3);
    }

    #[test]
    fn partial_message_reports_both_counts() {
        let status = SyncStatus::Partial {
            synced: 2,
            failed: 1,
        };
        assert_eq!(status.message(), "Synced 2, failed 1");
        assert!(!status.is_syncing());
    }
}
