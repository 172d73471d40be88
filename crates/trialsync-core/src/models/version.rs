//! Version/checksum record model

use serde::{Deserialize, Serialize};

/// Last accepted version of one `(table, entity)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRecord {
    pub version: u64,
    /// Canonical checksum of the entity data at `version`
    pub checksum: String,
    /// Unix ms
    pub timestamp: i64,
    pub device_id: String,
}

impl VersionRecord {
    /// Storage key inside the versions namespace.
    pub fn key(table: &str, id: &str) -> String {
        format!("{table}_{id}")
    }
}
