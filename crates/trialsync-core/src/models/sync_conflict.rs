//! Sync conflict model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Classification of local/remote divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    NoConflict,
    NewerServerVersion,
    ChecksumMismatch,
    VersionMismatch,
}

/// Strategy chosen for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    UseLocal,
    UseServer,
    MergeNeeded,
}

impl ConflictKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoConflict => "no-conflict",
            Self::NewerServerVersion => "newer-server-version",
            Self::ChecksumMismatch => "checksum-mismatch",
            Self::VersionMismatch => "version-mismatch",
        }
    }
}

impl Resolution {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UseLocal => "use-local",
            Self::UseServer => "use-server",
            Self::MergeNeeded => "merge-needed",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictKind {
    type Err = crate::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "no-conflict" => Ok(Self::NoConflict),
            "newer-server-version" => Ok(Self::NewerServerVersion),
            "checksum-mismatch" => Ok(Self::ChecksumMismatch),
            "version-mismatch" => Ok(Self::VersionMismatch),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown conflict kind: {other}"
            ))),
        }
    }
}

impl FromStr for Resolution {
    type Err = crate::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "use-local" => Ok(Self::UseLocal),
            "use-server" => Ok(Self::UseServer),
            "merge-needed" => Ok(Self::MergeNeeded),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown resolution: {other}"
            ))),
        }
    }
}

/// Recorded sync conflict, kept for audit even when resolved automatically
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Conflict row identifier (0 until persisted)
    pub id: i64,
    /// Collection of the entity
    pub table: String,
    /// Entity involved in the conflict
    pub entity_id: String,
    pub kind: ConflictKind,
    pub resolution: Resolution,
    pub local_version: u64,
    pub server_version: u64,
    pub local_checksum: String,
    pub server_checksum: String,
    /// Resolution timestamp (unix ms)
    pub resolved_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_and_resolution_round_trip_strings() {
        for kind in [
            ConflictKind::NoConflict,
            ConflictKind::NewerServerVersion,
            ConflictKind::ChecksumMismatch,
            ConflictKind::VersionMismatch,
        ] {
            assert_eq!(kind.as_str().parse::<ConflictKind>().unwrap(), kind);
        }
        assert_eq!(
            "merge-needed".parse::<Resolution>().unwrap(),
            Resolution::MergeNeeded
        );
    }

    #[test]
    fn serde_uses_kebab_case() {
        let json = serde_json::to_string(&ConflictKind::ChecksumMismatch).unwrap();
        assert_eq!(json, "\"checksum-mismatch\"");
    }
}
