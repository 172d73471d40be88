//! Conflict detection between local and remote copies of an entity.
//!
//! Checksums are computed over a canonical JSON serialization (object keys
//! sorted, no insignificant whitespace) so the same content always hashes
//! the same way regardless of how the map was built.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::ids::DeviceId;
use crate::models::{
    document_body, ConflictKind, ConflictRecord, Resolution, VersionRecord, CONFLICT_FLAG,
    CONFLICT_RESOLUTION,
};
use crate::services::LocalStore;
use crate::util::now_millis;

/// Number of hex characters kept from the digest.
const CHECKSUM_LEN: usize = 16;

/// Outcome of comparing a local and a remote copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub kind: ConflictKind,
    pub resolution: Resolution,
    pub local_version: u64,
    pub server_version: u64,
    pub local_checksum: String,
    pub server_checksum: String,
}

impl ConflictInfo {
    pub const fn is_conflict(&self) -> bool {
        !matches!(self.kind, ConflictKind::NoConflict)
    }

    /// Whether this outcome belongs in the audit log.
    pub const fn needs_audit(&self) -> bool {
        matches!(
            self.kind,
            ConflictKind::NewerServerVersion | ConflictKind::ChecksumMismatch
        )
    }
}

/// Serialize `value` with object keys in sorted order.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Short deterministic digest of `value`.
pub fn generate_checksum(value: &Value) -> String {
    let digest = Sha256::digest(canonical_json(value).as_bytes());
    let mut checksum = hex::encode(digest);
    checksum.truncate(CHECKSUM_LEN);
    checksum
}

/// Classify divergence between `local` and `server`.
///
/// Rules are checked in order: identical version and content, server ahead,
/// same version with different content, local ahead.
pub fn detect(
    local: &Value,
    server: &Value,
    local_version: u64,
    server_version: u64,
) -> ConflictInfo {
    let local_checksum = generate_checksum(local);
    let server_checksum = generate_checksum(server);

    let (kind, resolution) = if local_version == server_version && local_checksum == server_checksum
    {
        (ConflictKind::NoConflict, Resolution::UseServer)
    } else if server_version > local_version {
        (ConflictKind::NewerServerVersion, Resolution::UseServer)
    } else if local_version == server_version {
        (ConflictKind::ChecksumMismatch, Resolution::MergeNeeded)
    } else {
        (ConflictKind::VersionMismatch, Resolution::UseLocal)
    };

    ConflictInfo {
        kind,
        resolution,
        local_version,
        server_version,
        local_checksum,
        server_checksum,
    }
}

/// Apply the resolution chosen by [`detect`].
///
/// A merge is shallow: top-level local fields override server fields and the
/// result is tagged with `_conflict` for downstream audit.
pub fn resolve(local: &Value, server: &Value, conflict: &ConflictInfo) -> Value {
    match conflict.resolution {
        Resolution::UseServer => server.clone(),
        Resolution::UseLocal => local.clone(),
        Resolution::MergeNeeded => {
            let mut merged = match server {
                Value::Object(map) => map.clone(),
                _ => Map::new(),
            };
            if let Value::Object(local) = local {
                for (key, value) in local {
                    merged.insert(key.clone(), value.clone());
                }
            }
            merged.insert(CONFLICT_FLAG.to_string(), Value::Bool(true));
            merged.insert(
                CONFLICT_RESOLUTION.to_string(),
                Value::String("local-priority".to_string()),
            );
            Value::Object(merged)
        }
    }
}

/// Version bookkeeping and conflict audit backed by the local store.
#[derive(Clone)]
pub struct ConflictDetector {
    store: LocalStore,
    device_id: DeviceId,
}

impl ConflictDetector {
    pub const fn new(store: LocalStore, device_id: DeviceId) -> Self {
        Self { store, device_id }
    }

    /// Record `version` of `data` as accepted for `(table, id)`.
    pub async fn store_version(
        &self,
        table: &str,
        id: &str,
        data: &Value,
        version: u64,
    ) -> Result<VersionRecord> {
        let record = self.version_record(data, version);
        self.store.put_version(table, id, &record).await?;
        Ok(record)
    }

    /// Version record for `data` at `version`, stamped with this device.
    pub fn version_record(&self, data: &Value, version: u64) -> VersionRecord {
        VersionRecord {
            version,
            checksum: generate_checksum(&document_body(data)),
            timestamp: now_millis(),
            device_id: self.device_id.to_string(),
        }
    }

    pub async fn stored_version(&self, table: &str, id: &str) -> Result<Option<VersionRecord>> {
        self.store.get_version(table, id).await
    }

    /// True iff a stored version for the entity is greater than `new_version`.
    pub async fn is_stale_update(&self, table: &str, id: &str, new_version: u64) -> Result<bool> {
        Ok(self
            .stored_version(table, id)
            .await?
            .is_some_and(|stored| stored.version > new_version))
    }

    /// Fail with [`Error::StaleWrite`] when `new_version` would regress state.
    pub async fn ensure_fresh(&self, table: &str, id: &str, new_version: u64) -> Result<()> {
        match self.stored_version(table, id).await? {
            Some(stored) if stored.version > new_version => Err(Error::StaleWrite {
                table: table.to_string(),
                id: id.to_string(),
                attempted: new_version,
                stored: stored.version,
            }),
            _ => Ok(()),
        }
    }

    /// Append `conflict` to the audit log.
    pub async fn record_conflict(
        &self,
        table: &str,
        id: &str,
        conflict: &ConflictInfo,
    ) -> Result<ConflictRecord> {
        let mut record = ConflictRecord {
            id: 0,
            table: table.to_string(),
            entity_id: id.to_string(),
            kind: conflict.kind,
            resolution: conflict.resolution,
            local_version: conflict.local_version,
            server_version: conflict.server_version,
            local_checksum: conflict.local_checksum.clone(),
            server_checksum: conflict.server_checksum.clone(),
            resolved_at: now_millis(),
        };
        record.id = self.store.record_conflict(&record).await?;
        tracing::warn!(
            "Recorded {} conflict for {table}/{id} (local v{}, server v{}, resolution {})",
            record.kind,
            record.local_version,
            record.server_version,
            record.resolution
        );
        Ok(record)
    }

    pub async fn recent_conflicts(&self, limit: usize) -> Result<Vec<ConflictRecord>> {
        self.store.recent_conflicts(limit).await
    }
}
