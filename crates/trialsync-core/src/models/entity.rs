//! Entity record model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids;

/// Sync bookkeeping stored alongside every entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMetadata {
    /// Last successful sync (Unix ms)
    pub last_synced: Option<i64>,
    /// Local copy has changes the remote store has not accepted yet
    pub is_dirty: bool,
    /// Monotonic version counter; the remote store is the source of truth
    pub version: u64,
}

/// A locally persisted entity such as a consolidated patient record or a form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    /// Permanent remote id, or a device-scoped temporary id before first sync
    pub id: String,
    /// Logical collection (`patient`, `baseline`, `followup`, ...)
    pub entity_type: String,
    /// Structured clinical fields
    pub data: Value,
    pub metadata: EntityMetadata,
}

impl EntityRecord {
    /// Create a clean, never-synced record.
    pub fn new(id: impl Into<String>, entity_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            data,
            metadata: EntityMetadata::default(),
        }
    }

    /// Whether the record still carries a temporary offline id.
    pub fn is_temporary(&self) -> bool {
        ids::is_temporary(&self.id)
    }

    /// Remote document form: `data` plus a camelCase `metadata` block.
    pub fn to_document(&self) -> Value {
        let mut document = match &self.data {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };
        document.insert(
            "metadata".to_string(),
            serde_json::to_value(&self.metadata).unwrap_or(Value::Null),
        );
        Value::Object(document)
    }

    /// Mark the record as accepted by the remote store at `version`.
    pub fn mark_synced(&mut self, version: u64, synced_at: i64) {
        self.metadata.version = version;
        self.metadata.is_dirty = false;
        self.metadata.last_synced = Some(synced_at);
    }
}

/// Root flag set on a document written by a local-priority merge.
pub const CONFLICT_FLAG: &str = "_conflict";
/// Root marker naming how a merged document was resolved.
pub const CONFLICT_RESOLUTION: &str = "_conflictResolution";

const BOOKKEEPING_ROOTS: [&str; 3] = ["metadata", CONFLICT_FLAG, CONFLICT_RESOLUTION];

/// Strip sync bookkeeping and merge audit tags from a remote document,
/// leaving only clinical fields.
pub fn document_body(document: &Value) -> Value {
    match document {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !BOOKKEEPING_ROOTS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Drop merge audit tags a caller may have copied from a remote document.
pub fn without_merge_tags(mut document: Value) -> Value {
    if let Value::Object(map) = &mut document {
        map.remove(CONFLICT_FLAG);
        map.remove(CONFLICT_RESOLUTION);
    }
    document
}
