//! Data models for trialsync

mod entity;
mod queued_change;
mod sync_conflict;
mod version;

pub use entity::{
    document_body, without_merge_tags, EntityMetadata, EntityRecord, CONFLICT_FLAG,
    CONFLICT_RESOLUTION,
};
pub use queued_change::{FieldChanges, QueuedChange, SyncPriority};
pub use sync_conflict::{ConflictKind, ConflictRecord, Resolution};
pub use version::VersionRecord;
