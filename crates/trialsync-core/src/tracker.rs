//! Dirty-field tracking for one in-memory entity.
//!
//! The tracker holds two copies of an entity: the baseline (last state the
//! remote store accepted) and the working copy. `update_field` mutates only
//! the working copy and records the path, so producing the remote write
//! costs time proportional to the number of dirty paths rather than the
//! size of the entity.

use std::collections::BTreeSet;
use std::future::Future;

use serde_json::Value;

use crate::error::Result;
use crate::models::FieldChanges;
use crate::paths::{self, EntitySchema};
use crate::util::now_rfc3339;

/// Bookkeeping path carrying the sync timestamp.
pub const LAST_SYNCED_PATH: &str = "metadata.lastSynced";
/// Bookkeeping path carrying the dirty flag.
pub const IS_DIRTY_PATH: &str = "metadata.isDirty";

/// Summary of a tracker's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerStats {
    pub dirty_fields: usize,
    pub has_changes: bool,
}

#[derive(Debug, Clone)]
pub struct DirtyFieldTracker {
    baseline: Value,
    working: Value,
    dirty: BTreeSet<String>,
    schema: EntitySchema,
}

impl Default for DirtyFieldTracker {
    fn default() -> Self {
        Self::new(EntitySchema::permissive())
    }
}

impl DirtyFieldTracker {
    pub fn new(schema: EntitySchema) -> Self {
        Self {
            baseline: Value::Object(serde_json::Map::new()),
            working: Value::Object(serde_json::Map::new()),
            dirty: BTreeSet::new(),
            schema,
        }
    }

    /// Snapshot `entity` as the sync baseline and clear all dirty state.
    pub fn initialize(&mut self, entity: &Value) {
        self.baseline = entity.clone();
        self.working = entity.clone();
        self.dirty.clear();
    }

    /// Set `value` at `path` in the working copy and mark it dirty.
    ///
    /// Writing a path back to its baseline value removes it from the dirty
    /// set again.
    pub fn update_field(&mut self, path: &str, value: Value) -> Result<()> {
        self.schema.validate(path)?;
        paths::set_path(&mut self.working, path, value)?;

        if self.dirty.iter().any(|dirty| paths::is_ancestor(dirty, path)) {
            // Already covered by a dirty ancestor.
            self.prune_clean();
            return Ok(());
        }

        self.dirty.retain(|dirty| !paths::is_ancestor(path, dirty));
        self.dirty.insert(path.to_string());
        self.prune_clean();
        Ok(())
    }

    fn prune_clean(&mut self) {
        let baseline = &self.baseline;
        let working = &self.working;
        self.dirty
            .retain(|path| paths::get_path(baseline, path) != paths::get_path(working, path));
    }

    /// Current value of every dirty path plus sync bookkeeping. Empty when
    /// nothing is dirty.
    pub fn get_changes(&self) -> FieldChanges {
        let mut changes = self.pending_fields();
        if changes.is_empty() {
            return changes;
        }
        changes.insert(LAST_SYNCED_PATH.to_string(), Value::String(now_rfc3339()));
        changes.insert(IS_DIRTY_PATH.to_string(), Value::Bool(false));
        changes
    }

    /// Dirty paths and their working values, without bookkeeping.
    pub fn pending_fields(&self) -> FieldChanges {
        self.dirty
            .iter()
            .map(|path| {
                let value = paths::get_path(&self.working, path)
                    .cloned()
                    .unwrap_or(Value::Null);
                (path.clone(), value)
            })
            .collect()
    }

    pub fn get_changed_fields(&self) -> Vec<String> {
        self.dirty.iter().cloned().collect()
    }

    pub fn has_changes(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Reset the working copy to the baseline.
    pub fn discard_changes(&mut self) {
        self.working = self.baseline.clone();
        self.dirty.clear();
    }

    /// Adopt the working copy as the new baseline.
    pub fn mark_synced(&mut self) {
        self.baseline = self.working.clone();
        self.dirty.clear();
    }

    /// Hand the pending changes to `write` and commit them only if it
    /// succeeds. On failure the tracker is left untouched.
    pub async fn sync_with<F, Fut, T>(&mut self, write: F) -> Result<Option<T>>
    where
        F: FnOnce(FieldChanges) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.has_changes() {
            return Ok(None);
        }
        let output = write(self.get_changes()).await?;
        self.mark_synced();
        Ok(Some(output))
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            dirty_fields: self.dirty.len(),
            has_changes: self.has_changes(),
        }
    }

    /// Forget both copies.
    pub fn reset(&mut self) {
        self.baseline = Value::Object(serde_json::Map::new());
        self.working = Value::Object(serde_json::Map::new());
        self.dirty.clear();
    }

    pub const fn working(&self) -> &Value {
        &self.working
    }

    pub const fn baseline(&self) -> &Value {
        &self.baseline
    }
}
