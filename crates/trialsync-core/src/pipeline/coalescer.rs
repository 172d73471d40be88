//! Batches pending deltas per entity.
//!
//! Several saves of the same entity between two flushes collapse into one
//! outgoing write: paths merge with last-write-wins and the most urgent
//! priority is kept.

use std::collections::HashMap;
use std::mem;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::delta::merge_changes;
use crate::models::{FieldChanges, QueuedChange, SyncPriority};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoalescerConfig {
    /// Number of distinct entities that makes a batch full
    pub batch_size: usize,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self { batch_size: 10 }
    }
}

/// Accumulated changes for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct CoalescedChange {
    pub form_id: String,
    pub form_type: String,
    pub delta: FieldChanges,
    pub priority: SyncPriority,
    /// Highest local version among the merged changes
    pub version: u64,
    /// Queue entries folded into this batch entry
    pub change_ids: Vec<String>,
    pub first_enqueued_at: i64,
    /// Number of changes merged beyond the first
    pub merged: usize,
}

impl CoalescedChange {
    fn from_change(change: &QueuedChange) -> Self {
        Self {
            form_id: change.form_id.clone(),
            form_type: change.form_type.clone(),
            delta: change.delta.clone(),
            priority: change.priority,
            version: change.version,
            change_ids: vec![change.change_id.clone()],
            first_enqueued_at: change.enqueued_at,
            merged: 0,
        }
    }

    fn absorb(&mut self, change: &QueuedChange) {
        merge_changes(&mut self.delta, &change.delta);
        self.priority = self.priority.min(change.priority);
        self.version = self.version.max(change.version);
        if !self.change_ids.contains(&change.change_id) {
            self.change_ids.push(change.change_id.clone());
            self.merged += 1;
        }
    }
}

#[derive(Debug, Default)]
struct Batch {
    order: Vec<String>,
    entries: HashMap<String, CoalescedChange>,
}

/// Thread-safe accumulator of per-entity deltas.
#[derive(Debug, Default)]
pub struct RequestCoalescer {
    config: CoalescerConfig,
    batch: Mutex<Batch>,
}

impl RequestCoalescer {
    pub fn new(config: CoalescerConfig) -> Self {
        Self {
            config,
            batch: Mutex::new(Batch::default()),
        }
    }

    fn key(form_type: &str, form_id: &str) -> String {
        format!("{form_type}:{form_id}")
    }

    /// Merge `change` into the batch. Returns true once the batch holds
    /// `batch_size` entities and should be flushed.
    pub fn add(&self, change: &QueuedChange) -> bool {
        let mut batch = self.batch.lock();
        let key = Self::key(&change.form_type, &change.form_id);
        if let Some(entry) = batch.entries.get_mut(&key) {
            entry.absorb(change);
            tracing::debug!("Coalesced change {} into {key}", change.change_id);
        } else {
            batch.entries.insert(key.clone(), CoalescedChange::from_change(change));
            batch.order.push(key);
        }
        batch.entries.len() >= self.config.batch_size.max(1)
    }

    /// Swap out the whole batch in insertion order.
    pub fn flush(&self) -> Vec<CoalescedChange> {
        let Batch { order, mut entries } = mem::take(&mut *self.batch.lock());
        order
            .into_iter()
            .filter_map(|key| entries.remove(&key))
            .collect()
    }

    /// Remove and return the pending entry for one entity.
    pub fn take(&self, form_type: &str, form_id: &str) -> Option<CoalescedChange> {
        let mut batch = self.batch.lock();
        let key = Self::key(form_type, form_id);
        let entry = batch.entries.remove(&key)?;
        batch.order.retain(|existing| existing != &key);
        Some(entry)
    }

    /// Move a pending entry from a temporary id to its permanent id.
    pub fn rekey(&self, form_type: &str, old_id: &str, new_id: &str) {
        let mut batch = self.batch.lock();
        let old_key = Self::key(form_type, old_id);
        let Some(mut entry) = batch.entries.remove(&old_key) else {
            return;
        };
        let new_key = Self::key(form_type, new_id);
        entry.form_id = new_id.to_string();
        for key in &mut batch.order {
            if *key == old_key {
                key.clone_from(&new_key);
            }
        }
        batch.entries.insert(new_key, entry);
    }

    pub fn len(&self) -> usize {
        self.batch.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        *self.batch.lock() = Batch::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn change(
        id: &str,
        form_id: &str,
        path: &str,
        value: serde_json::Value,
        priority: SyncPriority,
    ) -> QueuedChange {
        QueuedChange {
            change_id: id.to_string(),
            form_id: form_id.to_string(),
            form_type: "baseline".to_string(),
            delta: FieldChanges::from([(path.to_string(), value)]),
            priority,
            enqueued_at: 1,
            version: 1,
            retries: 0,
            last_error: None,
        }
    }

    #[test]
    fn same_entity_changes_merge() {
        let coalescer = RequestCoalescer::new(CoalescerConfig::default());
        coalescer.add(&change("c1", "f1", "hba1c", json!(7.0), SyncPriority::Normal));
        coalescer.add(&change("c2", "f1", "hba1c", json!(7.2), SyncPriority::Critical));
        coalescer.add(&change("c3", "f1", "weight", json!(80), SyncPriority::Low));

        let batch = coalescer.flush();
        assert_eq!(batch.len(), 1);
        let entry = &batch[0];
        assert_eq!(entry.delta["hba1c"], json!(7.2));
        assert_eq!(entry.delta["weight"], json!(80));
        assert_eq!(entry.priority, SyncPriority::Critical);
        assert_eq!(entry.change_ids, vec!["c1", "c2", "c3"]);
        assert_eq!(entry.merged, 2);
        assert!(coalescer.is_empty());
    }

    #[test]
    fn add_reports_full_batch() {
        let coalescer = RequestCoalescer::new(CoalescerConfig { batch_size: 2 });
        assert!(!coalescer.add(&change("c1", "f1", "a", json!(1), SyncPriority::Normal)));
        assert!(!coalescer.add(&change("c2", "f1", "b", json!(1), SyncPriority::Normal)));
        assert!(coalescer.add(&change("c3", "f2", "a", json!(1), SyncPriority::Normal)));
    }

    #[test]
    fn take_and_rekey_single_entity() {
        let coalescer = RequestCoalescer::new(CoalescerConfig::default());
        coalescer.add(&change("c1", "tmp", "a", json!(1), SyncPriority::Normal));
        coalescer.add(&change("c2", "f2", "a", json!(1), SyncPriority::Normal));

        coalescer.rekey("baseline", "tmp", "perm");
        let taken = coalescer.take("baseline", "perm").unwrap();
        assert_eq!(taken.form_id, "perm");
        assert!(coalescer.take("baseline", "tmp").is_none());
        assert_eq!(coalescer.flush().len(), 1);
    }

    #[test]
    fn concurrent_adds_during_flush_are_not_lost() {
        let coalescer = Arc::new(RequestCoalescer::new(CoalescerConfig { batch_size: 10_000 }));
        let writers: Vec<_> = (0..4)
            .map(|worker| {
                let coalescer = Arc::clone(&coalescer);
                std::thread::spawn(move || {
                    for n in 0..250 {
                        coalescer.add(&change(
                            &format!("c{worker}_{n}"),
                            &format!("f{worker}_{n}"),
                            "a",
                            json!(n),
                            SyncPriority::Normal,
                        ));
                    }
                })
            })
            .collect();

        let mut seen = 0;
        while writers.iter().any(|writer| !writer.is_finished()) {
            seen += coalescer.flush().len();
        }
        for writer in writers {
            writer.join().unwrap();
        }
        seen += coalescer.flush().len();
        assert_eq!(seen, 1_000);
    }
}
