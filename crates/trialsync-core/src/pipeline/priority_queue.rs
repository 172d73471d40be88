//! Priority-ordered queue with FIFO tie-break.

use std::collections::{BTreeMap, HashMap};

use crate::models::SyncPriority;

/// Queue of items keyed by id, ordered by `(priority, arrival)`.
///
/// Not internally synchronized; the engine wraps it in a mutex.
#[derive(Debug, Clone)]
pub struct PriorityQueue<T> {
    entries: BTreeMap<(SyncPriority, u64), (String, T)>,
    index: HashMap<String, (SyncPriority, u64)>,
    next_seq: u64,
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 1,
        }
    }

    /// Continue sequence numbering after `seq` (used when restoring a
    /// persisted queue).
    pub fn resume_after(&mut self, seq: u64) {
        self.next_seq = self.next_seq.max(seq.saturating_add(1));
    }

    /// Add `item` under `id`, replacing any previous item with that id.
    /// Returns the sequence number assigned.
    pub fn enqueue(&mut self, id: impl Into<String>, priority: SyncPriority, item: T) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.insert_at(id.into(), priority, seq, item);
        seq
    }

    /// Insert with an explicit sequence number.
    pub fn insert_at(&mut self, id: String, priority: SyncPriority, seq: u64, item: T) {
        self.remove(&id);
        self.next_seq = self.next_seq.max(seq + 1);
        self.index.insert(id.clone(), (priority, seq));
        self.entries.insert((priority, seq), (id, item));
    }

    /// Remove the most urgent, oldest item.
    pub fn dequeue(&mut self) -> Option<(String, T)> {
        let (_, (id, item)) = self.entries.pop_first()?;
        self.index.remove(&id);
        Some((id, item))
    }

    pub fn peek(&self) -> Option<(&str, &T)> {
        self.entries
            .first_key_value()
            .map(|(_, (id, item))| (id.as_str(), item))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        let key = self.index.get(id)?;
        self.entries.get_mut(key).map(|(_, item)| item)
    }

    /// Raise `id` to `priority` if that is more urgent. Its arrival order
    /// within the new priority is kept.
    pub fn promote(&mut self, id: &str, priority: SyncPriority) -> bool {
        let Some(&(current, seq)) = self.index.get(id) else {
            return false;
        };
        if priority >= current {
            return false;
        }
        if let Some(entry) = self.entries.remove(&(current, seq)) {
            self.entries.insert((priority, seq), entry);
            self.index.insert(id.to_string(), (priority, seq));
        }
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        let key = self.index.remove(id)?;
        self.entries.remove(&key).map(|(_, item)| item)
    }

    /// Change the id of a queued item, keeping its position.
    pub fn rekey(&mut self, old_id: &str, new_id: &str) -> bool {
        let Some(key) = self.index.remove(old_id) else {
            return false;
        };
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.0 = new_id.to_string();
        }
        self.index.insert(new_id.to_string(), key);
        true
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.values_mut().map(|(_, item)| item)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}

impl<T: Clone> PriorityQueue<T> {
    /// Items in dequeue order.
    pub fn snapshot(&self) -> Vec<T> {
        self.entries.values().map(|(_, item)| item.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dequeues_by_priority_then_arrival() {
        let mut queue = PriorityQueue::new();
        queue.enqueue("a", SyncPriority::Normal, 'a');
        queue.enqueue("b", SyncPriority::Critical, 'b');
        queue.enqueue("c", SyncPriority::Normal, 'c');
        queue.enqueue("d", SyncPriority::Low, 'd');
        queue.enqueue("e", SyncPriority::Critical, 'e');

        let order: Vec<char> = std::iter::from_fn(|| queue.dequeue().map(|(_, item)| item)).collect();
        assert_eq!(order, vec!['b', 'e', 'a', 'c', 'd']);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn promote_moves_ahead_but_never_demotes() {
        let mut queue = PriorityQueue::new();
        queue.enqueue("a", SyncPriority::High, 1);
        queue.enqueue("b", SyncPriority::Low, 2);

        assert!(queue.promote("b", SyncPriority::Critical));
        assert!(!queue.promote("a", SyncPriority::Low));
        assert_eq!(queue.peek(), Some(("b", &2)));
        assert!(!queue.promote("missing", SyncPriority::Critical));
    }

    #[test]
    fn enqueue_same_id_replaces() {
        let mut queue = PriorityQueue::new();
        queue.enqueue("a", SyncPriority::Normal, 1);
        queue.enqueue("a", SyncPriority::Normal, 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.snapshot(), vec![2]);
    }

    #[test]
    fn remove_and_rekey() {
        let mut queue = PriorityQueue::new();
        queue.enqueue("tmp", SyncPriority::Normal, 1);
        queue.enqueue("x", SyncPriority::Normal, 2);

        assert!(queue.rekey("tmp", "perm"));
        assert!(queue.contains("perm"));
        assert!(!queue.contains("tmp"));
        assert_eq!(queue.remove("x"), Some(2));
        assert_eq!(queue.dequeue(), Some(("perm".to_string(), 1)));
    }

    #[test]
    fn restored_sequence_keeps_fifo() {
        let mut queue = PriorityQueue::new();
        queue.insert_at("old".to_string(), SyncPriority::Normal, 41, "old");
        queue.resume_after(41);
        queue.enqueue("new", SyncPriority::Normal, "new");
        assert_eq!(queue.dequeue().map(|(id, _)| id).as_deref(), Some("old"));
    }
}
