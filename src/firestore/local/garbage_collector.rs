use std::collections::BTreeMap;

use crate::firestore::local::journal::{Transactional, UndoLog};
use crate::firestore::local::ListenSequenceNumber;
use crate::firestore::model::DocumentKey;

/// Outcome of one garbage collection pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub documents_removed: usize,
}

impl LruResults {
    pub const DID_NOT_RUN: LruResults = LruResults {
        did_run: false,
        sequence_numbers_collected: 0,
        documents_removed: 0,
    };
}

/// Tracks documents that lost their last reference.
///
/// A key becomes a candidate when a target, a local view or a mutation stops
/// referencing it, and stops being one as soon as anything references it
/// again. Candidates remember the sequence number at which they were
/// orphaned so that collection removes the oldest first.
#[derive(Clone, Debug, Default)]
pub struct MemoryEagerReferenceDelegate {
    orphaned_documents: BTreeMap<DocumentKey, ListenSequenceNumber>,
    undo: UndoLog<DocumentKey, ListenSequenceNumber>,
}

impl MemoryEagerReferenceDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_reference(&mut self, key: &DocumentKey) {
        self.undo.record(&self.orphaned_documents, key);
        self.orphaned_documents.remove(key);
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, sequence_number: ListenSequenceNumber) {
        self.undo.record(&self.orphaned_documents, key);
        self.orphaned_documents.insert(key.clone(), sequence_number);
    }

    pub fn orphaned_count(&self) -> usize {
        self.orphaned_documents.len()
    }

    pub fn is_orphaned(&self, key: &DocumentKey) -> bool {
        self.orphaned_documents.contains_key(key)
    }

    /// The sequence number below which `count` orphans fall, oldest first.
    pub fn nth_sequence_number(&self, count: usize) -> Option<ListenSequenceNumber> {
        if count == 0 {
            return None;
        }
        let mut sequence_numbers: Vec<ListenSequenceNumber> =
            self.orphaned_documents.values().copied().collect();
        sequence_numbers.sort_unstable();
        sequence_numbers.dedup();
        sequence_numbers
            .get(count.min(sequence_numbers.len()).saturating_sub(1))
            .copied()
    }

    /// Removes and returns orphans at or below `upper_bound`.
    pub fn take_orphans_up_to(&mut self, upper_bound: ListenSequenceNumber) -> Vec<DocumentKey> {
        let keys: Vec<DocumentKey> = self
            .orphaned_documents
            .iter()
            .filter(|(_, sequence_number)| **sequence_number <= upper_bound)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            self.undo.record(&self.orphaned_documents, key);
            self.orphaned_documents.remove(key);
        }
        keys
    }

    pub fn clear(&mut self) {
        self.undo.record_all(&self.orphaned_documents);
        self.orphaned_documents.clear();
    }
}

impl Transactional for MemoryEagerReferenceDelegate {
    fn begin(&mut self) {
        self.undo.begin();
    }

    fn commit(&mut self) {
        self.undo.commit();
    }

    fn rollback(&mut self) {
        self.undo.rollback(&mut self.orphaned_documents);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn re_referenced_documents_are_no_longer_orphans() {
        let mut delegate = MemoryEagerReferenceDelegate::new();
        delegate.remove_reference(&key("rooms/a"), 1);
        delegate.remove_reference(&key("rooms/b"), 2);
        delegate.remove_reference(&key("rooms/c"), 3);
        delegate.add_reference(&key("rooms/b"));

        assert_eq!(delegate.orphaned_count(), 2);
        assert_eq!(delegate.nth_sequence_number(1), Some(1));
        assert_eq!(delegate.nth_sequence_number(10), Some(3));

        let taken = delegate.take_orphans_up_to(1);
        assert_eq!(taken, vec![key("rooms/a")]);
        assert!(delegate.is_orphaned(&key("rooms/c")));
    }
}
