use std::collections::BTreeSet;

use crate::firestore::local::journal::{Transactional, UndoLog};
use crate::firestore::model::DocumentKey;

/// Two-way index of (document key, id) references, where the id is a target
/// id or a batch id.
///
/// Used both for the matching keys of cached targets and for the documents
/// currently shown by local views.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeSet<(DocumentKey, i32)>,
    by_id: BTreeSet<(i32, DocumentKey)>,
    /// Journaled against `by_key`; `by_id` mirrors it.
    undo: UndoLog<(DocumentKey, i32), ()>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: i32) {
        let entry = (key, id);
        self.undo.record_member(&self.by_key, &entry);
        self.by_id.insert((id, entry.0.clone()));
        self.by_key.insert(entry);
    }

    pub fn add_references<'a>(&mut self, keys: impl IntoIterator<Item = &'a DocumentKey>, id: i32) {
        for key in keys {
            self.add_reference(key.clone(), id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: i32) {
        let entry = (key.clone(), id);
        self.undo.record_member(&self.by_key, &entry);
        self.by_id.remove(&(id, key.clone()));
        self.by_key.remove(&entry);
    }

    pub fn remove_references<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        id: i32,
    ) {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Drops every reference held by `id` and returns the keys released.
    pub fn remove_references_for_id(&mut self, id: i32) -> BTreeSet<DocumentKey> {
        let released = self.references_for_id(id);
        for key in &released {
            self.remove_reference(key, id);
        }
        released
    }

    pub fn remove_all_references(&mut self) -> BTreeSet<DocumentKey> {
        let released = self.by_key.iter().map(|(key, _)| key.clone()).collect();
        self.undo.record_all_members(&self.by_key);
        self.by_key.clear();
        self.by_id.clear();
        released
    }

    pub fn references_for_id(&self, id: i32) -> BTreeSet<DocumentKey> {
        self.by_id
            .range((id, DocumentKey::empty())..)
            .take_while(|(entry_id, _)| *entry_id == id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .range((key.clone(), i32::MIN)..)
            .next()
            .is_some_and(|(entry_key, _)| entry_key == key)
    }

    pub fn contains(&self, key: &DocumentKey, id: i32) -> bool {
        self.by_key.contains(&(key.clone(), id))
    }
}

impl Transactional for ReferenceSet {
    fn begin(&mut self) {
        self.undo.begin();
    }

    fn commit(&mut self) {
        self.undo.commit();
    }

    fn rollback(&mut self) {
        for ((key, id), was_present) in self.undo.take_members() {
            if was_present {
                self.by_id.insert((id, key.clone()));
                self.by_key.insert((key, id));
            } else {
                self.by_id.remove(&(id, key.clone()));
                self.by_key.remove(&(key, id));
            }
        }
    }
}
