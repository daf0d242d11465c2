use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::{DocumentSet, Query};
use crate::firestore::model::{Document, DocumentKey};
use crate::util::fail;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Removed,
    Added,
    Modified,
    /// Only the document's pending-write state changed.
    Metadata,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub document: Document,
}

impl DocumentViewChange {
    pub fn new(change_type: ChangeType, document: Document) -> Self {
        Self {
            change_type,
            document,
        }
    }
}

/// Accumulates per-document changes, collapsing successive changes to the same
/// key into the single change a listener should see.
#[derive(Clone, Debug, Default)]
pub struct DocumentViewChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentViewChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_change(&mut self, change: DocumentViewChange) {
        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };

        use ChangeType::*;
        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some(change),
            (old_type, Metadata) if old_type != Removed => {
                Some(DocumentViewChange::new(old_type, change.document))
            }
            (Modified, Modified) => Some(DocumentViewChange::new(Modified, change.document)),
            (Added, Modified) => Some(DocumentViewChange::new(Added, change.document)),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange::new(Removed, old.document.clone())),
            (Removed, Added) => Some(DocumentViewChange::new(Modified, change.document)),
            (old_type, new_type) => fail(format!(
                "unsupported combination of changes {new_type:?} after {old_type:?}"
            )),
        };
        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes(&self) -> Vec<DocumentViewChange> {
        self.changes.values().cloned().collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum SyncState {
    #[default]
    None,
    Local,
    Synced,
}

/// The result set of a query at one point in time, with the changes since the
/// previous snapshot.
#[derive(Clone, Debug)]
pub struct ViewSnapshot {
    pub query: Query,
    pub documents: DocumentSet,
    pub old_documents: DocumentSet,
    pub changes: Vec<DocumentViewChange>,
    pub is_from_cache: bool,
    pub mutated_keys: BTreeSet<DocumentKey>,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// A first snapshot that reports every document as added.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: BTreeSet<DocumentKey>,
        is_from_cache: bool,
        excludes_metadata_changes: bool,
        has_cached_results: bool,
    ) -> Self {
        let changes = documents
            .iter()
            .map(|document| DocumentViewChange::new(ChangeType::Added, document.clone()))
            .collect();
        let old_documents = documents.empty_like();
        Self {
            query,
            documents,
            old_documents,
            changes,
            is_from_cache,
            mutated_keys,
            sync_state_changed: true,
            excludes_metadata_changes,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }
}

impl PartialEq for ViewSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.is_from_cache == other.is_from_cache
            && self.has_cached_results == other.has_cached_results
            && self.sync_state_changed == other.sync_state_changed
            && self.mutated_keys == other.mutated_keys
            && self.excludes_metadata_changes == other.excludes_metadata_changes
            && self.query == other.query
            && self.documents == other.documents
            && self.old_documents == other.old_documents
            && self.changes == other.changes
    }
}
