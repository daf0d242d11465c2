use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::{
    ChangeType, DocumentSet, DocumentViewChange, DocumentViewChangeSet, LimitType, OnlineState,
    Query, SyncState, ViewSnapshot,
};
use crate::firestore::model::{Document, DocumentKey};
use crate::firestore::remote::TargetChange;
use crate::util::hard_assert;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimboChangeType {
    Added,
    Removed,
}

/// A document entering or leaving limbo for one view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LimboDocumentChange {
    pub change_type: LimboChangeType,
    pub key: DocumentKey,
}

/// Uncommitted result of [`View::compute_doc_changes`].
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentViewChangeSet,
    pub mutated_keys: BTreeSet<DocumentKey>,
    /// Set when a limit query lost a document at its boundary; the caller must
    /// recompute with the full local result before applying.
    pub needs_refill: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Materialized result set of one query.
#[derive(Debug)]
pub struct View {
    query: Query,
    sync_state: SyncState,
    current: bool,
    document_set: DocumentSet,
    synced_documents: BTreeSet<DocumentKey>,
    limbo_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
}

impl View {
    /// `remote_documents` are the keys the server last reported for the target.
    pub fn new(query: Query, remote_documents: BTreeSet<DocumentKey>) -> Self {
        let document_set = DocumentSet::for_query(&query);
        Self {
            query,
            sync_state: SyncState::None,
            current: false,
            document_set,
            synced_documents: remote_documents,
            limbo_documents: BTreeSet::new(),
            mutated_keys: BTreeSet::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync_state
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn documents(&self) -> &DocumentSet {
        &self.document_set
    }

    /// Classifies `doc_changes` against the current result set. Passing the
    /// output of a previous call continues from it (the refill pass).
    pub fn compute_doc_changes(
        &self,
        doc_changes: &BTreeMap<DocumentKey, Document>,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let is_refill = previous.is_some();
        let (mut change_set, old_document_set, mut new_mutated_keys) = match previous {
            Some(previous) => (
                previous.change_set,
                previous.document_set,
                previous.mutated_keys,
            ),
            None => (
                DocumentViewChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut new_document_set = old_document_set.clone();
        let mut needs_refill = false;

        // Boundary documents of a full limit; an update moving past them means
        // a cached document outside the old window may now belong in it.
        let limit = self.query.limit().map(|limit| limit.max(0) as usize);
        let is_full = limit.is_some_and(|limit| old_document_set.len() == limit);
        let last_doc_in_limit = match self.query.limit_type() {
            LimitType::LimitToFirst if is_full => old_document_set.last().cloned(),
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type() {
            LimitType::LimitToLast if is_full => old_document_set.first().cloned(),
            _ => None,
        };

        for (key, candidate) in doc_changes {
            let old_doc = old_document_set.get(key);
            let new_doc = self.query.matches(candidate).then_some(candidate);

            let old_had_pending = old_doc.is_some_and(|doc| self.mutated_keys.contains(doc.key()));
            // Committed mutations only count for documents mutated while the
            // view was alive.
            let new_has_pending = new_doc.is_some_and(|doc| {
                doc.has_local_mutations()
                    || (self.mutated_keys.contains(doc.key()) && doc.has_committed_mutations())
            });

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        if !should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.add_change(DocumentViewChange::new(
                                ChangeType::Modified,
                                new_doc.clone(),
                            ));
                            change_applied = true;

                            let past_last = last_doc_in_limit.as_ref().is_some_and(|last| {
                                self.query.compare(new_doc, last) == Ordering::Greater
                            });
                            let before_first = first_doc_in_limit.as_ref().is_some_and(|first| {
                                self.query.compare(new_doc, first) == Ordering::Less
                            });
                            if past_last || before_first {
                                needs_refill = true;
                            }
                        }
                    } else if old_had_pending != new_has_pending {
                        change_set.add_change(DocumentViewChange::new(
                            ChangeType::Metadata,
                            new_doc.clone(),
                        ));
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set
                        .add_change(DocumentViewChange::new(ChangeType::Added, new_doc.clone()));
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set
                        .add_change(DocumentViewChange::new(ChangeType::Removed, old_doc.clone()));
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        if new_doc.has_local_mutations() {
                            new_mutated_keys.insert(key.clone());
                        } else {
                            new_mutated_keys.remove(key);
                        }
                        new_document_set.insert(new_doc.clone());
                    }
                    None => {
                        new_document_set.remove(key);
                        new_mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while new_document_set.len() > limit {
                let evicted = match self.query.limit_type() {
                    LimitType::LimitToFirst => new_document_set.last().cloned(),
                    LimitType::LimitToLast => new_document_set.first().cloned(),
                };
                let Some(evicted) = evicted else { break };
                new_document_set.remove(evicted.key());
                new_mutated_keys.remove(evicted.key());
                change_set.add_change(DocumentViewChange::new(ChangeType::Removed, evicted));
            }
        }

        hard_assert(
            !needs_refill || !is_refill,
            "view was refilled using docs that themselves needed refilling",
        );

        ViewDocumentChanges {
            document_set: new_document_set,
            change_set,
            mutated_keys: new_mutated_keys,
            needs_refill,
        }
    }

    /// Commits `doc_changes` and produces a snapshot if anything visible
    /// changed.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        hard_assert(
            !doc_changes.needs_refill,
            "cannot apply changes that need a refill",
        );

        let old_document_set =
            std::mem::replace(&mut self.document_set, doc_changes.document_set.clone());
        self.mutated_keys = doc_changes.mutated_keys.clone();

        let mut changes = doc_changes.change_set.changes();
        changes.sort_by(|left, right| {
            change_type_order(left.change_type)
                .cmp(&change_type_order(right.change_type))
                .then_with(|| self.query.compare(&left.document, &right.document))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if target_is_pending_reset {
            Vec::new()
        } else {
            self.update_limbo_documents()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_sync_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = new_sync_state != self.sync_state;
        self.sync_state = new_sync_state;

        let snapshot = (!changes.is_empty() || sync_state_changed).then(|| ViewSnapshot {
            query: self.query.clone(),
            documents: doc_changes.document_set,
            old_documents: old_document_set,
            changes,
            is_from_cache: new_sync_state == SyncState::Local,
            mutated_keys: doc_changes.mutated_keys,
            sync_state_changed,
            excludes_metadata_changes: false,
            has_cached_results: target_change.is_some_and(|change| !change.resume_token.is_empty()),
        });

        ViewChange {
            snapshot,
            limbo_changes,
        }
    }

    /// The target change a freshly created view is seeded with: no document
    /// changes, only whether the cached target was already current.
    pub fn synthesize_target_change(current: bool, resume_token: Vec<u8>) -> TargetChange {
        TargetChange::synthesized_for_current_change(current, resume_token)
    }

    /// Going offline drops `current`, turning results into cached ones.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentViewChangeSet::new(),
                mutated_keys: self.mutated_keys.clone(),
                needs_refill: false,
            };
            self.apply_changes(unchanged, None, false)
        } else {
            ViewChange::default()
        }
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        for key in &change.added_documents {
            self.synced_documents.insert(key.clone());
        }
        for key in &change.modified_documents {
            hard_assert(
                self.synced_documents.contains(key),
                format!("modified document {key} not found in view"),
            );
        }
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        // Limbo can only be decided once in sync with the server.
        if !self.current {
            return Vec::new();
        }

        let old_limbo = std::mem::take(&mut self.limbo_documents);
        self.limbo_documents = self
            .document_set
            .iter()
            .filter(|document| self.should_be_limbo_doc(document))
            .map(|document| document.key().clone())
            .collect();

        let removed = old_limbo
            .difference(&self.limbo_documents)
            .map(|key| LimboDocumentChange {
                change_type: LimboChangeType::Removed,
                key: key.clone(),
            });
        let added = self
            .limbo_documents
            .difference(&old_limbo)
            .map(|key| LimboDocumentChange {
                change_type: LimboChangeType::Added,
                key: key.clone(),
            });
        removed.chain(added).collect()
    }

    fn should_be_limbo_doc(&self, document: &Document) -> bool {
        // Local edits may explain why the server does not list the document.
        !self.synced_documents.contains(document.key()) && !document.has_local_mutations()
    }
}

/// Write acknowledgements carrying a server-computed value are held back
/// until watch delivers the same document, so listeners see two events
/// instead of three.
fn should_wait_for_synced_document(old_doc: &Document, new_doc: &Document) -> bool {
    old_doc.has_local_mutations() && new_doc.has_committed_mutations() && !new_doc.has_local_mutations()
}

fn change_type_order(change_type: ChangeType) -> u8 {
    match change_type {
        ChangeType::Removed => 0,
        ChangeType::Added => 1,
        ChangeType::Modified | ChangeType::Metadata => 2,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::firestore::core::OrderBy;
    use crate::firestore::model::{FieldPath, ResourcePath, SnapshotVersion};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str, sort: i64) -> Document {
        Document::new_found(
            key(path),
            SnapshotVersion::from_micros(1),
            MapValue::new(BTreeMap::from([(
                "sort".to_string(),
                FirestoreValue::from_integer(sort),
            )])),
        )
    }

    fn batch(documents: &[Document]) -> BTreeMap<DocumentKey, Document> {
        documents
            .iter()
            .map(|document| (document.key().clone(), document.clone()))
            .collect()
    }

    fn query() -> Query {
        Query::at_path(ResourcePath::from_segments(["rooms"]))
            .with_order_by(OrderBy::ascending(FieldPath::from_dot_separated("sort").unwrap()))
    }

    fn apply(view: &mut View, documents: &[Document], target: Option<&TargetChange>) -> ViewChange {
        let changes = view.compute_doc_changes(&batch(documents), None);
        view.apply_changes(changes, target, false)
    }

    #[test]
    fn first_application_reports_adds_and_second_is_noop() {
        let mut view = View::new(query(), BTreeSet::new());
        let documents = [doc("rooms/a", 1), doc("rooms/b", 2)];
        let first = apply(&mut view, &documents, None).snapshot.unwrap();
        assert_eq!(first.changes.len(), 2);
        assert!(first.changes.iter().all(|c| c.change_type == ChangeType::Added));
        assert!(first.is_from_cache);

        assert!(apply(&mut view, &documents, None).snapshot.is_none());
    }

    #[test]
    fn limit_evicts_boundary_document() {
        let mut view = View::new(query().with_limit_to_first(2), BTreeSet::new());
        apply(&mut view, &[doc("rooms/a", 1), doc("rooms/b", 2)], None);

        let snapshot = apply(&mut view, &[doc("rooms/c", 0)], None).snapshot.unwrap();
        assert_eq!(snapshot.documents.len(), 2);
        let keys: Vec<String> = snapshot.documents.keys().map(ToString::to_string).collect();
        assert_eq!(keys, vec!["rooms/c", "rooms/a"]);
        let removed: Vec<_> = snapshot
            .changes
            .iter()
            .filter(|change| change.change_type == ChangeType::Removed)
            .map(|change| change.document.key().to_string())
            .collect();
        assert_eq!(removed, vec!["rooms/b"]);
    }

    #[test]
    fn removal_from_full_limit_needs_refill() {
        let mut view = View::new(query().with_limit_to_first(2), BTreeSet::new());
        apply(&mut view, &[doc("rooms/a", 1), doc("rooms/b", 2)], None);

        let deleted = Document::new_no_document(key("rooms/a"), SnapshotVersion::from_micros(2));
        let changes = view.compute_doc_changes(&batch(&[deleted]), None);
        assert!(changes.needs_refill);

        let refilled = view.compute_doc_changes(&batch(&[doc("rooms/c", 3)]), Some(changes));
        assert!(!refilled.needs_refill);
        let snapshot = view.apply_changes(refilled, None, false).snapshot.unwrap();
        let keys: Vec<String> = snapshot.documents.keys().map(ToString::to_string).collect();
        assert_eq!(keys, vec!["rooms/b", "rooms/c"]);
    }

    #[test]
    fn unsynced_documents_enter_limbo_once_current() {
        let mut view = View::new(query(), BTreeSet::new());
        let target = TargetChange {
            current: true,
            added_documents: BTreeSet::from([key("rooms/a")]),
            ..TargetChange::default()
        };
        let change = apply(&mut view, &[doc("rooms/a", 1), doc("rooms/b", 2)], Some(&target));
        assert_eq!(
            change.limbo_changes,
            vec![LimboDocumentChange {
                change_type: LimboChangeType::Added,
                key: key("rooms/b"),
            }]
        );
        assert!(change.snapshot.unwrap().is_from_cache);

        let resolved = TargetChange {
            current: true,
            removed_documents: BTreeSet::new(),
            ..TargetChange::default()
        };
        let deleted = Document::new_no_document(key("rooms/b"), SnapshotVersion::from_micros(3));
        let change = apply(&mut view, &[deleted], Some(&resolved));
        assert_eq!(change.limbo_changes[0].change_type, LimboChangeType::Removed);
        let snapshot = change.snapshot.unwrap();
        assert!(!snapshot.is_from_cache);
        assert!(snapshot.sync_state_changed);
    }

    #[test]
    fn going_offline_marks_results_as_cached() {
        let mut view = View::new(query(), BTreeSet::new());
        let target = TargetChange {
            current: true,
            added_documents: BTreeSet::from([key("rooms/a")]),
            ..TargetChange::default()
        };
        apply(&mut view, &[doc("rooms/a", 1)], Some(&target));
        assert_eq!(view.sync_state(), SyncState::Synced);

        let change = view.apply_online_state_change(OnlineState::Offline);
        let snapshot = change.snapshot.unwrap();
        assert!(snapshot.is_from_cache);
        assert!(snapshot.changes.is_empty());
        assert!(view
            .apply_online_state_change(OnlineState::Offline)
            .snapshot
            .is_none());
    }

    #[test]
    fn acknowledged_write_waits_for_watch() {
        let mut view = View::new(query(), BTreeSet::new());
        let mut local = doc("rooms/a", 1);
        local.set_has_local_mutations();
        apply(&mut view, &[local], None);

        let mut acknowledged = doc("rooms/a", 2);
        acknowledged.set_has_committed_mutations();
        let change = apply(&mut view, &[acknowledged], None);
        assert!(change.snapshot.is_none());
    }
}
