use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::local::QueryPurpose;
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion, TargetId};

/// Aggregated result of a consistent batch of watch changes.
#[derive(Debug, Clone, Default)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter did not match, with the purpose their
    /// replacement listen should carry.
    pub target_mismatches: BTreeMap<TargetId, QueryPurpose>,
    pub document_updates: BTreeMap<DocumentKey, Document>,
    /// Documents only referenced by limbo-resolution targets.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_mismatches.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// Per-target changes contained in a [`RemoteEvent`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetChange {
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    /// A change carrying only the `current` flag, used to seed a new view from
    /// cached target state.
    pub fn synthesized_for_current_change(current: bool, resume_token: Vec<u8>) -> Self {
        Self {
            resume_token,
            current,
            ..Self::default()
        }
    }

    pub fn has_document_changes(&self) -> bool {
        !(self.added_documents.is_empty()
            && self.modified_documents.is_empty()
            && self.removed_documents.is_empty())
    }
}
