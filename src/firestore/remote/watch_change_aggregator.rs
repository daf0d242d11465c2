use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::firestore::local::{QueryPurpose, TargetData};
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion, TargetId};
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::watch_change::{
    DocumentChange, ExistenceFilterChange, TargetChangeState, WatchChange, WatchTargetChange,
};
use crate::util::hard_assert;

const LOG_TARGET: &str = "firestore::remote::watch";

/// Read access to the state the sync engine keeps about listened targets.
pub trait TargetMetadataProvider {
    /// Keys the target held as of the last raised remote event.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// The target data of an active listen, `None` once it was stopped.
    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DocumentChangeType {
    Added,
    Modified,
    Removed,
}

/// Changes accumulated for one target since the last remote event.
#[derive(Debug)]
struct TargetState {
    /// Outstanding watch/unwatch requests. Changes for a target are ignored
    /// until the backend has acknowledged all of them.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, DocumentChangeType>,
    has_pending_changes: bool,
    current: bool,
    resume_token: Vec<u8>,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            // A new target must raise at least one event.
            has_pending_changes: true,
            current: false,
            resume_token: Vec::new(),
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &[u8]) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            let bucket = match change_type {
                DocumentChangeType::Added => &mut change.added_documents,
                DocumentChangeType::Modified => &mut change.modified_documents,
                DocumentChangeType::Removed => &mut change.removed_documents,
            };
            bucket.insert(key.clone());
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: DocumentChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses -= 1;
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Folds individual watch changes into consistent [`RemoteEvent`]s.
#[derive(Debug, Default)]
pub struct WatchChangeAggregator {
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, Document>,
    /// Targets each pending document was seen on.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, QueryPurpose>,
}

impl WatchChangeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_watch_change(
        &mut self,
        change: WatchChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        match change {
            WatchChange::TargetChange(target_change) => {
                self.handle_target_change(target_change, metadata)
            }
            WatchChange::DocumentChange(document_change) => {
                self.handle_document_change(document_change, metadata)
            }
            WatchChange::DocumentDelete(delete) => {
                let tombstone = Document::new_no_document(delete.key.clone(), delete.read_time);
                self.handle_document_change(
                    DocumentChange {
                        updated_target_ids: Vec::new(),
                        removed_target_ids: delete.removed_target_ids,
                        key: delete.key,
                        document: Some(tombstone),
                    },
                    metadata,
                );
            }
            WatchChange::DocumentRemove(remove) => self.handle_document_change(
                DocumentChange {
                    updated_target_ids: Vec::new(),
                    removed_target_ids: remove.removed_target_ids,
                    key: remove.key,
                    document: None,
                },
                metadata,
            ),
            WatchChange::ExistenceFilter(filter) => self.handle_existence_filter(filter, metadata),
        }
    }

    fn handle_document_change(
        &mut self,
        change: DocumentChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        for target_id in &change.updated_target_ids {
            match &change.document {
                Some(document) if document.is_found_document() => {
                    self.add_document_to_target(*target_id, document.clone(), metadata);
                }
                document => self.remove_document_from_target(
                    *target_id,
                    change.key.clone(),
                    document.clone(),
                    metadata,
                ),
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(
                *target_id,
                change.key.clone(),
                change.document.clone(),
                metadata,
            );
        }
    }

    fn handle_target_change(
        &mut self,
        change: WatchTargetChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        for target_id in self.target_ids_for_change(&change, metadata) {
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(target_id, metadata) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Add => {
                    // A target that was unwatched and watched again is only
                    // added once the last pending response arrives.
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Remove => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                    hard_assert(
                        change.cause.is_none(),
                        "rejected listens are handled before reaching the aggregator",
                    );
                }
                TargetChangeState::Current => {
                    if self.is_active_target(target_id, metadata) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(target_id, metadata) {
                        // The backend resends every document after a reset.
                        self.reset_target(target_id, metadata);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    fn target_ids_for_change(
        &self,
        change: &WatchTargetChange,
        metadata: &dyn TargetMetadataProvider,
    ) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        self.target_states
            .keys()
            .copied()
            .filter(|target_id| self.is_active_target(*target_id, metadata))
            .collect()
    }

    fn handle_existence_filter(
        &mut self,
        filter: ExistenceFilterChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        let target_id = filter.target_id;
        let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
            return;
        };
        let target = target_data.target();
        if target.is_document_query() {
            if filter.count == 0 {
                // The document was deleted without a delete event. Commit a
                // tombstone at version zero so later updates replace it.
                if let Ok(key) = DocumentKey::from_path(target.path().clone()) {
                    let tombstone = Document::new_no_document(key.clone(), SnapshotVersion::NONE);
                    self.remove_document_from_target(target_id, key, Some(tombstone), metadata);
                }
            } else {
                hard_assert(
                    filter.count == 1,
                    "single document existence filter must have a count of 0 or 1",
                );
            }
            return;
        }

        let current_size = self.current_document_count_for_target(target_id, metadata);
        if current_size != filter.count as usize {
            debug!(
                target: LOG_TARGET,
                "Existence filter mismatch for target {target_id}: local {current_size}, remote {}",
                filter.count
            );
            self.reset_target(target_id, metadata);
            self.pending_target_resets
                .insert(target_id, QueryPurpose::ExistenceFilterMismatch);
        }
    }

    /// Builds the event for everything aggregated so far and resets the
    /// pending document state. Target states keep their tokens and `current`
    /// flags.
    pub fn create_remote_event(
        &mut self,
        snapshot_version: SnapshotVersion,
        metadata: &dyn TargetMetadataProvider,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
                continue;
            };
            let is_current = self
                .target_states
                .get(&target_id)
                .is_some_and(|state| state.current);
            if is_current && target_data.target().is_document_query() {
                // A current document target without the document means the
                // document does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target().path().clone()) {
                    if !self.pending_document_updates.contains_key(&key)
                        && !self.target_contains_document(target_id, &key, metadata)
                    {
                        let tombstone = Document::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(target_id, key, Some(tombstone), metadata);
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, target_ids) in &self.pending_document_target_mapping {
            let only_limbo_targets = target_ids.iter().all(|target_id| {
                self.target_data_for_active_target(*target_id, metadata)
                    .map_or(true, |data| data.purpose() == QueryPurpose::LimboResolution)
            });
            if only_limbo_targets {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    fn add_document_to_target(
        &mut self,
        target_id: TargetId,
        document: Document,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let key = document.key().clone();
        let change_type = if self.target_contains_document(target_id, &key, metadata) {
            DocumentChangeType::Modified
        } else {
            DocumentChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_updates.insert(key, document);
    }

    /// Removes the key from the target. `updated_document` is the tombstone
    /// to store, or `None` when the document merely left the target.
    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: DocumentKey,
        updated_document: Option<Document>,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let contained = self.target_contains_document(target_id, &key, metadata);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), DocumentChangeType::Removed);
        } else {
            // The document was added and removed within this event.
            state.remove_document_change(&key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key, document);
        }
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    /// Number of documents the target will hold after the pending changes.
    fn current_document_count_for_target(
        &mut self,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> usize {
        let change = self.ensure_target_state(target_id).to_target_change();
        (metadata.get_remote_keys_for_target(target_id).len() + change.added_documents.len())
            .saturating_sub(change.removed_documents.len())
    }

    /// Bumps the outstanding request count for a watch or unwatch that was
    /// just sent.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id)
            .record_pending_target_request();
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states
            .entry(target_id)
            .or_insert_with(TargetState::new)
    }

    fn is_active_target(&self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) -> bool {
        self.target_data_for_active_target(target_id, metadata)
            .is_some()
    }

    fn target_data_for_active_target(
        &self,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => metadata.get_target_data_for_target(target_id),
        }
    }

    /// Drops all changes for the target and marks every key it held as
    /// removed.
    fn reset_target(&mut self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) {
        hard_assert(
            !self
                .target_states
                .get(&target_id)
                .is_some_and(TargetState::is_pending),
            "should only reset active targets",
        );
        self.target_states.insert(target_id, TargetState::new());
        for key in metadata.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(target_id, key, None, metadata);
        }
    }

    fn target_contains_document(
        &self,
        target_id: TargetId,
        key: &DocumentKey,
        metadata: &dyn TargetMetadataProvider,
    ) -> bool {
        metadata.get_remote_keys_for_target(target_id).contains(key)
    }
}
