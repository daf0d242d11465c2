use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::Target;
use crate::firestore::local::journal::{Saved, Transactional, UndoLog};
use crate::firestore::local::{ListenSequenceNumber, ReferenceSet, TargetData};
use crate::firestore::model::{DocumentKey, SnapshotVersion, TargetId};

/// Cached targets, keyed by canonical id, plus the document keys the server
/// reported as matching each target.
#[derive(Clone, Debug, Default)]
pub struct MemoryTargetCache {
    targets: BTreeMap<String, TargetData>,
    canonical_ids: BTreeMap<TargetId, String>,
    matching_keys: ReferenceSet,
    highest_target_id: TargetId,
    highest_sequence_number: ListenSequenceNumber,
    last_remote_snapshot_version: SnapshotVersion,
    targets_undo: UndoLog<String, TargetData>,
    canonical_ids_undo: UndoLog<TargetId, String>,
    saved: Saved<(TargetId, ListenSequenceNumber, SnapshotVersion)>,
}

impl MemoryTargetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn highest_target_id(&self) -> TargetId {
        self.highest_target_id
    }

    pub fn highest_listen_sequence_number(&self) -> ListenSequenceNumber {
        self.highest_sequence_number
    }

    pub fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.last_remote_snapshot_version
    }

    pub fn set_last_remote_snapshot_version(&mut self, version: SnapshotVersion) {
        self.last_remote_snapshot_version = version;
    }

    pub fn add_target_data(&mut self, target_data: TargetData) {
        let canonical_id = target_data.target().canonical_id();
        self.highest_target_id = self.highest_target_id.max(target_data.target_id());
        self.highest_sequence_number = self
            .highest_sequence_number
            .max(target_data.sequence_number());
        self.canonical_ids_undo
            .record(&self.canonical_ids, &target_data.target_id());
        self.canonical_ids
            .insert(target_data.target_id(), canonical_id.clone());
        self.targets_undo.record(&self.targets, &canonical_id);
        self.targets.insert(canonical_id, target_data);
    }

    pub fn update_target_data(&mut self, target_data: TargetData) {
        self.add_target_data(target_data);
    }

    /// Drops the target and returns the keys it was matching.
    pub fn remove_target_data(&mut self, target_data: &TargetData) -> BTreeSet<DocumentKey> {
        self.canonical_ids_undo
            .record(&self.canonical_ids, &target_data.target_id());
        if let Some(canonical_id) = self.canonical_ids.remove(&target_data.target_id()) {
            self.targets_undo.record(&self.targets, &canonical_id);
            self.targets.remove(&canonical_id);
        }
        self.matching_keys
            .remove_references_for_id(target_data.target_id())
    }

    pub fn get_target_data(&self, target: &Target) -> Option<&TargetData> {
        self.targets.get(&target.canonical_id())
    }

    pub fn get_target_data_by_id(&self, target_id: TargetId) -> Option<&TargetData> {
        let canonical_id = self.canonical_ids.get(&target_id)?;
        self.targets.get(canonical_id)
    }

    pub fn targets(&self) -> impl Iterator<Item = &TargetData> {
        self.targets.values()
    }

    pub fn add_matching_keys<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        target_id: TargetId,
    ) {
        self.matching_keys.add_references(keys, target_id);
    }

    pub fn remove_matching_keys<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        target_id: TargetId,
    ) {
        self.matching_keys.remove_references(keys, target_id);
    }

    pub fn remove_matching_keys_for_target_id(&mut self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.matching_keys.remove_references_for_id(target_id)
    }

    pub fn get_matching_keys_for_target_id(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.matching_keys.references_for_id(target_id)
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.matching_keys.contains_key(key)
    }

    /// Forgets every target but keeps the id and sequence high-water marks so
    /// ids are never reused.
    pub fn clear(&mut self) {
        self.targets_undo.record_all(&self.targets);
        self.canonical_ids_undo.record_all(&self.canonical_ids);
        self.targets.clear();
        self.canonical_ids.clear();
        self.matching_keys.remove_all_references();
        self.last_remote_snapshot_version = SnapshotVersion::NONE;
    }
}

impl Transactional for MemoryTargetCache {
    fn begin(&mut self) {
        self.targets_undo.begin();
        self.canonical_ids_undo.begin();
        self.matching_keys.begin();
        self.saved.save(&(
            self.highest_target_id,
            self.highest_sequence_number,
            self.last_remote_snapshot_version,
        ));
    }

    fn commit(&mut self) {
        self.targets_undo.commit();
        self.canonical_ids_undo.commit();
        self.matching_keys.commit();
        self.saved.discard();
    }

    fn rollback(&mut self) {
        self.targets_undo.rollback(&mut self.targets);
        self.canonical_ids_undo.rollback(&mut self.canonical_ids);
        self.matching_keys.rollback();
        let mut scalars = (
            self.highest_target_id,
            self.highest_sequence_number,
            self.last_remote_snapshot_version,
        );
        self.saved.restore(&mut scalars);
        (
            self.highest_target_id,
            self.highest_sequence_number,
            self.last_remote_snapshot_version,
        ) = scalars;
    }
}
