use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use crate::firestore::local::journal::{Transactional, UndoLog};
use crate::firestore::model::{BasePath, BatchId, DocumentKey, Mutation, ResourcePath};

/// The single mutation that turns the remote version of a document into its
/// locally visible version, tagged with the newest batch that contributed.
#[derive(Clone, Debug, PartialEq)]
pub struct Overlay {
    largest_batch_id: BatchId,
    mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: BatchId, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn largest_batch_id(&self) -> BatchId {
        self.largest_batch_id
    }

    pub fn mutation(&self) -> &Mutation {
        &self.mutation
    }

    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}

/// At most one overlay per document key.
#[derive(Clone, Debug, Default)]
pub struct MemoryDocumentOverlayCache {
    overlays: BTreeMap<DocumentKey, Overlay>,
    keys_by_batch_id: BTreeSet<(BatchId, DocumentKey)>,
    /// (collection id, key) pairs for collection group lookups.
    keys_by_collection_group: BTreeSet<(String, DocumentKey)>,
    overlays_undo: UndoLog<DocumentKey, Overlay>,
    batch_index_undo: UndoLog<(BatchId, DocumentKey), ()>,
    group_index_undo: UndoLog<(String, DocumentKey), ()>,
}

impl MemoryDocumentOverlayCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_overlay(&self, key: &DocumentKey) -> Option<&Overlay> {
        self.overlays.get(key)
    }

    /// Overlays for the subset of `keys` that have one.
    pub fn get_overlays<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
    ) -> BTreeMap<DocumentKey, Overlay> {
        keys.into_iter()
            .filter_map(|key| {
                self.overlays
                    .get(key)
                    .map(|overlay| (key.clone(), overlay.clone()))
            })
            .collect()
    }

    pub fn save_overlays(&mut self, largest_batch_id: BatchId, overlays: BTreeMap<DocumentKey, Mutation>) {
        for mutation in overlays.into_values() {
            self.save_overlay(largest_batch_id, mutation);
        }
    }

    pub fn remove_overlays_for_batch_id(&mut self, batch_id: BatchId) {
        let keys: Vec<DocumentKey> = self
            .keys_by_batch_id
            .range((batch_id, DocumentKey::empty())..)
            .take_while(|(entry_batch_id, _)| *entry_batch_id == batch_id)
            .map(|(_, key)| key.clone())
            .collect();
        for key in keys {
            self.remove_overlay(&key);
        }
    }

    /// Overlays for documents directly inside `collection` whose largest batch
    /// is newer than `since_batch_id`.
    pub fn get_overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> BTreeMap<DocumentKey, Overlay> {
        self.overlays
            .range::<ResourcePath, _>((Bound::Excluded(collection), Bound::Unbounded))
            .take_while(|(key, _)| collection.is_prefix_of(key.path()))
            .filter(|(key, overlay)| {
                collection.is_immediate_parent_of(key.path())
                    && overlay.largest_batch_id > since_batch_id
            })
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect()
    }

    /// Overlays in `collection_group` newer than `since_batch_id`. Whole batches
    /// are returned together, so the result may exceed `count` to finish the
    /// last batch.
    pub fn get_overlays_for_collection_group(
        &self,
        collection_group: &str,
        since_batch_id: BatchId,
        count: usize,
    ) -> BTreeMap<DocumentKey, Overlay> {
        let mut by_batch: BTreeMap<BatchId, Vec<&Overlay>> = BTreeMap::new();
        let group_keys = self
            .keys_by_collection_group
            .range((collection_group.to_string(), DocumentKey::empty())..)
            .take_while(|(group, _)| group == collection_group);
        for (_, key) in group_keys {
            let Some(overlay) = self.overlays.get(key) else {
                continue;
            };
            if overlay.largest_batch_id > since_batch_id {
                by_batch
                    .entry(overlay.largest_batch_id)
                    .or_default()
                    .push(overlay);
            }
        }

        let mut result = BTreeMap::new();
        for overlays in by_batch.into_values() {
            for overlay in overlays {
                result.insert(overlay.key().clone(), overlay.clone());
            }
            if result.len() >= count {
                break;
            }
        }
        result
    }

    fn save_overlay(&mut self, largest_batch_id: BatchId, mutation: Mutation) {
        let key = mutation.key().clone();
        self.remove_overlay(&key);

        let batch_entry = (largest_batch_id, key.clone());
        self.batch_index_undo
            .record_member(&self.keys_by_batch_id, &batch_entry);
        self.keys_by_batch_id.insert(batch_entry);

        let group_entry = (key.collection_group().to_string(), key.clone());
        self.group_index_undo
            .record_member(&self.keys_by_collection_group, &group_entry);
        self.keys_by_collection_group.insert(group_entry);

        self.overlays_undo.record(&self.overlays, &key);
        self.overlays
            .insert(key, Overlay::new(largest_batch_id, mutation));
    }

    fn remove_overlay(&mut self, key: &DocumentKey) {
        let Some(existing) = self.overlays.get(key) else {
            return;
        };
        let batch_entry = (existing.largest_batch_id, key.clone());
        self.batch_index_undo
            .record_member(&self.keys_by_batch_id, &batch_entry);
        self.keys_by_batch_id.remove(&batch_entry);

        let group_entry = (key.collection_group().to_string(), key.clone());
        self.group_index_undo
            .record_member(&self.keys_by_collection_group, &group_entry);
        self.keys_by_collection_group.remove(&group_entry);

        self.overlays_undo.record(&self.overlays, key);
        self.overlays.remove(key);
    }
}

impl Transactional for MemoryDocumentOverlayCache {
    fn begin(&mut self) {
        self.overlays_undo.begin();
        self.batch_index_undo.begin();
        self.group_index_undo.begin();
    }

    fn commit(&mut self) {
        self.overlays_undo.commit();
        self.batch_index_undo.commit();
        self.group_index_undo.commit();
    }

    fn rollback(&mut self) {
        self.overlays_undo.rollback(&mut self.overlays);
        self.batch_index_undo.rollback_set(&mut self.keys_by_batch_id);
        self.group_index_undo
            .rollback_set(&mut self.keys_by_collection_group);
    }
}
