use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::Query;
use crate::firestore::local::MemoryPersistence;
use crate::firestore::model::{
    BasePath, BatchId, Document, DocumentKey, FieldMask, Mutation, OverlayedDocument,
    SnapshotVersion, Timestamp,
};

/// Where an incremental query scan resumes: documents read after
/// `read_time` and overlays written by batches after `largest_batch_id`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexOffset {
    pub read_time: SnapshotVersion,
    pub largest_batch_id: BatchId,
}

impl IndexOffset {
    pub const NONE: IndexOffset = IndexOffset {
        read_time: SnapshotVersion::NONE,
        largest_batch_id: -1,
    };

    pub fn from_read_time(read_time: SnapshotVersion) -> Self {
        Self {
            read_time,
            largest_batch_id: -1,
        }
    }
}

/// Locally visible documents: the remote cache with overlays applied.
pub struct LocalDocumentsView<'a> {
    persistence: &'a mut MemoryPersistence,
}

impl<'a> LocalDocumentsView<'a> {
    pub fn new(persistence: &'a mut MemoryPersistence) -> Self {
        Self { persistence }
    }

    /// The local view of `key`; an invalid document when nothing is known.
    pub fn get_document(&self, key: &DocumentKey) -> Document {
        let overlay = self.persistence.overlays.get_overlay(key);
        let mut document = match overlay {
            Some(overlay) if !overlay.mutation().is_patch() => Document::new_invalid(key.clone()),
            _ => self.persistence.remote_documents.get(key),
        };
        if let Some(overlay) = overlay {
            overlay
                .mutation()
                .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        }
        document
    }

    pub fn get_documents<'k>(
        &mut self,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> BTreeMap<DocumentKey, Document> {
        let documents = self.persistence.remote_documents.get_all(keys);
        self.get_local_view_of_documents(documents, &BTreeSet::new())
    }

    /// Applies overlays to `documents`. Keys in `existence_state_changed` whose
    /// overlay depends on the remote version get their overlay recomputed.
    pub fn get_local_view_of_documents(
        &mut self,
        documents: BTreeMap<DocumentKey, Document>,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Document> {
        self.compute_views(documents, existence_state_changed)
            .into_iter()
            .map(|(key, overlayed)| (key, overlayed.document))
            .collect()
    }

    /// Like [`Self::get_local_view_of_documents`] but keeps the mutated field
    /// masks, as needed when a new batch is layered on top.
    pub fn get_overlayed_documents(
        &mut self,
        documents: BTreeMap<DocumentKey, Document>,
    ) -> BTreeMap<DocumentKey, OverlayedDocument> {
        self.compute_views(documents, &BTreeSet::new())
    }

    fn compute_views(
        &mut self,
        documents: BTreeMap<DocumentKey, Document>,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, OverlayedDocument> {
        let overlays = self.persistence.overlays.get_overlays(documents.keys());
        let mut recalculate = BTreeMap::new();
        let mut results = BTreeMap::new();

        for (key, mut document) in documents {
            let overlay = overlays.get(&key);
            let depends_on_remote = overlay.map_or(true, |overlay| overlay.mutation().is_patch());
            if existence_state_changed.contains(&key) && depends_on_remote {
                recalculate.insert(key, document);
            } else if let Some(overlay) = overlay {
                let mask = overlay.mutation().field_mask();
                overlay.mutation().apply_to_local_view(
                    &mut document,
                    mask.clone(),
                    Timestamp::now(),
                );
                results.insert(key, OverlayedDocument::new(document, mask));
            } else {
                results.insert(key, OverlayedDocument::new(document, Some(FieldMask::empty())));
            }
        }

        let masks = self.recalculate_and_save_overlays(&mut recalculate);
        for (key, document) in recalculate {
            let mask = masks.get(&key).cloned().unwrap_or(Some(FieldMask::empty()));
            results.insert(key, OverlayedDocument::new(document, mask));
        }
        results
    }

    /// Replays every queued batch touching `documents` (updating them in
    /// place) and stores one overlay per key, tagged with the newest batch
    /// that changed it.
    pub fn recalculate_and_save_overlays(
        &mut self,
        documents: &mut BTreeMap<DocumentKey, Document>,
    ) -> BTreeMap<DocumentKey, Option<FieldMask>> {
        let batches = self
            .persistence
            .mutation_queue
            .get_all_mutation_batches_affecting_document_keys(documents.keys());

        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut keys_by_batch_id: BTreeMap<BatchId, BTreeSet<DocumentKey>> = BTreeMap::new();
        for batch in &batches {
            for key in batch.keys() {
                let Some(document) = documents.get_mut(&key) else {
                    continue;
                };
                let previous = masks.remove(&key).unwrap_or(Some(FieldMask::empty()));
                let mask = batch.apply_to_local_view(document, previous);
                masks.insert(key.clone(), mask);
                keys_by_batch_id
                    .entry(batch.batch_id())
                    .or_default()
                    .insert(key);
            }
        }

        let mut processed = BTreeSet::new();
        for (batch_id, keys) in keys_by_batch_id.into_iter().rev() {
            let mut overlays = BTreeMap::new();
            for key in keys {
                if !processed.insert(key.clone()) {
                    continue;
                }
                let (Some(document), Some(mask)) = (documents.get(&key), masks.get(&key)) else {
                    continue;
                };
                if let Some(overlay) = Mutation::calculate_overlay_mutation(document, mask.as_ref()) {
                    overlays.insert(key, overlay);
                }
            }
            self.persistence.overlays.save_overlays(batch_id, overlays);
        }
        masks
    }

    pub fn recalculate_and_save_overlays_for_keys(&mut self, keys: &BTreeSet<DocumentKey>) {
        let mut documents = self.persistence.remote_documents.get_all(keys);
        self.recalculate_and_save_overlays(&mut documents);
    }

    /// Every locally visible document matching `query` that changed after
    /// `offset`.
    pub fn get_documents_matching_query(
        &self,
        query: &Query,
        offset: IndexOffset,
    ) -> BTreeMap<DocumentKey, Document> {
        if query.is_document_query() {
            self.get_documents_matching_document_query(query)
        } else if let Some(collection_id) = query.collection_group_id() {
            self.get_documents_matching_collection_group_query(query, collection_id, offset)
        } else {
            self.get_documents_matching_collection_query(query, offset)
        }
    }

    fn get_documents_matching_document_query(&self, query: &Query) -> BTreeMap<DocumentKey, Document> {
        let Ok(key) = DocumentKey::from_path(query.path().clone()) else {
            return BTreeMap::new();
        };
        let document = self.get_document(&key);
        if document.is_found_document() {
            BTreeMap::from([(key, document)])
        } else {
            BTreeMap::new()
        }
    }

    fn get_documents_matching_collection_group_query(
        &self,
        query: &Query,
        collection_id: &str,
        offset: IndexOffset,
    ) -> BTreeMap<DocumentKey, Document> {
        let mut results = BTreeMap::new();
        for parent in self.persistence.index_manager.get_collection_parents(collection_id) {
            if !query.path().is_prefix_of(&parent) {
                continue;
            }
            let collection_query =
                query.as_collection_query_at_path(parent.append_segment(collection_id));
            results.extend(self.get_documents_matching_collection_query(&collection_query, offset));
        }
        results
    }

    fn get_documents_matching_collection_query(
        &self,
        query: &Query,
        offset: IndexOffset,
    ) -> BTreeMap<DocumentKey, Document> {
        let overlays = self
            .persistence
            .overlays
            .get_overlays_for_collection(query.path(), offset.largest_batch_id);
        let overlay_keys: BTreeSet<DocumentKey> = overlays.keys().cloned().collect();
        let mut documents = self.persistence.remote_documents.get_documents_matching_query(
            query,
            offset.read_time,
            &overlay_keys,
        );
        for key in overlays.keys() {
            if !documents.contains_key(key) {
                // Visible only through a local write, or not read since
                // `offset`.
                documents.insert(key.clone(), self.persistence.remote_documents.get(key));
            }
        }

        let now = Timestamp::now();
        documents
            .into_iter()
            .filter_map(|(key, mut document)| {
                if let Some(overlay) = overlays.get(&key) {
                    overlay
                        .mutation()
                        .apply_to_local_view(&mut document, Some(FieldMask::empty()), now);
                }
                query.matches(&document).then_some((key, document))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{FieldPath, ResourcePath};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn map(field: &str, value: i64) -> MapValue {
        MapValue::new(BTreeMap::from([(
            field.to_string(),
            FirestoreValue::from_integer(value),
        )]))
    }

    #[test]
    fn overlays_layer_on_top_of_remote_documents() {
        let mut persistence = MemoryPersistence::new();
        persistence.add_remote_document(
            &Document::new_found(key("rooms/a"), SnapshotVersion::from_micros(1), map("x", 1)),
            SnapshotVersion::from_micros(1),
        );
        let patch = Mutation::patch(
            key("rooms/a"),
            map("y", 2),
            FieldMask::from_paths([FieldPath::from_dot_separated("y").unwrap()]),
        );
        let set = Mutation::set(key("rooms/b"), map("x", 3));
        let batch = persistence.mutation_queue.add_mutation_batch(
            Timestamp::from_micros(1),
            Vec::new(),
            vec![patch, set],
        );

        let mut view = LocalDocumentsView::new(&mut persistence);
        view.recalculate_and_save_overlays_for_keys(&batch.keys());

        let a = view.get_document(&key("rooms/a"));
        assert!(a.has_local_mutations());
        assert_eq!(a.data(), &{
            let mut expected = map("x", 1);
            expected.set(&FieldPath::from_dot_separated("y").unwrap(), FirestoreValue::from_integer(2));
            expected
        });

        let query = Query::at_path(ResourcePath::from_segments(["rooms"]));
        let results = view.get_documents_matching_query(&query, IndexOffset::NONE);
        assert_eq!(results.len(), 2);
        assert!(results[&key("rooms/b")].has_local_mutations());
    }
}
