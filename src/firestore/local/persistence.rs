use log::debug;

use crate::firestore::config::SyncEngineSettings;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::journal::Transactional;
use crate::firestore::local::{
    ListenSequenceNumber, LruResults, MemoryBundleCache, MemoryDocumentOverlayCache,
    MemoryEagerReferenceDelegate, MemoryIndexManager, MemoryMutationQueue,
    MemoryRemoteDocumentCache, MemoryTargetCache, ReferenceSet, TargetData,
};
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion, TargetId};
use crate::util::hard_assert;

const LOG_TARGET: &str = "firestore::local::persistence";

/// Every cache of the local store, plus the reference bookkeeping that
/// decides which cached documents may be collected.
///
/// All changes go through [`MemoryPersistence::run_transaction`], which rolls
/// every cache back together when the transaction fails. Each cache journals
/// only the entries a transaction touches.
#[derive(Clone, Debug, Default)]
pub struct MemoryPersistence {
    pub mutation_queue: MemoryMutationQueue,
    pub remote_documents: MemoryRemoteDocumentCache,
    pub target_cache: MemoryTargetCache,
    pub overlays: MemoryDocumentOverlayCache,
    pub bundle_cache: MemoryBundleCache,
    pub index_manager: MemoryIndexManager,
    /// Documents currently shown by a local view, per target id.
    local_view_references: ReferenceSet,
    reference_delegate: MemoryEagerReferenceDelegate,
    current_sequence_number: ListenSequenceNumber,
    in_transaction: bool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `block` atomically: on `Err` every cache is restored to its state
    /// before the call. Transactions do not nest.
    pub fn run_transaction<T>(
        &mut self,
        action: &str,
        block: impl FnOnce(&mut Self) -> FirestoreResult<T>,
    ) -> FirestoreResult<T> {
        hard_assert(
            !self.in_transaction,
            format!("transaction {action} started inside another transaction"),
        );
        debug!(target: LOG_TARGET, "Starting transaction: {action}");
        let previous_sequence_number = self.current_sequence_number;
        self.current_sequence_number =
            self.current_sequence_number.max(self.target_cache.highest_listen_sequence_number()) + 1;
        self.in_transaction = true;
        self.for_each_cache(|cache| cache.begin());

        let result = block(self);
        match &result {
            Ok(_) => self.for_each_cache(|cache| cache.commit()),
            Err(error) => {
                debug!(target: LOG_TARGET, "Rolling back transaction {action}: {error}");
                self.for_each_cache(|cache| cache.rollback());
                self.current_sequence_number = previous_sequence_number;
            }
        }
        self.in_transaction = false;
        result
    }

    fn for_each_cache(&mut self, step: fn(&mut dyn Transactional)) {
        step(&mut self.mutation_queue);
        step(&mut self.remote_documents);
        step(&mut self.target_cache);
        step(&mut self.overlays);
        step(&mut self.bundle_cache);
        step(&mut self.index_manager);
        step(&mut self.local_view_references);
        step(&mut self.reference_delegate);
    }

    pub fn current_sequence_number(&self) -> ListenSequenceNumber {
        self.current_sequence_number
    }

    /// Stores `document` in the remote cache and records its collection for
    /// collection-group lookups.
    pub fn add_remote_document(&mut self, document: &Document, read_time: SnapshotVersion) {
        self.index_manager
            .add_to_collection_parent_index(&document.key().collection_path());
        self.remote_documents.add(document, read_time);
    }

    pub fn remove_remote_document(&mut self, key: &DocumentKey) {
        self.remote_documents.remove(key);
    }

    pub fn add_matching_keys<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey> + Clone,
        target_id: TargetId,
    ) {
        self.target_cache.add_matching_keys(keys.clone(), target_id);
        for key in keys {
            self.reference_delegate.add_reference(key);
        }
    }

    pub fn remove_matching_keys<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey> + Clone,
        target_id: TargetId,
    ) {
        self.target_cache.remove_matching_keys(keys.clone(), target_id);
        for key in keys {
            self.orphan_if_unreferenced(key);
        }
    }

    pub fn remove_matching_keys_for_target_id(&mut self, target_id: TargetId) {
        let released = self.target_cache.remove_matching_keys_for_target_id(target_id);
        for key in &released {
            self.orphan_if_unreferenced(key);
        }
    }

    /// Removes a target and releases the documents it was matching.
    pub fn remove_target(&mut self, target_data: &TargetData) {
        let released = self.target_cache.remove_target_data(target_data);
        for key in &released {
            self.orphan_if_unreferenced(key);
        }
    }

    pub fn add_local_view_references<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        target_id: TargetId,
    ) {
        for key in keys {
            self.local_view_references.add_reference(key.clone(), target_id);
            self.reference_delegate.add_reference(key);
        }
    }

    pub fn remove_local_view_references<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        target_id: TargetId,
    ) {
        for key in keys {
            self.local_view_references.remove_reference(key, target_id);
            self.orphan_if_unreferenced(key);
        }
    }

    pub fn remove_local_view_references_for_id(&mut self, target_id: TargetId) {
        let released = self.local_view_references.remove_references_for_id(target_id);
        for key in &released {
            self.orphan_if_unreferenced(key);
        }
    }

    /// Called for keys of a batch that left the mutation queue.
    pub fn remove_mutation_reference(&mut self, key: &DocumentKey) {
        self.orphan_if_unreferenced(key);
    }

    /// Limbo documents are only held by their resolution target; once that
    /// target resolves them they become collectable.
    pub fn update_limbo_document(&mut self, key: &DocumentKey) {
        self.orphan_if_unreferenced(key);
    }

    pub fn is_referenced(&self, key: &DocumentKey) -> bool {
        self.target_cache.contains_key(key)
            || self.local_view_references.contains_key(key)
            || self.mutation_queue.contains_key(key)
    }

    /// Drops the remote document cache and every cached target. Pending
    /// writes and their overlays survive.
    pub fn clear_remote_state(&mut self) {
        self.remote_documents.clear();
        self.target_cache.clear();
        self.local_view_references.remove_all_references();
        self.reference_delegate.clear();
    }

    /// Removes the oldest orphaned documents once the remote document cache
    /// outgrows `settings.cache_size_bytes`.
    pub fn collect_garbage(&mut self, settings: &SyncEngineSettings) -> LruResults {
        if !settings.gc_enabled() {
            debug!(target: LOG_TARGET, "Garbage collection skipped; disabled");
            return LruResults::DID_NOT_RUN;
        }
        let cache_size = self.remote_documents.byte_size();
        if cache_size < settings.cache_size_bytes {
            debug!(
                target: LOG_TARGET,
                "Garbage collection skipped; cache size {cache_size} is lower than threshold {}",
                settings.cache_size_bytes
            );
            return LruResults::DID_NOT_RUN;
        }

        let orphaned = self.reference_delegate.orphaned_count();
        let percentile = (orphaned * settings.gc_percentile_to_collect as usize).div_ceil(100);
        let to_collect = percentile.min(settings.gc_maximum_sequence_numbers_to_collect);
        let Some(upper_bound) = self.reference_delegate.nth_sequence_number(to_collect) else {
            return LruResults {
                did_run: true,
                ..LruResults::default()
            };
        };

        let candidates = self.reference_delegate.take_orphans_up_to(upper_bound);
        let sequence_numbers_collected = to_collect;
        let mut documents_removed = 0;
        for key in candidates {
            // A reference acquired after the key was orphaned keeps it alive.
            if self.is_referenced(&key) {
                continue;
            }
            if self.remote_documents.remove(&key).is_some() {
                documents_removed += 1;
            }
        }
        debug!(
            target: LOG_TARGET,
            "Garbage collection removed {documents_removed} documents up to sequence number {upper_bound}"
        );
        LruResults {
            did_run: true,
            sequence_numbers_collected,
            documents_removed,
        }
    }

    fn orphan_if_unreferenced(&mut self, key: &DocumentKey) {
        if !self.is_referenced(key) {
            self.reference_delegate
                .remove_reference(key, self.current_sequence_number);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::*;
    use crate::firestore::core::Query;
    use crate::firestore::error::aborted;
    use crate::firestore::local::QueryPurpose;
    use crate::firestore::model::{Mutation, ResourcePath, Timestamp};
    use crate::firestore::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn found(path: &str) -> Document {
        Document::new_found(key(path), SnapshotVersion::from_micros(1), MapValue::empty())
    }

    fn target_data(target_id: TargetId) -> TargetData {
        let collection = format!("rooms{target_id}");
        TargetData::new(
            Query::at_path(ResourcePath::from_segments([collection])).to_target(),
            target_id,
            QueryPurpose::Listen,
            1,
        )
    }

    #[test]
    fn failed_transaction_rolls_back_every_cache() {
        let mut persistence = MemoryPersistence::new();
        persistence
            .run_transaction("setup", |txn| {
                txn.add_remote_document(&found("rooms/kept"), SnapshotVersion::from_micros(1));
                txn.target_cache.add_target_data(target_data(2));
                txn.add_matching_keys([&key("rooms/kept")], 2);
                Ok(())
            })
            .unwrap();
        let sequence_number = persistence.current_sequence_number();

        let result: FirestoreResult<()> = persistence.run_transaction("write", |txn| {
            let batch = txn.mutation_queue.add_mutation_batch(
                Timestamp::from_micros(1),
                Vec::new(),
                vec![Mutation::delete(key("rooms/a"))],
            );
            txn.overlays.save_overlays(
                batch.batch_id(),
                BTreeMap::from([(key("rooms/a"), Mutation::delete(key("rooms/a")))]),
            );
            txn.add_remote_document(&found("rooms/a"), SnapshotVersion::from_micros(9));
            txn.remove_remote_document(&key("rooms/kept"));
            txn.remove_target(&target_data(2));
            txn.target_cache.add_target_data(target_data(4));
            txn.add_local_view_references([&key("rooms/a")], 4);
            Err(aborted("boom"))
        });

        assert!(result.is_err());
        assert!(persistence.mutation_queue.is_empty());
        assert!(persistence.overlays.get_overlay(&key("rooms/a")).is_none());
        assert!(!persistence.remote_documents.get(&key("rooms/a")).is_valid_document());
        assert!(persistence.remote_documents.get(&key("rooms/kept")).is_valid_document());
        assert_eq!(
            persistence.remote_documents.latest_read_time(),
            SnapshotVersion::from_micros(1)
        );
        assert!(persistence.target_cache.get_target_data_by_id(2).is_some());
        assert!(persistence.target_cache.get_target_data_by_id(4).is_none());
        assert_eq!(persistence.target_cache.highest_target_id(), 2);
        assert_eq!(
            persistence.target_cache.get_matching_keys_for_target_id(2),
            BTreeSet::from([key("rooms/kept")])
        );
        assert!(!persistence.is_referenced(&key("rooms/a")));
        assert_eq!(persistence.current_sequence_number(), sequence_number);

        // The next batch reuses the rolled-back id.
        let batch = persistence
            .run_transaction("retry", |txn| {
                Ok(txn.mutation_queue.add_mutation_batch(
                    Timestamp::from_micros(2),
                    Vec::new(),
                    vec![Mutation::delete(key("rooms/a"))],
                ))
            })
            .unwrap();
        assert_eq!(batch.batch_id(), 1);
    }

    #[test]
    fn committed_transaction_keeps_its_changes() {
        let mut persistence = MemoryPersistence::new();
        persistence
            .run_transaction("write", |txn| {
                txn.add_remote_document(&found("rooms/a"), SnapshotVersion::from_micros(1));
                txn.target_cache.add_target_data(target_data(2));
                Ok(())
            })
            .unwrap();
        let failed: FirestoreResult<()> =
            persistence.run_transaction("fail", |_| Err(aborted("boom")));
        assert!(failed.is_err());

        assert!(persistence.remote_documents.get(&key("rooms/a")).is_valid_document());
        assert!(persistence.target_cache.get_target_data_by_id(2).is_some());
    }

    #[test]
    #[should_panic(expected = "INTERNAL ASSERTION FAILED")]
    fn transactions_do_not_nest() {
        let mut persistence = MemoryPersistence::new();
        let _ = persistence.run_transaction("outer", |txn| {
            txn.run_transaction("inner", |_| Ok(()))
        });
    }

    #[test]
    fn collection_only_removes_unreferenced_documents_over_threshold() {
        let mut persistence = MemoryPersistence::new();
        persistence
            .run_transaction("setup", |txn| {
                txn.add_remote_document(&found("rooms/a"), SnapshotVersion::from_micros(1));
                txn.add_remote_document(&found("rooms/b"), SnapshotVersion::from_micros(1));
                txn.add_matching_keys([&key("rooms/a"), &key("rooms/b")], 2);
                txn.remove_matching_keys([&key("rooms/a"), &key("rooms/b")], 2);
                txn.add_local_view_references([&key("rooms/b")], 4);
                Ok(())
            })
            .unwrap();

        let disabled = SyncEngineSettings::default();
        assert_eq!(persistence.collect_garbage(&disabled), LruResults::DID_NOT_RUN);

        let mut eager = SyncEngineSettings::default().with_cache_size_bytes(0);
        eager.gc_percentile_to_collect = 100;
        let results = persistence.collect_garbage(&eager);
        assert!(results.did_run);
        assert_eq!(results.documents_removed, 1);
        assert!(!persistence.remote_documents.get(&key("rooms/a")).is_valid_document());
        assert!(persistence.remote_documents.get(&key("rooms/b")).is_valid_document());
    }
}
