use std::collections::BTreeSet;

use crate::firestore::core::Query;
use crate::firestore::local::journal::{Saved, Transactional, UndoLog};
use crate::firestore::model::{
    BasePath, BatchId, DocumentKey, Mutation, MutationBatch, ResourcePath, Timestamp,
    BATCH_ID_UNKNOWN,
};
use crate::util::{fail, hard_assert};

/// In-memory log of local write batches that the backend has not yet
/// acknowledged.
#[derive(Clone, Debug)]
pub struct MemoryMutationQueue {
    /// Sorted by batch id. Acknowledged batches may be removed from anywhere.
    queue: Vec<MutationBatch>,
    next_batch_id: BatchId,
    /// (key path, batch id) pairs so that both single keys and collection
    /// prefixes resolve to batches without scanning the queue.
    batches_by_document_key: BTreeSet<(ResourcePath, BatchId)>,
    last_stream_token: Vec<u8>,
    /// Queue edits since `begin`, undone in reverse.
    queue_changes: Option<Vec<QueueChange>>,
    key_index_undo: UndoLog<(ResourcePath, BatchId), ()>,
    saved: Saved<(BatchId, Vec<u8>)>,
}

#[derive(Clone, Debug)]
enum QueueChange {
    Pushed,
    Removed(usize, MutationBatch),
}

impl Default for MemoryMutationQueue {
    fn default() -> Self {
        Self {
            queue: Vec::new(),
            next_batch_id: 1,
            batches_by_document_key: BTreeSet::new(),
            last_stream_token: Vec::new(),
            queue_changes: None,
            key_index_undo: UndoLog::default(),
            saved: Saved::default(),
        }
    }
}

impl MemoryMutationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn last_stream_token(&self) -> &[u8] {
        &self.last_stream_token
    }

    pub fn set_last_stream_token(&mut self, stream_token: Vec<u8>) {
        self.last_stream_token = stream_token;
    }

    /// Records the backend's acknowledgement of `batch`, which must be the
    /// first batch in the queue.
    pub fn acknowledge_batch(&mut self, batch: &MutationBatch, stream_token: Vec<u8>) {
        let index = self.index_of_existing_batch_id(batch.batch_id(), "acknowledged");
        hard_assert(index == 0, "can only acknowledge the first batch in the mutation queue");
        self.last_stream_token = stream_token;
    }

    pub fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> MutationBatch {
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;

        if let Some(last) = self.queue.last() {
            hard_assert(
                last.batch_id() < batch_id,
                "mutation batch ids must be monotonically increasing",
            );
        }

        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        for mutation in batch.mutations() {
            let entry = (mutation.key().path().clone(), batch_id);
            self.key_index_undo
                .record_member(&self.batches_by_document_key, &entry);
            self.batches_by_document_key.insert(entry);
        }
        self.queue.push(batch.clone());
        if let Some(changes) = self.queue_changes.as_mut() {
            changes.push(QueueChange::Pushed);
        }
        batch
    }

    pub fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        let index = self.index_of_batch_id(batch_id)?;
        self.queue.get(index)
    }

    /// The first batch with an id greater than `batch_id`.
    pub fn get_next_mutation_batch_after_batch_id(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        let start = self
            .queue
            .partition_point(|batch| batch.batch_id() <= batch_id);
        self.queue.get(start)
    }

    /// `BATCH_ID_UNKNOWN` when the queue is empty.
    pub fn get_highest_unacknowledged_batch_id(&self) -> BatchId {
        self.queue
            .last()
            .map_or(BATCH_ID_UNKNOWN, MutationBatch::batch_id)
    }

    pub fn get_all_mutation_batches(&self) -> &[MutationBatch] {
        &self.queue
    }

    pub fn get_all_mutation_batches_affecting_document_key(
        &self,
        key: &DocumentKey,
    ) -> Vec<MutationBatch> {
        let batch_ids: BTreeSet<BatchId> = self
            .batch_ids_with_prefix(key.path())
            .filter(|(path, _)| *path == key.path())
            .map(|(_, batch_id)| batch_id)
            .collect();
        self.batches_from_ids(batch_ids)
    }

    /// Batches touching any of `keys`, ordered by batch id.
    pub fn get_all_mutation_batches_affecting_document_keys<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
    ) -> Vec<MutationBatch> {
        let mut batch_ids = BTreeSet::new();
        for key in keys {
            batch_ids.extend(
                self.batch_ids_with_prefix(key.path())
                    .filter(|(path, _)| *path == key.path())
                    .map(|(_, batch_id)| batch_id),
            );
        }
        self.batches_from_ids(batch_ids)
    }

    /// Batches touching a document directly inside the query's collection.
    pub fn get_all_mutation_batches_affecting_query(&self, query: &Query) -> Vec<MutationBatch> {
        hard_assert(
            !query.is_collection_group_query(),
            "collection group queries must be split into collection queries first",
        );
        let prefix = query.path();
        let immediate_children_length = prefix.len() + 1;
        let batch_ids: BTreeSet<BatchId> = self
            .batch_ids_with_prefix(prefix)
            .filter(|(path, _)| path.len() == immediate_children_length)
            .map(|(_, batch_id)| batch_id)
            .collect();
        self.batches_from_ids(batch_ids)
    }

    /// Removing a batch that is no longer queued is a no-op.
    pub fn remove_mutation_batch(&mut self, batch: &MutationBatch) {
        let Some(index) = self.index_of_batch_id(batch.batch_id()) else {
            return;
        };
        let removed = self.queue.remove(index);
        for mutation in removed.mutations() {
            let entry = (mutation.key().path().clone(), removed.batch_id());
            self.key_index_undo
                .record_member(&self.batches_by_document_key, &entry);
            self.batches_by_document_key.remove(&entry);
        }
        if let Some(changes) = self.queue_changes.as_mut() {
            changes.push(QueueChange::Removed(index, removed));
        }
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.batch_ids_with_prefix(key.path())
            .next()
            .is_some_and(|(path, _)| path == key.path())
    }

    /// Index entries whose path starts with `prefix`, in path order.
    fn batch_ids_with_prefix<'a>(
        &'a self,
        prefix: &'a ResourcePath,
    ) -> impl Iterator<Item = (&'a ResourcePath, BatchId)> + 'a {
        self.batches_by_document_key
            .range((prefix.clone(), BatchId::MIN)..)
            .take_while(move |(path, _)| prefix.is_prefix_of(path))
            .map(|(path, batch_id)| (path, *batch_id))
    }

    fn batches_from_ids(&self, batch_ids: BTreeSet<BatchId>) -> Vec<MutationBatch> {
        batch_ids
            .into_iter()
            .filter_map(|batch_id| self.lookup_mutation_batch(batch_id).cloned())
            .collect()
    }

    fn index_of_batch_id(&self, batch_id: BatchId) -> Option<usize> {
        self.queue
            .binary_search_by_key(&batch_id, MutationBatch::batch_id)
            .ok()
    }

    fn index_of_existing_batch_id(&self, batch_id: BatchId, action: &str) -> usize {
        match self.index_of_batch_id(batch_id) {
            Some(index) => index,
            None => fail(format!("batch {batch_id} cannot be {action}: not in queue")),
        }
    }
}

impl Transactional for MemoryMutationQueue {
    fn begin(&mut self) {
        self.queue_changes = Some(Vec::new());
        self.key_index_undo.begin();
        self.saved
            .save(&(self.next_batch_id, self.last_stream_token.clone()));
    }

    fn commit(&mut self) {
        self.queue_changes = None;
        self.key_index_undo.commit();
        self.saved.discard();
    }

    fn rollback(&mut self) {
        for change in self.queue_changes.take().unwrap_or_default().into_iter().rev() {
            match change {
                QueueChange::Pushed => {
                    self.queue.pop();
                }
                QueueChange::Removed(index, batch) => self.queue.insert(index, batch),
            }
        }
        self.key_index_undo
            .rollback_set(&mut self.batches_by_document_key);
        let mut scalars = (self.next_batch_id, std::mem::take(&mut self.last_stream_token));
        self.saved.restore(&mut scalars);
        (self.next_batch_id, self.last_stream_token) = scalars;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn add_set(queue: &mut MemoryMutationQueue, paths: &[&str]) -> MutationBatch {
        let mutations = paths
            .iter()
            .map(|path| Mutation::set(key(path), MapValue::empty()))
            .collect();
        queue.add_mutation_batch(Timestamp::from_micros(1), Vec::new(), mutations)
    }

    #[test]
    fn batch_ids_are_monotonic_and_removal_is_idempotent() {
        let mut queue = MemoryMutationQueue::new();
        assert_eq!(queue.get_highest_unacknowledged_batch_id(), BATCH_ID_UNKNOWN);

        let first = add_set(&mut queue, &["rooms/a"]);
        let second = add_set(&mut queue, &["rooms/b"]);
        assert_eq!(first.batch_id(), 1);
        assert_eq!(second.batch_id(), 2);
        assert_eq!(queue.get_highest_unacknowledged_batch_id(), 2);

        queue.remove_mutation_batch(&second);
        queue.remove_mutation_batch(&second);
        assert_eq!(queue.get_all_mutation_batches().len(), 1);
        assert!(!queue.contains_key(&key("rooms/b")));

        let third = add_set(&mut queue, &["rooms/c"]);
        assert_eq!(third.batch_id(), 3);
    }

    #[test]
    fn next_batch_skips_removed_ids() {
        let mut queue = MemoryMutationQueue::new();
        let first = add_set(&mut queue, &["rooms/a"]);
        let second = add_set(&mut queue, &["rooms/b"]);
        let third = add_set(&mut queue, &["rooms/c"]);
        queue.remove_mutation_batch(&second);

        let next = queue.get_next_mutation_batch_after_batch_id(first.batch_id());
        assert_eq!(next.map(MutationBatch::batch_id), Some(third.batch_id()));
        assert!(queue
            .get_next_mutation_batch_after_batch_id(third.batch_id())
            .is_none());
        assert_eq!(
            queue
                .get_next_mutation_batch_after_batch_id(BATCH_ID_UNKNOWN)
                .map(MutationBatch::batch_id),
            Some(1)
        );
    }

    #[test]
    fn key_lookup_returns_exactly_the_touching_batches_in_order() {
        let mut queue = MemoryMutationQueue::new();
        let paths: Vec<String> = (0..10).map(|i| format!("rooms/{i}")).collect();
        for path in &paths {
            add_set(&mut queue, &[path.as_str()]);
        }
        add_set(&mut queue, &["rooms/7", "rooms/2"]);

        let wanted = [key("rooms/7"), key("rooms/2"), key("rooms/missing")];
        let ids: Vec<BatchId> = queue
            .get_all_mutation_batches_affecting_document_keys(&wanted)
            .iter()
            .map(MutationBatch::batch_id)
            .collect();
        assert_eq!(ids, vec![3, 8, 11]);
    }

    #[test]
    fn query_lookup_only_returns_immediate_children() {
        let mut queue = MemoryMutationQueue::new();
        let direct = add_set(&mut queue, &["rooms/a"]);
        add_set(&mut queue, &["rooms/a/messages/m"]);
        add_set(&mut queue, &["roomsx/a"]);

        let query = Query::at_path(ResourcePath::from_segments(["rooms"]));
        let batches = queue.get_all_mutation_batches_affecting_query(&query);
        let ids: Vec<BatchId> = batches.iter().map(MutationBatch::batch_id).collect();
        assert_eq!(ids, vec![direct.batch_id()]);
    }

    #[test]
    fn rollback_restores_queue_order_and_next_id() {
        let mut queue = MemoryMutationQueue::new();
        let first = add_set(&mut queue, &["rooms/a"]);
        let second = add_set(&mut queue, &["rooms/b"]);

        queue.begin();
        queue.remove_mutation_batch(&first);
        add_set(&mut queue, &["rooms/c"]);
        queue.remove_mutation_batch(&second);
        queue.set_last_stream_token(b"token".to_vec());
        queue.rollback();

        let ids: Vec<BatchId> = queue
            .get_all_mutation_batches()
            .iter()
            .map(MutationBatch::batch_id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(queue.contains_key(&key("rooms/a")));
        assert!(!queue.contains_key(&key("rooms/c")));
        assert!(queue.last_stream_token().is_empty());
        assert_eq!(add_set(&mut queue, &["rooms/d"]).batch_id(), 3);
    }
}
