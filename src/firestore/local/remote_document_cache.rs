use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use crate::firestore::core::Query;
use crate::firestore::local::journal::{Saved, Transactional, UndoLog};
use crate::firestore::model::{BasePath, Document, DocumentKey, ResourcePath, SnapshotVersion};

/// Last known server version of every cached document, keyed by path so a
/// collection is a contiguous range.
#[derive(Clone, Debug, Default)]
pub struct MemoryRemoteDocumentCache {
    documents: BTreeMap<DocumentKey, Document>,
    byte_size: i64,
    /// Newest read time ever stored. Never lowered by removals.
    latest_read_time: SnapshotVersion,
    undo: UndoLog<DocumentKey, Document>,
    saved: Saved<(i64, SnapshotVersion)>,
}

impl MemoryRemoteDocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn add(&mut self, document: &Document, read_time: SnapshotVersion) {
        let mut stored = document.clone();
        stored.set_read_time(read_time);
        self.undo.record(&self.documents, stored.key());
        self.byte_size += stored.estimated_size() as i64;
        self.latest_read_time = self.latest_read_time.max(read_time);
        if let Some(previous) = self.documents.insert(stored.key().clone(), stored) {
            self.byte_size -= previous.estimated_size() as i64;
        }
    }

    pub fn remove(&mut self, key: &DocumentKey) -> Option<Document> {
        self.undo.record(&self.documents, key);
        let removed = self.documents.remove(key)?;
        self.byte_size -= removed.estimated_size() as i64;
        Some(removed)
    }

    /// The cached document, or an invalid placeholder on a miss.
    pub fn get(&self, key: &DocumentKey) -> Document {
        self.documents
            .get(key)
            .cloned()
            .unwrap_or_else(|| Document::new_invalid(key.clone()))
    }

    pub fn get_all<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
    ) -> BTreeMap<DocumentKey, Document> {
        keys.into_iter()
            .map(|key| (key.clone(), self.get(key)))
            .collect()
    }

    /// Documents directly inside `collection` read after `since_read_time`.
    pub fn get_all_in_collection(
        &self,
        collection: &ResourcePath,
        since_read_time: SnapshotVersion,
    ) -> BTreeMap<DocumentKey, Document> {
        self.collection_range(collection)
            .filter(|document| document.read_time() > since_read_time)
            .map(|document| (document.key().clone(), document.clone()))
            .collect()
    }

    /// Documents in the query's collection that changed after
    /// `since_read_time` and either match the query or have pending local
    /// changes (which may make them match once overlays are applied).
    pub fn get_documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
        mutated_keys: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Document> {
        self.collection_range(query.path())
            .filter(|document| document.read_time() > since_read_time)
            .filter(|document| mutated_keys.contains(document.key()) || query.matches(document))
            .map(|document| (document.key().clone(), document.clone()))
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.documents.keys()
    }

    pub fn byte_size(&self) -> i64 {
        self.byte_size
    }

    /// No cached document was read after this version.
    pub fn latest_read_time(&self) -> SnapshotVersion {
        self.latest_read_time
    }

    pub fn clear(&mut self) {
        self.undo.record_all(&self.documents);
        self.documents.clear();
        self.byte_size = 0;
        self.latest_read_time = SnapshotVersion::NONE;
    }

    /// Every document directly inside `collection`, in key order.
    pub fn collection_documents<'a: 'c, 'c>(
        &'a self,
        collection: &'c ResourcePath,
    ) -> impl Iterator<Item = &'a Document> + 'c {
        self.collection_range(collection)
    }

    fn collection_range<'a: 'c, 'c>(
        &'a self,
        collection: &'c ResourcePath,
    ) -> impl Iterator<Item = &'a Document> + 'c {
        self.documents
            .range::<ResourcePath, _>((Bound::Excluded(collection), Bound::Unbounded))
            .take_while(move |(key, _)| collection.is_prefix_of(key.path()))
            .filter(move |(key, _)| collection.is_immediate_parent_of(key.path()))
            .map(|(_, document)| document)
    }
}

impl Transactional for MemoryRemoteDocumentCache {
    fn begin(&mut self) {
        self.undo.begin();
        self.saved.save(&(self.byte_size, self.latest_read_time));
    }

    fn commit(&mut self) {
        self.undo.commit();
        self.saved.discard();
    }

    fn rollback(&mut self) {
        self.undo.rollback(&mut self.documents);
        let mut scalars = (self.byte_size, self.latest_read_time);
        self.saved.restore(&mut scalars);
        (self.byte_size, self.latest_read_time) = scalars;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::value::MapValue;

    fn found(path: &str, version: i64) -> Document {
        Document::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(version),
            MapValue::empty(),
        )
    }

    #[test]
    fn collection_scan_respects_read_time_and_nesting() {
        let mut cache = MemoryRemoteDocumentCache::new();
        cache.add(&found("rooms/a", 1), SnapshotVersion::from_micros(1));
        cache.add(&found("rooms/b", 2), SnapshotVersion::from_micros(5));
        cache.add(&found("rooms/b/messages/m", 2), SnapshotVersion::from_micros(5));
        cache.add(&found("roomz/c", 2), SnapshotVersion::from_micros(5));

        let rooms = ResourcePath::from_segments(["rooms"]);
        assert_eq!(cache.get_all_in_collection(&rooms, SnapshotVersion::NONE).len(), 2);
        let newer = cache.get_all_in_collection(&rooms, SnapshotVersion::from_micros(1));
        assert_eq!(newer.keys().map(ToString::to_string).collect::<Vec<_>>(), vec!["rooms/b"]);

        let missing = DocumentKey::from_string("rooms/zz").unwrap();
        assert!(!cache.get(&missing).is_valid_document());
    }

    #[test]
    fn rollback_restores_documents_and_size() {
        let mut cache = MemoryRemoteDocumentCache::new();
        cache.add(&found("rooms/a", 1), SnapshotVersion::from_micros(1));
        let size = cache.byte_size();
        assert!(size > 0);

        cache.begin();
        cache.remove(&DocumentKey::from_string("rooms/a").unwrap());
        cache.add(&found("rooms/b", 9), SnapshotVersion::from_micros(9));
        assert_eq!(cache.latest_read_time(), SnapshotVersion::from_micros(9));
        cache.rollback();

        assert_eq!(cache.keys().map(ToString::to_string).collect::<Vec<_>>(), vec!["rooms/a"]);
        assert_eq!(cache.byte_size(), size);
        assert_eq!(cache.latest_read_time(), SnapshotVersion::from_micros(1));
    }

    #[test]
    fn latest_read_time_is_raised_by_adds_and_kept_after_removal() {
        let mut cache = MemoryRemoteDocumentCache::new();
        assert_eq!(cache.latest_read_time(), SnapshotVersion::NONE);
        cache.add(&found("rooms/a", 1), SnapshotVersion::from_micros(7));
        cache.add(&found("rooms/b", 1), SnapshotVersion::from_micros(3));
        assert_eq!(cache.latest_read_time(), SnapshotVersion::from_micros(7));

        cache.remove(&DocumentKey::from_string("rooms/a").unwrap());
        assert_eq!(cache.latest_read_time(), SnapshotVersion::from_micros(7));

        cache.clear();
        assert_eq!(cache.latest_read_time(), SnapshotVersion::NONE);
        assert_eq!(cache.byte_size(), 0);
    }
}
