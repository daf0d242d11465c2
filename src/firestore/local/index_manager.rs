use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::firestore::core::{Direction, Filter, Operator, Target};
use crate::firestore::local::journal::{Saved, Transactional, UndoLog};
use crate::firestore::local::MemoryRemoteDocumentCache;
use crate::firestore::model::{
    BasePath, Document, DocumentKey, FieldIndex, IndexKind, IndexSegment, ResourcePath,
};
use crate::firestore::value::FirestoreValue;
use crate::util::hard_assert;

const LOG_TARGET: &str = "firestore::local::index_manager";

/// Collection-parent index plus client-side field indexes.
///
/// Field index entries are not materialized; a scan computes each document's
/// entry from the remote document cache and keeps those inside the target's
/// lower and upper bounds.
#[derive(Clone, Debug, Default)]
pub struct MemoryIndexManager {
    /// (collection id, parent path) pairs.
    collection_parents: BTreeSet<(String, ResourcePath)>,
    field_indexes: BTreeMap<i32, FieldIndex>,
    next_index_id: i32,
    parents_undo: UndoLog<(String, ResourcePath), ()>,
    field_indexes_undo: UndoLog<i32, FieldIndex>,
    saved_next_index_id: Saved<i32>,
}

impl MemoryIndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_to_collection_parent_index(&mut self, collection_path: &ResourcePath) {
        hard_assert(
            collection_path.len() % 2 == 1,
            format!("expected a collection path, got {collection_path}"),
        );
        let Some(collection_id) = collection_path.last_segment() else {
            return;
        };
        let entry = (collection_id.to_string(), collection_path.without_last());
        if self.collection_parents.contains(&entry) {
            return;
        }
        self.parents_undo
            .record_member(&self.collection_parents, &entry);
        self.collection_parents.insert(entry);
    }

    /// Paths of every document known to contain a `collection_id` collection.
    pub fn get_collection_parents(&self, collection_id: &str) -> Vec<ResourcePath> {
        self.collection_parents
            .range((collection_id.to_string(), ResourcePath::root())..)
            .take_while(|(id, _)| id == collection_id)
            .map(|(_, parent)| parent.clone())
            .collect()
    }

    /// Registers `index` and returns it with its assigned id.
    pub fn add_field_index(&mut self, index: FieldIndex) -> FieldIndex {
        self.next_index_id += 1;
        let index = index.with_index_id(self.next_index_id);
        debug!(
            target: LOG_TARGET,
            "Adding field index {} on {}",
            index.index_id(),
            index.collection_group()
        );
        self.field_indexes_undo
            .record(&self.field_indexes, &index.index_id());
        self.field_indexes.insert(index.index_id(), index.clone());
        index
    }

    pub fn delete_field_index(&mut self, index: &FieldIndex) {
        self.field_indexes_undo
            .record(&self.field_indexes, &index.index_id());
        self.field_indexes.remove(&index.index_id());
    }

    pub fn get_field_indexes(&self, collection_group: &str) -> Vec<&FieldIndex> {
        self.field_indexes
            .values()
            .filter(|index| index.collection_group() == collection_group)
            .collect()
    }

    /// The index with the most segments that can serve `target`, if any.
    pub fn get_field_index(&self, target: &Target) -> Option<&FieldIndex> {
        if !is_indexable(target) {
            return None;
        }
        let collection_group = target_collection_group(target)?;
        self.get_field_indexes(collection_group)
            .into_iter()
            .filter(|index| serves_target(index, target))
            .max_by_key(|index| index.segments().len())
    }

    /// Keys of documents whose index entry lies within the target's bounds,
    /// or `None` when no index serves the target. Callers still apply the
    /// full query predicate to the returned documents.
    pub fn get_documents_matching_target(
        &self,
        target: &Target,
        documents: &MemoryRemoteDocumentCache,
    ) -> Option<BTreeSet<DocumentKey>> {
        let index = self.get_field_index(target)?;
        let lower = target.lower_bound(index);
        let upper = target.upper_bound(index);
        let array_values = array_filter_values(target, index);

        let keys = self
            .documents_in_target_scope(target, documents)
            .into_iter()
            .filter(|document| document.is_found_document())
            .filter(|document| {
                let Some(entry) = index_entry(index, document) else {
                    return false;
                };
                lower.admits_as_lower(&entry) && upper.admits_as_upper(&entry)
            })
            .filter(|document| contains_array_value(index, document, &array_values))
            .map(|document| document.key().clone())
            .collect();
        Some(keys)
    }

    /// Only the collections the target can read from are scanned.
    fn documents_in_target_scope<'a>(
        &self,
        target: &Target,
        documents: &'a MemoryRemoteDocumentCache,
    ) -> Vec<&'a Document> {
        let Some(group) = target.collection_group() else {
            return documents.collection_documents(target.path()).collect();
        };
        let mut scoped = Vec::new();
        for parent in self.get_collection_parents(group) {
            if !target.path().is_prefix_of(&parent) {
                continue;
            }
            let collection = parent.append_segment(group);
            scoped.extend(documents.collection_documents(&collection));
        }
        scoped
    }
}

impl Transactional for MemoryIndexManager {
    fn begin(&mut self) {
        self.parents_undo.begin();
        self.field_indexes_undo.begin();
        self.saved_next_index_id.save(&self.next_index_id);
    }

    fn commit(&mut self) {
        self.parents_undo.commit();
        self.field_indexes_undo.commit();
        self.saved_next_index_id.discard();
    }

    fn rollback(&mut self) {
        self.parents_undo.rollback_set(&mut self.collection_parents);
        self.field_indexes_undo.rollback(&mut self.field_indexes);
        self.saved_next_index_id.restore(&mut self.next_index_id);
    }
}

fn target_collection_group(target: &Target) -> Option<&str> {
    target
        .collection_group()
        .or_else(|| target.path().last_segment())
}

/// Disjunctions and multi-value operators would need one scan per value.
fn is_indexable(target: &Target) -> bool {
    !target.is_document_query()
        && target.filters().iter().all(|filter| match filter {
            Filter::Field(_) => true,
            Filter::Composite(composite) => composite.is_flat_conjunction(),
        })
        && target.filters().iter().flat_map(Filter::flattened_filters).all(|filter| {
            !matches!(
                filter.op(),
                Operator::In | Operator::NotIn | Operator::ArrayContainsAny
            )
        })
}

/// Equality-filtered segments first, then the inequality field, then the
/// remaining order-bys in order and direction.
fn serves_target(index: &FieldIndex, target: &Target) -> bool {
    let filters: Vec<_> = target
        .filters()
        .iter()
        .flat_map(Filter::flattened_filters)
        .collect();

    if let Some(array_segment) = index.array_segment() {
        let has_array_filter = filters.iter().any(|filter| {
            filter.op() == Operator::ArrayContains && filter.field() == &array_segment.field_path
        });
        if !has_array_filter {
            return false;
        }
    }

    let equality_fields: BTreeSet<_> = filters
        .iter()
        .filter(|filter| filter.op() == Operator::Equal)
        .map(|filter| filter.field())
        .collect();
    let inequality_field = filters
        .iter()
        .find(|filter| filter.is_inequality())
        .map(|filter| filter.field());

    let segments: Vec<&IndexSegment> = index.directional_segments().collect();
    let mut position = 0;
    while position < segments.len() && equality_fields.contains(&segments[position].field_path) {
        position += 1;
    }
    if position == segments.len() {
        return true;
    }

    let mut order_bys = target
        .order_by()
        .iter()
        .filter(|order| !order.field().is_key_field())
        .filter(|order| !equality_fields.contains(order.field()))
        .peekable();

    if let Some(inequality_field) = inequality_field {
        if !equality_fields.contains(inequality_field) {
            let segment = segments[position];
            if &segment.field_path != inequality_field {
                return false;
            }
            let Some(order) = order_bys.next() else {
                return false;
            };
            if order.field() != inequality_field || !direction_matches(segment.kind, order.direction()) {
                return false;
            }
            position += 1;
        }
    }

    for segment in &segments[position..] {
        match order_bys.next() {
            Some(order)
                if order.field() == &segment.field_path
                    && direction_matches(segment.kind, order.direction()) => {}
            _ => return false,
        }
    }
    true
}

fn direction_matches(kind: IndexKind, direction: Direction) -> bool {
    matches!(
        (kind, direction),
        (IndexKind::Ascending, Direction::Ascending) | (IndexKind::Descending, Direction::Descending)
    )
}

fn index_entry(index: &FieldIndex, document: &Document) -> Option<Vec<FirestoreValue>> {
    index
        .directional_segments()
        .map(|segment| document.field(&segment.field_path).cloned())
        .collect()
}

fn array_filter_values(target: &Target, index: &FieldIndex) -> Vec<FirestoreValue> {
    let Some(segment) = index.array_segment() else {
        return Vec::new();
    };
    target
        .field_filters_for_path(&segment.field_path)
        .into_iter()
        .filter(|filter| filter.op() == Operator::ArrayContains)
        .map(|filter| filter.value().clone())
        .collect()
}

fn contains_array_value(index: &FieldIndex, document: &Document, values: &[FirestoreValue]) -> bool {
    let Some(segment) = index.array_segment() else {
        return true;
    };
    let Some(array) = document
        .field(&segment.field_path)
        .and_then(FirestoreValue::as_array)
    else {
        return false;
    };
    values.iter().all(|value| array.contains(value))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::firestore::core::{FieldFilter, OrderBy, Query};
    use crate::firestore::model::{FieldPath, SnapshotVersion};
    use crate::firestore::value::MapValue;

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn doc(path: &str, a: i64) -> Document {
        Document::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            MapValue::new(BTreeMap::from([(
                "a".to_string(),
                FirestoreValue::from_integer(a),
            )])),
        )
    }

    #[test]
    fn collection_parents_are_recorded_per_collection_id() {
        let mut manager = MemoryIndexManager::new();
        manager.add_to_collection_parent_index(&ResourcePath::from_segments(["rooms", "r1", "messages"]));
        manager.add_to_collection_parent_index(&ResourcePath::from_segments(["rooms", "r2", "messages"]));
        manager.add_to_collection_parent_index(&ResourcePath::from_segments(["messages"]));
        assert_eq!(manager.get_collection_parents("messages").len(), 3);
        assert!(manager.get_collection_parents("users").is_empty());
    }

    #[test]
    fn range_scan_uses_filter_bounds() {
        let mut manager = MemoryIndexManager::new();
        manager.add_field_index(FieldIndex::new(
            "rooms",
            vec![IndexSegment::new(field("a"), IndexKind::Ascending)],
        ));

        let mut cache = MemoryRemoteDocumentCache::new();
        for (path, a) in [("rooms/x", 1), ("rooms/y", 5), ("rooms/z", 9)] {
            cache.add(&doc(path, a), SnapshotVersion::from_micros(1));
        }

        let filter = FieldFilter::new(field("a"), Operator::GreaterThan, FirestoreValue::from_integer(1)).unwrap();
        let target = Query::at_path(ResourcePath::from_segments(["rooms"]))
            .with_filter(filter)
            .to_target();
        let keys = manager.get_documents_matching_target(&target, &cache).unwrap();
        let keys: Vec<String> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(keys, vec!["rooms/y", "rooms/z"]);
    }

    #[test]
    fn index_must_follow_order_by_direction() {
        let mut manager = MemoryIndexManager::new();
        manager.add_field_index(FieldIndex::new(
            "rooms",
            vec![IndexSegment::new(field("a"), IndexKind::Ascending)],
        ));
        let descending = Query::at_path(ResourcePath::from_segments(["rooms"]))
            .with_order_by(OrderBy::descending(field("a")))
            .to_target();
        assert!(manager.get_field_index(&descending).is_none());

        let ascending = Query::at_path(ResourcePath::from_segments(["rooms"]))
            .with_order_by(OrderBy::ascending(field("a")))
            .to_target();
        assert!(manager.get_field_index(&ascending).is_some());
    }

    #[test]
    fn collection_group_scan_reads_only_indexed_parents_under_the_query_path() {
        let mut manager = MemoryIndexManager::new();
        manager.add_field_index(FieldIndex::new(
            "messages",
            vec![IndexSegment::new(field("a"), IndexKind::Ascending)],
        ));

        let mut cache = MemoryRemoteDocumentCache::new();
        for (path, a) in [
            ("rooms/r1/messages/m1", 3),
            ("rooms/r2/messages/m2", 4),
            ("users/u1/messages/m3", 5),
            ("rooms/r1/notes/n1", 6),
        ] {
            let document = doc(path, a);
            manager.add_to_collection_parent_index(&document.key().collection_path());
            cache.add(&document, SnapshotVersion::from_micros(1));
        }

        let filter = FieldFilter::new(field("a"), Operator::GreaterThan, FirestoreValue::from_integer(0)).unwrap();
        let everywhere = Query::collection_group(ResourcePath::root(), "messages")
            .with_filter(filter.clone())
            .to_target();
        let keys = manager.get_documents_matching_target(&everywhere, &cache).unwrap();
        assert_eq!(keys.len(), 3);

        let under_rooms = Query::collection_group(ResourcePath::from_segments(["rooms"]), "messages")
            .with_filter(filter)
            .to_target();
        let keys: Vec<String> = manager
            .get_documents_matching_target(&under_rooms, &cache)
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(keys, vec!["rooms/r1/messages/m1", "rooms/r2/messages/m2"]);
    }

    #[test]
    fn rollback_forgets_parents_and_indexes_added_in_the_transaction() {
        let mut manager = MemoryIndexManager::new();
        manager.add_to_collection_parent_index(&ResourcePath::from_segments(["rooms", "r1", "messages"]));

        manager.begin();
        manager.add_to_collection_parent_index(&ResourcePath::from_segments(["rooms", "r2", "messages"]));
        manager.add_to_collection_parent_index(&ResourcePath::from_segments(["rooms", "r1", "messages"]));
        manager.add_field_index(FieldIndex::new(
            "rooms",
            vec![IndexSegment::new(field("a"), IndexKind::Ascending)],
        ));
        manager.rollback();

        assert_eq!(manager.get_collection_parents("messages").len(), 1);
        assert!(manager.get_field_indexes("rooms").is_empty());
        let index = manager.add_field_index(FieldIndex::new(
            "rooms",
            vec![IndexSegment::new(field("a"), IndexKind::Ascending)],
        ));
        assert_eq!(index.index_id(), 1);
    }
}
