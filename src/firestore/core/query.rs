use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use crate::firestore::core::{Bound, Direction, Filter, OrderBy, Target};
use crate::firestore::model::{BasePath, Document, DocumentKey, FieldPath, ResourcePath};
use crate::util::hard_assert;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum LimitType {
    #[default]
    LimitToFirst,
    LimitToLast,
}

/// A user-facing query: everything a [`Target`] carries plus the explicit
/// ordering and the limit type.
#[derive(Clone, Debug)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<Filter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<i64>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
    normalized_order_by: Vec<OrderBy>,
}

impl Query {
    /// A query over the documents directly under `path` (or the single
    /// document at `path`).
    pub fn at_path(path: ResourcePath) -> Self {
        Self::from_parts(path, None)
    }

    /// A query over every collection with id `collection_id` below `path`.
    pub fn collection_group(path: ResourcePath, collection_id: impl Into<String>) -> Self {
        Self::from_parts(path, Some(collection_id.into()))
    }

    fn from_parts(path: ResourcePath, collection_group: Option<String>) -> Self {
        let mut query = Self {
            path,
            collection_group,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::LimitToFirst,
            start_at: None,
            end_at: None,
            normalized_order_by: Vec::new(),
        };
        query.normalize();
        query
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<i64> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// True when the query returns every document of its collection.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field().is_key_field()))
    }

    pub fn with_filter(&self, filter: impl Into<Filter>) -> Query {
        hard_assert(!self.is_document_query(), "no filter is allowed for document queries");
        let mut query = self.clone();
        query.filters.push(filter.into());
        query.normalize();
        query
    }

    pub fn with_order_by(&self, order_by: OrderBy) -> Query {
        hard_assert(!self.is_document_query(), "no ordering is allowed for document queries");
        let mut query = self.clone();
        query.explicit_order_by.push(order_by);
        query.normalize();
        query
    }

    pub fn with_limit_to_first(&self, limit: i64) -> Query {
        let mut query = self.clone();
        query.limit = Some(limit);
        query.limit_type = LimitType::LimitToFirst;
        query
    }

    pub fn with_limit_to_last(&self, limit: i64) -> Query {
        let mut query = self.clone();
        query.limit = Some(limit);
        query.limit_type = LimitType::LimitToLast;
        query
    }

    pub fn starting_at(&self, bound: Bound) -> Query {
        let mut query = self.clone();
        query.start_at = Some(bound);
        query
    }

    pub fn ending_at(&self, bound: Bound) -> Query {
        let mut query = self.clone();
        query.end_at = Some(bound);
        query
    }

    /// The same query re-rooted at one collection path; used to split a
    /// collection-group query into per-collection queries.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Query {
        let mut query = self.clone();
        query.path = path;
        query.collection_group = None;
        query
    }

    /// Fields constrained by inequality filters, in field order.
    pub fn inequality_fields(&self) -> BTreeSet<FieldPath> {
        self.filters
            .iter()
            .flat_map(Filter::flattened_filters)
            .filter(|filter| filter.is_inequality())
            .map(|filter| filter.field().clone())
            .collect()
    }

    /// Explicit order-bys, then implied ones for inequality fields, then the
    /// document key. Implied entries take the last explicit direction.
    pub fn normalized_order_by(&self) -> &[OrderBy] {
        &self.normalized_order_by
    }

    fn normalize(&mut self) {
        let mut normalized = self.explicit_order_by.clone();
        let mut ordered: BTreeSet<String> = normalized
            .iter()
            .map(|order| order.field().canonical_string())
            .collect();
        let last_direction = normalized
            .last()
            .map(OrderBy::direction)
            .unwrap_or(Direction::Ascending);

        for field in self.inequality_fields() {
            if !field.is_key_field() && ordered.insert(field.canonical_string()) {
                normalized.push(OrderBy::new(field, last_direction));
            }
        }
        if !ordered.contains(&FieldPath::key_path().canonical_string()) {
            normalized.push(OrderBy::new(FieldPath::key_path(), last_direction));
        }
        self.normalized_order_by = normalized;
    }

    pub fn to_target(&self) -> Target {
        match self.limit_type {
            LimitType::LimitToFirst => Target::new(
                self.path.clone(),
                self.collection_group.clone(),
                self.filters.clone(),
                self.normalized_order_by.clone(),
                self.limit,
                self.start_at.clone(),
                self.end_at.clone(),
            ),
            LimitType::LimitToLast => {
                let flipped = self
                    .normalized_order_by
                    .iter()
                    .map(|order| OrderBy::new(order.field().clone(), order.direction().flipped()))
                    .collect();
                // Cursors swap to follow the flipped ordering.
                Target::new(
                    self.path.clone(),
                    self.collection_group.clone(),
                    self.filters.clone(),
                    flipped,
                    self.limit,
                    self.end_at.clone(),
                    self.start_at.clone(),
                )
            }
        }
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::LimitToFirst => "f",
            LimitType::LimitToLast => "l",
        };
        format!("{}|lt:{limit_type}", self.to_target().canonical_id())
    }

    /// Whether `document` belongs in the query's result, ignoring the limit.
    pub fn matches(&self, document: &Document) -> bool {
        document.is_found_document()
            && self.matches_path_and_collection_group(document)
            && self.matches_order_by(document)
            && self.filters.iter().all(|filter| filter.matches(document))
            && self.matches_bounds(document)
    }

    fn matches_path_and_collection_group(&self, document: &Document) -> bool {
        let document_path = document.key().path();
        if let Some(group) = &self.collection_group {
            document.key().has_collection_id(group) && self.path.is_prefix_of(document_path)
        } else if DocumentKey::is_document_key(&self.path) {
            &self.path == document_path
        } else {
            self.path.is_immediate_parent_of(document_path)
        }
    }

    fn matches_order_by(&self, document: &Document) -> bool {
        // Implied order-bys count too: `a > 1 || b == 1` excludes documents
        // without `a`.
        self.normalized_order_by.iter().all(|order| {
            order.field().is_key_field() || document.field(order.field()).is_some()
        })
    }

    fn matches_bounds(&self, document: &Document) -> bool {
        let order_by = &self.normalized_order_by;
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(order_by, document) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if !end.sorts_after_document(order_by, document) {
                return false;
            }
        }
        true
    }

    /// Result order of the query.
    pub fn compare(&self, left: &Document, right: &Document) -> Ordering {
        for order in &self.normalized_order_by {
            let ordering = order.compare(left, right);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    pub fn comparator(&self) -> impl Fn(&Document, &Document) -> Ordering + '_ {
        move |left, right| self.compare(left, right)
    }
}

impl PartialEq for Query {
    fn eq(&self, other: &Self) -> bool {
        self.limit_type == other.limit_type && self.to_target() == other.to_target()
    }
}

impl Display for Query {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Query({})", self.canonical_id())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::firestore::core::{FieldFilter, Operator};
    use crate::firestore::model::SnapshotVersion;
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn filter(path: &str, op: Operator, value: i64) -> Filter {
        Filter::Field(FieldFilter::new(field(path), op, FirestoreValue::from_integer(value)).unwrap())
    }

    fn collection(path: &str) -> Query {
        Query::at_path(ResourcePath::from_string(path).unwrap())
    }

    fn doc(path: &str, entries: &[(&str, i64)]) -> Document {
        let fields: BTreeMap<String, FirestoreValue> = entries
            .iter()
            .map(|(name, value)| (name.to_string(), FirestoreValue::from_integer(*value)))
            .collect();
        Document::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            MapValue::new(fields),
        )
    }

    #[test]
    fn normalized_order_by_adds_inequality_fields_and_key() {
        let query = collection("rooms")
            .with_filter(filter("b", Operator::GreaterThan, 1))
            .with_filter(filter("a", Operator::LessThan, 5))
            .with_order_by(OrderBy::descending(field("c")));
        let fields: Vec<String> = query
            .normalized_order_by()
            .iter()
            .map(OrderBy::canonical_id)
            .collect();
        assert_eq!(fields, vec!["cdesc", "adesc", "bdesc", "__name__desc"]);
    }

    #[test]
    fn matches_only_immediate_children() {
        let query = collection("rooms");
        assert!(query.matches(&doc("rooms/eros", &[])));
        assert!(!query.matches(&doc("rooms/eros/messages/1", &[])));
        assert!(!query.matches(&doc("other/eros", &[])));
    }

    #[test]
    fn collection_group_matches_nested_collections() {
        let query = Query::collection_group(ResourcePath::root(), "messages");
        assert!(query.matches(&doc("rooms/eros/messages/1", &[])));
        assert!(!query.matches(&doc("rooms/eros", &[])));
    }

    #[test]
    fn missing_order_by_field_excludes_document() {
        let query = collection("rooms").with_order_by(OrderBy::ascending(field("a")));
        assert!(query.matches(&doc("rooms/x", &[("a", 1)])));
        assert!(!query.matches(&doc("rooms/y", &[("b", 1)])));
    }

    #[test]
    fn comparator_breaks_ties_by_key() {
        let query = collection("rooms").with_order_by(OrderBy::ascending(field("a")));
        let first = doc("rooms/a", &[("a", 1)]);
        let second = doc("rooms/b", &[("a", 1)]);
        let third = doc("rooms/c", &[("a", 0)]);
        assert_eq!(query.compare(&first, &second), Ordering::Less);
        assert_eq!(query.compare(&third, &first), Ordering::Less);
    }

    #[test]
    fn canonical_ids_capture_semantic_differences() {
        let base = collection("rooms").with_filter(filter("a", Operator::Equal, 1));
        let same = collection("rooms").with_filter(filter("a", Operator::Equal, 1));
        assert_eq!(base.canonical_id(), same.canonical_id());
        assert_eq!(base, same);
        assert_ne!(base.canonical_id(), base.with_limit_to_first(2).canonical_id());
        assert_ne!(
            base.with_limit_to_first(2).canonical_id(),
            base.with_limit_to_last(2).canonical_id()
        );
        assert_ne!(
            base.with_order_by(OrderBy::ascending(field("b"))).canonical_id(),
            base.with_order_by(OrderBy::descending(field("b"))).canonical_id()
        );
        assert_eq!(base.canonical_id(), "rooms|f:a==1|ob:__name__asc|lt:f");
    }

    #[test]
    fn limit_to_last_flips_target() {
        let query = collection("rooms")
            .with_order_by(OrderBy::ascending(field("a")))
            .starting_at(Bound::new(vec![FirestoreValue::from_integer(1)], true))
            .with_limit_to_last(3);
        let target = query.to_target();
        assert!(target
            .order_by()
            .iter()
            .all(|order| order.direction() == Direction::Descending));
        assert!(target.start_at().is_none());
        assert!(target.end_at().is_some());
    }
}
