use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::firestore::core::{Bound, FieldFilter, Filter, IndexBound, Operator, OrderBy};
use crate::firestore::model::{DocumentKey, FieldIndex, FieldPath, IndexKind, IndexSegment, ResourcePath};
use crate::firestore::value::{values, FirestoreValue};
use crate::util::hard_assert;

/// The server-trackable part of a query: scope, filters, normalized order,
/// limit and cursors.
///
/// Limit-to-last queries are expressed as a target with every direction and
/// cursor flipped, so targets only carry a plain limit.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<Filter>,
    order_by: Vec<OrderBy>,
    limit: Option<i64>,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Target {
    pub fn new(
        path: ResourcePath,
        collection_group: Option<String>,
        filters: Vec<Filter>,
        order_by: Vec<OrderBy>,
        limit: Option<i64>,
        start_at: Option<Bound>,
        end_at: Option<Bound>,
    ) -> Self {
        hard_assert(
            order_by
                .last()
                .is_some_and(|order| order.field().is_key_field()),
            "a target's normalized order-by must end with the document key",
        );
        Self {
            path,
            collection_group,
            filters,
            order_by,
            limit,
            start_at,
            end_at,
        }
    }

    /// Target for a single document, as used by limbo resolution.
    pub fn for_document(key: &DocumentKey) -> Self {
        Self::new(
            key.path().clone(),
            None,
            Vec::new(),
            vec![OrderBy::ascending(FieldPath::key_path())],
            None,
            None,
            None,
        )
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn limit(&self) -> Option<i64> {
        self.limit
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

    /// Stable string identity of the target. Persisted caches are keyed by it,
    /// so its format must not change.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.canonical_id());
        }
        id.push_str("|ob:");
        for order in &self.order_by {
            id.push_str(&order.canonical_id());
        }
        if let Some(limit) = self.limit {
            id.push_str("|l:");
            id.push_str(&limit.to_string());
        }
        if let Some(start) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(if start.is_inclusive() { "b:" } else { "a:" });
            id.push_str(&start.position_string());
        }
        if let Some(end) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(if end.is_inclusive() { "a:" } else { "b:" });
            id.push_str(&end.position_string());
        }
        id
    }

    /// Field filters (at any depth) on `path`.
    pub fn field_filters_for_path(&self, path: &FieldPath) -> Vec<&FieldFilter> {
        self.filters
            .iter()
            .flat_map(Filter::flattened_filters)
            .filter(|filter| filter.field() == path)
            .collect()
    }

    /// Number of index segments a fully matching index needs.
    pub fn segment_count(&self) -> usize {
        let mut fields: Vec<&FieldPath> = Vec::new();
        let mut has_array = false;
        for filter in self.filters.iter().flat_map(Filter::flattened_filters) {
            if filter.field().is_key_field() {
                continue;
            }
            if matches!(filter.op(), Operator::ArrayContains | Operator::ArrayContainsAny) {
                has_array = true;
            } else if !fields.contains(&filter.field()) {
                fields.push(filter.field());
            }
        }
        for order in &self.order_by {
            if !order.field().is_key_field() && !fields.contains(&order.field()) {
                fields.push(order.field());
            }
        }
        fields.len() + usize::from(has_array)
    }

    /// Tightest lower scan bound over `index` implied by filters and the start
    /// cursor.
    pub fn lower_bound(&self, index: &FieldIndex) -> IndexBound {
        let mut position = Vec::new();
        let mut descending = Vec::new();
        let mut inclusive = true;
        for segment in index.directional_segments() {
            let (value, segment_inclusive) = if segment.kind == IndexKind::Ascending {
                self.ascending_bound(segment, self.start_at.as_ref())
            } else {
                self.descending_bound(segment, self.start_at.as_ref())
            };
            position.push(value);
            descending.push(segment.kind == IndexKind::Descending);
            inclusive &= segment_inclusive;
        }
        IndexBound {
            position,
            descending,
            inclusive,
        }
    }

    /// Tightest upper scan bound over `index` implied by filters and the end
    /// cursor.
    pub fn upper_bound(&self, index: &FieldIndex) -> IndexBound {
        let mut position = Vec::new();
        let mut descending = Vec::new();
        let mut inclusive = true;
        for segment in index.directional_segments() {
            let (value, segment_inclusive) = if segment.kind == IndexKind::Ascending {
                self.descending_bound(segment, self.end_at.as_ref())
            } else {
                self.ascending_bound(segment, self.end_at.as_ref())
            };
            position.push(value);
            descending.push(segment.kind == IndexKind::Descending);
            inclusive &= segment_inclusive;
        }
        IndexBound {
            position,
            descending,
            inclusive,
        }
    }

    fn ascending_bound(
        &self,
        segment: &IndexSegment,
        cursor: Option<&Bound>,
    ) -> (Option<FirestoreValue>, bool) {
        let mut segment_value = Some(FirestoreValue::null());
        let mut segment_inclusive = true;

        for filter in self.field_filters_for_path(&segment.field_path) {
            let (filter_value, filter_inclusive) = match filter.op() {
                Operator::LessThan | Operator::LessThanOrEqual => (
                    Some(values::type_lower_bound(filter.value().type_order())),
                    true,
                ),
                Operator::Equal | Operator::In | Operator::GreaterThanOrEqual => {
                    (Some(filter.value().clone()), true)
                }
                Operator::GreaterThan => (Some(filter.value().clone()), false),
                Operator::NotEqual | Operator::NotIn => (Some(FirestoreValue::null()), true),
                // Cannot bound the scan.
                Operator::ArrayContains | Operator::ArrayContainsAny => continue,
            };
            if values::lower_bound_compare(
                segment_value.as_ref(),
                segment_inclusive,
                filter_value.as_ref(),
                filter_inclusive,
            ) == Ordering::Less
            {
                segment_value = filter_value;
                segment_inclusive = filter_inclusive;
            }
        }

        if let Some((cursor_value, cursor_inclusive)) = self.cursor_value(segment, cursor) {
            if values::lower_bound_compare(
                segment_value.as_ref(),
                segment_inclusive,
                Some(cursor_value),
                cursor_inclusive,
            ) == Ordering::Less
            {
                segment_value = Some(cursor_value.clone());
                segment_inclusive = cursor_inclusive;
            }
        }
        (segment_value, segment_inclusive)
    }

    fn descending_bound(
        &self,
        segment: &IndexSegment,
        cursor: Option<&Bound>,
    ) -> (Option<FirestoreValue>, bool) {
        let mut segment_value: Option<FirestoreValue> = None;
        let mut segment_inclusive = true;

        for filter in self.field_filters_for_path(&segment.field_path) {
            let (filter_value, filter_inclusive) = match filter.op() {
                Operator::GreaterThan | Operator::GreaterThanOrEqual => {
                    (values::type_upper_bound(filter.value().type_order()), false)
                }
                Operator::Equal | Operator::In | Operator::LessThanOrEqual => {
                    (Some(filter.value().clone()), true)
                }
                Operator::LessThan => (Some(filter.value().clone()), false),
                Operator::NotEqual | Operator::NotIn => (None, true),
                Operator::ArrayContains | Operator::ArrayContainsAny => continue,
            };
            if values::upper_bound_compare(
                segment_value.as_ref(),
                segment_inclusive,
                filter_value.as_ref(),
                filter_inclusive,
            ) == Ordering::Greater
            {
                segment_value = filter_value;
                segment_inclusive = filter_inclusive;
            }
        }

        if let Some((cursor_value, cursor_inclusive)) = self.cursor_value(segment, cursor) {
            if values::upper_bound_compare(
                segment_value.as_ref(),
                segment_inclusive,
                Some(cursor_value),
                cursor_inclusive,
            ) == Ordering::Greater
            {
                segment_value = Some(cursor_value.clone());
                segment_inclusive = cursor_inclusive;
            }
        }
        (segment_value, segment_inclusive)
    }

    fn cursor_value<'a>(
        &self,
        segment: &IndexSegment,
        cursor: Option<&'a Bound>,
    ) -> Option<(&'a FirestoreValue, bool)> {
        let cursor = cursor?;
        let index = self
            .order_by
            .iter()
            .position(|order| order.field() == &segment.field_path)?;
        cursor
            .position()
            .get(index)
            .map(|value| (value, cursor.is_inclusive()))
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Target({})", self.canonical_id())
    }
}
