use std::cmp::Ordering;

use crate::firestore::core::OrderBy;
use crate::firestore::model::{Document, DocumentKey};
use crate::firestore::value::{values, FirestoreValue};
use crate::util::hard_assert;

/// A query cursor: one value per order-by, plus whether the position itself
/// is part of the result.
#[derive(Clone, Debug, PartialEq)]
pub struct Bound {
    position: Vec<FirestoreValue>,
    inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self {
            position,
            inclusive,
        }
    }

    pub fn position(&self) -> &[FirestoreValue] {
        &self.position
    }

    pub fn is_inclusive(&self) -> bool {
        self.inclusive
    }

    pub fn position_string(&self) -> String {
        self.position
            .iter()
            .map(values::canonical_id)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Whether a lower bound at this position admits `document`.
    pub fn sorts_before_document(&self, order_by: &[OrderBy], document: &Document) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    /// Whether an upper bound at this position admits `document`.
    pub fn sorts_after_document(&self, order_by: &[OrderBy], document: &Document) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }

    fn compare_to_document(&self, order_by: &[OrderBy], document: &Document) -> Ordering {
        hard_assert(
            self.position.len() <= order_by.len(),
            "bound has more components than the query's orderBy",
        );
        for (component, order) in self.position.iter().zip(order_by) {
            let ordering = if order.field().is_key_field() {
                let key = component
                    .as_reference()
                    .and_then(|name| DocumentKey::from_name(name).ok());
                hard_assert(key.is_some(), "bound has a non-key value where the key path is being used");
                match key {
                    Some(key) => key.cmp(document.key()),
                    None => Ordering::Equal,
                }
            } else {
                match document.field(order.field()) {
                    Some(value) => values::compare(component, value),
                    // Unreachable for documents that pass the order-by check.
                    None => Ordering::Greater,
                }
            };
            let ordering = order.direction().apply(ordering);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

/// Scan bound over an index; a `None` component is past every value.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexBound {
    pub position: Vec<Option<FirestoreValue>>,
    /// Per component, whether the index segment sorts descending.
    pub descending: Vec<bool>,
    pub inclusive: bool,
}

impl IndexBound {
    /// Compares an index entry against this bound, component by component, in
    /// index order.
    pub fn compare_entry(&self, entry: &[FirestoreValue]) -> Ordering {
        for (index, (bound, value)) in self.position.iter().zip(entry).enumerate() {
            let mut ordering = values::compare_with_max(Some(value), bound.as_ref());
            if self.descending.get(index).copied().unwrap_or(false) {
                ordering = ordering.reverse();
            }
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    pub fn admits_as_lower(&self, entry: &[FirestoreValue]) -> bool {
        match self.compare_entry(entry) {
            Ordering::Greater => true,
            Ordering::Equal => self.inclusive,
            Ordering::Less => false,
        }
    }

    pub fn admits_as_upper(&self, entry: &[FirestoreValue]) -> bool {
        match self.compare_entry(entry) {
            Ordering::Less => true,
            Ordering::Equal => self.inclusive,
            Ordering::Greater => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::firestore::model::{FieldPath, SnapshotVersion};
    use crate::firestore::value::MapValue;

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
    fn inclusive_and_exclusive_start() {
        let order_by = vec![
            OrderBy::ascending(FieldPath::from_dot_separated("a").unwrap()),
            OrderBy::ascending(FieldPath::key_path()),
        ];
        let at = Bound::new(vec![FirestoreValue::from_integer(2)], true);
        let after = Bound::new(vec![FirestoreValue::from_integer(2)], false);
        assert!(at.sorts_before_document(&order_by, &doc("c/x", 2)));
        assert!(!after.sorts_before_document(&order_by, &doc("c/x", 2)));
        assert!(after.sorts_before_document(&order_by, &doc("c/x", 3)));
        assert!(at.sorts_after_document(&order_by, &doc("c/x", 1)));
    }

    #[test]
    fn key_components_compare_document_keys() {
        let order_by = vec![OrderBy::ascending(FieldPath::key_path())];
        let bound = Bound::new(vec![FirestoreValue::from_reference("c/m")], false);
        assert!(bound.sorts_before_document(&order_by, &doc("c/z", 0)));
        assert!(!bound.sorts_before_document(&order_by, &doc("c/a", 0)));
    }
}
