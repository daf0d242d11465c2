use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::firestore::core::Query;
use crate::firestore::model::{Document, DocumentKey};

pub type DocumentComparator = Arc<dyn Fn(&Document, &Document) -> Ordering + Send + Sync>;

/// Documents ordered by a query comparator, with lookup by key.
#[derive(Clone)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    by_key: BTreeMap<DocumentKey, Document>,
    sorted: Vec<Document>,
}

impl DocumentSet {
    /// The comparator is extended with a key tie-break, so it only needs to
    /// order documents that differ in sort values.
    pub fn new(comparator: DocumentComparator) -> Self {
        let comparator: DocumentComparator = Arc::new(move |left: &Document, right: &Document| {
            comparator(left, right).then_with(|| left.key().cmp(right.key()))
        });
        Self {
            comparator,
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    pub fn for_query(query: &Query) -> Self {
        let query = query.clone();
        Self::new(Arc::new(move |left, right| query.compare(left, right)))
    }

    pub fn ordered_by_key() -> Self {
        Self::new(Arc::new(|_, _| Ordering::Equal))
    }

    /// An empty set with the same ordering.
    pub fn empty_like(&self) -> Self {
        Self {
            comparator: Arc::clone(&self.comparator),
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&Document> {
        self.sorted.last()
    }

    pub fn position(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.by_key.get(key)?;
        self.search(document).ok()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Document> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(Document::key)
    }

    pub fn compare(&self, left: &Document, right: &Document) -> Ordering {
        (self.comparator)(left, right)
    }

    /// Inserts `document`, replacing any document with the same key.
    pub fn insert(&mut self, document: Document) {
        self.remove(document.key());
        let index = match self.search(&document) {
            Ok(index) | Err(index) => index,
        };
        self.by_key.insert(document.key().clone(), document.clone());
        self.sorted.insert(index, document);
    }

    pub fn remove(&mut self, key: &DocumentKey) -> Option<Document> {
        let existing = self.by_key.remove(key)?;
        if let Ok(index) = self.search(&existing) {
            self.sorted.remove(index);
        }
        Some(existing)
    }

    fn search(&self, document: &Document) -> Result<usize, usize> {
        self.sorted
            .binary_search_by(|candidate| (self.comparator)(candidate, document))
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}

impl Debug for DocumentSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.sorted.iter().map(Document::key))
            .finish()
    }
}

impl<'a> IntoIterator for &'a DocumentSet {
    type Item = &'a Document;
    type IntoIter = std::slice::Iter<'a, Document>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::firestore::core::OrderBy;
    use crate::firestore::model::{FieldPath, ResourcePath, SnapshotVersion};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn doc(path: &str, sort: i64) -> Document {
        Document::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            MapValue::new(BTreeMap::from([(
                "sort".to_string(),
                FirestoreValue::from_integer(sort),
            )])),
        )
    }

    #[test]
    fn keeps_query_order_and_replaces_by_key() {
        let query = Query::at_path(ResourcePath::from_segments(["rooms"]))
            .with_order_by(OrderBy::descending(FieldPath::from_dot_separated("sort").unwrap()));
        let mut set = DocumentSet::for_query(&query);
        set.insert(doc("rooms/a", 1));
        set.insert(doc("rooms/b", 3));
        set.insert(doc("rooms/c", 2));
        let keys: Vec<String> = set.keys().map(ToString::to_string).collect();
        assert_eq!(keys, vec!["rooms/b", "rooms/c", "rooms/a"]);

        set.insert(doc("rooms/a", 5));
        assert_eq!(set.len(), 3);
        assert_eq!(set.first().map(|d| d.key().to_string()), Some("rooms/a".to_string()));
        assert_eq!(set.position(&DocumentKey::from_string("rooms/c").unwrap()), Some(2));

        set.remove(&DocumentKey::from_string("rooms/b").unwrap());
        assert_eq!(set.len(), 2);
        assert!(set.remove(&DocumentKey::from_string("rooms/b").unwrap()).is_none());
    }
}
