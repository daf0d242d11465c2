use std::borrow::Borrow;
use std::fmt::{Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{BasePath, ResourcePath};

/// Identifies exactly one document. Keys order by their path segments.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    pub fn from_path(path: ResourcePath) -> FirestoreResult<Self> {
        if !Self::is_document_key(&path) {
            return Err(invalid_argument(format!(
                "Document keys must point to a document (even number of segments): {path}"
            )));
        }
        Ok(Self { path })
    }

    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        Self::from_path(ResourcePath::from_string(path)?)
    }

    pub fn from_segments<I, S>(segments: I) -> FirestoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_path(ResourcePath::from_segments(segments))
    }

    /// Parses either a fully qualified document name
    /// (`projects/p/databases/d/documents/...`) or a bare key path.
    pub fn from_name(name: &str) -> FirestoreResult<Self> {
        let path = ResourcePath::from_string(name)?;
        let qualified = path.len() > 4
            && path.get(0) == Some("projects")
            && path.get(2) == Some("databases")
            && path.get(4) == Some("documents");
        if qualified {
            Self::from_path(path.pop_first_n(5))
        } else {
            Self::from_path(path)
        }
    }

    /// Sorts before every real key. Only meaningful as the start of a range
    /// scan.
    pub fn empty() -> Self {
        Self {
            path: ResourcePath::root(),
        }
    }

    pub fn is_document_key(path: &ResourcePath) -> bool {
        !path.is_empty() && path.len() % 2 == 0
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_path(&self) -> ResourcePath {
        self.path.without_last()
    }

    /// The id of the collection directly containing this document.
    pub fn collection_group(&self) -> &str {
        self.path.get(self.path.len() - 2).unwrap_or_default()
    }

    pub fn has_collection_id(&self, collection_id: &str) -> bool {
        self.collection_group() == collection_id
    }

    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }
}

// Keys order exactly like their paths, which allows range scans over a
// key-ordered map starting at a collection path.
impl Borrow<ResourcePath> for DocumentKey {
    fn borrow(&self) -> &ResourcePath {
        &self.path
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_even_segments() {
        let err = DocumentKey::from_string("rooms").unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn parses_valid_path() {
        let key = DocumentKey::from_string("rooms/eros/messages/1").unwrap();
        assert_eq!(key.id(), "1");
        assert_eq!(key.collection_group(), "messages");
        assert!(key.has_collection_id("messages"));
        assert_eq!(key.collection_path().canonical_string(), "rooms/eros/messages");
    }

    #[test]
    fn parses_qualified_names() {
        let key =
            DocumentKey::from_name("projects/p/databases/(default)/documents/rooms/eros").unwrap();
        assert_eq!(key, DocumentKey::from_string("rooms/eros").unwrap());
        assert_eq!(
            DocumentKey::from_name("rooms/eros").unwrap(),
            DocumentKey::from_string("rooms/eros").unwrap()
        );
    }

    #[test]
    fn orders_by_path() {
        let a = DocumentKey::from_string("a/b").unwrap();
        let nested = DocumentKey::from_string("a/b/c/d").unwrap();
        let c = DocumentKey::from_string("a/c").unwrap();
        assert!(a < nested);
        assert!(nested < c);
    }
}
