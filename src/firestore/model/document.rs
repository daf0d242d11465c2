use crate::firestore::model::{DocumentKey, FieldPath, SnapshotVersion};
use crate::firestore::value::{FirestoreValue, MapValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DocumentType {
    /// Nothing is known about the document; placeholder for a cache miss.
    Invalid,
    FoundDocument,
    /// The document is known not to exist at `version`.
    NoDocument,
    /// The document was written but its contents are unknown (a patch was
    /// acknowledged against a document missing from the cache).
    UnknownDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DocumentState {
    Synced,
    HasLocalMutations,
    HasCommittedMutations,
}

/// A document as seen by the cache or a view. Values are treated as immutable
/// once handed to a view; mutation application works on a clone.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    key: DocumentKey,
    document_type: DocumentType,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    data: MapValue,
    state: DocumentState,
}

impl Document {
    pub fn new_invalid(key: DocumentKey) -> Self {
        Self {
            key,
            document_type: DocumentType::Invalid,
            version: SnapshotVersion::NONE,
            read_time: SnapshotVersion::NONE,
            data: MapValue::empty(),
            state: DocumentState::Synced,
        }
    }

    pub fn new_found(key: DocumentKey, version: SnapshotVersion, data: MapValue) -> Self {
        let mut document = Self::new_invalid(key);
        document.convert_to_found(version, data);
        document
    }

    pub fn new_no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut document = Self::new_invalid(key);
        document.convert_to_no_document(version);
        document
    }

    pub fn new_unknown(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut document = Self::new_invalid(key);
        document.convert_to_unknown(version);
        document
    }

    pub fn convert_to_found(&mut self, version: SnapshotVersion, data: MapValue) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::FoundDocument;
        self.data = data;
        self.state = DocumentState::Synced;
        self
    }

    pub fn convert_to_no_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::NoDocument;
        self.data = MapValue::empty();
        self.state = DocumentState::Synced;
        self
    }

    pub fn convert_to_unknown(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::UnknownDocument;
        self.data = MapValue::empty();
        self.state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.state = DocumentState::HasLocalMutations;
        self.version = SnapshotVersion::NONE;
        self
    }

    pub fn set_read_time(&mut self, read_time: SnapshotVersion) -> &mut Self {
        self.read_time = read_time;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn state(&self) -> DocumentState {
        self.state
    }

    pub fn data(&self) -> &MapValue {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut MapValue {
        &mut self.data
    }

    /// Value at `path`; the key path resolves to nothing here, callers that
    /// order by key compare [`Document::key`] instead.
    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.data.get(path)
    }

    pub fn is_valid_document(&self) -> bool {
        self.document_type != DocumentType::Invalid
    }

    pub fn is_found_document(&self) -> bool {
        self.document_type == DocumentType::FoundDocument
    }

    pub fn is_no_document(&self) -> bool {
        self.document_type == DocumentType::NoDocument
    }

    pub fn is_unknown_document(&self) -> bool {
        self.document_type == DocumentType::UnknownDocument
    }

    pub fn has_local_mutations(&self) -> bool {
        self.state == DocumentState::HasLocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.state == DocumentState::HasCommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }

    /// Approximate footprint used by cache-size based garbage collection.
    pub fn estimated_size(&self) -> usize {
        fn value_size(value: &FirestoreValue) -> usize {
            use crate::firestore::value::ValueKind;
            match value.kind() {
                ValueKind::String(string) | ValueKind::Reference(string) => 16 + string.len(),
                ValueKind::Bytes(bytes) => 16 + bytes.len(),
                ValueKind::Array(array) => 16 + array.values().iter().map(value_size).sum::<usize>(),
                ValueKind::Map(map) => {
                    16 + map
                        .fields()
                        .iter()
                        .map(|(name, value)| name.len() + value_size(value))
                        .sum::<usize>()
                }
                _ => 16,
            }
        }
        let key_size: usize = self.key.path().to_string().len();
        key_size
            + self
                .data
                .fields()
                .iter()
                .map(|(name, value)| name.len() + value_size(value))
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/eros").unwrap()
    }

    #[test]
    fn conversions_update_type_and_state() {
        let mut document = Document::new_invalid(key());
        assert!(!document.is_valid_document());

        let data = MapValue::new(BTreeMap::from([(
            "a".to_string(),
            FirestoreValue::from_integer(1),
        )]));
        document.convert_to_found(SnapshotVersion::from_micros(5), data);
        assert!(document.is_found_document());
        assert!(!document.has_pending_writes());

        document.set_has_local_mutations();
        assert!(document.has_local_mutations());
        assert_eq!(document.version(), SnapshotVersion::NONE);

        document.convert_to_no_document(SnapshotVersion::from_micros(9));
        assert!(document.is_no_document());
        assert!(document.data().is_empty());
    }

    #[test]
    fn unknown_documents_have_committed_mutations() {
        let document = Document::new_unknown(key(), SnapshotVersion::from_micros(3));
        assert!(document.is_unknown_document());
        assert!(document.has_committed_mutations());
    }
}
