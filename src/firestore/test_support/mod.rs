//! Builders and fakes shared by unit and integration tests.
//!
//! Helpers panic on malformed input; they are meant for literals written in
//! tests.

mod transport;

use std::collections::BTreeMap;

use crate::firestore::core::{Filter, FieldFilter, Operator, Query};
use crate::firestore::model::{Document, DocumentKey, FieldPath, ResourcePath, SnapshotVersion};
use crate::firestore::value::{FirestoreValue, MapValue};

pub use transport::{RecordingTransport, TransportCall};

pub fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap_or_else(|error| panic!("bad document key {path}: {error}"))
}

pub fn path(path: &str) -> ResourcePath {
    ResourcePath::from_string(path).unwrap_or_else(|error| panic!("bad path {path}: {error}"))
}

pub fn field(path: &str) -> FieldPath {
    FieldPath::from_dot_separated(path).unwrap_or_else(|error| panic!("bad field path {path}: {error}"))
}

/// A synced document read at `version` (in microseconds).
pub fn doc(path: &str, version: i64, data: MapValue) -> Document {
    let version = SnapshotVersion::from_micros(version);
    let mut document = Document::new_found(key(path), version, data);
    document.set_read_time(version);
    document
}

pub fn deleted_doc(path: &str, version: i64) -> Document {
    let version = SnapshotVersion::from_micros(version);
    let mut document = Document::new_no_document(key(path), version);
    document.set_read_time(version);
    document
}

pub fn map(fields: &[(&str, FirestoreValue)]) -> MapValue {
    MapValue::new(
        fields
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect::<BTreeMap<_, _>>(),
    )
}

/// `filter("age", ">=", FirestoreValue::from_integer(21))`
pub fn filter(field_path: &str, op: &str, value: FirestoreValue) -> Filter {
    let op = Operator::parse(op).unwrap_or_else(|error| panic!("bad operator {op}: {error}"));
    FieldFilter::new(field(field_path), op, value)
        .unwrap_or_else(|error| panic!("bad filter on {field_path}: {error}"))
        .into()
}

pub fn and_filters(filters: Vec<Filter>) -> Filter {
    Filter::and(filters)
}

pub fn or_filters(filters: Vec<Filter>) -> Filter {
    Filter::or(filters)
}

/// A query over every document of the collection at `collection_path`.
pub fn query(collection_path: &str) -> Query {
    Query::at_path(path(collection_path))
}
