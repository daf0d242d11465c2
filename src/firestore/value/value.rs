use std::collections::BTreeMap;

use crate::firestore::model::{GeoPoint, Timestamp};
use crate::firestore::value::{ArrayValue, BytesValue, MapValue};

/// A typed document value.
///
/// Equality, ordering and canonical ids follow the cross-type rules in
/// [`crate::firestore::value::values`]: `PartialEq` is number-type strict and
/// treats NaN as equal to NaN.
#[derive(Clone, Debug)]
pub struct FirestoreValue {
    kind: ValueKind,
}

#[derive(Clone, Debug)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    /// Placeholder for a server timestamp that has not been acknowledged yet.
    ServerTimestamp {
        local_write_time: Timestamp,
        previous_value: Option<Box<FirestoreValue>>,
    },
    String(String),
    Bytes(BytesValue),
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Map(MapValue),
}

/// Position of a value's type in the cross-type total order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TypeOrder {
    Null = 0,
    Boolean = 1,
    Number = 2,
    Timestamp = 3,
    ServerTimestamp = 4,
    String = 5,
    Blob = 6,
    Reference = 7,
    GeoPoint = 8,
    Array = 9,
    Map = 10,
}

impl FirestoreValue {
    fn with_kind(kind: ValueKind) -> Self {
        Self { kind }
    }

    pub fn null() -> Self {
        Self::with_kind(ValueKind::Null)
    }

    pub fn from_bool(value: bool) -> Self {
        Self::with_kind(ValueKind::Boolean(value))
    }

    pub fn from_integer(value: i64) -> Self {
        Self::with_kind(ValueKind::Integer(value))
    }

    pub fn from_double(value: f64) -> Self {
        Self::with_kind(ValueKind::Double(value))
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self::with_kind(ValueKind::Timestamp(value))
    }

    pub fn server_timestamp(local_write_time: Timestamp, previous_value: Option<FirestoreValue>) -> Self {
        // Only keep the last acknowledged value, never a chain of placeholders.
        let previous_value = match previous_value {
            Some(value) => match value.kind {
                ValueKind::ServerTimestamp { previous_value, .. } => previous_value,
                _ => Some(Box::new(value)),
            },
            None => None,
        };
        Self::with_kind(ValueKind::ServerTimestamp {
            local_write_time,
            previous_value,
        })
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self::with_kind(ValueKind::String(value.into()))
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self::with_kind(ValueKind::Bytes(value))
    }

    /// A reference to another document, either as a bare key path or a fully
    /// qualified document name.
    pub fn from_reference(path: impl Into<String>) -> Self {
        Self::with_kind(ValueKind::Reference(path.into()))
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        Self::with_kind(ValueKind::GeoPoint(value))
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        Self::with_kind(ValueKind::Array(ArrayValue::new(values)))
    }

    pub fn from_map(map: BTreeMap<String, FirestoreValue>) -> Self {
        Self::with_kind(ValueKind::Map(MapValue::new(map)))
    }

    pub fn from_map_value(map: MapValue) -> Self {
        Self::with_kind(ValueKind::Map(map))
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn into_kind(self) -> ValueKind {
        self.kind
    }

    pub fn type_order(&self) -> TypeOrder {
        match &self.kind {
            ValueKind::Null => TypeOrder::Null,
            ValueKind::Boolean(_) => TypeOrder::Boolean,
            ValueKind::Integer(_) | ValueKind::Double(_) => TypeOrder::Number,
            ValueKind::Timestamp(_) => TypeOrder::Timestamp,
            ValueKind::ServerTimestamp { .. } => TypeOrder::ServerTimestamp,
            ValueKind::String(_) => TypeOrder::String,
            ValueKind::Bytes(_) => TypeOrder::Blob,
            ValueKind::Reference(_) => TypeOrder::Reference,
            ValueKind::GeoPoint(_) => TypeOrder::GeoPoint,
            ValueKind::Array(_) => TypeOrder::Array,
            ValueKind::Map(_) => TypeOrder::Map,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(value) if value.is_nan())
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.kind, ValueKind::Reference(_))
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match &self.kind {
            ValueKind::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match &self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    pub(crate) fn as_map_mut(&mut self) -> Option<&mut MapValue> {
        match &mut self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::Reference(reference) => Some(reference),
            _ => None,
        }
    }

    /// Stable string form; see [`crate::firestore::value::values::canonical_id`].
    pub fn canonical_id(&self) -> String {
        super::values::canonical_id(self)
    }
}

impl PartialEq for FirestoreValue {
    fn eq(&self, other: &Self) -> bool {
        super::values::equals(self, other)
    }
}
