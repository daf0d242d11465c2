//! Cross-type equality, total ordering and canonical ids for [`FirestoreValue`].
//!
//! Type order: null < boolean < number < timestamp < server timestamp <
//! string < blob < reference < geo point < array < map.

use std::cmp::Ordering;

use crate::firestore::model::{DocumentKey, GeoPoint, Timestamp};
use crate::firestore::value::{BytesValue, FirestoreValue, MapValue, TypeOrder, ValueKind};

/// Value equality. Integers and doubles never equal each other; doubles
/// compare by bit pattern, so NaN equals NaN and -0.0 differs from 0.0.
pub fn equals(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => true,
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l == r,
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l == r,
        (ValueKind::Double(l), ValueKind::Double(r)) => l.to_bits() == r.to_bits(),
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l == r,
        (
            ValueKind::ServerTimestamp {
                local_write_time: l,
                ..
            },
            ValueKind::ServerTimestamp {
                local_write_time: r,
                ..
            },
        ) => l == r,
        (ValueKind::String(l), ValueKind::String(r)) => l == r,
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l == r,
        (ValueKind::Reference(l), ValueKind::Reference(r)) => {
            compare_references(l, r) == Ordering::Equal
        }
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => {
            l.latitude().to_bits() == r.latitude().to_bits()
                && l.longitude().to_bits() == r.longitude().to_bits()
        }
        (ValueKind::Array(l), ValueKind::Array(r)) => l.values() == r.values(),
        (ValueKind::Map(l), ValueKind::Map(r)) => l.fields() == r.fields(),
        _ => false,
    }
}

/// Total order across all value types.
pub fn compare(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let left_type = left.type_order();
    let right_type = right.type_order();
    if left_type != right_type {
        return left_type.cmp(&right_type);
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l.cmp(r),
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l.cmp(r),
        (ValueKind::Double(l), ValueKind::Double(r)) => compare_doubles(*l, *r),
        (ValueKind::Double(l), ValueKind::Integer(r)) => compare_mixed(*l, *r),
        (ValueKind::Integer(l), ValueKind::Double(r)) => compare_mixed(*r, *l).reverse(),
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l.cmp(r),
        (
            ValueKind::ServerTimestamp {
                local_write_time: l,
                ..
            },
            ValueKind::ServerTimestamp {
                local_write_time: r,
                ..
            },
        ) => l.cmp(r),
        (ValueKind::String(l), ValueKind::String(r)) => l.cmp(r),
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l.cmp(r),
        (ValueKind::Reference(l), ValueKind::Reference(r)) => compare_references(l, r),
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => compare_doubles(
            l.latitude(),
            r.latitude(),
        )
        .then_with(|| compare_doubles(l.longitude(), r.longitude())),
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            for (lv, rv) in l.values().iter().zip(r.values()) {
                let ordering = compare(lv, rv);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            l.len().cmp(&r.len())
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => compare_maps(l, r),
        _ => Ordering::Equal,
    }
}

/// Double comparison where NaN equals NaN and sorts before every number.
pub fn compare_doubles(left: f64, right: f64) -> Ordering {
    match left.partial_cmp(&right) {
        Some(ordering) => ordering,
        None => match (left.is_nan(), right.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            _ => Ordering::Greater,
        },
    }
}

fn compare_mixed(double: f64, integer: i64) -> Ordering {
    if double.is_nan() {
        return Ordering::Less;
    }
    // Out of i64 range: the double wins regardless of the integer.
    if double < -9_223_372_036_854_775_808.0 {
        return Ordering::Less;
    }
    if double >= 9_223_372_036_854_775_808.0 {
        return Ordering::Greater;
    }
    let truncated = double as i64;
    match truncated.cmp(&integer) {
        Ordering::Equal => compare_doubles(double, integer as f64),
        other => other,
    }
}

fn compare_references(left: &str, right: &str) -> Ordering {
    let mut left_segments = left.split('/');
    let mut right_segments = right.split('/');
    loop {
        match (left_segments.next(), right_segments.next()) {
            (Some(l), Some(r)) => match l.cmp(r) {
                Ordering::Equal => continue,
                other => return other,
            },
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (None, None) => return Ordering::Equal,
        }
    }
}

fn compare_maps(left: &MapValue, right: &MapValue) -> Ordering {
    let mut left_entries = left.fields().iter();
    let mut right_entries = right.fields().iter();
    loop {
        match (left_entries.next(), right_entries.next()) {
            (Some((lk, lv)), Some((rk, rv))) => {
                let ordering = lk.cmp(rk).then_with(|| compare(lv, rv));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (None, None) => return Ordering::Equal,
        }
    }
}

/// Deterministic string form used inside target canonical ids. The format is
/// persisted as part of cache keys and must not change.
pub fn canonical_id(value: &FirestoreValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &FirestoreValue, out: &mut String) {
    match value.kind() {
        ValueKind::Null => out.push_str("null"),
        ValueKind::Boolean(boolean) => out.push_str(if *boolean { "true" } else { "false" }),
        ValueKind::Integer(integer) => out.push_str(&integer.to_string()),
        ValueKind::Double(double) => out.push_str(&format!("{double:?}")),
        ValueKind::Timestamp(timestamp) => write_time(timestamp, out),
        ValueKind::ServerTimestamp {
            local_write_time,
            previous_value,
        } => {
            out.push_str("{__local_write_time__:");
            write_time(local_write_time, out);
            if let Some(previous) = previous_value {
                out.push_str(",__previous_value__:");
                write_canonical(previous, out);
            }
            out.push_str(",__type__:server_timestamp}");
        }
        ValueKind::String(string) => out.push_str(string),
        ValueKind::Bytes(bytes) => out.push_str(&bytes.to_base64()),
        ValueKind::Reference(reference) => match DocumentKey::from_name(reference) {
            Ok(key) => out.push_str(&key.to_string()),
            Err(_) => out.push_str(reference),
        },
        ValueKind::GeoPoint(point) => out.push_str(&format!(
            "geo({:?},{:?})",
            point.latitude(),
            point.longitude()
        )),
        ValueKind::Array(array) => {
            out.push('[');
            for (index, element) in array.values().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(element, out);
            }
            out.push(']');
        }
        ValueKind::Map(map) => {
            out.push('{');
            for (index, (key, element)) in map.fields().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(key);
                out.push(':');
                write_canonical(element, out);
            }
            out.push('}');
        }
    }
}

fn write_time(timestamp: &Timestamp, out: &mut String) {
    out.push_str(&format!("time({},{})", timestamp.seconds, timestamp.nanos));
}

/// Smallest value of the given type in the total order.
pub fn type_lower_bound(type_order: TypeOrder) -> FirestoreValue {
    match type_order {
        TypeOrder::Null => FirestoreValue::null(),
        TypeOrder::Boolean => FirestoreValue::from_bool(false),
        TypeOrder::Number => FirestoreValue::from_double(f64::NAN),
        TypeOrder::Timestamp => FirestoreValue::from_timestamp(Timestamp::new(i64::MIN, 0)),
        TypeOrder::ServerTimestamp => {
            FirestoreValue::server_timestamp(Timestamp::new(i64::MIN, 0), None)
        }
        TypeOrder::String => FirestoreValue::from_string(""),
        TypeOrder::Blob => FirestoreValue::from_bytes(BytesValue::new(Vec::new())),
        TypeOrder::Reference => FirestoreValue::from_reference(""),
        TypeOrder::GeoPoint => FirestoreValue::from_geo_point(GeoPoint::MIN),
        TypeOrder::Array => FirestoreValue::from_array(Vec::new()),
        TypeOrder::Map => FirestoreValue::from_map_value(MapValue::empty()),
    }
}

/// Exclusive upper bound of the given type; `None` when nothing sorts after it.
pub fn type_upper_bound(type_order: TypeOrder) -> Option<FirestoreValue> {
    let next = match type_order {
        TypeOrder::Null => TypeOrder::Boolean,
        TypeOrder::Boolean => TypeOrder::Number,
        TypeOrder::Number => TypeOrder::Timestamp,
        TypeOrder::Timestamp => TypeOrder::ServerTimestamp,
        TypeOrder::ServerTimestamp => TypeOrder::String,
        TypeOrder::String => TypeOrder::Blob,
        TypeOrder::Blob => TypeOrder::Reference,
        TypeOrder::Reference => TypeOrder::GeoPoint,
        TypeOrder::GeoPoint => TypeOrder::Array,
        TypeOrder::Array => TypeOrder::Map,
        TypeOrder::Map => return None,
    };
    Some(type_lower_bound(next))
}

/// Compares two optional values where `None` sorts after every value.
pub fn compare_with_max(left: Option<&FirestoreValue>, right: Option<&FirestoreValue>) -> Ordering {
    match (left, right) {
        (Some(left), Some(right)) => compare(left, right),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Orders two lower bounds; an inclusive bound sorts before an exclusive one
/// at the same value.
pub fn lower_bound_compare(
    left: Option<&FirestoreValue>,
    left_inclusive: bool,
    right: Option<&FirestoreValue>,
    right_inclusive: bool,
) -> Ordering {
    compare_with_max(left, right).then(match (left_inclusive, right_inclusive) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => Ordering::Equal,
    })
}

/// Orders two upper bounds; an inclusive bound sorts after an exclusive one at
/// the same value.
pub fn upper_bound_compare(
    left: Option<&FirestoreValue>,
    left_inclusive: bool,
    right: Option<&FirestoreValue>,
    right_inclusive: bool,
) -> Ordering {
    compare_with_max(left, right).then(match (left_inclusive, right_inclusive) {
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        _ => Ordering::Equal,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::firestore::model::GeoPoint;
    use crate::firestore::value::BytesValue;

    fn int(value: i64) -> FirestoreValue {
        FirestoreValue::from_integer(value)
    }

    fn double(value: f64) -> FirestoreValue {
        FirestoreValue::from_double(value)
    }

    fn string(value: &str) -> FirestoreValue {
        FirestoreValue::from_string(value)
    }

    #[test]
    fn numbers_are_type_strict_for_equality() {
        assert_eq!(int(1), int(1));
        assert_ne!(int(1), double(1.0));
        assert_eq!(double(f64::NAN), double(f64::NAN));
        assert_ne!(double(0.0), double(-0.0));
    }

    #[test]
    fn numbers_compare_across_representations() {
        assert_eq!(compare(&int(1), &double(1.0)), Ordering::Equal);
        assert_eq!(compare(&int(1), &double(1.5)), Ordering::Less);
        assert_eq!(compare(&double(2.5), &int(2)), Ordering::Greater);
        assert_eq!(compare(&double(f64::NAN), &int(i64::MIN)), Ordering::Less);
        assert_eq!(compare(&double(f64::NAN), &double(f64::NAN)), Ordering::Equal);
        assert_eq!(compare(&double(-0.0), &double(0.0)), Ordering::Equal);
        assert_eq!(compare(&double(1e19), &int(i64::MAX)), Ordering::Greater);
    }

    #[test]
    fn ordering_follows_type_order() {
        let ordered = vec![
            FirestoreValue::null(),
            FirestoreValue::from_bool(false),
            FirestoreValue::from_bool(true),
            double(f64::NAN),
            int(-5),
            double(0.5),
            FirestoreValue::from_timestamp(Timestamp::new(1, 0)),
            FirestoreValue::server_timestamp(Timestamp::new(0, 0), None),
            string(""),
            string("a"),
            FirestoreValue::from_bytes(BytesValue::new(vec![0])),
            FirestoreValue::from_reference("a/b"),
            FirestoreValue::from_reference("a/b/c/d"),
            FirestoreValue::from_geo_point(GeoPoint::new(0.0, 0.0).unwrap()),
            FirestoreValue::from_array(vec![]),
            FirestoreValue::from_array(vec![int(1)]),
            FirestoreValue::from_map(BTreeMap::new()),
        ];
        for window in ordered.windows(2) {
            assert_eq!(
                compare(&window[0], &window[1]),
                Ordering::Less,
                "{:?} should sort before {:?}",
                window[0],
                window[1]
            );
        }
    }

    #[test]
    fn maps_compare_by_sorted_entries_then_size() {
        let a1 = FirestoreValue::from_map(BTreeMap::from([("a".to_string(), int(1))]));
        let a2 = FirestoreValue::from_map(BTreeMap::from([("a".to_string(), int(2))]));
        let a1b = FirestoreValue::from_map(BTreeMap::from([
            ("a".to_string(), int(1)),
            ("b".to_string(), int(0)),
        ]));
        let b0 = FirestoreValue::from_map(BTreeMap::from([("b".to_string(), int(0))]));
        assert_eq!(compare(&a1, &a2), Ordering::Less);
        assert_eq!(compare(&a1, &a1b), Ordering::Less);
        assert_eq!(compare(&a1b, &b0), Ordering::Less);
    }

    #[test]
    fn canonical_ids() {
        let map = FirestoreValue::from_map(BTreeMap::from([
            ("b".to_string(), FirestoreValue::from_array(vec![int(1), double(2.0)])),
            ("a".to_string(), FirestoreValue::null()),
        ]));
        assert_eq!(canonical_id(&map), "{a:null,b:[1,2.0]}");
        assert_eq!(
            canonical_id(&FirestoreValue::from_timestamp(Timestamp::new(3, 4))),
            "time(3,4)"
        );
        assert_eq!(
            canonical_id(&FirestoreValue::from_reference(
                "projects/p/databases/(default)/documents/rooms/eros"
            )),
            "rooms/eros"
        );
        assert_eq!(
            canonical_id(&FirestoreValue::from_geo_point(GeoPoint::new(1.5, -2.0).unwrap())),
            "geo(1.5,-2.0)"
        );
    }

    #[test]
    fn type_bounds_bracket_every_value_of_the_type() {
        let lower = type_lower_bound(TypeOrder::Number);
        let upper = type_upper_bound(TypeOrder::Number).unwrap();
        for value in [int(i64::MIN), double(f64::NEG_INFINITY), double(3.5)] {
            assert_ne!(compare(&lower, &value), Ordering::Greater);
            assert_eq!(compare(&value, &upper), Ordering::Less);
        }
        assert!(type_upper_bound(TypeOrder::Map).is_none());
    }

    #[test]
    fn bound_comparisons_respect_inclusiveness() {
        let one = int(1);
        assert_eq!(
            lower_bound_compare(Some(&one), true, Some(&one), false),
            Ordering::Less
        );
        assert_eq!(
            upper_bound_compare(Some(&one), true, Some(&one), false),
            Ordering::Greater
        );
        assert_eq!(
            upper_bound_compare(Some(&one), true, None, true),
            Ordering::Less
        );
    }
}
