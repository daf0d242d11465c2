use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::model::{BasePath, FieldPath};
use crate::firestore::value::{FirestoreValue, ValueKind};

/// A map of field names to values; also used as the data of a whole document.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, FirestoreValue> {
        self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Looks up the value at `path`; the empty path yields `None`.
    pub fn get(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (last, parents) = path.segments().split_last()?;
        let mut current = &self.fields;
        for segment in parents {
            match current.get(segment).map(FirestoreValue::kind) {
                Some(ValueKind::Map(child)) => current = &child.fields,
                _ => return None,
            }
        }
        current.get(last)
    }

    /// Writes `value` at `path`, replacing any non-map intermediate values.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        set_in(&mut self.fields, path.segments(), value);
    }

    /// Removes the value at `path`. Missing parents are left untouched.
    pub fn delete(&mut self, path: &FieldPath) {
        delete_in(&mut self.fields, path.segments());
    }

    /// Leaf paths of this map. Empty nested maps count as leaves.
    pub fn field_mask(&self) -> BTreeSet<FieldPath> {
        let mut mask = BTreeSet::new();
        Self::collect_mask(&self.fields, &FieldPath::empty_path(), &mut mask);
        mask
    }

    fn collect_mask(
        fields: &BTreeMap<String, FirestoreValue>,
        prefix: &FieldPath,
        mask: &mut BTreeSet<FieldPath>,
    ) {
        for (name, value) in fields {
            let path = prefix.append_segment(name.clone());
            match value.kind() {
                ValueKind::Map(child) if !child.is_empty() => {
                    Self::collect_mask(&child.fields, &path, mask);
                }
                _ => {
                    mask.insert(path);
                }
            }
        }
    }
}

fn set_in(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String], value: FirestoreValue) {
    match segments.split_first() {
        None => {}
        Some((name, [])) => {
            fields.insert(name.clone(), value);
        }
        Some((name, rest)) => {
            let mut child = match fields.remove(name).map(FirestoreValue::into_kind) {
                Some(ValueKind::Map(child)) => child,
                _ => MapValue::empty(),
            };
            set_in(&mut child.fields, rest, value);
            fields.insert(name.clone(), FirestoreValue::from_map_value(child));
        }
    }
}

fn delete_in(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    match segments.split_first() {
        None => {}
        Some((name, [])) => {
            fields.remove(name);
        }
        Some((name, rest)) => {
            if let Some(child) = fields.get_mut(name).and_then(FirestoreValue::as_map_mut) {
                delete_in(&mut child.fields, rest);
            }
        }
    }
}

impl From<BTreeMap<String, FirestoreValue>> for MapValue {
    fn from(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self::new(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    #[test]
    fn set_creates_intermediate_maps() {
        let mut map = MapValue::empty();
        map.set(&field("a.b.c"), FirestoreValue::from_integer(1));
        assert_eq!(map.get(&field("a.b.c")), Some(&FirestoreValue::from_integer(1)));
        assert!(map.get(&field("a.b")).unwrap().as_map().is_some());
    }

    #[test]
    fn set_replaces_scalar_parents() {
        let mut map = MapValue::empty();
        map.set(&field("a"), FirestoreValue::from_string("scalar"));
        map.set(&field("a.b"), FirestoreValue::from_bool(true));
        assert_eq!(map.get(&field("a.b")), Some(&FirestoreValue::from_bool(true)));
    }

    #[test]
    fn delete_leaves_missing_parents_alone() {
        let mut map = MapValue::empty();
        map.set(&field("a.b"), FirestoreValue::from_integer(1));
        map.set(&field("a.c"), FirestoreValue::from_integer(2));
        map.delete(&field("a.b"));
        map.delete(&field("x.y"));
        assert_eq!(map.get(&field("a.b")), None);
        assert_eq!(map.get(&field("a.c")), Some(&FirestoreValue::from_integer(2)));
    }

    #[test]
    fn field_mask_lists_leaves() {
        let mut map = MapValue::empty();
        map.set(&field("a.b"), FirestoreValue::from_integer(1));
        map.set(&field("c"), FirestoreValue::from_map(BTreeMap::new()));
        let mask: Vec<String> = map.field_mask().iter().map(FieldPath::canonical_string).collect();
        assert_eq!(mask, vec!["a.b".to_string(), "c".to_string()]);
    }
}
