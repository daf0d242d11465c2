use std::collections::BTreeSet;

use crate::firestore::model::{
    BasePath, Document, DocumentKey, FieldMask, FieldPath, SnapshotVersion, Timestamp,
};
use crate::firestore::value::{ArrayValue, FirestoreValue, MapValue, ValueKind};
use crate::util::hard_assert;

/// Condition a document must satisfy for a mutation to apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &Document) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

impl TransformOperation {
    /// Locally visible result of the transform on top of `previous`.
    fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ServerTimestamp => {
                FirestoreValue::server_timestamp(local_write_time, previous.cloned())
            }
            TransformOperation::ArrayUnion(elements) => {
                FirestoreValue::from_array(coerce_array(previous).union(elements).into_values())
            }
            TransformOperation::ArrayRemove(elements) => FirestoreValue::from_array(
                coerce_array(previous).remove_all(elements).into_values(),
            ),
            TransformOperation::NumericIncrement(operand) => {
                let base = self
                    .compute_base_value(previous)
                    .unwrap_or_else(|| FirestoreValue::from_integer(0));
                increment(&base, operand)
            }
        }
    }

    /// Value after the backend acknowledged the transform with `result`.
    fn apply_to_remote_document(
        &self,
        previous: Option<&FirestoreValue>,
        result: &FirestoreValue,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ArrayUnion(elements) => {
                FirestoreValue::from_array(coerce_array(previous).union(elements).into_values())
            }
            TransformOperation::ArrayRemove(elements) => FirestoreValue::from_array(
                coerce_array(previous).remove_all(elements).into_values(),
            ),
            TransformOperation::ServerTimestamp | TransformOperation::NumericIncrement(_) => {
                result.clone()
            }
        }
    }

    /// Base value to persist alongside a non-idempotent transform so that the
    /// local view stays stable while the write is pending.
    fn compute_base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match self {
            TransformOperation::NumericIncrement(_) => match previous {
                Some(value) if value.is_number() => Some(value.clone()),
                _ => Some(FirestoreValue::from_integer(0)),
            },
            _ => None,
        }
    }
}

fn coerce_array(value: Option<&FirestoreValue>) -> ArrayValue {
    value
        .and_then(FirestoreValue::as_array)
        .cloned()
        .unwrap_or_default()
}

fn increment(base: &FirestoreValue, operand: &FirestoreValue) -> FirestoreValue {
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(current), ValueKind::Integer(delta)) => {
            FirestoreValue::from_integer(current.saturating_add(*delta))
        }
        (ValueKind::Integer(current), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(*current as f64 + delta)
        }
        (ValueKind::Double(current), ValueKind::Integer(delta)) => {
            FirestoreValue::from_double(current + *delta as f64)
        }
        (ValueKind::Double(current), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(current + delta)
        }
        _ => operand.clone(),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    field_path: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field_path: FieldPath, operation: TransformOperation) -> Self {
        Self {
            field_path,
            operation,
        }
    }

    pub fn field_path(&self) -> &FieldPath {
        &self.field_path
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MutationKind {
    /// Replaces the whole document.
    Set { value: MapValue },
    /// Writes the fields named by `mask`; masked fields absent from `value`
    /// are deleted.
    Patch { value: MapValue, mask: FieldMask },
    Delete,
    /// Only checks the precondition; used by transactions.
    Verify,
}

/// The backend's answer for one mutation of an acknowledged batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<FirestoreValue>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Vec<FirestoreValue>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

/// One write against one document.
#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    key: DocumentKey,
    kind: MutationKind,
    precondition: Precondition,
    field_transforms: Vec<FieldTransform>,
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Self::new(key, MutationKind::Set { value }, Precondition::None)
    }

    pub fn patch(key: DocumentKey, value: MapValue, mask: FieldMask) -> Self {
        Self::new(
            key,
            MutationKind::Patch { value, mask },
            Precondition::Exists(true),
        )
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self::new(key, MutationKind::Delete, Precondition::None)
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Self::new(key, MutationKind::Verify, precondition)
    }

    pub fn new(key: DocumentKey, kind: MutationKind, precondition: Precondition) -> Self {
        Self {
            key,
            kind,
            precondition,
            field_transforms: Vec::new(),
        }
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    pub fn with_transforms(mut self, field_transforms: Vec<FieldTransform>) -> Self {
        self.field_transforms = field_transforms;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn kind(&self) -> &MutationKind {
        &self.kind
    }

    pub fn precondition(&self) -> Precondition {
        self.precondition
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        &self.field_transforms
    }

    pub fn is_patch(&self) -> bool {
        matches!(self.kind, MutationKind::Patch { .. })
    }

    /// Fields this mutation touches; `None` means the whole document.
    pub fn field_mask(&self) -> Option<FieldMask> {
        match &self.kind {
            MutationKind::Patch { mask, .. } => Some(mask.union(
                self.field_transforms
                    .iter()
                    .map(|transform| transform.field_path().clone()),
            )),
            _ => None,
        }
    }

    /// Applies an acknowledged write to the cached remote document.
    pub fn apply_to_remote_document(&self, document: &mut Document, result: &MutationResult) {
        self.verify_key_matches(document);
        match &self.kind {
            MutationKind::Set { value } => {
                let mut data = value.clone();
                for (path, transformed) in self.server_transform_results(document, result) {
                    data.set(&path, transformed);
                }
                document
                    .convert_to_found(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Patch { .. } => {
                if !self.precondition.is_valid_for(document) {
                    // The patch hit a document we do not have; its content is unknown.
                    document.convert_to_unknown(result.version);
                    return;
                }
                let transforms = self.server_transform_results(document, result);
                let mut data = document.data().clone();
                self.apply_patch(&mut data);
                for (path, transformed) in transforms {
                    data.set(&path, transformed);
                }
                document
                    .convert_to_found(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Delete => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            MutationKind::Verify => {}
        }
    }

    /// Applies the mutation to the locally visible document.
    ///
    /// `previous_mask` is the set of fields already changed by earlier
    /// mutations (`None` = the whole document). Returns the accumulated mask.
    pub fn apply_to_local_view(
        &self,
        document: &mut Document,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        self.verify_key_matches(document);
        if !self.precondition.is_valid_for(document) {
            return previous_mask;
        }
        match &self.kind {
            MutationKind::Set { value } => {
                let transforms = self.local_transform_results(document, local_write_time);
                let mut data = value.clone();
                for (path, transformed) in transforms {
                    data.set(&path, transformed);
                }
                let version = document.version();
                document.convert_to_found(version, data).set_has_local_mutations();
                None
            }
            MutationKind::Patch { mask, .. } => {
                let transforms = self.local_transform_results(document, local_write_time);
                let mut data = document.data().clone();
                self.apply_patch(&mut data);
                for (path, transformed) in transforms {
                    data.set(&path, transformed);
                }
                let version = document.version();
                document.convert_to_found(version, data).set_has_local_mutations();
                previous_mask.map(|previous| {
                    previous
                        .union(mask.mask().iter().cloned())
                        .union(self.field_transforms.iter().map(|t| t.field_path().clone()))
                })
            }
            MutationKind::Delete => {
                let version = document.version();
                document.convert_to_no_document(version).set_has_local_mutations();
                None
            }
            MutationKind::Verify => previous_mask,
        }
    }

    /// Values that pin non-idempotent transforms (increments) to the state the
    /// user saw when writing. `None` when no transform needs one.
    pub fn extract_transform_base_value(&self, document: &Document) -> Option<MapValue> {
        let mut base = MapValue::empty();
        let mut found = false;
        for transform in &self.field_transforms {
            let existing = document.field(transform.field_path());
            if let Some(value) = transform.operation().compute_base_value(existing) {
                base.set(transform.field_path(), value);
                found = true;
            }
        }
        found.then_some(base)
    }

    fn apply_patch(&self, data: &mut MapValue) {
        if let MutationKind::Patch { value, mask } = &self.kind {
            for path in mask.mask() {
                if path.is_empty() {
                    continue;
                }
                match value.get(path) {
                    Some(new_value) => data.set(path, new_value.clone()),
                    None => data.delete(path),
                }
            }
        }
    }

    fn server_transform_results(
        &self,
        document: &Document,
        result: &MutationResult,
    ) -> Vec<(FieldPath, FirestoreValue)> {
        if self.field_transforms.is_empty() {
            return Vec::new();
        }
        hard_assert(
            self.field_transforms.len() == result.transform_results.len(),
            format!(
                "server transform result count ({}) should match field transform count ({})",
                result.transform_results.len(),
                self.field_transforms.len()
            ),
        );
        self.field_transforms
            .iter()
            .zip(&result.transform_results)
            .map(|(transform, server_value)| {
                let previous = document.field(transform.field_path());
                (
                    transform.field_path().clone(),
                    transform
                        .operation()
                        .apply_to_remote_document(previous, server_value),
                )
            })
            .collect()
    }

    fn local_transform_results(
        &self,
        document: &Document,
        local_write_time: Timestamp,
    ) -> Vec<(FieldPath, FirestoreValue)> {
        self.field_transforms
            .iter()
            .map(|transform| {
                let previous = document.field(transform.field_path());
                (
                    transform.field_path().clone(),
                    transform
                        .operation()
                        .apply_to_local_view(previous, local_write_time),
                )
            })
            .collect()
    }

    fn verify_key_matches(&self, document: &Document) {
        hard_assert(
            document.key() == &self.key,
            format!(
                "can only apply a mutation to a document with the same key ({} vs {})",
                self.key,
                document.key()
            ),
        );
    }

    /// Squashes the local state of `document` into a single mutation that
    /// reproduces it on top of the remote version.
    ///
    /// `mask` is the accumulated set of changed fields (`None` = the whole
    /// document). Returns `None` when the document has no local changes.
    pub fn calculate_overlay_mutation(
        document: &Document,
        mask: Option<&FieldMask>,
    ) -> Option<Mutation> {
        if !document.has_local_mutations() || mask.is_some_and(FieldMask::is_empty) {
            return None;
        }

        let Some(mask) = mask else {
            return Some(if document.is_no_document() {
                Mutation::delete(document.key().clone())
            } else {
                Mutation::set(document.key().clone(), document.data().clone())
            });
        };

        let data = document.data();
        let mut patch_value = MapValue::empty();
        let mut patch_mask = BTreeSet::new();
        for path in mask.mask() {
            if patch_mask.contains(path) {
                continue;
            }
            let mut path = path.clone();
            let mut value = data.get(&path);
            // A deleted nested field is expressed by rewriting its parent.
            if value.is_none() && path.len() > 1 {
                path = path.without_last();
                value = data.get(&path);
            }
            match value {
                Some(value) => patch_value.set(&path, value.clone()),
                None => patch_value.delete(&path),
            }
            patch_mask.insert(path);
        }
        Some(
            Mutation::patch(
                document.key().clone(),
                patch_value,
                FieldMask::new(patch_mask),
            )
            .with_precondition(Precondition::None),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn map(entries: &[(&str, FirestoreValue)]) -> MapValue {
        let mut value = MapValue::empty();
        for (path, entry) in entries {
            value.set(&field(path), entry.clone());
        }
        value
    }

    fn int(value: i64) -> FirestoreValue {
        FirestoreValue::from_integer(value)
    }

    fn found(path: &str, entries: &[(&str, FirestoreValue)]) -> Document {
        Document::new_found(key(path), SnapshotVersion::from_micros(1), map(entries))
    }

    #[test]
    fn set_replaces_document() {
        let mut document = found("rooms/eros", &[("a", int(1)), ("b", int(2))]);
        let set = Mutation::set(key("rooms/eros"), map(&[("c", int(3))]));
        let mask = set.apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        assert_eq!(mask, None);
        assert_eq!(document.data(), &map(&[("c", int(3))]));
        assert!(document.has_local_mutations());
    }

    #[test]
    fn patch_merges_and_deletes_masked_fields() {
        let mut document = found("rooms/eros", &[("a", int(1)), ("b.c", int(2))]);
        let patch = Mutation::patch(
            key("rooms/eros"),
            map(&[("a", int(10))]),
            FieldMask::from_paths([field("a"), field("b.c")]),
        );
        let mask = patch
            .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now())
            .unwrap();
        assert_eq!(document.field(&field("a")), Some(&int(10)));
        assert_eq!(document.field(&field("b.c")), None);
        assert!(mask.covers(&field("a")));
        assert!(mask.covers(&field("b.c")));
    }

    #[test]
    fn patch_requires_existing_document() {
        let mut document = Document::new_no_document(key("rooms/eros"), SnapshotVersion::from_micros(1));
        let patch = Mutation::patch(
            key("rooms/eros"),
            map(&[("a", int(1))]),
            FieldMask::from_paths([field("a")]),
        );
        let mask = patch.apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        assert_eq!(mask, Some(FieldMask::empty()));
        assert!(document.is_no_document());
    }

    #[test]
    fn transforms_apply_locally() {
        let mut document = found(
            "rooms/eros",
            &[("count", int(1)), ("tags", FirestoreValue::from_array(vec![int(1)]))],
        );
        let patch = Mutation::patch(key("rooms/eros"), MapValue::empty(), FieldMask::empty())
            .with_transforms(vec![
                FieldTransform::new(field("count"), TransformOperation::NumericIncrement(int(2))),
                FieldTransform::new(
                    field("tags"),
                    TransformOperation::ArrayUnion(vec![int(1), int(2)]),
                ),
                FieldTransform::new(field("at"), TransformOperation::ServerTimestamp),
            ]);
        patch.apply_to_local_view(&mut document, None, Timestamp::new(5, 0));
        assert_eq!(document.field(&field("count")), Some(&int(3)));
        assert_eq!(
            document.field(&field("tags")),
            Some(&FirestoreValue::from_array(vec![int(1), int(2)]))
        );
        assert!(matches!(
            document.field(&field("at")).map(FirestoreValue::kind),
            Some(ValueKind::ServerTimestamp { .. })
        ));
    }

    #[test]
    fn increment_base_value_pins_non_numbers_to_zero() {
        let document = found("rooms/eros", &[("count", FirestoreValue::from_string("x"))]);
        let patch = Mutation::patch(key("rooms/eros"), MapValue::empty(), FieldMask::empty())
            .with_transforms(vec![FieldTransform::new(
                field("count"),
                TransformOperation::NumericIncrement(int(1)),
            )]);
        let base = patch.extract_transform_base_value(&document).unwrap();
        assert_eq!(base.get(&field("count")), Some(&int(0)));
    }

    #[test]
    fn acknowledged_patch_on_missing_document_becomes_unknown() {
        let mut document = Document::new_invalid(key("rooms/eros"));
        let patch = Mutation::patch(
            key("rooms/eros"),
            map(&[("a", int(1))]),
            FieldMask::from_paths([field("a")]),
        );
        let result = MutationResult::new(SnapshotVersion::from_micros(7), Vec::new());
        patch.apply_to_remote_document(&mut document, &result);
        assert!(document.is_unknown_document());
        assert_eq!(document.version(), SnapshotVersion::from_micros(7));
    }

    #[test]
    fn acknowledged_server_timestamp_uses_server_value() {
        let mut document = found("rooms/eros", &[]);
        let set = Mutation::set(key("rooms/eros"), MapValue::empty()).with_transforms(vec![
            FieldTransform::new(field("at"), TransformOperation::ServerTimestamp),
        ]);
        let server_time = FirestoreValue::from_timestamp(Timestamp::new(100, 0));
        let result = MutationResult::new(SnapshotVersion::from_micros(9), vec![server_time.clone()]);
        set.apply_to_remote_document(&mut document, &result);
        assert_eq!(document.field(&field("at")), Some(&server_time));
        assert!(document.has_committed_mutations());
    }

    #[test]
    fn overlay_of_nested_delete_rewrites_parent() {
        let mut document = found("rooms/eros", &[("a.b", int(1)), ("a.c", int(2))]);
        let patch = Mutation::patch(
            key("rooms/eros"),
            MapValue::empty(),
            FieldMask::from_paths([field("a.b")]),
        );
        let mask = patch.apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        let overlay = Mutation::calculate_overlay_mutation(&document, mask.as_ref()).unwrap();
        match overlay.kind() {
            MutationKind::Patch { value, mask } => {
                assert_eq!(mask.mask().iter().collect::<Vec<_>>(), vec![&field("a")]);
                assert_eq!(
                    value.get(&field("a")),
                    Some(&FirestoreValue::from_map(BTreeMap::from([(
                        "c".to_string(),
                        int(2)
                    )])))
                );
            }
            other => panic!("unexpected overlay {other:?}"),
        }
    }

    #[test]
    fn overlay_of_whole_document_delete() {
        let mut document = found("rooms/eros", &[("a", int(1))]);
        let delete = Mutation::delete(key("rooms/eros"));
        let mask = delete.apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        let overlay = Mutation::calculate_overlay_mutation(&document, mask.as_ref()).unwrap();
        assert_eq!(overlay.kind(), &MutationKind::Delete);
    }
}
