use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::firestore::error::{
    internal_error, invalid_argument, FirestoreError, FirestoreErrorCode, FirestoreResult,
};
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion, TargetId};
use crate::firestore::remote::serializer::{decode_bytes, RemoteSerializer};

/// One message received on the watch stream.
#[derive(Debug, Clone)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentChange),
    /// The document was deleted; the listener should see a tombstone.
    DocumentDelete(DocumentDelete),
    /// The document no longer matches the targets but may still exist.
    DocumentRemove(DocumentRemove),
    ExistenceFilter(ExistenceFilterChange),
}

impl WatchChange {
    /// The consistent snapshot version this change completes, if any. Only a
    /// global no-change with a read time marks a point where every target is
    /// consistent.
    pub fn snapshot_version(&self) -> SnapshotVersion {
        match self {
            WatchChange::TargetChange(change)
                if change.state == TargetChangeState::NoChange && change.target_ids.is_empty() =>
            {
                change.read_time.unwrap_or(SnapshotVersion::NONE)
            }
            _ => SnapshotVersion::NONE,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Empty means the change applies to every active target.
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    pub read_time: Option<SnapshotVersion>,
    pub cause: Option<FirestoreError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetChangeState {
    #[default]
    NoChange,
    Add,
    Remove,
    Current,
    Reset,
}

#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    /// `None` when the backend only reports the key leaving targets.
    pub document: Option<Document>,
}

#[derive(Debug, Clone)]
pub struct DocumentDelete {
    pub key: DocumentKey,
    pub read_time: SnapshotVersion,
    pub removed_target_ids: Vec<TargetId>,
}

#[derive(Debug, Clone)]
pub struct DocumentRemove {
    pub key: DocumentKey,
    pub read_time: SnapshotVersion,
    pub removed_target_ids: Vec<TargetId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: i32,
}

#[derive(Debug, Deserialize)]
struct StatusCause {
    code: i32,
    #[serde(default)]
    message: Option<String>,
}

/// Decodes one JSON listen response. Unknown response kinds yield `None`.
pub fn decode_watch_change(
    serializer: &RemoteSerializer,
    value: &JsonValue,
) -> FirestoreResult<Option<WatchChange>> {
    if let Some(target_change) = value.get("targetChange") {
        return decode_target_change(serializer, target_change).map(Some);
    }
    if let Some(document_change) = value.get("documentChange") {
        return decode_document_change(serializer, document_change).map(Some);
    }
    if let Some(document_delete) = value.get("documentDelete") {
        let (key, read_time, removed_target_ids) =
            decode_document_tombstone(serializer, document_delete, "documentDelete")?;
        return Ok(Some(WatchChange::DocumentDelete(DocumentDelete {
            key,
            read_time,
            removed_target_ids,
        })));
    }
    if let Some(document_remove) = value.get("documentRemove") {
        let (key, read_time, removed_target_ids) =
            decode_document_tombstone(serializer, document_remove, "documentRemove")?;
        return Ok(Some(WatchChange::DocumentRemove(DocumentRemove {
            key,
            read_time,
            removed_target_ids,
        })));
    }
    if let Some(filter) = value.get("filter") {
        return decode_filter_change(filter).map(Some);
    }
    Ok(None)
}

fn decode_target_change(
    serializer: &RemoteSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let target_ids = numeric_array(value.get("targetIds"));
    let resume_token = decode_bytes(value.get("resumeToken"))?;
    let read_time = value
        .get("readTime")
        .and_then(JsonValue::as_str)
        .map(|timestamp| serializer.decode_timestamp_string(timestamp))
        .transpose()?
        .map(SnapshotVersion::new);
    let state = value
        .get("targetChangeType")
        .and_then(JsonValue::as_str)
        .map(target_state_from_str)
        .unwrap_or_default();
    let cause = value
        .get("cause")
        .map(|cause| serde_json::from_value::<StatusCause>(cause.clone()))
        .transpose()
        .map_err(|err| internal_error(format!("Failed to decode watch cause: {err}")))?
        .map(|cause| {
            FirestoreError::new(
                FirestoreErrorCode::from_rpc_code(cause.code),
                cause
                    .message
                    .unwrap_or_else(|| "watch target rejected".to_string()),
            )
        });

    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids,
        resume_token,
        read_time,
        cause,
    }))
}

fn decode_document_change(
    serializer: &RemoteSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let document_value = value
        .get("document")
        .ok_or_else(|| invalid_argument("documentChange missing document"))?;
    let document = serializer.decode_document(document_value)?;
    Ok(WatchChange::DocumentChange(DocumentChange {
        updated_target_ids: numeric_array(value.get("targetIds")),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key: document.key().clone(),
        document: Some(document),
    }))
}

fn decode_document_tombstone(
    serializer: &RemoteSerializer,
    value: &JsonValue,
    kind: &str,
) -> FirestoreResult<(DocumentKey, SnapshotVersion, Vec<TargetId>)> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument(format!("{kind} missing document")))?;
    let key = serializer.document_key_from_name(name)?;
    let read_time = value
        .get("readTime")
        .and_then(JsonValue::as_str)
        .map(|timestamp| serializer.decode_timestamp_string(timestamp))
        .transpose()?
        .map(SnapshotVersion::new)
        .unwrap_or(SnapshotVersion::NONE);
    Ok((key, read_time, numeric_array(value.get("removedTargetIds"))))
}

fn decode_filter_change(value: &JsonValue) -> FirestoreResult<WatchChange> {
    let target_id = value
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| invalid_argument("filter missing targetId"))? as TargetId;
    let count = value
        .get("count")
        .and_then(JsonValue::as_i64)
        .unwrap_or_default() as i32;
    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        count,
    }))
}

fn numeric_array(value: Option<&JsonValue>) -> Vec<TargetId> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|value| value as TargetId))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

fn target_state_from_str(value: &str) -> TargetChangeState {
    match value {
        "ADD" => TargetChangeState::Add,
        "REMOVE" => TargetChangeState::Remove,
        "CURRENT" => TargetChangeState::Current,
        "RESET" => TargetChangeState::Reset,
        _ => TargetChangeState::NoChange,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::DatabaseId;
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use base64::Engine;
    use serde_json::json;

    fn serializer() -> RemoteSerializer {
        RemoteSerializer::new(DatabaseId::new("project", "(default)"))
    }

    #[test]
    fn decodes_target_change() {
        let change = json!({
            "targetChange": {
                "targetIds": [1, 2],
                "resumeToken": BASE64_STANDARD.encode([1u8, 2, 3]),
                "targetChangeType": "CURRENT"
            }
        });

        let decoded = decode_watch_change(&serializer(), &change).unwrap().unwrap();
        match decoded {
            WatchChange::TargetChange(change) => {
                assert_eq!(change.target_ids, vec![1, 2]);
                assert_eq!(change.resume_token, vec![1, 2, 3]);
                assert_eq!(change.state, TargetChangeState::Current);
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn decodes_rejection_cause() {
        let change = json!({
            "targetChange": {
                "targetIds": [4],
                "targetChangeType": "REMOVE",
                "cause": { "code": 7, "message": "denied" }
            }
        });
        let Some(WatchChange::TargetChange(change)) =
            decode_watch_change(&serializer(), &change).unwrap()
        else {
            panic!("expected target change");
        };
        let cause = change.cause.unwrap();
        assert_eq!(cause.code, FirestoreErrorCode::PermissionDenied);
        assert_eq!(cause.message(), "denied");
    }

    #[test]
    fn only_global_no_change_carries_snapshot_version() {
        let global = WatchChange::TargetChange(WatchTargetChange {
            read_time: Some(SnapshotVersion::from_micros(5)),
            ..WatchTargetChange::default()
        });
        assert_eq!(global.snapshot_version(), SnapshotVersion::from_micros(5));

        let scoped = WatchChange::TargetChange(WatchTargetChange {
            target_ids: vec![2],
            read_time: Some(SnapshotVersion::from_micros(5)),
            ..WatchTargetChange::default()
        });
        assert_eq!(scoped.snapshot_version(), SnapshotVersion::NONE);
    }

    #[test]
    fn decodes_document_delete_and_filter() {
        let delete = json!({
            "documentDelete": {
                "document": "projects/project/databases/(default)/documents/rooms/a",
                "removedTargetIds": [2],
                "readTime": "2024-01-01T00:00:00Z"
            }
        });
        match decode_watch_change(&serializer(), &delete).unwrap().unwrap() {
            WatchChange::DocumentDelete(delete) => {
                assert_eq!(delete.key.to_string(), "rooms/a");
                assert_eq!(delete.removed_target_ids, vec![2]);
                assert!(!delete.read_time.is_none());
            }
            other => panic!("unexpected change: {other:?}"),
        }

        let filter = json!({ "filter": { "targetId": 2, "count": 3 } });
        match decode_watch_change(&serializer(), &filter).unwrap().unwrap() {
            WatchChange::ExistenceFilter(filter) => {
                assert_eq!(filter, ExistenceFilterChange { target_id: 2, count: 3 });
            }
            other => panic!("unexpected change: {other:?}"),
        }
        assert!(decode_watch_change(&serializer(), &json!({})).unwrap().is_none());
    }
}
