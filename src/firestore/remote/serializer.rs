use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::{json, Value as JsonValue};

use crate::firestore::core::{Bound, CompositeOperator, Direction, Filter, Operator, Target};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::TargetData;
use crate::firestore::model::{
    BasePath, DatabaseId, Document, DocumentKey, FieldTransform, GeoPoint, Mutation, MutationBatch,
    MutationKind, MutationResult, Precondition, SnapshotVersion, Timestamp, TransformOperation,
};
use crate::firestore::value::{BytesValue, FirestoreValue, MapValue, ValueKind};

/// Encodes targets and writes into the JSON shape of the Firestore RPC API,
/// and decodes the documents and results coming back.
#[derive(Clone, Debug)]
pub struct RemoteSerializer {
    database_id: DatabaseId,
}

impl RemoteSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.database_id.document_name(key)
    }

    pub fn document_key_from_name(&self, name: &str) -> FirestoreResult<DocumentKey> {
        self.database_id.key_from_name(name)
    }

    /// `{targetId, query|documents, resumeToken|readTime}` for a watch
    /// request.
    pub fn encode_target(&self, target_data: &TargetData) -> JsonValue {
        let target = target_data.target();
        let mut request = serde_json::Map::new();
        request.insert("targetId".to_string(), json!(target_data.target_id()));
        if target.is_document_query() {
            request.insert(
                "documents".to_string(),
                json!({ "documents": [self.encode_resource_name(target)] }),
            );
        } else {
            request.insert("query".to_string(), self.encode_query_target(target));
        }

        if !target_data.resume_token().is_empty() {
            request.insert(
                "resumeToken".to_string(),
                json!(BASE64_STANDARD.encode(target_data.resume_token())),
            );
        } else if !target_data.snapshot_version().is_none() {
            request.insert(
                "readTime".to_string(),
                json!(target_data.snapshot_version().timestamp().to_rfc3339()),
            );
        }
        JsonValue::Object(request)
    }

    fn encode_resource_name(&self, target: &Target) -> String {
        format!(
            "{}/documents/{}",
            self.database_id.database_name(),
            target.path()
        )
    }

    /// `{parent, structuredQuery}`; collection queries are rooted at the
    /// parent of the queried collection.
    pub fn encode_query_target(&self, target: &Target) -> JsonValue {
        let (parent, collection_id, all_descendants) = match target.collection_group() {
            Some(group) => (target.path().clone(), group.to_string(), true),
            None => (
                target.path().without_last(),
                target.path().last_segment().unwrap_or_default().to_string(),
                false,
            ),
        };

        let mut structured = serde_json::Map::new();
        structured.insert(
            "from".to_string(),
            json!([{ "collectionId": collection_id, "allDescendants": all_descendants }]),
        );
        match target.filters() {
            [] => {}
            [filter] => {
                structured.insert("where".to_string(), self.encode_filter(filter));
            }
            filters => {
                structured.insert(
                    "where".to_string(),
                    self.encode_filter(&Filter::and(filters.to_vec())),
                );
            }
        }

        let orders: Vec<JsonValue> = target
            .order_by()
            .iter()
            .map(|order| {
                json!({
                    "field": { "fieldPath": order.field().canonical_string() },
                    "direction": match order.direction() {
                        Direction::Ascending => "ASCENDING",
                        Direction::Descending => "DESCENDING",
                    },
                })
            })
            .collect();
        structured.insert("orderBy".to_string(), JsonValue::Array(orders));

        if let Some(limit) = target.limit() {
            structured.insert("limit".to_string(), json!(limit));
        }
        if let Some(start) = target.start_at() {
            structured.insert("startAt".to_string(), self.encode_cursor(start, true));
        }
        if let Some(end) = target.end_at() {
            structured.insert("endAt".to_string(), self.encode_cursor(end, false));
        }

        let parent_name = if parent.is_empty() {
            format!("{}/documents", self.database_id.database_name())
        } else {
            format!("{}/documents/{}", self.database_id.database_name(), parent)
        };
        json!({
            "parent": parent_name,
            "structuredQuery": JsonValue::Object(structured),
        })
    }

    /// A `runAggregationQuery` request counting the target's documents.
    pub fn encode_count_query(&self, target: &Target) -> JsonValue {
        let mut query_target = self.encode_query_target(target);
        let structured = query_target
            .get_mut("structuredQuery")
            .map(JsonValue::take)
            .unwrap_or(JsonValue::Null);
        json!({
            "parent": query_target["parent"].take(),
            "structuredAggregationQuery": {
                "structuredQuery": structured,
                "aggregations": [{ "alias": "count", "count": {} }],
            }
        })
    }

    fn encode_filter(&self, filter: &Filter) -> JsonValue {
        match filter {
            Filter::Field(field_filter) => {
                let field = json!({ "fieldPath": field_filter.field().canonical_string() });
                let value = field_filter.value();
                match field_filter.op() {
                    Operator::Equal if value.is_null() => {
                        json!({ "unaryFilter": { "field": field, "op": "IS_NULL" } })
                    }
                    Operator::Equal if value.is_nan() => {
                        json!({ "unaryFilter": { "field": field, "op": "IS_NAN" } })
                    }
                    Operator::NotEqual if value.is_null() => {
                        json!({ "unaryFilter": { "field": field, "op": "IS_NOT_NULL" } })
                    }
                    Operator::NotEqual if value.is_nan() => {
                        json!({ "unaryFilter": { "field": field, "op": "IS_NOT_NAN" } })
                    }
                    op => json!({
                        "fieldFilter": {
                            "field": field,
                            "op": encode_operator(op),
                            "value": encode_value(value),
                        }
                    }),
                }
            }
            Filter::Composite(composite) => json!({
                "compositeFilter": {
                    "op": match composite.op() {
                        CompositeOperator::And => "AND",
                        CompositeOperator::Or => "OR",
                    },
                    "filters": composite
                        .filters()
                        .iter()
                        .map(|child| self.encode_filter(child))
                        .collect::<Vec<_>>(),
                }
            }),
        }
    }

    fn encode_cursor(&self, bound: &Bound, start: bool) -> JsonValue {
        json!({
            "values": bound.position().iter().map(encode_value).collect::<Vec<_>>(),
            "before": if start { bound.is_inclusive() } else { !bound.is_inclusive() },
        })
    }

    /// `{writes: [...], streamToken}` for one batch on the write stream.
    pub fn encode_mutation_batch(&self, batch: &MutationBatch, stream_token: &[u8]) -> JsonValue {
        let writes: Vec<JsonValue> = batch
            .mutations()
            .iter()
            .map(|mutation| self.encode_mutation(mutation))
            .collect();
        let mut request = serde_json::Map::new();
        request.insert("writes".to_string(), JsonValue::Array(writes));
        if !stream_token.is_empty() {
            request.insert(
                "streamToken".to_string(),
                json!(BASE64_STANDARD.encode(stream_token)),
            );
        }
        JsonValue::Object(request)
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let name = self.document_name(mutation.key());
        let mut write = serde_json::Map::new();
        match mutation.kind() {
            MutationKind::Set { value } => {
                write.insert(
                    "update".to_string(),
                    json!({ "name": name, "fields": encode_map_fields(value) }),
                );
            }
            MutationKind::Patch { value, mask } => {
                write.insert(
                    "update".to_string(),
                    json!({ "name": name, "fields": encode_map_fields(value) }),
                );
                let paths: Vec<String> = mask
                    .mask()
                    .iter()
                    .map(|path| path.canonical_string())
                    .collect();
                write.insert("updateMask".to_string(), json!({ "fieldPaths": paths }));
            }
            MutationKind::Delete => {
                write.insert("delete".to_string(), json!(name));
            }
            MutationKind::Verify => {
                write.insert("verify".to_string(), json!(name));
            }
        }

        if !mutation.field_transforms().is_empty() {
            write.insert(
                "updateTransforms".to_string(),
                JsonValue::Array(
                    mutation
                        .field_transforms()
                        .iter()
                        .map(encode_field_transform)
                        .collect(),
                ),
            );
        }
        match mutation.precondition() {
            Precondition::None => {}
            Precondition::Exists(exists) => {
                write.insert("currentDocument".to_string(), json!({ "exists": exists }));
            }
            Precondition::UpdateTime(version) => {
                write.insert(
                    "currentDocument".to_string(),
                    json!({ "updateTime": version.timestamp().to_rfc3339() }),
                );
            }
        }
        JsonValue::Object(write)
    }

    /// A found document from `{name, fields, updateTime}`.
    pub fn decode_document(&self, value: &JsonValue) -> FirestoreResult<Document> {
        let name = value
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document missing name"))?;
        let key = self.document_key_from_name(name)?;
        let version = decode_version(value.get("updateTime"))?;
        let data = decode_map_value(value)?;
        Ok(Document::new_found(key, version, data))
    }

    /// `{updateTime, transformResults}` of one acknowledged write. Writes
    /// without an update time (deletes of missing documents) take the commit
    /// version.
    pub fn decode_mutation_result(
        &self,
        value: &JsonValue,
        commit_version: SnapshotVersion,
    ) -> FirestoreResult<MutationResult> {
        let mut version = decode_version(value.get("updateTime"))?;
        if version.is_none() {
            version = commit_version;
        }
        let transform_results = value
            .get("transformResults")
            .and_then(JsonValue::as_array)
            .map(|results| results.iter().map(decode_value).collect::<FirestoreResult<Vec<_>>>())
            .transpose()?
            .unwrap_or_default();
        Ok(MutationResult::new(version, transform_results))
    }

    /// `{commitTime, writeResults, streamToken}` of a write response.
    pub fn decode_write_response(
        &self,
        value: &JsonValue,
    ) -> FirestoreResult<(SnapshotVersion, Vec<MutationResult>, Vec<u8>)> {
        let commit_version = decode_version(value.get("commitTime"))?;
        let results = value
            .get("writeResults")
            .and_then(JsonValue::as_array)
            .map(|results| {
                results
                    .iter()
                    .map(|result| self.decode_mutation_result(result, commit_version))
                    .collect::<FirestoreResult<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();
        let stream_token = decode_bytes(value.get("streamToken"))?;
        Ok((commit_version, results, stream_token))
    }

    pub fn decode_timestamp_string(&self, value: &str) -> FirestoreResult<Timestamp> {
        Timestamp::parse_rfc3339(value)
    }
}

fn encode_operator(op: Operator) -> &'static str {
    match op {
        Operator::LessThan => "LESS_THAN",
        Operator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
        Operator::Equal => "EQUAL",
        Operator::NotEqual => "NOT_EQUAL",
        Operator::GreaterThan => "GREATER_THAN",
        Operator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
        Operator::ArrayContains => "ARRAY_CONTAINS",
        Operator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
        Operator::In => "IN",
        Operator::NotIn => "NOT_IN",
    }
}

fn encode_field_transform(transform: &FieldTransform) -> JsonValue {
    let field_path = transform.field_path().canonical_string();
    match transform.operation() {
        TransformOperation::ServerTimestamp => json!({
            "fieldPath": field_path,
            "setToServerValue": "REQUEST_TIME"
        }),
        TransformOperation::ArrayUnion(elements) => json!({
            "fieldPath": field_path,
            "appendMissingElements": { "values": elements.iter().map(encode_value).collect::<Vec<_>>() }
        }),
        TransformOperation::ArrayRemove(elements) => json!({
            "fieldPath": field_path,
            "removeAllFromArray": { "values": elements.iter().map(encode_value).collect::<Vec<_>>() }
        }),
        TransformOperation::NumericIncrement(operand) => json!({
            "fieldPath": field_path,
            "increment": encode_value(operand)
        }),
    }
}

fn encode_map_fields(map: &MapValue) -> JsonValue {
    let fields: serde_json::Map<String, JsonValue> = map
        .fields()
        .iter()
        .map(|(key, value)| (key.clone(), encode_value(value)))
        .collect();
    JsonValue::Object(fields)
}

pub(crate) fn encode_value(value: &FirestoreValue) -> JsonValue {
    match value.kind() {
        ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
        ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
        ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
        ValueKind::Double(double) => json!({ "doubleValue": double }),
        ValueKind::Timestamp(timestamp) => json!({ "timestampValue": timestamp.to_rfc3339() }),
        // Pending server timestamps only exist in local views and are sent as
        // transforms, never as values.
        ValueKind::ServerTimestamp { .. } => json!({ "nullValue": JsonValue::Null }),
        ValueKind::String(string) => json!({ "stringValue": string }),
        ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
        ValueKind::Reference(reference) => json!({ "referenceValue": reference }),
        ValueKind::GeoPoint(point) => json!({
            "geoPointValue": {
                "latitude": point.latitude(),
                "longitude": point.longitude(),
            }
        }),
        ValueKind::Array(array) => {
            json!({ "arrayValue": { "values": array.values().iter().map(encode_value).collect::<Vec<_>>() } })
        }
        ValueKind::Map(map) => json!({ "mapValue": { "fields": encode_map_fields(map) } }),
    }
}

fn decode_version(value: Option<&JsonValue>) -> FirestoreResult<SnapshotVersion> {
    match value.and_then(JsonValue::as_str) {
        Some(timestamp) => Ok(SnapshotVersion::new(Timestamp::parse_rfc3339(timestamp)?)),
        None => Ok(SnapshotVersion::NONE),
    }
}

pub(crate) fn decode_bytes(value: Option<&JsonValue>) -> FirestoreResult<Vec<u8>> {
    match value.and_then(JsonValue::as_str) {
        Some(encoded) => BASE64_STANDARD
            .decode(encoded)
            .map_err(|err| invalid_argument(format!("Invalid base64 token: {err}"))),
        None => Ok(Vec::new()),
    }
}

fn decode_map_value(value: &JsonValue) -> FirestoreResult<MapValue> {
    let Some(fields_value) = value.get("fields") else {
        return Ok(MapValue::empty());
    };
    let fields_object = fields_value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?;
    let mut fields = BTreeMap::new();
    for (key, value) in fields_object {
        fields.insert(key.clone(), decode_value(value)?);
    }
    Ok(MapValue::new(fields))
}

pub(crate) fn decode_value(value: &JsonValue) -> FirestoreResult<FirestoreValue> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected Firestore value object"))?;
    if object.contains_key("nullValue") {
        return Ok(FirestoreValue::null());
    }
    if let Some(bool_value) = object.get("booleanValue") {
        let value = bool_value
            .as_bool()
            .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
        return Ok(FirestoreValue::from_bool(value));
    }
    if let Some(integer_value) = object.get("integerValue") {
        let parsed = match integer_value {
            JsonValue::String(value) => i64::from_str(value)
                .map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?,
            JsonValue::Number(number) => number
                .as_i64()
                .ok_or_else(|| invalid_argument("Integer out of range"))?,
            _ => return Err(invalid_argument("integerValue must be a string or number")),
        };
        return Ok(FirestoreValue::from_integer(parsed));
    }
    if let Some(double_value) = object.get("doubleValue") {
        let parsed = match double_value {
            JsonValue::Number(number) => number
                .as_f64()
                .ok_or_else(|| invalid_argument("Invalid doubleValue"))?,
            JsonValue::String(value) => match value.as_str() {
                "NaN" => f64::NAN,
                "Infinity" => f64::INFINITY,
                "-Infinity" => f64::NEG_INFINITY,
                other => other
                    .parse::<f64>()
                    .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
            },
            _ => return Err(invalid_argument("doubleValue must be a number or string")),
        };
        return Ok(FirestoreValue::from_double(parsed));
    }
    if let Some(timestamp_value) = object.get("timestampValue") {
        let timestamp = timestamp_value
            .as_str()
            .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
        return Ok(FirestoreValue::from_timestamp(Timestamp::parse_rfc3339(timestamp)?));
    }
    if let Some(string_value) = object.get("stringValue") {
        let value = string_value
            .as_str()
            .ok_or_else(|| invalid_argument("stringValue must be string"))?;
        return Ok(FirestoreValue::from_string(value));
    }
    if let Some(bytes_value) = object.get("bytesValue") {
        let encoded = bytes_value
            .as_str()
            .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
        let decoded = BytesValue::from_base64(encoded)
            .map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
        return Ok(FirestoreValue::from_bytes(decoded));
    }
    if let Some(reference_value) = object.get("referenceValue") {
        let value = reference_value
            .as_str()
            .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
        return Ok(FirestoreValue::from_reference(value));
    }
    if let Some(geo_point) = object.get("geoPointValue") {
        let latitude = geo_point
            .get("latitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or_default();
        let longitude = geo_point
            .get("longitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or_default();
        return Ok(FirestoreValue::from_geo_point(GeoPoint::new(latitude, longitude)?));
    }
    if let Some(array_value) = object.get("arrayValue") {
        let values = array_value
            .get("values")
            .and_then(JsonValue::as_array)
            .map(|entries| entries.iter().map(decode_value).collect::<FirestoreResult<Vec<_>>>())
            .transpose()?
            .unwrap_or_default();
        return Ok(FirestoreValue::from_array(values));
    }
    if let Some(map_value) = object.get("mapValue") {
        return Ok(FirestoreValue::from_map_value(decode_map_value(map_value)?));
    }

    Err(invalid_argument("Unknown Firestore value type"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{FieldFilter, Query};
    use crate::firestore::local::QueryPurpose;
    use crate::firestore::model::{FieldMask, FieldPath, ResourcePath};

    fn serializer() -> RemoteSerializer {
        RemoteSerializer::new(DatabaseId::default("project"))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn encodes_collection_targets_with_resume_token() {
        let query = Query::at_path(ResourcePath::from_segments(["rooms", "r1", "messages"]))
            .with_filter(
                FieldFilter::new(
                    FieldPath::from_dot_separated("n").unwrap(),
                    Operator::GreaterThan,
                    FirestoreValue::from_integer(1),
                )
                .unwrap(),
            )
            .with_limit_to_first(2);
        let target_data = TargetData::new(query.to_target(), 4, QueryPurpose::Listen, 1)
            .with_resume_token(vec![1, 2], SnapshotVersion::from_micros(10));

        let encoded = serializer().encode_target(&target_data);
        assert_eq!(encoded["targetId"], json!(4));
        assert_eq!(encoded["resumeToken"], json!(BASE64_STANDARD.encode([1u8, 2])));
        assert_eq!(
            encoded["query"]["parent"],
            json!("projects/project/databases/(default)/documents/rooms/r1")
        );
        let structured = &encoded["query"]["structuredQuery"];
        assert_eq!(structured["from"][0]["collectionId"], json!("messages"));
        assert_eq!(structured["where"]["fieldFilter"]["op"], json!("GREATER_THAN"));
        assert_eq!(structured["limit"], json!(2));
        assert_eq!(structured["orderBy"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn encodes_document_targets_and_null_filters() {
        let target_data = TargetData::new(
            Target::for_document(&key("rooms/a")),
            1,
            QueryPurpose::LimboResolution,
            1,
        );
        let encoded = serializer().encode_target(&target_data);
        assert_eq!(
            encoded["documents"]["documents"][0],
            json!("projects/project/databases/(default)/documents/rooms/a")
        );

        let filter = Filter::Field(
            FieldFilter::new(
                FieldPath::from_dot_separated("a").unwrap(),
                Operator::Equal,
                FirestoreValue::null(),
            )
            .unwrap(),
        );
        assert_eq!(
            serializer().encode_filter(&filter)["unaryFilter"]["op"],
            json!("IS_NULL")
        );
    }

    #[test]
    fn encodes_patch_writes_with_mask_and_precondition() {
        let mutation = Mutation::patch(
            key("rooms/a"),
            MapValue::new(BTreeMap::from([(
                "n".to_string(),
                FirestoreValue::from_integer(1),
            )])),
            FieldMask::from_paths([FieldPath::from_dot_separated("n").unwrap()]),
        );
        let batch = MutationBatch::new(3, Timestamp::from_micros(1), Vec::new(), vec![mutation]);
        let encoded = serializer().encode_mutation_batch(&batch, &[9]);
        let write = &encoded["writes"][0];
        assert_eq!(write["updateMask"]["fieldPaths"], json!(["n"]));
        assert_eq!(write["currentDocument"]["exists"], json!(true));
        assert_eq!(write["update"]["fields"]["n"]["integerValue"], json!("1"));
        assert_eq!(encoded["streamToken"], json!(BASE64_STANDARD.encode([9u8])));
    }

    #[test]
    fn decodes_write_responses() {
        let response = json!({
            "commitTime": "2024-01-01T00:00:01Z",
            "streamToken": BASE64_STANDARD.encode([4u8]),
            "writeResults": [
                { "updateTime": "2024-01-01T00:00:00Z" },
                { "transformResults": [{ "integerValue": "5" }] }
            ]
        });
        let (commit, results, token) = serializer().decode_write_response(&response).unwrap();
        assert_eq!(token, vec![4]);
        assert_eq!(results.len(), 2);
        assert!(results[0].version < commit);
        assert_eq!(results[1].version, commit);
        assert_eq!(results[1].transform_results, vec![FirestoreValue::from_integer(5)]);
    }

    #[test]
    fn decodes_documents() {
        let document = serializer()
            .decode_document(&json!({
                "name": "projects/project/databases/(default)/documents/rooms/a",
                "updateTime": "2024-01-01T00:00:00Z",
                "fields": { "tags": { "arrayValue": { "values": [{ "stringValue": "x" }] } } }
            }))
            .unwrap();
        assert_eq!(document.key(), &key("rooms/a"));
        assert!(document.is_found_document());
        assert_eq!(
            document.field(&FieldPath::from_dot_separated("tags").unwrap()),
            Some(&FirestoreValue::from_array(vec![FirestoreValue::from_string("x")]))
        );
    }
}
