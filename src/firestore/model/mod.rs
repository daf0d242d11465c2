mod base_path;
mod database_id;
mod document;
mod document_key;
mod field_index;
mod field_mask;
mod field_path;
mod geo_point;
mod mutation;
mod mutation_batch;
mod resource_path;
mod snapshot_version;
mod timestamp;

pub use base_path::BasePath;
pub use database_id::{DatabaseId, DEFAULT_DATABASE_ID};
pub use document::{Document, DocumentState, DocumentType};
pub use document_key::DocumentKey;
pub use field_index::{FieldIndex, IndexKind, IndexSegment};
pub use field_mask::FieldMask;
pub use field_path::{FieldPath, IntoFieldPath};
pub use geo_point::GeoPoint;
pub use mutation::{
    FieldTransform, Mutation, MutationKind, MutationResult, Precondition, TransformOperation,
};
pub use mutation_batch::{
    BatchId, MutationBatch, MutationBatchResult, OverlayedDocument, BATCH_ID_UNKNOWN,
};
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;

pub type TargetId = i32;
