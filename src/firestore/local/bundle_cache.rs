use std::collections::BTreeMap;

use crate::firestore::core::{LimitType, Query, Target};
use crate::firestore::local::journal::{Transactional, UndoLog};
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion};

#[derive(Clone, Debug, PartialEq)]
pub struct BundleMetadata {
    pub bundle_id: String,
    pub schema_version: i32,
    /// Server time at which the bundle was built.
    pub create_time: SnapshotVersion,
    pub total_documents: usize,
    pub total_bytes: u64,
}

/// The target of a bundled named query and how its limit is applied.
#[derive(Clone, Debug, PartialEq)]
pub struct BundledQuery {
    pub target: Target,
    pub limit_type: LimitType,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NamedQuery {
    pub name: String,
    pub bundled_query: BundledQuery,
    /// Server time the query results were read at.
    pub read_time: SnapshotVersion,
}

impl NamedQuery {
    /// Rebuilds the application-level query from the bundled target.
    pub fn to_query(&self) -> Query {
        let target = &self.bundled_query.target;
        let mut query = match target.collection_group() {
            Some(group) => Query::collection_group(target.path().clone(), group),
            None => Query::at_path(target.path().clone()),
        };
        for filter in target.filters() {
            query = query.with_filter(filter.clone());
        }
        for order_by in target.order_by() {
            query = query.with_order_by(order_by.clone());
        }
        if let Some(limit) = target.limit() {
            query = match self.bundled_query.limit_type {
                LimitType::LimitToFirst => query.with_limit_to_first(limit),
                LimitType::LimitToLast => query.with_limit_to_last(limit),
            };
        }
        if let Some(start_at) = target.start_at() {
            query = query.starting_at(start_at.clone());
        }
        if let Some(end_at) = target.end_at() {
            query = query.ending_at(end_at.clone());
        }
        query
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BundledDocumentMetadata {
    pub key: DocumentKey,
    pub read_time: SnapshotVersion,
    pub exists: bool,
    /// Names of the bundled queries this document is a result of.
    pub queries: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BundledDocument {
    pub metadata: BundledDocumentMetadata,
    /// Present when `metadata.exists`.
    pub document: Option<Document>,
}

/// A decoded bundle ready to be applied to the local store.
#[derive(Clone, Debug, PartialEq)]
pub struct Bundle {
    pub metadata: BundleMetadata,
    pub named_queries: Vec<NamedQuery>,
    pub documents: Vec<BundledDocument>,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryBundleCache {
    bundles: BTreeMap<String, BundleMetadata>,
    named_queries: BTreeMap<String, NamedQuery>,
    bundles_undo: UndoLog<String, BundleMetadata>,
    named_queries_undo: UndoLog<String, NamedQuery>,
}

impl MemoryBundleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_bundle_metadata(&self, bundle_id: &str) -> Option<&BundleMetadata> {
        self.bundles.get(bundle_id)
    }

    pub fn save_bundle_metadata(&mut self, metadata: BundleMetadata) {
        self.bundles_undo.record(&self.bundles, &metadata.bundle_id);
        self.bundles.insert(metadata.bundle_id.clone(), metadata);
    }

    pub fn get_named_query(&self, name: &str) -> Option<&NamedQuery> {
        self.named_queries.get(name)
    }

    pub fn save_named_query(&mut self, query: NamedQuery) {
        self.named_queries_undo.record(&self.named_queries, &query.name);
        self.named_queries.insert(query.name.clone(), query);
    }
}

impl Transactional for MemoryBundleCache {
    fn begin(&mut self) {
        self.bundles_undo.begin();
        self.named_queries_undo.begin();
    }

    fn commit(&mut self) {
        self.bundles_undo.commit();
        self.named_queries_undo.commit();
    }

    fn rollback(&mut self) {
        self.bundles_undo.rollback(&mut self.bundles);
        self.named_queries_undo.rollback(&mut self.named_queries);
    }
}
