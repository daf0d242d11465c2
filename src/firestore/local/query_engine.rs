use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::firestore::core::{DocumentSet, LimitType, Query};
use crate::firestore::local::{IndexOffset, LocalDocumentsView, MemoryPersistence};
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion};

const LOG_TARGET: &str = "firestore::local::query_engine";

/// Picks the cheapest way to answer a query from local state: a field index
/// scan, the previous result set plus everything changed since the last
/// limbo-free snapshot, or a full collection scan.
pub fn get_documents_matching_query(
    persistence: &mut MemoryPersistence,
    query: &Query,
    last_limbo_free_snapshot_version: SnapshotVersion,
    remote_keys: &BTreeSet<DocumentKey>,
) -> BTreeMap<DocumentKey, Document> {
    if let Some(results) = perform_query_using_index(persistence, query) {
        return results;
    }
    if let Some(results) =
        perform_query_using_remote_keys(persistence, query, remote_keys, last_limbo_free_snapshot_version)
    {
        return results;
    }
    execute_full_collection_scan(persistence, query)
}

fn perform_query_using_index(
    persistence: &mut MemoryPersistence,
    query: &Query,
) -> Option<BTreeMap<DocumentKey, Document>> {
    if query.matches_all_documents() || query.is_document_query() {
        return None;
    }
    let target = query.to_target();
    let keys = persistence
        .index_manager
        .get_documents_matching_target(&target, &persistence.remote_documents)?;
    debug!(target: LOG_TARGET, "Using index to execute {query}");

    // Only remote documents are indexed; local writes come from overlays.
    let newest_read_time = persistence.remote_documents.latest_read_time();
    let mut view = LocalDocumentsView::new(persistence);
    let indexed = view.get_documents(&keys);
    Some(append_remaining_results(
        &view,
        apply_query(query, indexed),
        query,
        IndexOffset::from_read_time(newest_read_time),
    ))
}

fn perform_query_using_remote_keys(
    persistence: &mut MemoryPersistence,
    query: &Query,
    remote_keys: &BTreeSet<DocumentKey>,
    last_limbo_free_snapshot_version: SnapshotVersion,
) -> Option<BTreeMap<DocumentKey, Document>> {
    // A full scan is as cheap as re-reading every document for these.
    if query.matches_all_documents() || last_limbo_free_snapshot_version.is_none() {
        return None;
    }

    let mut view = LocalDocumentsView::new(persistence);
    let documents = view.get_documents(remote_keys);
    let previous_results = apply_query(query, documents);
    if query.has_limit()
        && needs_refill(
            query,
            &previous_results,
            remote_keys,
            last_limbo_free_snapshot_version,
        )
    {
        return None;
    }

    debug!(
        target: LOG_TARGET,
        "Re-using previous result from {last_limbo_free_snapshot_version} to execute {query}"
    );
    Some(append_remaining_results(
        &view,
        previous_results,
        query,
        IndexOffset::from_read_time(last_limbo_free_snapshot_version),
    ))
}

fn execute_full_collection_scan(
    persistence: &mut MemoryPersistence,
    query: &Query,
) -> BTreeMap<DocumentKey, Document> {
    debug!(target: LOG_TARGET, "Using full collection scan to execute {query}");
    LocalDocumentsView::new(persistence).get_documents_matching_query(query, IndexOffset::NONE)
}

fn apply_query(query: &Query, documents: BTreeMap<DocumentKey, Document>) -> DocumentSet {
    let mut results = DocumentSet::for_query(query);
    for document in documents.into_values() {
        if document.is_found_document() && query.matches(&document) {
            results.insert(document);
        }
    }
    results
}

/// Whether the previous limit result may be missing documents, in which case
/// it cannot be reused.
fn needs_refill(
    query: &Query,
    previous_results: &DocumentSet,
    remote_keys: &BTreeSet<DocumentKey>,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    // A document left the result set; one outside the limit may replace it.
    if remote_keys.len() != previous_results.len() {
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::LimitToFirst => previous_results.last(),
        LimitType::LimitToLast => previous_results.first(),
    };
    edge.is_some_and(|document| {
        document.has_pending_writes() || document.version() > limbo_free_snapshot_version
    })
}

fn append_remaining_results(
    view: &LocalDocumentsView<'_>,
    indexed: DocumentSet,
    query: &Query,
    offset: IndexOffset,
) -> BTreeMap<DocumentKey, Document> {
    let mut remaining = view.get_documents_matching_query(query, offset);
    for document in &indexed {
        remaining.insert(document.key().clone(), document.clone());
    }
    remaining
}
