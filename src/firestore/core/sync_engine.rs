use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::channel::oneshot;
use indexmap::{IndexMap, IndexSet};
use log::{debug, warn};

use crate::firestore::config::SyncEngineSettings;
use crate::firestore::core::{
    ChangeType, LimboChangeType, LimboDocumentChange, OnlineState, Query, QuerySyncer, SyncState,
    Target, TargetIdGenerator, View, ViewSnapshot,
};
use crate::firestore::error::{aborted, cancelled, FirestoreError, FirestoreResult};
use crate::firestore::local::{
    Bundle, BundledDocument, LocalStore, LocalViewChanges, LruResults, NamedQuery, QueryPurpose,
    ReferenceSet, TargetData, INVALID_SEQUENCE_NUMBER,
};
use crate::firestore::model::{
    BatchId, DatabaseId, Document, DocumentKey, Mutation, MutationBatchResult, MutationResult,
    SnapshotVersion, TargetId, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::{
    RemoteEvent, RemoteSerializer, RemoteStore, RemoteTransport, WatchChange,
};
use crate::util::{fail, hard_assert};

const LOG_TARGET: &str = "firestore::core::sync_engine";

/// Resolved once a write is acknowledged or rejected by the backend.
pub type WriteCallback = oneshot::Sender<FirestoreResult<()>>;

/// Output of the sync engine for the event manager, in the order it was
/// produced.
#[derive(Debug)]
pub enum SyncEngineEvent {
    ViewSnapshots(Vec<ViewSnapshot>),
    /// The query's target was rejected or dropped; its listeners are done.
    QueryError(Query, FirestoreError),
    OnlineStateChanged(OnlineState),
}

/// Summary of a bundle load.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BundleLoadProgress {
    pub documents_loaded: usize,
    pub total_documents: usize,
    pub bytes_loaded: u64,
    pub total_bytes: u64,
}

#[derive(Debug)]
struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

#[derive(Debug)]
struct LimboResolution {
    key: DocumentKey,
    /// Whether the limbo target has reported the document as existing.
    received_document: bool,
}

/// Keeps every view in sync with the local store and the watch stream.
///
/// The sync engine is single-threaded: it is owned by the async queue task
/// and every method runs there. Anything listeners need to hear about is
/// queued and collected with [`SyncEngine::take_events`].
pub struct SyncEngine {
    local_store: LocalStore,
    remote_store: RemoteStore,
    max_concurrent_limbo_resolutions: usize,
    /// Keyed by query canonical id.
    query_views: IndexMap<String, QueryView>,
    /// Every query sharing a target; the target is released when the last
    /// one stops listening.
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    enqueued_limbo_resolutions: IndexSet<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Which views hold each limbo document.
    limbo_document_refs: ReferenceSet,
    limbo_target_id_generator: TargetIdGenerator,
    mutation_callbacks: BTreeMap<BatchId, WriteCallback>,
    /// Keyed by the highest batch id that must settle first.
    pending_writes_callbacks: BTreeMap<BatchId, Vec<WriteCallback>>,
    online_state: OnlineState,
    events: Vec<SyncEngineEvent>,
}

impl SyncEngine {
    pub fn new(
        settings: SyncEngineSettings,
        database_id: DatabaseId,
        transport: Arc<dyn RemoteTransport>,
    ) -> Self {
        let remote_store = RemoteStore::new(
            transport,
            RemoteSerializer::new(database_id),
            settings.max_pending_writes,
            settings.max_watch_stream_failures,
        );
        let max_concurrent_limbo_resolutions = settings.max_concurrent_limbo_resolutions;
        Self {
            local_store: LocalStore::new(settings),
            remote_store,
            max_concurrent_limbo_resolutions,
            query_views: IndexMap::new(),
            queries_by_target: BTreeMap::new(),
            enqueued_limbo_resolutions: IndexSet::new(),
            active_limbo_targets_by_key: BTreeMap::new(),
            active_limbo_resolutions_by_target: BTreeMap::new(),
            limbo_document_refs: ReferenceSet::new(),
            limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
            mutation_callbacks: BTreeMap::new(),
            pending_writes_callbacks: BTreeMap::new(),
            online_state: OnlineState::Unknown,
            events: Vec::new(),
        }
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local_store
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.remote_store
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state
    }

    /// Drains everything raised since the last call.
    pub fn take_events(&mut self) -> Vec<SyncEngineEvent> {
        std::mem::take(&mut self.events)
    }

    /// Limbo documents with an open resolution target.
    pub fn active_limbo_documents(&self) -> &BTreeMap<DocumentKey, TargetId> {
        &self.active_limbo_targets_by_key
    }

    /// Limbo documents waiting for a free resolution slot, oldest first.
    pub fn enqueued_limbo_documents(&self) -> Vec<DocumentKey> {
        self.enqueued_limbo_resolutions.iter().cloned().collect()
    }

    /// The keys the backend is known to hold for `target_id`.
    pub fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        remote_keys_for_target(
            &self.active_limbo_resolutions_by_target,
            &self.queries_by_target,
            &self.query_views,
            target_id,
        )
    }

    async fn listen_to_query(
        &mut self,
        query: &Query,
        should_listen_to_remote: bool,
    ) -> FirestoreResult<ViewSnapshot> {
        let canonical_id = query.canonical_id();
        if let Some(query_view) = self.query_views.get(&canonical_id) {
            return Ok(initial_snapshot_of(&query_view.view));
        }

        let target_data = self.local_store.allocate_target(query.to_target())?;
        let target_id = target_data.target_id();
        let current = self.is_target_current(target_id);
        let snapshot = self
            .initialize_view_and_compute_snapshot(
                query,
                target_id,
                current,
                target_data.resume_token().to_vec(),
            )
            .await?;
        if should_listen_to_remote {
            self.remote_store.listen(target_data).await?;
            self.drain_online_state_change();
        }
        Ok(snapshot)
    }

    fn is_target_current(&self, target_id: TargetId) -> bool {
        self.queries_by_target
            .get(&target_id)
            .into_iter()
            .flatten()
            .filter_map(|query| self.query_views.get(&query.canonical_id()))
            .any(|query_view| query_view.view.sync_state() == SyncState::Synced)
    }

    async fn initialize_view_and_compute_snapshot(
        &mut self,
        query: &Query,
        target_id: TargetId,
        current: bool,
        resume_token: Vec<u8>,
    ) -> FirestoreResult<ViewSnapshot> {
        let query_result = self.local_store.execute_query(query, true)?;
        let mut view = View::new(query.clone(), query_result.remote_keys);
        let doc_changes = view.compute_doc_changes(&query_result.documents, None);
        let target_change = View::synthesize_target_change(
            current && self.online_state != OnlineState::Offline,
            resume_token,
        );
        let view_change = view.apply_changes(doc_changes, Some(&target_change), false);

        self.query_views.insert(
            query.canonical_id(),
            QueryView {
                query: query.clone(),
                target_id,
                view,
            },
        );
        self.queries_by_target
            .entry(target_id)
            .or_default()
            .push(query.clone());
        self.update_tracked_limbos(target_id, view_change.limbo_changes)
            .await?;

        let Some(snapshot) = view_change.snapshot else {
            fail(format!("initial view of {query} produced no snapshot"));
        };
        Ok(snapshot)
    }

    async fn stop_listening_to_query(
        &mut self,
        query: &Query,
        should_unlisten_to_remote: bool,
    ) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let Some(target_id) = self.query_views.get(&canonical_id).map(|qv| qv.target_id) else {
            warn!(target: LOG_TARGET, "Trying to stop listening to unknown {query}");
            return Ok(());
        };

        if let Some(queries) = self.queries_by_target.get_mut(&target_id) {
            if queries.len() > 1 {
                queries.retain(|other| other.canonical_id() != canonical_id);
                self.query_views.shift_remove(&canonical_id);
                return Ok(());
            }
        }

        self.local_store.release_target(target_id, false)?;
        if should_unlisten_to_remote {
            self.remote_store.stop_listening(target_id).await?;
            self.drain_online_state_change();
        }
        self.remove_and_cleanup_target(target_id, None).await
    }

    async fn remove_and_cleanup_target(
        &mut self,
        target_id: TargetId,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        for query in self.queries_by_target.remove(&target_id).unwrap_or_default() {
            self.query_views.shift_remove(&query.canonical_id());
            if let Some(error) = &error {
                self.events
                    .push(SyncEngineEvent::QueryError(query, error.clone()));
            }
        }

        let limbo_keys = self.limbo_document_refs.remove_references_for_id(target_id);
        for key in limbo_keys {
            if !self.limbo_document_refs.contains_key(&key) {
                self.remove_limbo_target(&key).await?;
            }
        }
        Ok(())
    }

    /// Feeds one watch change through the remote store and applies whatever
    /// it completes.
    pub async fn handle_watch_change(&mut self, change: WatchChange) -> FirestoreResult<()> {
        let last_remote_snapshot_version = self.local_store.get_last_remote_snapshot_version();
        let limbo_resolutions = &self.active_limbo_resolutions_by_target;
        let queries_by_target = &self.queries_by_target;
        let query_views = &self.query_views;
        let remote_keys = |target_id: TargetId| {
            remote_keys_for_target(limbo_resolutions, queries_by_target, query_views, target_id)
        };
        let outcome = self
            .remote_store
            .handle_watch_change(change, last_remote_snapshot_version, &remote_keys)
            .await?;
        self.drain_online_state_change();

        for (target_id, error) in outcome.rejected_listens {
            self.handle_rejected_listen(target_id, error).await?;
        }
        if let Some(remote_event) = outcome.remote_event {
            self.apply_remote_event(remote_event).await?;
        }
        Ok(())
    }

    pub async fn handle_watch_stream_error(&mut self, error: FirestoreError) -> FirestoreResult<()> {
        self.remote_store.handle_watch_stream_error(error).await?;
        self.drain_online_state_change();
        Ok(())
    }

    /// Applies a consistent snapshot from the watch stream to the local
    /// store and every view.
    pub async fn apply_remote_event(&mut self, remote_event: RemoteEvent) -> FirestoreResult<()> {
        for (target_id, change) in &remote_event.target_changes {
            let Some(resolution) = self.active_limbo_resolutions_by_target.get_mut(target_id) else {
                continue;
            };
            hard_assert(
                change.added_documents.len()
                    + change.modified_documents.len()
                    + change.removed_documents.len()
                    <= 1,
                "limbo resolution for single document contains multiple changes",
            );
            if !change.added_documents.is_empty() {
                resolution.received_document = true;
            } else if !change.modified_documents.is_empty() {
                hard_assert(
                    resolution.received_document,
                    "received change for limbo target document without add",
                );
            } else if !change.removed_documents.is_empty() {
                hard_assert(
                    resolution.received_document,
                    "received remove for limbo target document without add",
                );
                resolution.received_document = false;
            }
        }

        let changes = self.local_store.apply_remote_event(&remote_event)?;
        self.emit_new_snapshots_and_notify_local_store(changes, Some(&remote_event))
            .await
    }

    /// A target the backend refused. Limbo targets resolve their document
    /// as deleted; listen targets fail their queries.
    pub async fn handle_rejected_listen(
        &mut self,
        target_id: TargetId,
        error: FirestoreError,
    ) -> FirestoreResult<()> {
        if let Some(resolution) = self.active_limbo_resolutions_by_target.get(&target_id) {
            let key = resolution.key.clone();
            warn!(target: LOG_TARGET, "Limbo resolution for {key} failed: {error}");
            // The document is treated as deleted so the views stop waiting
            // on it.
            let remote_event = RemoteEvent {
                snapshot_version: SnapshotVersion::NONE,
                document_updates: BTreeMap::from([(
                    key.clone(),
                    Document::new_no_document(key.clone(), SnapshotVersion::NONE),
                )]),
                resolved_limbo_documents: BTreeSet::from([key.clone()]),
                ..RemoteEvent::default()
            };
            self.apply_remote_event(remote_event).await?;

            // The backend already dropped the target.
            self.active_limbo_targets_by_key.remove(&key);
            self.active_limbo_resolutions_by_target.remove(&target_id);
            self.pump_enqueued_limbo_resolutions().await
        } else {
            self.local_store.release_target(target_id, false)?;
            self.remove_and_cleanup_target(target_id, Some(error)).await
        }
    }

    async fn emit_new_snapshots_and_notify_local_store(
        &mut self,
        changes: BTreeMap<DocumentKey, Document>,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        let mut order: Vec<(TargetId, String)> = self
            .query_views
            .iter()
            .map(|(canonical_id, query_view)| (query_view.target_id, canonical_id.clone()))
            .collect();
        order.sort_by_key(|(target_id, _)| *target_id);

        let mut snapshots = Vec::new();
        let mut local_view_changes = Vec::new();
        for (target_id, canonical_id) in order {
            let Some(query_view) = self.query_views.get_mut(&canonical_id) else {
                continue;
            };
            let mut doc_changes = query_view.view.compute_doc_changes(&changes, None);
            if doc_changes.needs_refill {
                // The limit boundary moved; rerun the query against the
                // whole local cache.
                let documents = self
                    .local_store
                    .execute_query(&query_view.query, false)?
                    .documents;
                doc_changes = query_view
                    .view
                    .compute_doc_changes(&documents, Some(doc_changes));
            }

            let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
            let target_is_pending_reset = remote_event
                .is_some_and(|event| event.target_mismatches.contains_key(&target_id));
            let view_change =
                query_view
                    .view
                    .apply_changes(doc_changes, target_change, target_is_pending_reset);

            if let Some(snapshot) = view_change.snapshot {
                local_view_changes.push(local_view_changes_of(target_id, &snapshot));
                snapshots.push(snapshot);
            }
            self.update_tracked_limbos(target_id, view_change.limbo_changes)
                .await?;
        }

        if !snapshots.is_empty() {
            self.events.push(SyncEngineEvent::ViewSnapshots(snapshots));
        }
        self.local_store
            .notify_local_view_changes(&local_view_changes)
    }

    async fn update_tracked_limbos(
        &mut self,
        target_id: TargetId,
        limbo_changes: Vec<LimboDocumentChange>,
    ) -> FirestoreResult<()> {
        for change in limbo_changes {
            match change.change_type {
                LimboChangeType::Added => {
                    self.limbo_document_refs
                        .add_reference(change.key.clone(), target_id);
                    self.track_limbo_change(change.key).await?;
                }
                LimboChangeType::Removed => {
                    debug!(target: LOG_TARGET, "Document no longer in limbo: {}", change.key);
                    self.limbo_document_refs
                        .remove_reference(&change.key, target_id);
                    if !self.limbo_document_refs.contains_key(&change.key) {
                        self.remove_limbo_target(&change.key).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn track_limbo_change(&mut self, key: DocumentKey) -> FirestoreResult<()> {
        if self.active_limbo_targets_by_key.contains_key(&key)
            || self.enqueued_limbo_resolutions.contains(&key)
        {
            return Ok(());
        }
        debug!(target: LOG_TARGET, "New document in limbo: {key}");
        self.enqueued_limbo_resolutions.insert(key);
        self.pump_enqueued_limbo_resolutions().await
    }

    /// Starts limbo resolutions in the order they were enqueued while there
    /// are free slots.
    async fn pump_enqueued_limbo_resolutions(&mut self) -> FirestoreResult<()> {
        while self.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = self.enqueued_limbo_resolutions.shift_remove_index(0) else {
                break;
            };
            let limbo_target_id = self.limbo_target_id_generator.next_id();
            debug!(
                target: LOG_TARGET,
                "Resolving limbo document {key} with target {limbo_target_id}"
            );
            self.active_limbo_resolutions_by_target.insert(
                limbo_target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.active_limbo_targets_by_key
                .insert(key.clone(), limbo_target_id);
            let target_data = TargetData::new(
                Target::for_document(&key),
                limbo_target_id,
                QueryPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            );
            self.remote_store.listen(target_data).await?;
        }
        self.drain_online_state_change();
        Ok(())
    }

    async fn remove_limbo_target(&mut self, key: &DocumentKey) -> FirestoreResult<()> {
        self.enqueued_limbo_resolutions.shift_remove(key);
        let Some(limbo_target_id) = self.active_limbo_targets_by_key.remove(key) else {
            return Ok(());
        };
        debug!(target: LOG_TARGET, "Finished limbo resolution of {key}");
        self.remote_store.stop_listening(limbo_target_id).await?;
        self.active_limbo_resolutions_by_target
            .remove(&limbo_target_id);
        self.pump_enqueued_limbo_resolutions().await
    }

    /// Queues the batch locally, updates every affected view and hands the
    /// batch to the write pipeline. `callback` settles when the backend
    /// acknowledges or rejects the batch.
    pub async fn write_mutations(
        &mut self,
        mutations: Vec<Mutation>,
        callback: WriteCallback,
    ) -> FirestoreResult<()> {
        let result = match self.local_store.write_locally(mutations) {
            Ok(result) => result,
            Err(error) => {
                warn!(target: LOG_TARGET, "Failed to persist write: {error}");
                let _ = callback.send(Err(error));
                return Ok(());
            }
        };
        self.mutation_callbacks.insert(result.batch_id, callback);
        self.emit_new_snapshots_and_notify_local_store(result.changes, None)
            .await?;
        self.remote_store
            .fill_write_pipeline(&self.local_store)
            .await
    }

    /// The backend committed the batch at the head of the write pipeline.
    pub async fn handle_write_result(
        &mut self,
        batch_id: BatchId,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<()> {
        let batch_result =
            self.remote_store
                .handle_write_result(batch_id, commit_version, results, stream_token)?;
        self.handle_successful_write(batch_result).await?;
        self.remote_store
            .fill_write_pipeline(&self.local_store)
            .await
    }

    pub async fn handle_write_error(&mut self, error: FirestoreError) -> FirestoreResult<()> {
        let rejected = self
            .remote_store
            .handle_write_error(error, &self.local_store)
            .await?;
        if let Some((batch_id, error)) = rejected {
            self.handle_rejected_write(batch_id, error).await?;
        }
        self.remote_store
            .fill_write_pipeline(&self.local_store)
            .await
    }

    pub async fn handle_successful_write(
        &mut self,
        batch_result: MutationBatchResult,
    ) -> FirestoreResult<()> {
        let batch_id = batch_result.batch().batch_id();
        let changes = self.local_store.acknowledge_batch(&batch_result)?;
        debug!(target: LOG_TARGET, "Batch {batch_id} acknowledged");
        self.process_user_callback(batch_id, Ok(()));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snapshots_and_notify_local_store(changes, None)
            .await
    }

    pub async fn handle_rejected_write(
        &mut self,
        batch_id: BatchId,
        error: FirestoreError,
    ) -> FirestoreResult<()> {
        let changes = self.local_store.reject_batch(batch_id)?;
        debug!(target: LOG_TARGET, "Batch {batch_id} rejected: {error}");
        self.process_user_callback(batch_id, Err(error));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snapshots_and_notify_local_store(changes, None)
            .await
    }

    /// `callback` settles once every batch queued so far has been
    /// acknowledged or rejected.
    pub fn register_pending_writes_task(&mut self, callback: WriteCallback) {
        if !self.remote_store.can_use_network() {
            debug!(
                target: LOG_TARGET,
                "The network is disabled; pending writes will not settle until it is enabled"
            );
        }
        let highest_batch_id = self.local_store.get_highest_unacknowledged_batch_id();
        if highest_batch_id == BATCH_ID_UNKNOWN {
            let _ = callback.send(Ok(()));
            return;
        }
        self.pending_writes_callbacks
            .entry(highest_batch_id)
            .or_default()
            .push(callback);
    }

    fn process_user_callback(&mut self, batch_id: BatchId, result: FirestoreResult<()>) {
        if let Some(callback) = self.mutation_callbacks.remove(&batch_id) {
            let _ = callback.send(result);
        }
    }

    fn trigger_pending_writes_callbacks(&mut self, batch_id: BatchId) {
        let still_pending = self.pending_writes_callbacks.split_off(&(batch_id + 1));
        let settled = std::mem::replace(&mut self.pending_writes_callbacks, still_pending);
        for callback in settled.into_values().flatten() {
            let _ = callback.send(Ok(()));
        }
    }

    fn drain_online_state_change(&mut self) {
        if let Some(online_state) = self.remote_store.take_online_state_change() {
            self.handle_online_state_change(online_state);
        }
    }

    fn handle_online_state_change(&mut self, online_state: OnlineState) {
        let mut snapshots = Vec::new();
        for query_view in self.query_views.values_mut() {
            let view_change = query_view.view.apply_online_state_change(online_state);
            hard_assert(
                view_change.limbo_changes.is_empty(),
                "online state should not affect limbo documents",
            );
            if let Some(snapshot) = view_change.snapshot {
                snapshots.push(snapshot);
            }
        }
        self.events
            .push(SyncEngineEvent::OnlineStateChanged(online_state));
        if !snapshots.is_empty() {
            self.events.push(SyncEngineEvent::ViewSnapshots(snapshots));
        }
        self.online_state = online_state;
    }

    pub async fn enable_network(&mut self) -> FirestoreResult<()> {
        self.remote_store.enable_network(&self.local_store).await?;
        self.drain_online_state_change();
        Ok(())
    }

    pub async fn disable_network(&mut self) -> FirestoreResult<()> {
        self.remote_store.disable_network().await?;
        self.drain_online_state_change();
        Ok(())
    }

    /// Drops every cached remote document and target. Each tracked query
    /// fails with `aborted` and has to be listened to again; pending writes
    /// survive.
    ///
    /// Does not re-issue listens for queries that are still subscribed: their
    /// listeners receive ABORTED and must call `listen` again.
    pub async fn clear_cache(&mut self) -> FirestoreResult<()> {
        warn!(
            target: LOG_TARGET,
            "Clearing the cache; aborting {} queries",
            self.query_views.len()
        );
        let watched: Vec<TargetId> = self
            .queries_by_target
            .keys()
            .chain(self.active_limbo_resolutions_by_target.keys())
            .copied()
            .collect();
        for target_id in watched {
            if self.remote_store.is_listening(target_id) {
                self.remote_store.stop_listening(target_id).await?;
            }
        }

        let error = aborted("The local cache was cleared; listen again to resync");
        for query in std::mem::take(&mut self.queries_by_target)
            .into_values()
            .flatten()
        {
            self.events
                .push(SyncEngineEvent::QueryError(query, error.clone()));
        }
        self.query_views.clear();
        self.enqueued_limbo_resolutions.clear();
        self.active_limbo_targets_by_key.clear();
        self.active_limbo_resolutions_by_target.clear();
        self.limbo_document_refs.remove_all_references();

        self.local_store.clear_persistence()?;
        self.drain_online_state_change();
        Ok(())
    }

    /// Applies a decoded bundle. Bundles no newer than one already loaded
    /// are skipped.
    pub async fn load_bundle(&mut self, bundle: Bundle) -> FirestoreResult<BundleLoadProgress> {
        let Bundle {
            metadata,
            named_queries,
            documents: bundled_documents,
        } = bundle;
        let progress = BundleLoadProgress {
            documents_loaded: metadata.total_documents,
            total_documents: metadata.total_documents,
            bytes_loaded: metadata.total_bytes,
            total_bytes: metadata.total_bytes,
        };
        if self.local_store.has_newer_bundle(&metadata) {
            debug!(
                target: LOG_TARGET,
                "Bundle {} was already loaded",
                metadata.bundle_id
            );
            return Ok(progress);
        }

        let mut documents = BTreeMap::new();
        let mut keys_by_query: BTreeMap<String, BTreeSet<DocumentKey>> = BTreeMap::new();
        for BundledDocument {
            metadata: document_metadata,
            document,
        } in bundled_documents
        {
            let key = document_metadata.key.clone();
            let mut document = match document {
                Some(document) if document_metadata.exists => document,
                _ => Document::new_no_document(key.clone(), document_metadata.read_time),
            };
            document.set_read_time(document_metadata.read_time);
            for name in &document_metadata.queries {
                keys_by_query
                    .entry(name.clone())
                    .or_default()
                    .insert(key.clone());
            }
            documents.insert(key, document);
        }

        let changes = self
            .local_store
            .apply_bundle_documents(documents, &metadata.bundle_id)?;
        for named_query in named_queries {
            let keys = keys_by_query.remove(&named_query.name).unwrap_or_default();
            self.local_store.save_named_query(named_query, &keys)?;
        }
        self.local_store.save_bundle(metadata)?;
        self.emit_new_snapshots_and_notify_local_store(changes, None)
            .await?;
        Ok(progress)
    }

    pub fn get_named_query(&self, name: &str) -> Option<NamedQuery> {
        self.local_store.get_named_query(name)
    }

    pub fn collect_garbage(&mut self) -> FirestoreResult<LruResults> {
        self.local_store.collect_garbage()
    }

    pub async fn run_count(&self, query: &Query) -> FirestoreResult<i64> {
        self.remote_store.run_count(query).await
    }

    /// Closes the streams and fails every outstanding write callback.
    pub async fn shutdown(&mut self) -> FirestoreResult<()> {
        self.remote_store.shutdown().await?;
        self.drain_online_state_change();
        for (_, callback) in std::mem::take(&mut self.mutation_callbacks) {
            let _ = callback.send(Err(cancelled("The client has been terminated")));
        }
        for callback in std::mem::take(&mut self.pending_writes_callbacks)
            .into_values()
            .flatten()
        {
            let _ = callback.send(Err(cancelled("The client has been terminated")));
        }
        Ok(())
    }
}

#[async_trait]
impl QuerySyncer for SyncEngine {
    async fn listen(&mut self, query: &Query, should_listen_to_remote: bool) -> FirestoreResult<ViewSnapshot> {
        self.listen_to_query(query, should_listen_to_remote).await
    }

    async fn stop_listening(&mut self, query: &Query, should_unlisten_to_remote: bool) -> FirestoreResult<()> {
        self.stop_listening_to_query(query, should_unlisten_to_remote)
            .await
    }

    async fn listen_to_remote_store(&mut self, query: &Query) -> FirestoreResult<()> {
        if !self.query_views.contains_key(&query.canonical_id()) {
            return Ok(());
        }
        let target_data = self.local_store.allocate_target(query.to_target())?;
        self.remote_store.listen(target_data).await?;
        self.drain_online_state_change();
        Ok(())
    }

    async fn stop_listening_to_remote_store_only(&mut self, query: &Query) -> FirestoreResult<()> {
        let Some(target_id) = self
            .query_views
            .get(&query.canonical_id())
            .map(|query_view| query_view.target_id)
        else {
            return Ok(());
        };
        let sole_query = self
            .queries_by_target
            .get(&target_id)
            .is_some_and(|queries| queries.len() == 1);
        if sole_query {
            self.remote_store.stop_listening(target_id).await?;
            self.drain_online_state_change();
        }
        Ok(())
    }
}

fn remote_keys_for_target(
    limbo_resolutions: &BTreeMap<TargetId, LimboResolution>,
    queries_by_target: &BTreeMap<TargetId, Vec<Query>>,
    query_views: &IndexMap<String, QueryView>,
    target_id: TargetId,
) -> BTreeSet<DocumentKey> {
    if let Some(resolution) = limbo_resolutions.get(&target_id) {
        let mut keys = BTreeSet::new();
        if resolution.received_document {
            keys.insert(resolution.key.clone());
        }
        return keys;
    }
    queries_by_target
        .get(&target_id)
        .into_iter()
        .flatten()
        .filter_map(|query| query_views.get(&query.canonical_id()))
        .flat_map(|query_view| query_view.view.synced_documents().iter().cloned())
        .collect()
}

fn local_view_changes_of(target_id: TargetId, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let mut added = BTreeSet::new();
    let mut removed = BTreeSet::new();
    for change in &snapshot.changes {
        match change.change_type {
            ChangeType::Added => {
                added.insert(change.document.key().clone());
            }
            ChangeType::Removed => {
                removed.insert(change.document.key().clone());
            }
            ChangeType::Modified | ChangeType::Metadata => {}
        }
    }
    LocalViewChanges {
        target_id,
        from_cache: snapshot.is_from_cache,
        added,
        removed,
    }
}

fn initial_snapshot_of(view: &View) -> ViewSnapshot {
    let mutated_keys = view
        .documents()
        .iter()
        .filter(|document| document.has_local_mutations())
        .map(|document| document.key().clone())
        .collect();
    ViewSnapshot::from_initial_documents(
        view.query().clone(),
        view.documents().clone(),
        mutated_keys,
        view.sync_state() != SyncState::Synced,
        false,
        false,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};
    use crate::firestore::remote::{DocumentChange, DocumentRemove, TargetChangeState, WatchTargetChange};
    use crate::firestore::test_support::{doc, key, map, query, RecordingTransport, TransportCall};
    use crate::firestore::value::FirestoreValue;

    fn engine(transport: &Arc<RecordingTransport>) -> SyncEngine {
        SyncEngine::new(
            SyncEngineSettings::default(),
            DatabaseId::default("demo"),
            transport.clone(),
        )
    }

    fn target_change(state: TargetChangeState, target_ids: Vec<TargetId>) -> WatchChange {
        WatchChange::TargetChange(WatchTargetChange {
            state,
            target_ids,
            resume_token: b"token".to_vec(),
            ..WatchTargetChange::default()
        })
    }

    fn global_snapshot(micros: i64) -> WatchChange {
        WatchChange::TargetChange(WatchTargetChange {
            read_time: Some(SnapshotVersion::from_micros(micros)),
            ..WatchTargetChange::default()
        })
    }

    fn snapshots(events: Vec<SyncEngineEvent>) -> Vec<ViewSnapshot> {
        events
            .into_iter()
            .filter_map(|event| match event {
                SyncEngineEvent::ViewSnapshots(snapshots) => Some(snapshots),
                _ => None,
            })
            .flatten()
            .collect()
    }

    async fn sync_empty_target(engine: &mut SyncEngine, target_id: TargetId, micros: i64) {
        for change in [
            target_change(TargetChangeState::Add, vec![target_id]),
            target_change(TargetChangeState::Current, vec![target_id]),
            global_snapshot(micros),
        ] {
            engine.handle_watch_change(change).await.unwrap();
        }
    }

    #[tokio::test]
    async fn listen_allocates_even_target_and_unlisten_releases_it() {
        let transport = Arc::new(RecordingTransport::default());
        let mut engine = engine(&transport);
        let rooms = query("rooms");

        let snapshot = engine.listen(&rooms, true).await.unwrap();
        assert!(snapshot.is_from_cache);
        assert!(snapshot.documents.is_empty());
        engine.stop_listening(&rooms, true).await.unwrap();

        assert_eq!(
            transport.calls().await,
            vec![TransportCall::Watch(2), TransportCall::Unwatch(2)]
        );
    }

    #[tokio::test]
    async fn watch_snapshot_raises_synced_view() {
        let transport = Arc::new(RecordingTransport::default());
        let mut engine = engine(&transport);
        let rooms = query("rooms");
        engine.listen(&rooms, true).await.unwrap();

        engine
            .handle_watch_change(target_change(TargetChangeState::Add, vec![2]))
            .await
            .unwrap();
        engine
            .handle_watch_change(WatchChange::DocumentChange(DocumentChange {
                updated_target_ids: vec![2],
                removed_target_ids: vec![],
                key: key("rooms/eros"),
                document: Some(doc("rooms/eros", 1000, map(&[("name", FirestoreValue::from_string("Eros"))]))),
            }))
            .await
            .unwrap();
        engine
            .handle_watch_change(target_change(TargetChangeState::Current, vec![2]))
            .await
            .unwrap();
        engine.handle_watch_change(global_snapshot(1000)).await.unwrap();

        let events = engine.take_events();
        assert!(matches!(events[0], SyncEngineEvent::OnlineStateChanged(OnlineState::Online)));
        let snapshots = snapshots(events);
        assert_eq!(snapshots.len(), 1);
        assert!(!snapshots[0].is_from_cache);
        assert_eq!(snapshots[0].documents.len(), 1);
        assert_eq!(engine.get_remote_keys_for_target(2), BTreeSet::from([key("rooms/eros")]));
    }

    /// Syncs `rooms` with the given documents, then has watch drop them
    /// from the target without deleting them.
    async fn strand_documents(engine: &mut SyncEngine, paths: &[&str]) {
        engine
            .handle_watch_change(target_change(TargetChangeState::Add, vec![2]))
            .await
            .unwrap();
        for path in paths {
            engine
                .handle_watch_change(WatchChange::DocumentChange(DocumentChange {
                    updated_target_ids: vec![2],
                    removed_target_ids: vec![],
                    key: key(path),
                    document: Some(doc(path, 1000, map(&[]))),
                }))
                .await
                .unwrap();
        }
        engine
            .handle_watch_change(target_change(TargetChangeState::Current, vec![2]))
            .await
            .unwrap();
        engine.handle_watch_change(global_snapshot(1000)).await.unwrap();

        for path in paths {
            engine
                .handle_watch_change(WatchChange::DocumentRemove(DocumentRemove {
                    key: key(path),
                    read_time: SnapshotVersion::NONE,
                    removed_target_ids: vec![2],
                }))
                .await
                .unwrap();
        }
        engine.handle_watch_change(global_snapshot(2000)).await.unwrap();
    }

    #[tokio::test]
    async fn document_dropped_from_target_goes_to_limbo_and_failed_resolution_removes_it() {
        let transport = Arc::new(RecordingTransport::default());
        let mut engine = engine(&transport);
        engine.listen(&query("rooms"), true).await.unwrap();
        strand_documents(&mut engine, &["rooms/b"]).await;

        assert_eq!(engine.active_limbo_documents().get(&key("rooms/b")), Some(&1));
        assert!(transport.calls().await.contains(&TransportCall::Watch(1)));
        engine.take_events();

        let rejection = WatchChange::TargetChange(WatchTargetChange {
            state: TargetChangeState::Remove,
            target_ids: vec![1],
            cause: Some(permission_denied("no access")),
            ..WatchTargetChange::default()
        });
        engine.handle_watch_change(rejection).await.unwrap();

        assert!(engine.active_limbo_documents().is_empty());
        let snapshots = snapshots(engine.take_events());
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].documents.is_empty());
        assert_eq!(snapshots[0].changes[0].change_type, ChangeType::Removed);
    }

    #[tokio::test]
    async fn limbo_resolutions_respect_the_concurrency_limit() {
        let transport = Arc::new(RecordingTransport::default());
        let mut engine = SyncEngine::new(
            SyncEngineSettings::default().with_max_concurrent_limbo_resolutions(1),
            DatabaseId::default("demo"),
            transport.clone(),
        );
        engine.listen(&query("rooms"), true).await.unwrap();
        strand_documents(&mut engine, &["rooms/a", "rooms/b"]).await;

        assert_eq!(engine.active_limbo_documents().len(), 1);
        assert!(engine.active_limbo_documents().contains_key(&key("rooms/a")));
        assert_eq!(engine.enqueued_limbo_documents(), vec![key("rooms/b")]);
    }

    #[tokio::test]
    async fn acknowledged_write_settles_its_callback() {
        let transport = Arc::new(RecordingTransport::default());
        let mut engine = engine(&transport);
        engine.listen(&query("rooms"), true).await.unwrap();
        sync_empty_target(&mut engine, 2, 1000).await;

        let (sender, mut receiver) = oneshot::channel();
        engine
            .write_mutations(vec![Mutation::set(key("rooms/b"), map(&[]))], sender)
            .await
            .unwrap();
        assert!(transport.calls().await.contains(&TransportCall::Write(1)));
        assert_eq!(receiver.try_recv().unwrap(), None);

        let version = SnapshotVersion::from_micros(2000);
        engine
            .handle_write_result(1, version, vec![MutationResult::new(version, vec![])], vec![])
            .await
            .unwrap();
        assert_eq!(receiver.try_recv().unwrap(), Some(Ok(())));
        // Still shown with pending writes until watch confirms it.
        assert!(engine.active_limbo_documents().is_empty());
    }

    #[tokio::test]
    async fn rejected_listen_fails_the_query() {
        let transport = Arc::new(RecordingTransport::default());
        let mut engine = engine(&transport);
        let rooms = query("rooms");
        engine.listen(&rooms, true).await.unwrap();
        engine.take_events();

        let rejection = WatchChange::TargetChange(WatchTargetChange {
            state: TargetChangeState::Remove,
            target_ids: vec![2],
            cause: Some(permission_denied("no access")),
            ..WatchTargetChange::default()
        });
        engine.handle_watch_change(rejection).await.unwrap();

        let events = engine.take_events();
        let errors: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                SyncEngineEvent::QueryError(query, error) => Some((query.canonical_id(), error.code)),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec![(rooms.canonical_id(), FirestoreErrorCode::PermissionDenied)]);
        assert_eq!(engine.get_remote_keys_for_target(2), BTreeSet::new());
    }

    #[tokio::test]
    async fn pending_writes_task_settles_after_acknowledgement() {
        let transport = Arc::new(RecordingTransport::default());
        let mut engine = engine(&transport);

        let (ready, mut ready_receiver) = oneshot::channel();
        engine.register_pending_writes_task(ready);
        assert_eq!(ready_receiver.try_recv().unwrap(), Some(Ok(())));

        let (sender, _receiver) = oneshot::channel();
        engine
            .write_mutations(vec![Mutation::delete(key("rooms/a"))], sender)
            .await
            .unwrap();
        let (waiter, mut waiter_receiver) = oneshot::channel();
        engine.register_pending_writes_task(waiter);
        assert_eq!(waiter_receiver.try_recv().unwrap(), None);

        engine
            .handle_write_error(permission_denied("read only"))
            .await
            .unwrap();
        assert_eq!(waiter_receiver.try_recv().unwrap(), Some(Ok(())));
    }

    #[tokio::test]
    async fn clear_cache_aborts_every_query_once() {
        let transport = Arc::new(RecordingTransport::default());
        let mut engine = engine(&transport);
        engine.listen(&query("rooms"), true).await.unwrap();
        engine.listen(&query("users"), true).await.unwrap();
        engine.take_events();

        engine.clear_cache().await.unwrap();

        let aborted: Vec<_> = engine
            .take_events()
            .into_iter()
            .filter_map(|event| match event {
                SyncEngineEvent::QueryError(query, error) => {
                    assert_eq!(error.code, FirestoreErrorCode::Aborted);
                    Some(query.path().to_string())
                }
                _ => None,
            })
            .collect();
        assert_eq!(aborted, vec!["rooms".to_string(), "users".to_string()]);
        assert!(!engine.remote_store().is_listening(2));
        assert!(!engine.remote_store().is_listening(4));
    }
}
