use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value as JsonValue;

use crate::firestore::core::{OnlineState, Query};
use crate::firestore::error::{invalid_argument, unavailable, FirestoreError, FirestoreResult};
use crate::firestore::local::{LocalStore, TargetData};
use crate::firestore::model::{
    BatchId, DocumentKey, MutationBatch, MutationBatchResult, MutationResult, SnapshotVersion,
    TargetId, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::remote_event::RemoteEvent;
use crate::firestore::remote::serializer::RemoteSerializer;
use crate::firestore::remote::watch_change::{TargetChangeState, WatchChange};
use crate::firestore::remote::watch_change_aggregator::{
    TargetMetadataProvider, WatchChangeAggregator,
};

const LOG_TARGET: &str = "firestore::remote::remote_store";

/// The streams the remote store drives. Implementations forward encoded
/// requests to the backend and feed responses back through the client's
/// `handle_*` entry points.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Adds a target to the watch stream.
    async fn watch(&self, target_id: TargetId, request: JsonValue) -> FirestoreResult<()>;

    /// Removes a target from the watch stream.
    async fn unwatch(&self, target_id: TargetId) -> FirestoreResult<()>;

    /// Sends one mutation batch on the write stream.
    async fn write(&self, batch_id: BatchId, request: JsonValue) -> FirestoreResult<()>;

    /// Tears down both streams, typically because the network was disabled.
    async fn close_streams(&self) -> FirestoreResult<()>;

    /// Runs a count aggregation and returns the count.
    async fn run_count(&self, request: JsonValue) -> FirestoreResult<i64>;
}

/// Derives the client's [`OnlineState`] from watch stream health.
#[derive(Debug)]
struct OnlineStateTracker {
    state: OnlineState,
    watch_stream_failures: u32,
    max_watch_stream_failures: u32,
    /// Latest state not yet reported to the sync engine.
    pending_change: Option<OnlineState>,
}

impl OnlineStateTracker {
    fn new(max_watch_stream_failures: u32) -> Self {
        Self {
            state: OnlineState::Unknown,
            watch_stream_failures: 0,
            max_watch_stream_failures: max_watch_stream_failures.max(1),
            pending_change: None,
        }
    }

    fn handle_watch_stream_start(&mut self) {
        if self.watch_stream_failures == 0 {
            self.set_and_broadcast(OnlineState::Unknown);
        }
    }

    fn handle_watch_stream_failure(&mut self, error: &FirestoreError) {
        if self.state == OnlineState::Online {
            // A healthy stream failing once is retried before going offline.
            self.set_and_broadcast(OnlineState::Unknown);
            return;
        }
        self.watch_stream_failures += 1;
        if self.watch_stream_failures >= self.max_watch_stream_failures {
            warn!(
                target: LOG_TARGET,
                "Could not reach the backend after {} attempts: {error}",
                self.watch_stream_failures
            );
            self.set_and_broadcast(OnlineState::Offline);
        }
    }

    fn update_state(&mut self, state: OnlineState) {
        self.watch_stream_failures = 0;
        self.set_and_broadcast(state);
    }

    fn set_and_broadcast(&mut self, state: OnlineState) {
        if self.state != state {
            debug!(target: LOG_TARGET, "Online state changed to {state:?}");
            self.state = state;
            self.pending_change = Some(state);
        }
    }
}

/// What a watch change produced for the sync engine to apply.
#[derive(Debug, Default)]
pub struct WatchOutcome {
    pub rejected_listens: Vec<(TargetId, FirestoreError)>,
    pub remote_event: Option<RemoteEvent>,
}

struct ListenTargetMetadata<'a> {
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    remote_keys: &'a (dyn Fn(TargetId) -> BTreeSet<DocumentKey> + Sync),
}

impl TargetMetadataProvider for ListenTargetMetadata<'_> {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        (self.remote_keys)(target_id)
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }
}

/// Network side of the sync engine: tracks which targets are watched, turns
/// watch changes into remote events and keeps a bounded pipeline of batches
/// on the write stream.
pub struct RemoteStore {
    transport: Arc<dyn RemoteTransport>,
    serializer: RemoteSerializer,
    max_pending_writes: usize,
    listen_targets: BTreeMap<TargetId, TargetData>,
    /// Present while the watch stream is open.
    watch_change_aggregator: Option<WatchChangeAggregator>,
    write_pipeline: VecDeque<MutationBatch>,
    network_enabled: bool,
    online_state_tracker: OnlineStateTracker,
}

impl RemoteStore {
    pub fn new(
        transport: Arc<dyn RemoteTransport>,
        serializer: RemoteSerializer,
        max_pending_writes: usize,
        max_watch_stream_failures: u32,
    ) -> Self {
        Self {
            transport,
            serializer,
            max_pending_writes: max_pending_writes.max(1),
            listen_targets: BTreeMap::new(),
            watch_change_aggregator: None,
            write_pipeline: VecDeque::new(),
            network_enabled: true,
            online_state_tracker: OnlineStateTracker::new(max_watch_stream_failures),
        }
    }

    pub fn serializer(&self) -> &RemoteSerializer {
        &self.serializer
    }

    pub fn can_use_network(&self) -> bool {
        self.network_enabled
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state_tracker.state
    }

    /// The online state change not yet reported, if any.
    pub fn take_online_state_change(&mut self) -> Option<OnlineState> {
        self.online_state_tracker.pending_change.take()
    }

    pub fn is_listening(&self, target_id: TargetId) -> bool {
        self.listen_targets.contains_key(&target_id)
    }

    pub fn listen_target_ids(&self) -> Vec<TargetId> {
        self.listen_targets.keys().copied().collect()
    }

    fn watch_stream_open(&self) -> bool {
        self.watch_change_aggregator.is_some()
    }

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network() && !self.watch_stream_open() && !self.listen_targets.is_empty()
    }

    /// Starts watching the target. Listening to an already watched target is
    /// a no-op.
    pub async fn listen(&mut self, target_data: TargetData) -> FirestoreResult<()> {
        let target_id = target_data.target_id();
        if self.listen_targets.contains_key(&target_id) {
            return Ok(());
        }
        self.listen_targets.insert(target_id, target_data.clone());
        if self.should_start_watch_stream() {
            self.start_watch_stream().await
        } else if self.watch_stream_open() {
            self.send_watch_request(&target_data).await
        } else {
            Ok(())
        }
    }

    pub async fn stop_listening(&mut self, target_id: TargetId) -> FirestoreResult<()> {
        if self.listen_targets.remove(&target_id).is_none() {
            warn!(target: LOG_TARGET, "Stop listening to unknown target {target_id}");
            return Ok(());
        }
        if self.watch_stream_open() {
            self.send_unwatch_request(target_id).await?;
        }
        if self.listen_targets.is_empty() && !self.watch_stream_open() && self.can_use_network() {
            // Nothing left to prove connectivity with.
            self.online_state_tracker.update_state(OnlineState::Unknown);
        }
        Ok(())
    }

    async fn start_watch_stream(&mut self) -> FirestoreResult<()> {
        debug!(target: LOG_TARGET, "Starting watch stream for {} targets", self.listen_targets.len());
        self.watch_change_aggregator = Some(WatchChangeAggregator::new());
        self.online_state_tracker.handle_watch_stream_start();
        let targets: Vec<TargetData> = self.listen_targets.values().cloned().collect();
        for target_data in &targets {
            self.send_watch_request(target_data).await?;
        }
        Ok(())
    }

    async fn send_watch_request(&mut self, target_data: &TargetData) -> FirestoreResult<()> {
        if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_data.target_id());
        }
        let request = self.serializer.encode_target(target_data);
        self.transport
            .watch(target_data.target_id(), request)
            .await
    }

    async fn send_unwatch_request(&mut self, target_id: TargetId) -> FirestoreResult<()> {
        if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.transport.unwatch(target_id).await
    }

    /// Feeds one watch change into the aggregator and raises a remote event
    /// when the change completes a consistent snapshot newer than
    /// `last_remote_snapshot_version`. `remote_keys` reports the keys each
    /// target held as of the last event.
    pub async fn handle_watch_change(
        &mut self,
        change: WatchChange,
        last_remote_snapshot_version: SnapshotVersion,
        remote_keys: &(dyn Fn(TargetId) -> BTreeSet<DocumentKey> + Sync),
    ) -> FirestoreResult<WatchOutcome> {
        let mut outcome = WatchOutcome::default();
        if !self.watch_stream_open() {
            warn!(target: LOG_TARGET, "Ignoring watch change while the watch stream is closed");
            return Ok(outcome);
        }
        // Any message proves the backend is reachable.
        self.online_state_tracker.update_state(OnlineState::Online);

        let snapshot_version = change.snapshot_version();
        match change {
            WatchChange::TargetChange(target_change)
                if target_change.state == TargetChangeState::Remove
                    && target_change.cause.is_some() =>
            {
                let cause = target_change
                    .cause
                    .unwrap_or_else(|| unavailable("watch target removed"));
                for target_id in target_change.target_ids {
                    if self.listen_targets.remove(&target_id).is_some() {
                        if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
                            aggregator.remove_target(target_id);
                        }
                        warn!(target: LOG_TARGET, "Listen for target {target_id} rejected: {cause}");
                        outcome.rejected_listens.push((target_id, cause.clone()));
                    }
                }
                return Ok(outcome);
            }
            change => {
                let metadata = ListenTargetMetadata {
                    listen_targets: &self.listen_targets,
                    remote_keys,
                };
                if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
                    aggregator.handle_watch_change(change, &metadata);
                }
            }
        }

        if !snapshot_version.is_none() && snapshot_version >= last_remote_snapshot_version {
            outcome.remote_event = Some(self.raise_watch_snapshot(snapshot_version, remote_keys).await?);
        }
        Ok(outcome)
    }

    async fn raise_watch_snapshot(
        &mut self,
        snapshot_version: SnapshotVersion,
        remote_keys: &(dyn Fn(TargetId) -> BTreeSet<DocumentKey> + Sync),
    ) -> FirestoreResult<RemoteEvent> {
        let metadata = ListenTargetMetadata {
            listen_targets: &self.listen_targets,
            remote_keys,
        };
        let remote_event = match self.watch_change_aggregator.as_mut() {
            Some(aggregator) => aggregator.create_remote_event(snapshot_version, &metadata),
            None => RemoteEvent::default(),
        };

        for (target_id, change) in &remote_event.target_changes {
            if change.resume_token.is_empty() {
                continue;
            }
            if let Some(target_data) = self.listen_targets.get_mut(target_id) {
                *target_data =
                    target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
            }
        }

        // Re-listen from scratch so the backend resends the full result set.
        for (target_id, purpose) in &remote_event.target_mismatches {
            let Some(target_data) = self.listen_targets.get(target_id).cloned() else {
                continue;
            };
            self.listen_targets.insert(
                *target_id,
                target_data.with_resume_token(Vec::new(), target_data.snapshot_version()),
            );
            self.send_unwatch_request(*target_id).await?;
            let request_data = TargetData::new(
                target_data.target().clone(),
                *target_id,
                *purpose,
                target_data.sequence_number(),
            );
            self.send_watch_request(&request_data).await?;
        }
        Ok(remote_event)
    }

    /// Restarts the watch stream after a transport failure and re-sends
    /// every target.
    pub async fn handle_watch_stream_error(&mut self, error: FirestoreError) -> FirestoreResult<()> {
        warn!(target: LOG_TARGET, "Watch stream failed: {error}");
        self.watch_change_aggregator = None;
        if self.should_start_watch_stream() {
            self.online_state_tracker.handle_watch_stream_failure(&error);
            self.start_watch_stream().await
        } else {
            self.online_state_tracker.update_state(OnlineState::Unknown);
            Ok(())
        }
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        self.can_use_network() && self.write_pipeline.len() < self.max_pending_writes
    }

    /// Moves unsent batches from the mutation queue onto the write stream
    /// until the pipeline is full.
    pub async fn fill_write_pipeline(&mut self, local_store: &LocalStore) -> FirestoreResult<()> {
        let mut last_batch_id = self
            .write_pipeline
            .back()
            .map(MutationBatch::batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN);
        while self.can_add_to_write_pipeline() {
            let Some(batch) = local_store.get_next_mutation_batch(last_batch_id) else {
                break;
            };
            last_batch_id = batch.batch_id();
            let request = self
                .serializer
                .encode_mutation_batch(&batch, local_store.get_last_stream_token());
            self.write_pipeline.push_back(batch);
            self.transport.write(last_batch_id, request).await?;
        }
        Ok(())
    }

    /// Pops the acknowledged batch off the pipeline.
    pub fn handle_write_result(
        &mut self,
        batch_id: BatchId,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<MutationBatchResult> {
        match self.write_pipeline.front() {
            Some(batch) if batch.batch_id() != batch_id => {
                return Err(invalid_argument(format!(
                    "Write result for batch {batch_id} but batch {} is next in the pipeline",
                    batch.batch_id()
                )));
            }
            Some(batch) if batch.mutations().len() != results.len() => {
                return Err(invalid_argument(format!(
                    "Batch {batch_id} has {} mutations but {} results",
                    batch.mutations().len(),
                    results.len()
                )));
            }
            Some(_) => {}
            None => {
                return Err(invalid_argument(format!(
                    "Write result for batch {batch_id} with no pending writes"
                )));
            }
        }
        let batch = self
            .write_pipeline
            .pop_front()
            .ok_or_else(|| invalid_argument("write pipeline is empty"))?;
        Ok(MutationBatchResult::new(batch, commit_version, results, stream_token))
    }

    /// Handles a write stream failure. A permanent error rejects the batch at
    /// the head of the pipeline and returns it; a transient one re-sends the
    /// whole pipeline.
    pub async fn handle_write_error(
        &mut self,
        error: FirestoreError,
        local_store: &LocalStore,
    ) -> FirestoreResult<Option<(BatchId, FirestoreError)>> {
        if error.code.is_permanent_write_error() {
            let Some(batch) = self.write_pipeline.pop_front() else {
                warn!(target: LOG_TARGET, "Write error with no pending writes: {error}");
                return Ok(None);
            };
            warn!(
                target: LOG_TARGET,
                "Write batch {} rejected: {error}",
                batch.batch_id()
            );
            return Ok(Some((batch.batch_id(), error)));
        }

        debug!(target: LOG_TARGET, "Retrying {} writes after {error}", self.write_pipeline.len());
        if self.can_use_network() {
            for batch in &self.write_pipeline {
                let request = self
                    .serializer
                    .encode_mutation_batch(batch, local_store.get_last_stream_token());
                self.transport.write(batch.batch_id(), request).await?;
            }
        }
        Ok(None)
    }

    pub async fn enable_network(&mut self, local_store: &LocalStore) -> FirestoreResult<()> {
        self.network_enabled = true;
        if self.should_start_watch_stream() {
            self.start_watch_stream().await?;
        } else {
            self.online_state_tracker.update_state(OnlineState::Unknown);
        }
        self.fill_write_pipeline(local_store).await
    }

    pub async fn disable_network(&mut self) -> FirestoreResult<()> {
        self.network_enabled = false;
        self.disable_network_internal().await?;
        // Cached results are raised right away from now on.
        self.online_state_tracker.update_state(OnlineState::Offline);
        Ok(())
    }

    async fn disable_network_internal(&mut self) -> FirestoreResult<()> {
        self.watch_change_aggregator = None;
        if !self.write_pipeline.is_empty() {
            debug!(
                target: LOG_TARGET,
                "Stopping write stream with {} pending writes",
                self.write_pipeline.len()
            );
            self.write_pipeline.clear();
        }
        self.transport.close_streams().await
    }

    pub async fn run_count(&self, query: &Query) -> FirestoreResult<i64> {
        if !self.can_use_network() {
            return Err(unavailable(
                "Failed to get count result because the client is offline",
            ));
        }
        let request = self.serializer.encode_count_query(&query.to_target());
        self.transport.run_count(request).await
    }

    pub async fn shutdown(&mut self) -> FirestoreResult<()> {
        debug!(target: LOG_TARGET, "Shutting down remote store");
        self.network_enabled = false;
        self.disable_network_internal().await?;
        self.online_state_tracker.update_state(OnlineState::Unknown);
        Ok(())
    }
}
