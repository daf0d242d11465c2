use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::channel::oneshot;
use futures::FutureExt;
use log::{debug, warn};
use serde_json::Value as JsonValue;

use crate::firestore::config::SyncEngineSettings;
use crate::firestore::core::{
    AsyncQueue, BundleLoadProgress, EventManager, ListenOptions, ListenerId, OnlineState,
    OnlineStateListener, Query, QueryListener, SnapshotListener, SnapshotsInSyncListener,
    SyncEngine, SyncEngineEvent,
};
use crate::firestore::error::{cancelled, FirestoreError, FirestoreResult};
use crate::firestore::local::{Bundle, LruResults, NamedQuery};
use crate::firestore::model::{BatchId, DatabaseId, Mutation, MutationResult, SnapshotVersion};
use crate::firestore::remote::{decode_watch_change, RemoteTransport, WatchChange};

const LOG_TARGET: &str = "firestore::core::firestore_client";

/// Everything the client's async queue owns.
struct ClientState {
    sync_engine: SyncEngine,
    event_manager: EventManager,
}

impl ClientState {
    /// Hands what the sync engine raised to the listeners, in order.
    fn dispatch_events(&mut self) {
        for event in self.sync_engine.take_events() {
            match event {
                SyncEngineEvent::ViewSnapshots(snapshots) => {
                    self.event_manager.on_watch_change(snapshots)
                }
                SyncEngineEvent::QueryError(query, error) => {
                    self.event_manager.on_watch_error(&query, error)
                }
                SyncEngineEvent::OnlineStateChanged(online_state) => {
                    self.event_manager.on_online_state_change(online_state)
                }
            }
        }
    }

    async fn listen(&mut self, listener: QueryListener) {
        self.event_manager
            .listen(listener, &mut self.sync_engine)
            .await;
        self.dispatch_events();
    }

    async fn unlisten(&mut self, query: Query, listener_id: ListenerId) -> FirestoreResult<()> {
        let result = self
            .event_manager
            .unlisten(&query, listener_id, &mut self.sync_engine)
            .await;
        self.dispatch_events();
        result
    }

    fn settle<T>(&mut self, result: FirestoreResult<T>) -> FirestoreResult<T> {
        self.dispatch_events();
        result
    }
}

/// Public entry point of the sync core.
///
/// Every call is serialized onto one async queue that owns the sync engine,
/// the local store and the listener registry, so the client can be shared
/// freely across tasks. The transport feeds backend traffic back in through
/// the `handle_*` methods.
#[derive(Clone)]
pub struct FirestoreClient {
    queue: AsyncQueue<ClientState>,
    next_listener_id: Arc<AtomicU64>,
}

impl FirestoreClient {
    pub fn new(
        settings: SyncEngineSettings,
        database_id: DatabaseId,
        transport: Arc<dyn RemoteTransport>,
    ) -> Self {
        let state = ClientState {
            sync_engine: SyncEngine::new(settings, database_id, transport),
            event_manager: EventManager::new(),
        };
        Self {
            queue: AsyncQueue::start(state),
            next_listener_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn next_listener_id(&self) -> ListenerId {
        self.next_listener_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Registers `listener` on `query`. The listener first learns the
    /// current online state, then receives snapshots until the returned
    /// registration is removed or an error ends the listen.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        listener: SnapshotListener,
    ) -> FirestoreResult<ListenerRegistration> {
        let id = self.next_listener_id();
        let query_listener = QueryListener::new(id, query.clone(), options, listener);
        self.queue
            .enqueue(move |state: &mut ClientState| state.listen(query_listener).boxed())
            .await?;
        Ok(ListenerRegistration {
            queue: self.queue.clone(),
            query,
            id,
            removed: false,
        })
    }

    /// Applies `mutations` locally as one batch and resolves once the
    /// backend acknowledges it, or with the rejection.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        let (callback, result) = oneshot::channel();
        self.queue
            .enqueue(move |state: &mut ClientState| {
                async move {
                    let outcome = state.sync_engine.write_mutations(mutations, callback).await;
                    state.settle(outcome)
                }
                .boxed()
            })
            .await??;
        result
            .await
            .map_err(|_| cancelled("The write was dropped before it settled"))?
    }

    /// Resolves once every write issued so far has settled.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        let (callback, result) = oneshot::channel();
        self.queue
            .enqueue(move |state: &mut ClientState| {
                async move { state.sync_engine.register_pending_writes_task(callback) }.boxed()
            })
            .await?;
        result
            .await
            .map_err(|_| cancelled("Pending writes were dropped before they settled"))?
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.queue
            .enqueue(|state: &mut ClientState| {
                async move {
                    let outcome = state.sync_engine.enable_network().await;
                    state.settle(outcome)
                }
                .boxed()
            })
            .await?
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.queue
            .enqueue(|state: &mut ClientState| {
                async move {
                    let outcome = state.sync_engine.disable_network().await;
                    state.settle(outcome)
                }
                .boxed()
            })
            .await?
    }

    pub async fn online_state(&self) -> FirestoreResult<OnlineState> {
        self.queue
            .enqueue(|state: &mut ClientState| {
                async move { state.event_manager.online_state() }.boxed()
            })
            .await
    }

    /// Drops the cached remote state. Every active listener receives one
    /// `aborted` error and has to listen again.
    pub async fn clear_cache(&self) -> FirestoreResult<()> {
        self.queue
            .enqueue(|state: &mut ClientState| {
                async move {
                    let outcome = state.sync_engine.clear_cache().await;
                    state.settle(outcome)
                }
                .boxed()
            })
            .await?
    }

    pub async fn run_count(&self, query: Query) -> FirestoreResult<i64> {
        self.queue
            .enqueue(move |state: &mut ClientState| {
                async move { state.sync_engine.run_count(&query).await }.boxed()
            })
            .await?
    }

    pub async fn handle_watch_change(&self, change: WatchChange) -> FirestoreResult<()> {
        self.queue
            .enqueue(move |state: &mut ClientState| {
                async move {
                    let outcome = state.sync_engine.handle_watch_change(change).await;
                    state.settle(outcome)
                }
                .boxed()
            })
            .await?
    }

    /// Decodes a raw listen response and applies it. Messages that carry no
    /// watch change are ignored.
    pub async fn handle_watch_message(&self, message: JsonValue) -> FirestoreResult<()> {
        self.queue
            .enqueue(move |state: &mut ClientState| {
                async move {
                    let serializer = state.sync_engine.remote_store().serializer();
                    let change = match decode_watch_change(serializer, &message)? {
                        Some(change) => change,
                        None => {
                            debug!(target: LOG_TARGET, "Ignoring empty watch message");
                            return Ok(());
                        }
                    };
                    let outcome = state.sync_engine.handle_watch_change(change).await;
                    state.settle(outcome)
                }
                .boxed()
            })
            .await?
    }

    pub async fn handle_watch_stream_error(&self, error: FirestoreError) -> FirestoreResult<()> {
        self.queue
            .enqueue(move |state: &mut ClientState| {
                async move {
                    let outcome = state.sync_engine.handle_watch_stream_error(error).await;
                    state.settle(outcome)
                }
                .boxed()
            })
            .await?
    }

    pub async fn handle_write_result(
        &self,
        batch_id: BatchId,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<()> {
        self.queue
            .enqueue(move |state: &mut ClientState| {
                async move {
                    let outcome = state
                        .sync_engine
                        .handle_write_result(batch_id, commit_version, results, stream_token)
                        .await;
                    state.settle(outcome)
                }
                .boxed()
            })
            .await?
    }

    /// Decodes a raw write response for `batch_id` and applies it.
    pub async fn handle_write_response(&self, batch_id: BatchId, response: JsonValue) -> FirestoreResult<()> {
        self.queue
            .enqueue(move |state: &mut ClientState| {
                async move {
                    let (commit_version, results, stream_token) = state
                        .sync_engine
                        .remote_store()
                        .serializer()
                        .decode_write_response(&response)?;
                    let outcome = state
                        .sync_engine
                        .handle_write_result(batch_id, commit_version, results, stream_token)
                        .await;
                    state.settle(outcome)
                }
                .boxed()
            })
            .await?
    }

    pub async fn handle_write_error(&self, error: FirestoreError) -> FirestoreResult<()> {
        self.queue
            .enqueue(move |state: &mut ClientState| {
                async move {
                    let outcome = state.sync_engine.handle_write_error(error).await;
                    state.settle(outcome)
                }
                .boxed()
            })
            .await?
    }

    /// `listener` runs now and whenever every listener has seen a
    /// consistent snapshot.
    pub async fn add_snapshots_in_sync_listener(
        &self,
        listener: SnapshotsInSyncListener,
    ) -> FirestoreResult<ListenerId> {
        let id = self.next_listener_id();
        self.queue
            .enqueue(move |state: &mut ClientState| {
                async move {
                    state
                        .event_manager
                        .add_snapshots_in_sync_listener(id, listener)
                }
                .boxed()
            })
            .await?;
        Ok(id)
    }

    pub async fn remove_snapshots_in_sync_listener(&self, id: ListenerId) -> FirestoreResult<()> {
        self.queue
            .enqueue(move |state: &mut ClientState| {
                async move { state.event_manager.remove_snapshots_in_sync_listener(id) }.boxed()
            })
            .await
    }

    /// `listener` runs now with the current state and again on every change.
    pub async fn add_online_state_listener(
        &self,
        listener: OnlineStateListener,
    ) -> FirestoreResult<ListenerId> {
        let id = self.next_listener_id();
        self.queue
            .enqueue(move |state: &mut ClientState| {
                async move { state.event_manager.add_online_state_listener(id, listener) }.boxed()
            })
            .await?;
        Ok(id)
    }

    pub async fn remove_online_state_listener(&self, id: ListenerId) -> FirestoreResult<()> {
        self.queue
            .enqueue(move |state: &mut ClientState| {
                async move { state.event_manager.remove_online_state_listener(id) }.boxed()
            })
            .await
    }

    pub async fn load_bundle(&self, bundle: Bundle) -> FirestoreResult<BundleLoadProgress> {
        self.queue
            .enqueue(move |state: &mut ClientState| {
                async move {
                    let outcome = state.sync_engine.load_bundle(bundle).await;
                    state.settle(outcome)
                }
                .boxed()
            })
            .await?
    }

    pub async fn get_named_query(&self, name: impl Into<String>) -> FirestoreResult<Option<NamedQuery>> {
        let name = name.into();
        self.queue
            .enqueue(move |state: &mut ClientState| {
                async move { state.sync_engine.get_named_query(&name) }.boxed()
            })
            .await
    }

    pub async fn collect_garbage(&self) -> FirestoreResult<LruResults> {
        self.queue
            .enqueue(|state: &mut ClientState| {
                async move { state.sync_engine.collect_garbage() }.boxed()
            })
            .await?
    }

    /// Closes the streams and stops the queue. Later calls fail with
    /// `cancelled`.
    pub async fn shutdown(&self) -> FirestoreResult<()> {
        let outcome = self
            .queue
            .enqueue(|state: &mut ClientState| {
                async move {
                    let outcome = state.sync_engine.shutdown().await;
                    state.settle(outcome)
                }
                .boxed()
            })
            .await;
        self.queue.close();
        outcome?
    }
}

/// Handle of one registered snapshot listener. Removing or dropping it stops
/// the listener.
pub struct ListenerRegistration {
    queue: AsyncQueue<ClientState>,
    query: Query,
    id: ListenerId,
    removed: bool,
}

impl ListenerRegistration {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Removes the listener and waits until the sync engine has processed
    /// the removal.
    pub async fn remove(mut self) -> FirestoreResult<()> {
        self.removed = true;
        let query = self.query.clone();
        let id = self.id;
        self.queue
            .enqueue(move |state: &mut ClientState| state.unlisten(query, id).boxed())
            .await?
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        let query = self.query.clone();
        let id = self.id;
        let queued = self.queue.enqueue_and_forget(move |state: &mut ClientState| {
            async move {
                if let Err(error) = state.unlisten(query, id).await {
                    warn!(target: LOG_TARGET, "Failed to remove listener {id}: {error}");
                }
            }
            .boxed()
        });
        if !queued {
            debug!(target: LOG_TARGET, "Listener {id} dropped after shutdown");
        }
    }
}
