use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use log::{debug, warn};

use crate::firestore::core::{ListenerId, OnlineState, Query, QueryListener, ViewSnapshot};
use crate::firestore::error::{FirestoreError, FirestoreResult};

const LOG_TARGET: &str = "firestore::core::event_manager";

/// Called whenever every active listener has seen a consistent snapshot.
pub type SnapshotsInSyncListener = Arc<dyn Fn() + Send + Sync>;

/// Called with each new [`OnlineState`] of the client.
pub type OnlineStateListener = Arc<dyn Fn(OnlineState) + Send + Sync>;

/// The sync engine operations the event manager drives.
#[async_trait]
pub trait QuerySyncer: Send {
    /// Starts tracking `query` and returns its first snapshot.
    async fn listen(&mut self, query: &Query, should_listen_to_remote: bool) -> FirestoreResult<ViewSnapshot>;

    async fn stop_listening(&mut self, query: &Query, should_unlisten_to_remote: bool) -> FirestoreResult<()>;

    /// Opens the watch target of a query that so far only had cache
    /// listeners.
    async fn listen_to_remote_store(&mut self, query: &Query) -> FirestoreResult<()>;

    /// Closes the watch target but keeps the local view.
    async fn stop_listening_to_remote_store_only(&mut self, query: &Query) -> FirestoreResult<()>;
}

#[derive(Debug, Default)]
struct QueryListenersInfo {
    view_snapshot: Option<ViewSnapshot>,
    /// In registration order.
    listeners: Vec<QueryListener>,
}

impl QueryListenersInfo {
    fn has_remote_listeners(&self) -> bool {
        self.listeners
            .iter()
            .any(QueryListener::listens_to_remote_store)
    }
}

/// Fans view snapshots out to the listeners of each query and makes sure the
/// sync engine tracks every query exactly once.
#[derive(Default)]
pub struct EventManager {
    /// Keyed by query canonical id, in first-listen order.
    queries: IndexMap<String, QueryListenersInfo>,
    online_state: OnlineState,
    snapshots_in_sync_listeners: IndexMap<ListenerId, SnapshotsInSyncListener>,
    online_state_listeners: IndexMap<ListenerId, OnlineStateListener>,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state
    }

    pub fn has_listeners(&self, query: &Query) -> bool {
        self.queries.contains_key(&query.canonical_id())
    }

    /// Registers the listener, starting a sync engine listen for the first
    /// listener of a query. Failures are reported to the listener itself.
    pub async fn listen(&mut self, mut listener: QueryListener, syncer: &mut dyn QuerySyncer) {
        let canonical_id = listener.query().canonical_id();
        let first_listen = !self.queries.contains_key(&canonical_id);
        let needs_remote_upgrade = !first_listen
            && listener.listens_to_remote_store()
            && self
                .queries
                .get(&canonical_id)
                .is_some_and(|info| !info.has_remote_listeners());

        let query = listener.query().clone();
        let result = if first_listen {
            syncer
                .listen(&query, listener.listens_to_remote_store())
                .await
                .map(Some)
        } else if needs_remote_upgrade {
            syncer.listen_to_remote_store(&query).await.map(|()| None)
        } else {
            Ok(None)
        };

        let initial_snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(target: LOG_TARGET, "Failed to listen to {query}: {error}");
                listener.on_error(error);
                return;
            }
        };

        let info = self.queries.entry(canonical_id).or_default();
        if initial_snapshot.is_some() {
            info.view_snapshot = initial_snapshot;
        }

        // The listener learns the online state before its first snapshot.
        listener.apply_online_state_change(self.online_state);
        let mut raised_event = false;
        if let Some(snapshot) = info.view_snapshot.clone() {
            raised_event = listener.on_view_snapshot(snapshot);
        }
        info.listeners.push(listener);
        if raised_event {
            self.raise_snapshots_in_sync_event();
        }
    }

    /// Removes the listener. Unknown listeners are ignored.
    pub async fn unlisten(
        &mut self,
        query: &Query,
        listener_id: ListenerId,
        syncer: &mut dyn QuerySyncer,
    ) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let Some(info) = self.queries.get_mut(&canonical_id) else {
            return Ok(());
        };
        let Some(position) = info
            .listeners
            .iter()
            .position(|listener| listener.id() == listener_id)
        else {
            return Ok(());
        };
        let removed = info.listeners.remove(position);

        if info.listeners.is_empty() {
            self.queries.shift_remove(&canonical_id);
            debug!(target: LOG_TARGET, "Last listener removed from {query}");
            syncer
                .stop_listening(query, removed.listens_to_remote_store())
                .await
        } else if removed.listens_to_remote_store() && !info.has_remote_listeners() {
            syncer.stop_listening_to_remote_store_only(query).await
        } else {
            Ok(())
        }
    }

    /// Delivers snapshots query by query in the given order, and to each
    /// query's listeners in registration order.
    pub fn on_watch_change(&mut self, snapshots: Vec<ViewSnapshot>) {
        let mut raised_event = false;
        for snapshot in snapshots {
            let Some(info) = self.queries.get_mut(&snapshot.query.canonical_id()) else {
                continue;
            };
            for listener in &mut info.listeners {
                if listener.on_view_snapshot(snapshot.clone()) {
                    raised_event = true;
                }
            }
            info.view_snapshot = Some(snapshot);
        }
        if raised_event {
            self.raise_snapshots_in_sync_event();
        }
    }

    /// Fails every listener of the query once and forgets the query.
    pub fn on_watch_error(&mut self, query: &Query, error: FirestoreError) {
        if let Some(info) = self.queries.shift_remove(&query.canonical_id()) {
            for listener in &info.listeners {
                listener.on_error(error.clone());
            }
        }
    }

    pub fn on_online_state_change(&mut self, online_state: OnlineState) {
        if self.online_state != online_state {
            debug!(target: LOG_TARGET, "Notifying online state listeners of {online_state:?}");
            for listener in self.online_state_listeners.values() {
                listener(online_state);
            }
        }
        self.online_state = online_state;
        let mut raised_event = false;
        for info in self.queries.values_mut() {
            for listener in &mut info.listeners {
                if listener.apply_online_state_change(online_state) {
                    raised_event = true;
                }
            }
        }
        if raised_event {
            self.raise_snapshots_in_sync_event();
        }
    }

    /// Registers the listener and calls it right away.
    pub fn add_snapshots_in_sync_listener(&mut self, id: ListenerId, listener: SnapshotsInSyncListener) {
        listener();
        self.snapshots_in_sync_listeners.insert(id, listener);
    }

    pub fn remove_snapshots_in_sync_listener(&mut self, id: ListenerId) {
        self.snapshots_in_sync_listeners.shift_remove(&id);
    }

    /// Registers the listener and calls it right away with the current state.
    pub fn add_online_state_listener(&mut self, id: ListenerId, listener: OnlineStateListener) {
        listener(self.online_state);
        self.online_state_listeners.insert(id, listener);
    }

    pub fn remove_online_state_listener(&mut self, id: ListenerId) {
        self.online_state_listeners.shift_remove(&id);
    }

    fn raise_snapshots_in_sync_event(&self) {
        for listener in self.snapshots_in_sync_listeners.values() {
            listener();
        }
    }
}
