use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::firestore::core::{ChangeType, OnlineState, Query, ViewSnapshot};
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::util::hard_assert;

/// Receives every snapshot, or the error that ends the listen.
pub type SnapshotListener = Arc<dyn Fn(FirestoreResult<ViewSnapshot>) + Send + Sync>;

pub type ListenerId = u64;

/// Where a listener gets its results from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListenSource {
    /// The local cache, kept up to date by a watch on the backend.
    #[default]
    Default,
    /// The local cache only; no watch target is opened for this listener.
    Cache,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenOptions {
    /// Raise snapshots when only a document's pending-write state changed.
    pub include_document_metadata_changes: bool,
    /// Raise snapshots when only `is_from_cache` or pending writes changed.
    pub include_query_metadata_changes: bool,
    /// Hold back a cached first snapshot while the client may be online.
    pub wait_for_sync_when_online: bool,
    pub source: ListenSource,
}

impl ListenOptions {
    pub fn include_metadata_changes() -> Self {
        Self {
            include_document_metadata_changes: true,
            include_query_metadata_changes: true,
            ..Self::default()
        }
    }

    pub fn from_cache() -> Self {
        Self {
            source: ListenSource::Cache,
            ..Self::default()
        }
    }
}

/// One registered listener on a query. Decides which view snapshots are
/// raised to the user callback.
pub struct QueryListener {
    id: ListenerId,
    query: Query,
    options: ListenOptions,
    listener: SnapshotListener,
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl Debug for QueryListener {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryListener")
            .field("id", &self.id)
            .field("query", &self.query.canonical_id())
            .field("options", &self.options)
            .field("raised_initial_event", &self.raised_initial_event)
            .finish()
    }
}

impl QueryListener {
    pub fn new(id: ListenerId, query: Query, options: ListenOptions, listener: SnapshotListener) -> Self {
        Self {
            id,
            query,
            options,
            listener,
            raised_initial_event: false,
            snapshot: None,
            online_state: OnlineState::Unknown,
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn options(&self) -> &ListenOptions {
        &self.options
    }

    pub fn listens_to_remote_store(&self) -> bool {
        self.options.source != ListenSource::Cache
    }

    /// Applies a new view snapshot. Returns whether the callback was invoked.
    pub fn on_view_snapshot(&mut self, snapshot: ViewSnapshot) -> bool {
        hard_assert(
            !snapshot.changes.is_empty() || snapshot.sync_state_changed,
            "we got a new snapshot with no changes",
        );

        let snapshot = if self.options.include_document_metadata_changes {
            snapshot
        } else {
            let changes = snapshot
                .changes
                .into_iter()
                .filter(|change| change.change_type != ChangeType::Metadata)
                .collect();
            ViewSnapshot {
                changes,
                excludes_metadata_changes: true,
                ..snapshot
            }
        };

        let mut raised_event = false;
        if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                self.raise_initial_event(&snapshot);
                raised_event = true;
            }
        } else if self.should_raise_event(&snapshot) {
            (self.listener)(Ok(snapshot.clone()));
            raised_event = true;
        }
        self.snapshot = Some(snapshot);
        raised_event
    }

    pub fn on_error(&self, error: FirestoreError) {
        (self.listener)(Err(error));
    }

    /// Records the online state; a held-back cached snapshot may now be
    /// raised. Returns whether the callback was invoked.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> bool {
        self.online_state = online_state;
        let Some(snapshot) = self.snapshot.clone() else {
            return false;
        };
        if !self.raised_initial_event && self.should_raise_initial_event(&snapshot, online_state) {
            self.raise_initial_event(&snapshot);
            return true;
        }
        false
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.is_from_cache || !self.listens_to_remote_store() {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // Wait for the backend unless there is something to show or no
        // chance of hearing from it.
        !snapshot.documents.is_empty()
            || snapshot.has_cached_results
            || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.changes.is_empty() {
            return true;
        }
        let has_pending_writes_changed = self
            .snapshot
            .as_ref()
            .is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || has_pending_writes_changed {
            return self.options.include_query_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot) {
        hard_assert(!self.raised_initial_event, "trying to raise initial events twice");
        let initial = ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.documents.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.is_from_cache,
            snapshot.excludes_metadata_changes,
            snapshot.has_cached_results,
        );
        self.raised_initial_event = true;
        (self.listener)(Ok(initial));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{DocumentSet, DocumentViewChange};
    use crate::firestore::test_support::{doc, map, query};
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    type Events = Arc<Mutex<Vec<FirestoreResult<ViewSnapshot>>>>;

    fn listener(options: ListenOptions) -> (QueryListener, Events) {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let listener = QueryListener::new(
            1,
            query("rooms"),
            options,
            Arc::new(move |event| sink.lock().unwrap().push(event)),
        );
        (listener, events)
    }

    fn snapshot(from_cache: bool, documents: &[&str], sync_state_changed: bool) -> ViewSnapshot {
        let query = query("rooms");
        let mut set = DocumentSet::for_query(&query);
        let mut changes = Vec::new();
        for path in documents {
            let document = doc(path, 1, map(&[]));
            changes.push(DocumentViewChange::new(ChangeType::Added, document.clone()));
            set.insert(document);
        }
        ViewSnapshot {
            old_documents: set.empty_like(),
            query,
            documents: set,
            changes,
            is_from_cache: from_cache,
            mutated_keys: BTreeSet::new(),
            sync_state_changed,
            excludes_metadata_changes: false,
            has_cached_results: false,
        }
    }

    #[test]
    fn empty_cached_snapshot_waits_until_offline() {
        let (mut listener, events) = listener(ListenOptions::default());
        assert!(!listener.on_view_snapshot(snapshot(true, &[], true)));
        assert!(events.lock().unwrap().is_empty());

        assert!(listener.apply_online_state_change(OnlineState::Offline));
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].as_ref().unwrap().is_from_cache);
    }

    #[test]
    fn wait_for_sync_holds_back_cached_documents_while_online() {
        let (mut listener, events) = listener(ListenOptions {
            wait_for_sync_when_online: true,
            ..ListenOptions::default()
        });
        listener.apply_online_state_change(OnlineState::Online);
        assert!(!listener.on_view_snapshot(snapshot(true, &["rooms/a"], true)));
        assert!(listener.on_view_snapshot(snapshot(false, &["rooms/a"], true)));
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn metadata_only_snapshots_need_opt_in() {
        let (mut quiet, quiet_events) = listener(ListenOptions::default());
        let (mut chatty, chatty_events) = listener(ListenOptions::include_metadata_changes());
        for listener in [&mut quiet, &mut chatty] {
            listener.on_view_snapshot(snapshot(true, &["rooms/a"], true));
            let mut synced = snapshot(false, &["rooms/a"], true);
            synced.changes.clear();
            listener.on_view_snapshot(synced);
        }
        assert_eq!(quiet_events.lock().unwrap().len(), 1);
        assert_eq!(chatty_events.lock().unwrap().len(), 2);
    }

    #[test]
    fn cache_listeners_raise_immediately() {
        let (mut listener, events) = listener(ListenOptions::from_cache());
        assert!(!listener.listens_to_remote_store());
        assert!(listener.on_view_snapshot(snapshot(true, &[], true)));
        assert_eq!(events.lock().unwrap().len(), 1);
    }
}
