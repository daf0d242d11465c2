mod async_queue;
mod bound;
mod document_set;
mod event_manager;
mod filter;
mod firestore_client;
mod online_state;
mod order_by;
mod query;
mod query_listener;
mod sync_engine;
mod target;
mod target_id_generator;
mod view;
mod view_snapshot;

pub use async_queue::AsyncQueue;
pub use bound::{Bound, IndexBound};
pub use document_set::{DocumentComparator, DocumentSet};
#[doc(inline)]
pub use event_manager::{EventManager, OnlineStateListener, QuerySyncer, SnapshotsInSyncListener};
pub use filter::{CompositeFilter, CompositeOperator, FieldFilter, Filter, Operator};
#[doc(inline)]
pub use firestore_client::{FirestoreClient, ListenerRegistration};
pub use online_state::OnlineState;
pub use order_by::{Direction, OrderBy};
#[doc(inline)]
pub use query::{LimitType, Query};
pub use query_listener::{ListenOptions, ListenSource, ListenerId, QueryListener, SnapshotListener};
#[doc(inline)]
pub use sync_engine::{BundleLoadProgress, SyncEngine, SyncEngineEvent, WriteCallback};
#[doc(inline)]
pub use target::Target;
pub use target_id_generator::TargetIdGenerator;
pub use view::{LimboChangeType, LimboDocumentChange, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{ChangeType, DocumentViewChange, DocumentViewChangeSet, SyncState, ViewSnapshot};
