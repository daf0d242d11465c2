mod remote_event;
mod remote_store;
pub mod serializer;
pub mod watch_change;
mod watch_change_aggregator;

#[doc(inline)]
pub use remote_event::{RemoteEvent, TargetChange};
#[doc(inline)]
pub use remote_store::{RemoteStore, RemoteTransport, WatchOutcome};
pub use serializer::RemoteSerializer;
pub use watch_change::{
    decode_watch_change, DocumentChange, DocumentDelete, DocumentRemove, ExistenceFilterChange,
    TargetChangeState, WatchChange, WatchTargetChange,
};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
