mod bundle_cache;
mod document_overlay_cache;
mod garbage_collector;
mod index_manager;
mod journal;
mod local_documents;
mod local_store;
mod mutation_queue;
mod persistence;
pub mod query_engine;
mod reference_set;
mod remote_document_cache;
mod target_cache;
mod target_data;

#[doc(inline)]
pub use bundle_cache::{
    Bundle, BundleMetadata, BundledDocument, BundledDocumentMetadata, BundledQuery,
    MemoryBundleCache, NamedQuery,
};
#[doc(inline)]
pub use document_overlay_cache::{MemoryDocumentOverlayCache, Overlay};
pub use garbage_collector::{LruResults, MemoryEagerReferenceDelegate};
pub use index_manager::MemoryIndexManager;
pub use local_documents::{IndexOffset, LocalDocumentsView};
#[doc(inline)]
pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult, QueryResult};
pub use mutation_queue::MemoryMutationQueue;
#[doc(inline)]
pub use persistence::MemoryPersistence;
pub use reference_set::ReferenceSet;
pub use remote_document_cache::MemoryRemoteDocumentCache;
pub use target_cache::MemoryTargetCache;
#[doc(inline)]
pub use target_data::{ListenSequenceNumber, QueryPurpose, TargetData, INVALID_SEQUENCE_NUMBER};
