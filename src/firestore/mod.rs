pub mod config;
pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod value;

pub use config::SyncEngineSettings;
#[doc(inline)]
pub use core::{FirestoreClient, ListenOptions, ListenSource, ListenerRegistration, Query};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
