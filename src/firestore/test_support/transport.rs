use std::sync::atomic::{AtomicI64, Ordering};

use async_lock::Mutex;
use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::firestore::error::FirestoreResult;
use crate::firestore::model::{BatchId, TargetId};
use crate::firestore::remote::RemoteTransport;

/// One request the sync core sent to the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportCall {
    Watch(TargetId),
    Unwatch(TargetId),
    Write(BatchId),
    CloseStreams,
    RunCount,
}

/// Transport that records every request and never talks to a backend.
/// Responses are fed back through the client's `handle_*` methods.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<TransportCall>>,
    requests: Mutex<Vec<JsonValue>>,
    count: AtomicI64,
}

impl RecordingTransport {
    /// A transport whose count queries report `count`.
    pub fn with_count(count: i64) -> Self {
        let transport = Self::default();
        transport.count.store(count, Ordering::SeqCst);
        transport
    }

    pub async fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().await.clone()
    }

    /// Encoded watch, write and count requests, in send order.
    pub async fn requests(&self) -> Vec<JsonValue> {
        self.requests.lock().await.clone()
    }

    async fn record(&self, call: TransportCall, request: Option<JsonValue>) {
        self.calls.lock().await.push(call);
        if let Some(request) = request {
            self.requests.lock().await.push(request);
        }
    }
}

#[async_trait]
impl RemoteTransport for RecordingTransport {
    async fn watch(&self, target_id: TargetId, request: JsonValue) -> FirestoreResult<()> {
        self.record(TransportCall::Watch(target_id), Some(request)).await;
        Ok(())
    }

    async fn unwatch(&self, target_id: TargetId) -> FirestoreResult<()> {
        self.record(TransportCall::Unwatch(target_id), None).await;
        Ok(())
    }

    async fn write(&self, batch_id: BatchId, request: JsonValue) -> FirestoreResult<()> {
        self.record(TransportCall::Write(batch_id), Some(request)).await;
        Ok(())
    }

    async fn close_streams(&self) -> FirestoreResult<()> {
        self.record(TransportCall::CloseStreams, None).await;
        Ok(())
    }

    async fn run_count(&self, request: JsonValue) -> FirestoreResult<i64> {
        self.record(TransportCall::RunCount, Some(request)).await;
        Ok(self.count.load(Ordering::SeqCst))
    }
}
