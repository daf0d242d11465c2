use async_channel::{Receiver, Sender};
use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::debug;

use crate::firestore::error::{cancelled, FirestoreResult};
use crate::platform::runtime;

const LOG_TARGET: &str = "firestore::core::async_queue";

type Job<S> = Box<dyn for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, ()> + Send>;

/// Serial executor owning a piece of state.
///
/// Operations run one at a time, in the order they were enqueued, on a
/// background task that has exclusive access to the state. Callers on any
/// thread hand work over through a channel and await the result.
pub struct AsyncQueue<S> {
    sender: Sender<Job<S>>,
}

impl<S> Clone for AsyncQueue<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<S: Send + 'static> AsyncQueue<S> {
    /// Moves `state` onto a new background task.
    pub fn start(state: S) -> Self {
        let (sender, receiver) = async_channel::unbounded();
        runtime::spawn_detached(drain(state, receiver));
        Self { sender }
    }

    /// Runs `operation` after every operation enqueued before it and
    /// returns its output.
    pub async fn enqueue<T, F>(&self, operation: F) -> FirestoreResult<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, T> + Send + 'static,
    {
        let (result_sender, result_receiver) = oneshot::channel();
        let job: Job<S> = Box::new(move |state| {
            async move {
                let output = operation(state).await;
                let _ = result_sender.send(output);
            }
            .boxed()
        });
        self.sender
            .send(job)
            .await
            .map_err(|_| cancelled("The async queue has been shut down"))?;
        result_receiver
            .await
            .map_err(|_| cancelled("The async queue dropped the operation"))
    }

    /// Enqueues `operation` without waiting for it. Returns false when the
    /// queue is already closed.
    pub fn enqueue_and_forget<F>(&self, operation: F) -> bool
    where
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, ()> + Send + 'static,
    {
        self.sender.try_send(Box::new(operation)).is_ok()
    }

    /// Stops accepting operations; queued ones still run.
    pub fn close(&self) {
        self.sender.close();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

async fn drain<S>(mut state: S, receiver: Receiver<Job<S>>) {
    while let Ok(job) = receiver.recv().await {
        job(&mut state).await;
    }
    debug!(target: LOG_TARGET, "Async queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use std::time::Duration;

    #[tokio::test]
    async fn operations_run_in_enqueue_order() {
        let queue = AsyncQueue::start(Vec::new());
        let slow = queue.enqueue(|log: &mut Vec<&'static str>| {
            async move {
                runtime::sleep(Duration::from_millis(5)).await;
                log.push("slow");
            }
            .boxed()
        });
        let fast = queue.enqueue(|log: &mut Vec<&'static str>| {
            async move {
                log.push("fast");
            }
            .boxed()
        });
        let (slow, fast) = futures::future::join(slow, fast).await;
        slow.unwrap();
        fast.unwrap();

        let log = queue
            .enqueue(|log: &mut Vec<&'static str>| async move { log.clone() }.boxed())
            .await
            .unwrap();
        assert_eq!(log, vec!["slow", "fast"]);
    }

    #[tokio::test]
    async fn closed_queue_rejects_new_operations() {
        let queue = AsyncQueue::start(0_u32);
        assert!(queue.enqueue_and_forget(|count: &mut u32| {
            async move {
                *count += 1;
            }
            .boxed()
        }));
        queue.close();

        assert!(queue.is_closed());
        let error = queue
            .enqueue(|count: &mut u32| async move { *count }.boxed())
            .await
            .unwrap_err();
        assert_eq!(error.code, FirestoreErrorCode::Cancelled);
        assert!(!queue.enqueue_and_forget(|_: &mut u32| async {}.boxed()));
    }
}
