use std::future::Future;
use std::time::Duration;

/// Spawns `future` onto the ambient tokio runtime, or onto a lazily created
/// single-threaded background runtime when the caller is not inside one.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    use std::sync::LazyLock;
    use tokio::runtime::{Builder, Handle, Runtime};

    static BACKGROUND_RUNTIME: LazyLock<Runtime> = LazyLock::new(|| {
        Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("firestore-sync-worker")
            .enable_all()
            .build()
            .expect("failed to build background tokio runtime")
    });

    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => {
            BACKGROUND_RUNTIME.spawn(future);
        }
    }
}

/// Waits for `duration`; returns immediately for a zero duration.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tokio::time::sleep(duration).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::oneshot;

    #[tokio::test]
    async fn spawned_task_runs_on_current_runtime() {
        let (sender, receiver) = oneshot::channel();
        spawn_detached(async move {
            let _ = sender.send(42);
        });
        assert_eq!(receiver.await.unwrap(), 42);
    }

    #[test]
    fn spawned_task_runs_without_ambient_runtime() {
        let (sender, receiver) = oneshot::channel();
        spawn_detached(async move {
            sleep(Duration::from_millis(1)).await;
            let _ = sender.send("done");
        });
        assert_eq!(futures::executor::block_on(receiver).unwrap(), "done");
    }
}
