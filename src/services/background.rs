//! Periodic background tasks with a cancel handle.

use std::{future::Future, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A running periodic task. Cancelled on `cancel()`, `shutdown()` or drop.
pub struct BackgroundTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl BackgroundTask {
    /// Run `tick` now and then every `interval`.
    ///
    /// A tick that overruns the interval delays the next one instead of
    /// stacking up.
    pub fn spawn_periodic<F, Fut>(interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            // The first tick of a tokio interval fires immediately.
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tick() => {}
                        }
                    }
                }
            }
        });
        Self { cancel, task }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel and wait for the task to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.task).await;
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    #[tokio::test]
    async fn ticks_until_cancelled() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        let task = BackgroundTask::spawn_periodic(Duration::from_millis(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(40)).await;
        task.shutdown().await;

        let after_shutdown = count.load(Ordering::SeqCst);
        assert!(after_shutdown >= 2, "ticked {after_shutdown} times");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_shutdown);
    }

    #[tokio::test]
    async fn dropping_the_handle_stops_the_task() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        let task = BackgroundTask::spawn_periodic(Duration::from_millis(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(task);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let stopped_at = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), stopped_at);
    }
}
