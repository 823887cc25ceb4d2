//! Fails uploads that hang in an intermediate status.
//!
//! An upload whose client crashed or lost power never reaches a terminal
//! status on its own. The reaper sweeps such rows into `failed` with a
//! `timeout` error kind. Sweep failures are logged and never surface.

use crate::services::{background::BackgroundTask, upload_log_store::UploadLogStore};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Clone)]
pub struct StaleUploadReaper {
    store: UploadLogStore,
    stale_after: Duration,
}

impl StaleUploadReaper {
    pub fn new(store: UploadLogStore) -> Self {
        Self {
            store,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Sweep once, relative to the current time. Returns the rows failed
    /// (0 when the sweep itself failed).
    pub async fn mark_stale_uploads_as_failed(&self) -> u64 {
        self.sweep_at(Utc::now()).await
    }

    pub(crate) async fn sweep_at(&self, now: DateTime<Utc>) -> u64 {
        let stale_after = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let cutoff = now - stale_after;
        let message = format!(
            "Upload timed out: no completion after {} minutes",
            self.stale_after.as_secs() / 60
        );
        match self.store.fail_stale(cutoff, &message).await {
            Ok(0) => 0,
            Ok(count) => {
                info!(count, %cutoff, "marked stale uploads as failed");
                count
            }
            Err(err) => {
                warn!(error = %err, "stale upload sweep failed");
                0
            }
        }
    }

    /// Sweep now and then every `interval` until the returned handle is
    /// cancelled or dropped.
    pub fn start(&self, interval: Duration) -> CleanupHandle {
        let reaper = self.clone();
        info!(interval_secs = interval.as_secs(), "stale upload cleanup started");
        BackgroundTask::spawn_periodic(interval, move || {
            let reaper = reaper.clone();
            async move {
                reaper.mark_stale_uploads_as_failed().await;
            }
        })
    }
}

/// Stops the periodic sweep on `cancel()` or drop.
pub type CleanupHandle = BackgroundTask;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::upload_log::{UploadErrorKind, UploadStatus},
        services::upload_log_store::testing::{backdate, new_log, store},
    };

    #[tokio::test]
    async fn only_old_intermediate_rows_are_failed() {
        let store = store().await;
        let now = Utc::now();
        let rows = [
            ("old-uploading", UploadStatus::Uploading, 31),
            ("old-compressing", UploadStatus::Compressing, 45),
            ("fresh-uploading", UploadStatus::Uploading, 5),
            ("old-pending", UploadStatus::Pending, 60),
            ("old-completed", UploadStatus::Completed, 90),
            ("old-failed", UploadStatus::Failed, 90),
        ];
        for (id, status, minutes_ago) in rows {
            store.create(&new_log(id)).await.unwrap();
            backdate(&store, id, status, now - chrono::Duration::minutes(minutes_ago)).await;
        }

        let reaper = StaleUploadReaper::new(store.clone());
        assert_eq!(reaper.sweep_at(now).await, 2);

        for (id, before, _) in rows {
            let entry = store.get(id).await.unwrap();
            if id.starts_with("old-uploading") || id.starts_with("old-compressing") {
                assert_eq!(entry.status, UploadStatus::Failed, "{id}");
                assert_eq!(entry.error_kind, Some(UploadErrorKind::Timeout));
                assert!(entry.error_message.unwrap().contains("30 minutes"));
            } else {
                assert_eq!(entry.status, before, "{id}");
                assert!(entry.error_kind.is_none(), "{id}");
            }
        }

        // A second sweep finds nothing left to do.
        assert_eq!(reaper.sweep_at(now).await, 0);
    }

    #[tokio::test]
    async fn completed_timestamp_protects_a_row() {
        let store = store().await;
        store.create(&new_log("s1")).await.unwrap();
        store.mark_completed("s1", "https://cdn/s1.mp4").await.unwrap();
        // Status flipped back by a late progress writer, but completion stands.
        backdate(
            &store,
            "s1",
            UploadStatus::Uploading,
            Utc::now() - chrono::Duration::hours(2),
        )
        .await;

        let reaper = StaleUploadReaper::new(store.clone());
        assert_eq!(reaper.mark_stale_uploads_as_failed().await, 0);
    }

    #[tokio::test]
    async fn sweep_errors_are_swallowed() {
        let store = store().await;
        store.db.close().await;
        let reaper = StaleUploadReaper::new(store);
        assert_eq!(reaper.mark_stale_uploads_as_failed().await, 0);
    }

    #[tokio::test]
    async fn periodic_cleanup_runs_immediately() {
        let store = store().await;
        store.create(&new_log("hung")).await.unwrap();
        backdate(
            &store,
            "hung",
            UploadStatus::Uploading,
            Utc::now() - chrono::Duration::minutes(40),
        )
        .await;

        let handle = StaleUploadReaper::new(store.clone()).start(Duration::from_secs(3600));
        let mut failed = false;
        for _ in 0..50 {
            if store.get("hung").await.unwrap().status == UploadStatus::Failed {
                failed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;
        assert!(failed, "first sweep should run without waiting an interval");
    }
}
