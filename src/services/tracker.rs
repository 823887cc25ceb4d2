//! Read side of the upload log: what is uploading right now.
//!
//! The tracker polls active rows (every second by default) and publishes a
//! [`TrackerSnapshot`] keyed by session id through a `watch` channel, so a
//! UI can render without touching the database itself.

use crate::{
    errors::StoreResult,
    models::upload_log::{UploadErrorKind, UploadLogEntry},
    services::{background::BackgroundTask, upload_log_store::UploadLogStore},
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Message stored on rows cancelled through the tracker.
pub const USER_ABORT_MESSAGE: &str = "Upload cancelled by user";

/// Active uploads at the time of the last poll.
#[derive(Debug, Clone, Default)]
pub struct TrackerSnapshot {
    uploads: HashMap<String, UploadLogEntry>,
}

impl TrackerSnapshot {
    pub fn from_entries(entries: impl IntoIterator<Item = UploadLogEntry>) -> Self {
        Self {
            uploads: entries
                .into_iter()
                .map(|entry| (entry.session_id.clone(), entry))
                .collect(),
        }
    }

    pub fn get(&self, session_id: &str) -> Option<&UploadLogEntry> {
        self.uploads.get(session_id)
    }

    pub fn uploads(&self) -> &HashMap<String, UploadLogEntry> {
        &self.uploads
    }

    /// All tracked uploads, newest first.
    pub fn active_uploads(&self) -> Vec<&UploadLogEntry> {
        let mut list: Vec<_> = self.uploads.values().collect();
        list.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        list
    }

    pub fn uploads_for_boulder(&self, boulder_id: &str) -> Vec<&UploadLogEntry> {
        self.active_uploads()
            .into_iter()
            .filter(|entry| entry.boulder_id.as_deref() == Some(boulder_id))
            .collect()
    }

    pub fn has_active_uploads(&self) -> bool {
        !self.uploads.is_empty()
    }
}

#[derive(Clone)]
pub struct UploadTracker {
    store: UploadLogStore,
    tx: Arc<watch::Sender<TrackerSnapshot>>,
    poll_interval: Duration,
}

impl UploadTracker {
    pub fn new(store: UploadLogStore) -> Self {
        let (tx, _rx) = watch::channel(TrackerSnapshot::default());
        Self {
            store,
            tx: Arc::new(tx),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Receiver that sees every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<TrackerSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        self.tx.borrow().clone()
    }

    /// Poll once and publish the result.
    pub async fn refresh(&self) -> StoreResult<()> {
        let entries = self.store.active().await?;
        debug!(active = entries.len(), "upload tracker refreshed");
        self.tx.send_replace(TrackerSnapshot::from_entries(entries));
        Ok(())
    }

    /// Poll every `poll_interval` until the handle is cancelled or dropped.
    /// A failed poll keeps the previous snapshot.
    pub fn start(&self) -> BackgroundTask {
        let tracker = self.clone();
        BackgroundTask::spawn_periodic(self.poll_interval, move || {
            let tracker = tracker.clone();
            async move {
                if let Err(err) = tracker.refresh().await {
                    warn!(error = %err, "upload tracker poll failed");
                }
            }
        })
    }

    /// Mark an active upload as failed by user request. Returns `false`
    /// when the row was already terminal or unknown.
    pub async fn cancel(&self, session_id: &str) -> StoreResult<bool> {
        let cancelled = self
            .store
            .mark_failed(session_id, UploadErrorKind::Aborted, USER_ABORT_MESSAGE)
            .await?;
        if cancelled {
            info!(%session_id, "upload cancelled by user");
        }
        self.refresh().await?;
        Ok(cancelled)
    }
}
