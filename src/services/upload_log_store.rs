//! UploadLogStore — row-level CRUD over the `upload_logs` table.
//!
//! The pipeline writes a row when an upload starts and moves it through its
//! lifecycle; the tracker reads active rows; the reaper fails hung ones.
//! Writers never coordinate: last write wins.

use crate::{
    errors::{StoreError, StoreResult},
    models::upload_log::{NewUploadLog, UploadErrorKind, UploadLogEntry, UploadStatus},
};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::debug;

const COLUMNS: &str = "session_id, file_name, file_type, file_size, content_hash, status, \
                       progress, error_kind, error_message, url, boulder_id, started_at, \
                       completed_at, updated_at";

#[derive(Clone)]
pub struct UploadLogStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl UploadLogStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Insert a `pending` row for a starting upload.
    ///
    /// Re-using a session id (a resume) re-arms the existing row: status back
    /// to `pending`, errors and completion cleared, progress kept.
    pub async fn create(&self, new: &NewUploadLog) -> StoreResult<UploadLogEntry> {
        let now = Utc::now();
        let sql = format!(
            "INSERT INTO upload_logs (
                session_id, file_name, file_type, file_size, content_hash, status,
                progress, boulder_id, started_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET
                file_name = excluded.file_name,
                file_type = excluded.file_type,
                file_size = excluded.file_size,
                content_hash = excluded.content_hash,
                status = excluded.status,
                boulder_id = excluded.boulder_id,
                error_kind = NULL,
                error_message = NULL,
                completed_at = NULL,
                started_at = excluded.started_at,
                updated_at = excluded.updated_at
             RETURNING {COLUMNS}"
        );
        let entry = sqlx::query_as::<_, UploadLogEntry>(&sql)
            .bind(&new.session_id)
            .bind(&new.file_name)
            .bind(&new.file_type)
            .bind(new.file_size)
            .bind(&new.content_hash)
            .bind(UploadStatus::Pending)
            .bind(&new.boulder_id)
            .bind(now)
            .bind(now)
            .fetch_one(&*self.db)
            .await?;
        debug!(session_id = %new.session_id, "upload log created");
        Ok(entry)
    }

    pub async fn get(&self, session_id: &str) -> StoreResult<UploadLogEntry> {
        let sql = format!("SELECT {COLUMNS} FROM upload_logs WHERE session_id = ?");
        sqlx::query_as::<_, UploadLogEntry>(&sql)
            .bind(session_id)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => StoreError::UploadNotFound(session_id.to_string()),
                other => StoreError::Sqlx(other),
            })
    }

    /// Move an active row to another active status (e.g. `uploading`).
    pub async fn set_status(&self, session_id: &str, status: UploadStatus) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_logs SET status = ?, updated_at = ?
             WHERE session_id = ? AND status IN (?, ?, ?)",
        )
        .bind(status)
        .bind(Utc::now())
        .bind(session_id)
        .bind(UploadStatus::ACTIVE[0])
        .bind(UploadStatus::ACTIVE[1])
        .bind(UploadStatus::ACTIVE[2])
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_uploading(&self, session_id: &str) -> StoreResult<bool> {
        self.set_status(session_id, UploadStatus::Uploading).await
    }

    /// Record progress (percent). Rows already terminal are left alone.
    pub async fn update_progress(&self, session_id: &str, percent: f64) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_logs SET progress = ?, updated_at = ?
             WHERE session_id = ? AND status IN (?, ?, ?)",
        )
        .bind(percent.clamp(0.0, 100.0))
        .bind(Utc::now())
        .bind(session_id)
        .bind(UploadStatus::ACTIVE[0])
        .bind(UploadStatus::ACTIVE[1])
        .bind(UploadStatus::ACTIVE[2])
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Complete an active row. Returns `false` when the row already went
    /// terminal, e.g. it was cancelled from the tracker mid-upload.
    pub async fn mark_completed(&self, session_id: &str, url: &str) -> StoreResult<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE upload_logs
             SET status = ?, progress = 100, url = ?, error_kind = NULL, error_message = NULL,
                 completed_at = ?, updated_at = ?
             WHERE session_id = ? AND status IN (?, ?, ?)",
        )
        .bind(UploadStatus::Completed)
        .bind(url)
        .bind(now)
        .bind(now)
        .bind(session_id)
        .bind(UploadStatus::ACTIVE[0])
        .bind(UploadStatus::ACTIVE[1])
        .bind(UploadStatus::ACTIVE[2])
        .execute(&*self.db)
        .await?;
        if result.rows_affected() == 0 {
            // Missing rows are an error, terminal ones are not.
            self.get(session_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Fail an active row. Returns `false` when the row was already terminal
    /// or does not exist.
    pub async fn mark_failed(
        &self,
        session_id: &str,
        kind: UploadErrorKind,
        message: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_logs
             SET status = ?, error_kind = ?, error_message = ?, updated_at = ?
             WHERE session_id = ? AND status IN (?, ?, ?)",
        )
        .bind(UploadStatus::Failed)
        .bind(kind)
        .bind(message)
        .bind(Utc::now())
        .bind(session_id)
        .bind(UploadStatus::ACTIVE[0])
        .bind(UploadStatus::ACTIVE[1])
        .bind(UploadStatus::ACTIVE[2])
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Insert a terminal `duplicate` row pointing at an earlier upload's URL.
    ///
    /// An existing row for the session is overwritten unless it is
    /// `completed`; a completed row is returned untouched.
    pub async fn record_duplicate(
        &self,
        new: &NewUploadLog,
        url: &str,
    ) -> StoreResult<UploadLogEntry> {
        let now = Utc::now();
        let sql = format!(
            "INSERT INTO upload_logs (
                session_id, file_name, file_type, file_size, content_hash, status,
                progress, url, boulder_id, started_at, completed_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, 100, ?, ?, ?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET
                file_name = excluded.file_name,
                file_type = excluded.file_type,
                file_size = excluded.file_size,
                content_hash = excluded.content_hash,
                status = excluded.status,
                progress = excluded.progress,
                url = excluded.url,
                boulder_id = excluded.boulder_id,
                error_kind = NULL,
                error_message = NULL,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                updated_at = excluded.updated_at
             WHERE upload_logs.status <> ?
             RETURNING {COLUMNS}"
        );
        let entry = sqlx::query_as::<_, UploadLogEntry>(&sql)
            .bind(&new.session_id)
            .bind(&new.file_name)
            .bind(&new.file_type)
            .bind(new.file_size)
            .bind(&new.content_hash)
            .bind(UploadStatus::Duplicate)
            .bind(url)
            .bind(&new.boulder_id)
            .bind(now)
            .bind(now)
            .bind(now)
            .bind(UploadStatus::Completed)
            .fetch_optional(&*self.db)
            .await?;
        match entry {
            Some(entry) => Ok(entry),
            None => {
                debug!(session_id = %new.session_id, "session already completed, keeping its row");
                self.get(&new.session_id).await
            }
        }
    }

    /// Most recent completed upload with the same content hash.
    pub async fn find_completed_by_hash(
        &self,
        content_hash: &str,
    ) -> StoreResult<Option<UploadLogEntry>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM upload_logs
             WHERE content_hash = ? AND status = ? AND url IS NOT NULL
             ORDER BY completed_at DESC LIMIT 1"
        );
        let entry = sqlx::query_as::<_, UploadLogEntry>(&sql)
            .bind(content_hash)
            .bind(UploadStatus::Completed)
            .fetch_optional(&*self.db)
            .await?;
        Ok(entry)
    }

    /// Rows in pending/compressing/uploading, newest first.
    pub async fn active(&self) -> StoreResult<Vec<UploadLogEntry>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM upload_logs
             WHERE status IN (?, ?, ?)
             ORDER BY started_at DESC"
        );
        let rows = sqlx::query_as::<_, UploadLogEntry>(&sql)
            .bind(UploadStatus::ACTIVE[0])
            .bind(UploadStatus::ACTIVE[1])
            .bind(UploadStatus::ACTIVE[2])
            .fetch_all(&*self.db)
            .await?;
        Ok(rows)
    }

    /// Fail compressing/uploading rows started before `cutoff` that never
    /// completed. Returns the number of rows changed.
    pub async fn fail_stale(&self, cutoff: DateTime<Utc>, message: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE upload_logs
             SET status = ?, error_kind = ?, error_message = ?, updated_at = ?
             WHERE status IN (?, ?) AND started_at < ? AND completed_at IS NULL",
        )
        .bind(UploadStatus::Failed)
        .bind(UploadErrorKind::Timeout)
        .bind(message)
        .bind(Utc::now())
        .bind(UploadStatus::REAPABLE[0])
        .bind(UploadStatus::REAPABLE[1])
        .bind(cutoff)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn lifecycle_pending_to_completed() {
        let store = store().await;
        let entry = store.create(&new_log("s1")).await.unwrap();
        assert_eq!(entry.status, UploadStatus::Pending);
        assert_eq!(entry.progress, 0.0);

        assert!(store.set_status("s1", UploadStatus::Uploading).await.unwrap());
        assert!(store.update_progress("s1", 40.0).await.unwrap());
        assert!(store.mark_completed("s1", "https://cdn/s1.mp4").await.unwrap());

        let entry = store.get("s1").await.unwrap();
        assert_eq!(entry.status, UploadStatus::Completed);
        assert_eq!(entry.progress, 100.0);
        assert_eq!(entry.url.as_deref(), Some("https://cdn/s1.mp4"));
        assert!(entry.completed_at.is_some());
    }

    #[tokio::test]
    async fn terminal_rows_ignore_progress_and_failure() {
        let store = store().await;
        store.create(&new_log("s1")).await.unwrap();
        store.mark_completed("s1", "https://cdn/s1.mp4").await.unwrap();

        assert!(!store.update_progress("s1", 10.0).await.unwrap());
        assert!(
            !store
                .mark_failed("s1", UploadErrorKind::Aborted, "Upload cancelled by user")
                .await
                .unwrap()
        );
        assert_eq!(store.get("s1").await.unwrap().status, UploadStatus::Completed);
    }

    #[tokio::test]
    async fn cancelled_rows_are_not_completed() {
        let store = store().await;
        store.create(&new_log("s1")).await.unwrap();
        store
            .mark_failed("s1", UploadErrorKind::Aborted, "Upload cancelled by user")
            .await
            .unwrap();

        assert!(!store.mark_completed("s1", "https://cdn/s1.mp4").await.unwrap());
        let entry = store.get("s1").await.unwrap();
        assert_eq!(entry.status, UploadStatus::Failed);
        assert_eq!(entry.error_kind, Some(UploadErrorKind::Aborted));
        assert!(entry.url.is_none());
    }

    #[tokio::test]
    async fn recreating_a_session_rearms_it() {
        let store = store().await;
        store.create(&new_log("s1")).await.unwrap();
        store
            .mark_failed("s1", UploadErrorKind::Upload, "chunk 2 failed")
            .await
            .unwrap();

        let entry = store.create(&new_log("s1")).await.unwrap();
        assert_eq!(entry.status, UploadStatus::Pending);
        assert!(entry.error_message.is_none());
        assert!(entry.error_kind.is_none());
    }

    #[tokio::test]
    async fn missing_rows_are_reported() {
        let store = store().await;
        assert!(matches!(
            store.get("nope").await,
            Err(StoreError::UploadNotFound(_))
        ));
        assert!(matches!(
            store.mark_completed("nope", "u").await,
            Err(StoreError::UploadNotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_lookup_by_hash() {
        let store = store().await;
        let mut log = new_log("s1");
        log.content_hash = Some("abc".into());
        store.create(&log).await.unwrap();
        assert!(store.find_completed_by_hash("abc").await.unwrap().is_none());

        store.mark_completed("s1", "https://cdn/s1.mp4").await.unwrap();
        let found = store.find_completed_by_hash("abc").await.unwrap().unwrap();
        assert_eq!(found.session_id, "s1");

        let mut again = new_log("s2");
        again.content_hash = Some("abc".into());
        let dup = store
            .record_duplicate(&again, found.url.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(dup.status, UploadStatus::Duplicate);
        assert_eq!(dup.url.as_deref(), Some("https://cdn/s1.mp4"));
    }

    #[tokio::test]
    async fn duplicate_never_replaces_a_completed_row() {
        let store = store().await;
        let mut log = new_log("s1");
        log.content_hash = Some("abc".into());
        store.create(&log).await.unwrap();
        store.mark_completed("s1", "https://cdn/s1.mp4").await.unwrap();

        let kept = store.record_duplicate(&log, "https://cdn/s1.mp4").await.unwrap();
        assert_eq!(kept.status, UploadStatus::Completed);
        assert!(store.find_completed_by_hash("abc").await.unwrap().is_some());

        store.create(&new_log("s2")).await.unwrap();
        store
            .mark_failed("s2", UploadErrorKind::Upload, "chunk 0 failed")
            .await
            .unwrap();
        let replaced = store.record_duplicate(&new_log("s2"), "https://cdn/s1.mp4").await.unwrap();
        assert_eq!(replaced.status, UploadStatus::Duplicate);
        assert!(replaced.error_message.is_none());
    }

    #[tokio::test]
    async fn active_lists_newest_first() {
        let store = store().await;
        for id in ["old", "new", "done"] {
            store.create(&new_log(id)).await.unwrap();
        }
        let now = Utc::now();
        backdate(&store, "old", UploadStatus::Uploading, now - Duration::minutes(5)).await;
        backdate(&store, "new", UploadStatus::Pending, now).await;
        store.mark_completed("done", "u").await.unwrap();

        let ids: Vec<String> = store
            .active()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.session_id)
            .collect();
        assert_eq!(ids, vec!["new", "old"]);
    }
}
