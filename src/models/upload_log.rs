//! Represents a row of the `upload_logs` table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Lifecycle of an upload as seen by the UI.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Compressing,
    Uploading,
    Completed,
    Failed,
    Duplicate,
}

impl UploadStatus {
    /// Statuses the tracker polls for.
    pub const ACTIVE: [UploadStatus; 3] = [
        UploadStatus::Pending,
        UploadStatus::Compressing,
        UploadStatus::Uploading,
    ];

    /// Statuses the reaper is allowed to fail.
    pub const REAPABLE: [UploadStatus; 2] = [UploadStatus::Compressing, UploadStatus::Uploading];

    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Compressing => "compressing",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
            UploadStatus::Duplicate => "duplicate",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Failed | UploadStatus::Duplicate
        )
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a row ended up `failed`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum UploadErrorKind {
    /// Swept by the stale-upload reaper.
    Timeout,
    /// Cancelled by the user.
    Aborted,
    /// The upload itself failed (retries exhausted, I/O, ...).
    Upload,
}

/// One upload as mirrored into the log table.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadLogEntry {
    /// Session id shared with the upload API.
    pub session_id: String,

    pub file_name: String,

    /// MIME type of the uploaded file.
    pub file_type: String,

    pub file_size: i64,

    /// md5 hex digest of the whole file, used to spot re-uploads.
    pub content_hash: Option<String>,

    pub status: UploadStatus,

    /// Percent complete, `0.0..=100.0`.
    pub progress: f64,

    pub error_kind: Option<UploadErrorKind>,

    pub error_message: Option<String>,

    /// Final asset URL once completed (or the original's URL for duplicates).
    pub url: Option<String>,

    /// Boulder the video belongs to, if any.
    pub boulder_id: Option<String>,

    pub started_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,

    pub updated_at: DateTime<Utc>,
}

/// Fields supplied by the caller when an upload begins.
#[derive(Clone, Debug)]
pub struct NewUploadLog {
    pub session_id: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: i64,
    pub content_hash: Option<String>,
    pub boulder_id: Option<String>,
}
