//! Error types shared across the upload client.
//!
//! Each layer owns one enum: the wire (`TransportError`), the persisted
//! tables (`StoreError`), the CDN maintenance client (`CdnError`) and the
//! upload itself (`UploadError`), which wraps the others.

use std::io;
use thiserror::Error;

/// Failure of a single request against the upload API.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("server answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response body: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Failure reading or writing the upload log and boulder tables.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("upload `{0}` not found")]
    UploadNotFound(String),
    #[error("boulder `{0}` not found")]
    BoulderNotFound(String),
    #[error("stored video qualities are not valid JSON: {0}")]
    Qualities(#[from] serde_json::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Failure of a resumable upload.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload aborted")]
    Aborted,
    #[error("file `{0}` is empty")]
    EmptyFile(String),
    #[error("{size} bytes need more than u32::MAX chunks of {chunk_size} bytes")]
    TooManyChunks { size: u64, chunk_size: u64 },
    #[error("chunk {index} failed after {attempts} attempts: {source}")]
    ChunkFailed {
        index: u32,
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("finalize failed after {attempts} attempts: {source}")]
    FinalizeFailed {
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("server merged the upload but returned no url")]
    MissingUrl,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl UploadError {
    /// True when the upload stopped because its cancellation token fired.
    pub fn is_abort(&self) -> bool {
        matches!(self, UploadError::Aborted)
    }
}

pub type UploadResult<T> = Result<T, UploadError>;

/// Failure of a CDN maintenance call.
#[derive(Debug, Error)]
pub enum CdnError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("CDN answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_failure_names_the_chunk() {
        let err = UploadError::ChunkFailed {
            index: 7,
            attempts: 5,
            source: TransportError::Status {
                status: 502,
                body: "bad gateway".into(),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("chunk 7"));
        assert!(msg.contains("5 attempts"));
        assert!(!err.is_abort());
    }

    #[test]
    fn aborted_is_abort() {
        assert!(UploadError::Aborted.is_abort());
    }
}
