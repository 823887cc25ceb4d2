//! Client-side state of one resumable upload.

use serde::Serialize;
use std::collections::BTreeSet;

/// Fixed chunk size used by the upload API (5 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Number of chunks needed to carry `file_size` bytes, or `None` when the
/// count does not fit the protocol's `u32` chunk numbers.
pub fn total_chunks(file_size: u64, chunk_size: u64) -> Option<u32> {
    u32::try_from(file_size.div_ceil(chunk_size.max(1))).ok()
}

/// Tracks which chunks of a file the server has acknowledged.
///
/// Created when an upload starts, seeded from the resume-status endpoint,
/// and dropped once a final URL comes back or the caller gives up.
#[derive(Debug, Clone)]
pub struct UploadSession {
    /// Caller-generated identifier correlating every request of the upload.
    pub id: String,

    /// Total chunk count, `ceil(file_size / chunk_size)`.
    pub total_chunks: u32,

    uploaded: BTreeSet<u32>,
}

impl UploadSession {
    /// Start a session. Indices outside `0..total_chunks` are dropped.
    pub fn new(id: impl Into<String>, total_chunks: u32, uploaded: impl IntoIterator<Item = u32>) -> Self {
        let uploaded = uploaded
            .into_iter()
            .filter(|index| *index < total_chunks)
            .collect();
        Self {
            id: id.into(),
            total_chunks,
            uploaded,
        }
    }

    pub fn mark_uploaded(&mut self, index: u32) {
        if index < self.total_chunks {
            self.uploaded.insert(index);
        }
    }

    pub fn is_uploaded(&self, index: u32) -> bool {
        self.uploaded.contains(&index)
    }

    pub fn uploaded_count(&self) -> u32 {
        self.uploaded.len() as u32
    }

    /// Chunk indices still to send, ascending.
    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|index| !self.uploaded.contains(index))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.uploaded_count() == self.total_chunks
    }

    pub fn progress(&self) -> UploadProgress {
        UploadProgress {
            session_id: self.id.clone(),
            chunks_done: self.uploaded_count(),
            total_chunks: self.total_chunks,
        }
    }
}

/// Snapshot handed to progress callbacks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadProgress {
    pub session_id: String,
    pub chunks_done: u32,
    pub total_chunks: u32,
}

impl UploadProgress {
    /// Fraction complete in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        f64::from(self.chunks_done) / f64::from(self.total_chunks)
    }

    pub fn percent(&self) -> f64 {
        self.fraction() * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn total_chunks_rounds_up() {
        assert_eq!(total_chunks(12 * MIB, DEFAULT_CHUNK_SIZE), Some(3));
        assert_eq!(total_chunks(10 * MIB, DEFAULT_CHUNK_SIZE), Some(2));
        assert_eq!(total_chunks(1, DEFAULT_CHUNK_SIZE), Some(1));
        assert_eq!(total_chunks(0, DEFAULT_CHUNK_SIZE), Some(0));
    }

    #[test]
    fn chunk_counts_past_u32_are_refused() {
        let most = u64::from(u32::MAX);
        assert_eq!(total_chunks(most, 1), Some(u32::MAX));
        assert_eq!(total_chunks(most + 1, 1), None);
        assert_eq!(total_chunks(u64::MAX, DEFAULT_CHUNK_SIZE), None);
    }

    #[test]
    fn resumed_session_skips_acknowledged_chunks() {
        let session = UploadSession::new("s1", 3, [0]);
        assert_eq!(session.missing_chunks(), vec![1, 2]);
        assert!(!session.is_complete());
    }

    #[test]
    fn out_of_range_indices_are_ignored() {
        let mut session = UploadSession::new("s1", 2, [0, 5, 9]);
        assert_eq!(session.uploaded_count(), 1);
        session.mark_uploaded(4);
        assert_eq!(session.uploaded_count(), 1);
        session.mark_uploaded(1);
        assert!(session.is_complete());
    }

    #[test]
    fn progress_fraction() {
        let mut session = UploadSession::new("s1", 4, []);
        assert_eq!(session.progress().fraction(), 0.0);
        session.mark_uploaded(0);
        session.mark_uploaded(3);
        let progress = session.progress();
        assert_eq!(progress.chunks_done, 2);
        assert!((progress.percent() - 50.0).abs() < f64::EPSILON);
    }
}
