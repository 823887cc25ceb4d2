//! Resumable chunked upload.
//!
//! A file is cut into fixed-size chunks and posted one at a time:
//! 1. the resume-status endpoint says which chunks the server already holds;
//! 2. the missing ones are sent in ascending order, each under the retry
//!    policy, parking while offline;
//! 3. the first response carrying a `url` ends the upload;
//! 4. if every chunk is present and no `url` came back, a finalize request
//!    asks the server to merge.
//!
//! A wake lock is held for the whole call. Cancellation is cooperative
//! through a `CancellationToken`; chunks already sent stay on the server for
//! a later resume.

use crate::{
    errors::{UploadError, UploadResult},
    models::session::{DEFAULT_CHUNK_SIZE, UploadProgress, UploadSession, total_chunks},
    services::{
        connectivity::{AlwaysOnline, Connectivity},
        retry::{RetryError, RetryPolicy, run_with_retry},
        transport::{ChunkRequest, ChunkTransport, UploadTarget},
        wake_lock::{NoopWakeLock, WakeLock, WakeLockGuard},
    },
};
use bytes::Bytes;
use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Receives progress after every acknowledged chunk.
pub type ProgressCallback = Arc<dyn Fn(&UploadProgress) + Send + Sync>;

#[derive(Clone, Debug)]
enum FileSource {
    Path(PathBuf),
    Memory(Bytes),
}

/// A file to upload: where its bytes live plus the metadata the API wants.
#[derive(Clone, Debug)]
pub struct UploadFile {
    source: FileSource,
    pub name: String,
    pub size: u64,
    pub content_type: String,
}

impl UploadFile {
    /// Describe a file on disk. The content type is guessed from the
    /// extension.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".into());
        let content_type = guess_content_type(&name).to_string();
        Ok(Self {
            source: FileSource::Path(path.to_path_buf()),
            name,
            size: metadata.len(),
            content_type,
        })
    }

    pub fn from_bytes(
        name: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        let data = data.into();
        Self {
            size: data.len() as u64,
            source: FileSource::Memory(data),
            name: name.into(),
            content_type: content_type.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn total_chunks(&self, chunk_size: u64) -> Option<u32> {
        total_chunks(self.size, chunk_size)
    }

    /// Bytes of chunk `index`; the last chunk may be short.
    pub async fn read_chunk(&self, index: u32, chunk_size: u64) -> io::Result<Bytes> {
        let offset = u64::from(index) * chunk_size;
        if offset >= self.size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("chunk {} starts past the end of {}", index, self.name),
            ));
        }
        let len = chunk_size.min(self.size - offset);
        match &self.source {
            FileSource::Memory(data) => {
                Ok(data.slice(offset as usize..(offset + len) as usize))
            }
            FileSource::Path(path) => {
                let mut file = File::open(path).await?;
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; len as usize];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }

    /// md5 of the whole file as lowercase hex.
    pub async fn md5_hex(&self) -> io::Result<String> {
        let mut digest = md5::Context::new();
        match &self.source {
            FileSource::Memory(data) => digest.consume(data),
            FileSource::Path(path) => {
                let mut file = File::open(path).await?;
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    digest.consume(&buf[..n]);
                }
            }
        }
        Ok(format!("{:x}", digest.compute()))
    }
}

fn guess_content_type(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" => "video/mp4",
        "m4v" => "video/x-m4v",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "3gp" => "video/3gpp",
        _ => "application/octet-stream",
    }
}

/// Per-call settings of [`ResumableUploader::upload`].
#[derive(Clone, Default)]
pub struct UploadOptions {
    /// Caller-generated id; reuse it to resume an interrupted upload.
    pub session_id: String,
    pub sector_id: Option<String>,
    pub on_progress: Option<ProgressCallback>,
    pub cancel: CancellationToken,
}

impl UploadOptions {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    pub fn with_sector(mut self, sector_id: impl Into<String>) -> Self {
        self.sector_id = Some(sector_id.into());
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn report(&self, session: &UploadSession) {
        if let Some(callback) = &self.on_progress {
            callback(&session.progress());
        }
    }
}

/// Uploads files in resumable chunks over a [`ChunkTransport`].
pub struct ResumableUploader<T, C = AlwaysOnline> {
    transport: T,
    connectivity: C,
    wake_lock: Arc<dyn WakeLock>,
    chunk_size: u64,
    retry: RetryPolicy,
}

impl<T: ChunkTransport> ResumableUploader<T, AlwaysOnline> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            connectivity: AlwaysOnline,
            wake_lock: Arc::new(NoopWakeLock),
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

impl<T: ChunkTransport, C: Connectivity> ResumableUploader<T, C> {
    pub fn with_connectivity<C2: Connectivity>(self, connectivity: C2) -> ResumableUploader<T, C2> {
        ResumableUploader {
            transport: self.transport,
            connectivity,
            wake_lock: self.wake_lock,
            chunk_size: self.chunk_size,
            retry: self.retry,
        }
    }

    pub fn with_wake_lock(mut self, wake_lock: Arc<dyn WakeLock>) -> Self {
        self.wake_lock = wake_lock;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Upload `file` and return the final asset URL.
    pub async fn upload(&self, file: &UploadFile, options: UploadOptions) -> UploadResult<String> {
        if options.cancel.is_cancelled() {
            return Err(UploadError::Aborted);
        }
        if file.size == 0 {
            return Err(UploadError::EmptyFile(file.name.clone()));
        }
        let Some(total_chunks) = file.total_chunks(self.chunk_size) else {
            return Err(UploadError::TooManyChunks {
                size: file.size,
                chunk_size: self.chunk_size,
            });
        };

        let _wake = WakeLockGuard::hold(self.wake_lock.as_ref());
        self.run(file, total_chunks, &options).await
    }

    async fn run(
        &self,
        file: &UploadFile,
        total_chunks: u32,
        options: &UploadOptions,
    ) -> UploadResult<String> {
        let target = UploadTarget {
            session_id: options.session_id.clone(),
            file_name: file.name.clone(),
            file_size: file.size,
            file_type: file.content_type.clone(),
            total_chunks,
            sector_id: options.sector_id.clone(),
        };

        let acknowledged = self.negotiate_resume(&target, &options.cancel).await?;
        let mut session =
            UploadSession::new(target.session_id.clone(), target.total_chunks, acknowledged);
        if session.uploaded_count() > 0 {
            info!(
                session_id = %session.id,
                uploaded = session.uploaded_count(),
                total = session.total_chunks,
                "resuming upload"
            );
            options.report(&session);
        }

        let transport = &self.transport;
        let target_ref = &target;
        for index in session.missing_chunks() {
            if options.cancel.is_cancelled() {
                info!(session_id = %session.id, chunk = index, "upload aborted");
                return Err(UploadError::Aborted);
            }

            let data = file.read_chunk(index, self.chunk_size).await?;
            let label = format!("chunk {}/{}", index + 1, target.total_chunks);
            let response = run_with_retry(
                &self.retry,
                &options.cancel,
                &self.connectivity,
                &label,
                move |_| {
                    transport.send_chunk(ChunkRequest {
                        target: target_ref,
                        index,
                        data: data.clone(),
                    })
                },
            )
            .await
            .map_err(|err| match err {
                RetryError::Cancelled => UploadError::Aborted,
                RetryError::Exhausted { attempts, last } => UploadError::ChunkFailed {
                    index,
                    attempts,
                    source: last,
                },
            })?;

            session.mark_uploaded(index);
            options.report(&session);

            if let Some(url) = response.url {
                info!(session_id = %session.id, %url, "upload complete");
                return Ok(url);
            }
        }

        if options.cancel.is_cancelled() {
            return Err(UploadError::Aborted);
        }

        info!(
            session_id = %session.id,
            total = session.total_chunks,
            "all chunks on server without a url, requesting finalize"
        );
        let response = run_with_retry(
            &self.retry,
            &options.cancel,
            &self.connectivity,
            "finalize",
            move |_| transport.finalize(target_ref),
        )
        .await
        .map_err(|err| match err {
            RetryError::Cancelled => UploadError::Aborted,
            RetryError::Exhausted { attempts, last } => UploadError::FinalizeFailed {
                attempts,
                source: last,
            },
        })?;

        let url = response.url.ok_or(UploadError::MissingUrl)?;
        info!(session_id = %session.id, %url, "upload finalized");
        Ok(url)
    }

    /// Chunks the server already holds. Any failure means "none".
    async fn negotiate_resume(
        &self,
        target: &UploadTarget,
        cancel: &CancellationToken,
    ) -> UploadResult<Vec<u32>> {
        if cancel.is_cancelled() {
            return Err(UploadError::Aborted);
        }
        match self.transport.fetch_status(&target.session_id).await {
            Ok(status) => Ok(status.uploaded_chunks),
            Err(err) => {
                warn!(
                    session_id = %target.session_id,
                    error = %err,
                    "could not fetch upload status, starting from scratch"
                );
                Ok(Vec::new())
            }
        }
    }
}
