//! Upload with bookkeeping: duplicate detection, the upload log row, and the
//! boulder's quality tier.

use crate::{
    errors::{UploadError, UploadResult},
    models::{
        boulder::QualityTier,
        session::UploadProgress,
        upload_log::{NewUploadLog, UploadErrorKind},
    },
    services::{
        connectivity::{AlwaysOnline, Connectivity},
        quality_store::QualityStore,
        transport::ChunkTransport,
        upload_log_store::UploadLogStore,
        upload_service::{ProgressCallback, ResumableUploader, UploadFile, UploadOptions},
    },
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What to upload for, and how to report it.
#[derive(Clone)]
pub struct PipelineRequest {
    pub session_id: String,
    pub sector_id: Option<String>,
    /// Boulder that receives the URL once the upload completes.
    pub boulder_id: Option<String>,
    pub tier: QualityTier,
    pub on_progress: Option<ProgressCallback>,
    pub cancel: CancellationToken,
}

impl PipelineRequest {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            sector_id: None,
            boulder_id: None,
            tier: QualityTier::Hd,
            on_progress: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sector(mut self, sector_id: impl Into<String>) -> Self {
        self.sector_id = Some(sector_id.into());
        self
    }

    pub fn for_boulder(mut self, boulder_id: impl Into<String>, tier: QualityTier) -> Self {
        self.boulder_id = Some(boulder_id.into());
        self.tier = tier;
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
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// The file went up in this call.
    Completed { url: String },
    /// Same content was uploaded before; its URL was reused.
    Duplicate { url: String },
}

impl PipelineOutcome {
    pub fn url(&self) -> &str {
        match self {
            PipelineOutcome::Completed { url } | PipelineOutcome::Duplicate { url } => url,
        }
    }
}

pub struct UploadPipeline<T, C = AlwaysOnline> {
    uploader: ResumableUploader<T, C>,
    logs: UploadLogStore,
    qualities: QualityStore,
}

impl<T: ChunkTransport, C: Connectivity> UploadPipeline<T, C> {
    pub fn new(uploader: ResumableUploader<T, C>, logs: UploadLogStore, qualities: QualityStore) -> Self {
        Self {
            uploader,
            logs,
            qualities,
        }
    }

    pub fn uploader(&self) -> &ResumableUploader<T, C> {
        &self.uploader
    }

    pub async fn run(&self, file: &UploadFile, request: PipelineRequest) -> UploadResult<PipelineOutcome> {
        if request.cancel.is_cancelled() {
            return Err(UploadError::Aborted);
        }
        if file.size == 0 {
            return Err(UploadError::EmptyFile(file.name.clone()));
        }

        let content_hash = file.md5_hex().await?;
        let log = NewUploadLog {
            session_id: request.session_id.clone(),
            file_name: file.name.clone(),
            file_type: file.content_type.clone(),
            file_size: i64::try_from(file.size).unwrap_or(i64::MAX),
            content_hash: Some(content_hash.clone()),
            boulder_id: request.boulder_id.clone(),
        };

        let previous = self.logs.find_completed_by_hash(&content_hash).await?;
        if let Some((previous_session, url)) =
            previous.and_then(|entry| entry.url.map(|url| (entry.session_id, url)))
        {
            if previous_session == log.session_id {
                info!(session_id = %log.session_id, %url, "session already completed");
                self.attach(&request, &url).await?;
                return Ok(PipelineOutcome::Completed { url });
            }
            self.logs.record_duplicate(&log, &url).await?;
            info!(session_id = %log.session_id, %content_hash, %url, "duplicate upload, reusing url");
            self.attach(&request, &url).await?;
            return Ok(PipelineOutcome::Duplicate { url });
        }

        self.logs.create(&log).await?;
        self.logs.mark_uploading(&log.session_id).await?;

        match self.upload_mirroring_progress(file, &request).await {
            Ok(url) => {
                if !self.logs.mark_completed(&log.session_id, &url).await? {
                    // Cancelled from the tracker while the bytes were in flight.
                    info!(session_id = %log.session_id, %url, "upload row no longer active, not attaching");
                    return Err(UploadError::Aborted);
                }
                self.attach(&request, &url).await?;
                Ok(PipelineOutcome::Completed { url })
            }
            Err(err) => {
                let kind = if err.is_abort() {
                    UploadErrorKind::Aborted
                } else {
                    UploadErrorKind::Upload
                };
                if let Err(store_err) = self
                    .logs
                    .mark_failed(&log.session_id, kind, &err.to_string())
                    .await
                {
                    warn!(session_id = %log.session_id, error = %store_err, "could not record upload failure");
                }
                Err(err)
            }
        }
    }

    /// Run the upload while writing each progress update into the log row.
    async fn upload_mirroring_progress(
        &self,
        file: &UploadFile,
        request: &PipelineRequest,
    ) -> UploadResult<String> {
        let (tx, mut rx) = watch::channel(0.0_f64);
        let caller = request.on_progress.clone();
        let callback: ProgressCallback = Arc::new(move |progress: &UploadProgress| {
            tx.send_replace(progress.percent());
            if let Some(caller) = &caller {
                caller(progress);
            }
        });

        let mut options = UploadOptions::new(request.session_id.clone())
            .with_progress(callback)
            .with_cancel(request.cancel.clone());
        options.sector_id = request.sector_id.clone();

        let upload = self.uploader.upload(file, options);
        tokio::pin!(upload);

        let result = loop {
            tokio::select! {
                result = &mut upload => break result,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break (&mut upload).await;
                    }
                    let percent = *rx.borrow_and_update();
                    self.write_progress(&request.session_id, percent).await;
                }
            }
        };

        if result.is_err() {
            let percent = *rx.borrow();
            self.write_progress(&request.session_id, percent).await;
        }
        result
    }

    async fn write_progress(&self, session_id: &str, percent: f64) {
        if let Err(err) = self.logs.update_progress(session_id, percent).await {
            warn!(%session_id, error = %err, "could not record upload progress");
        }
    }

    async fn attach(&self, request: &PipelineRequest, url: &str) -> UploadResult<()> {
        if let Some(boulder_id) = &request.boulder_id {
            self.qualities.set_tier(boulder_id, request.tier, url).await?;
        }
        Ok(())
    }
}
