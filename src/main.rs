use anyhow::{Context, Result};
use beta_upload::{
    config::{AppConfig, Command},
    db,
    models::{boulder::QualityTier, session::UploadProgress},
    services::{
        cdn::{self, CdnClient, ReconcileMode},
        connectivity::NetworkMonitor,
        pipeline::{PipelineOutcome, PipelineRequest, UploadPipeline},
        quality_store::QualityStore,
        reaper::StaleUploadReaper,
        retry::RetryPolicy,
        tracker::UploadTracker,
        transport::HttpTransport,
        upload_log_store::UploadLogStore,
        upload_service::{ResumableUploader, UploadFile},
        wake_lock::InhibitWakeLock,
    },
};
use std::{path::Path, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + command ---
    let (cfg, command) = AppConfig::from_env_and_args()?;
    tracing::info!("Starting beta-upload with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);
    db::run_migrations(&db).await.context("running migrations")?;

    let logs = UploadLogStore::new(db.clone());
    let qualities = QualityStore::new(db.clone());

    match command {
        Command::Migrate => {
            tracing::info!("Database migration complete.");
        }
        Command::Upload {
            path,
            session_id,
            sector,
            boulder,
            tier,
        } => {
            upload(&cfg, logs, qualities, &path, session_id, sector, boulder, tier).await?;
        }
        Command::Watch => watch(logs).await?,
        Command::Cancel { session_id } => {
            let tracker = UploadTracker::new(logs);
            if tracker.cancel(&session_id).await? {
                println!("cancelled {session_id}");
            } else {
                println!("{session_id} is not an active upload");
            }
        }
        Command::Reap { watch } => {
            let reaper = StaleUploadReaper::new(logs).with_stale_after(cfg.stale_after());
            if watch {
                let handle = reaper.start(cfg.reaper_interval());
                tokio::signal::ctrl_c().await?;
                handle.shutdown().await;
            } else {
                let count = reaper.mark_stale_uploads_as_failed().await;
                println!("marked {count} stale upload(s) as failed");
            }
        }
        Command::CdnReconcile { confirm, .. } => {
            let mode = if confirm {
                ReconcileMode::Confirm
            } else {
                ReconcileMode::DryRun
            };
            let client = CdnClient::new(cfg.api_url.clone());
            let report = cdn::reconcile(&client, &qualities, mode).await?;
            for url in &report.orphans {
                println!("orphan   {url}");
            }
            for dangling in &report.dangling {
                println!(
                    "dangling {} {} {}",
                    dangling.boulder_id, dangling.tier, dangling.url
                );
            }
            for (url, err) in &report.delete_failures {
                println!("failed   {url}: {err}");
            }
            println!(
                "{} listed, {} orphaned, {} dangling, {} deleted, {} cleared",
                report.listed,
                report.orphans.len(),
                report.dangling.len(),
                report.deleted.len(),
                report.cleared
            );
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn upload(
    cfg: &AppConfig,
    logs: UploadLogStore,
    qualities: QualityStore,
    path: &Path,
    session_id: Option<String>,
    sector: Option<String>,
    boulder: Option<String>,
    tier: QualityTier,
) -> Result<()> {
    let file = UploadFile::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;

    let cancel = CancellationToken::new();
    let monitor = NetworkMonitor::default();
    let probe = match reqwest::Url::parse(&cfg.api_url) {
        Ok(url) => url.host_str().map(|host| {
            let port = url.port_or_known_default().unwrap_or(80);
            monitor.spawn_probe(host.to_string(), port, Duration::from_secs(5), cancel.clone())
        }),
        Err(err) => {
            tracing::warn!(api_url = %cfg.api_url, error = %err, "not probing connectivity");
            None
        }
    };

    let uploader = ResumableUploader::new(HttpTransport::new(cfg.api_url.clone()))
        .with_connectivity(monitor)
        .with_wake_lock(Arc::new(InhibitWakeLock::new()))
        .with_chunk_size(cfg.chunk_size)
        .with_retry_policy(RetryPolicy {
            max_attempts: cfg.max_attempts,
            base_delay: cfg.retry_base(),
        });
    let pipeline = UploadPipeline::new(uploader, logs, qualities);

    let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    println!("session {session_id}");
    let mut request = PipelineRequest::new(session_id).with_cancel(cancel.clone());
    request.sector_id = sector;
    if let Some(boulder) = boulder {
        request = request.for_boulder(boulder, tier);
    }
    request = request.with_progress(Arc::new(|progress: &UploadProgress| {
        tracing::info!(
            session_id = %progress.session_id,
            done = progress.chunks_done,
            total = progress.total_chunks,
            "{:.0}%",
            progress.percent()
        );
    }));

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, aborting upload");
            interrupt.cancel();
        }
    });

    let result = pipeline.run(&file, request).await;
    cancel.cancel();
    if let Some(probe) = probe {
        let _ = probe.await;
    }

    match result? {
        PipelineOutcome::Completed { url } => println!("uploaded {url}"),
        PipelineOutcome::Duplicate { url } => println!("already uploaded {url}"),
    }
    Ok(())
}

async fn watch(logs: UploadLogStore) -> Result<()> {
    let tracker = UploadTracker::new(logs);
    let mut rx = tracker.subscribe();
    let polling = tracker.start();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = rx.borrow_and_update().clone();
                if !snapshot.has_active_uploads() {
                    println!("no active uploads");
                    continue;
                }
                for entry in snapshot.active_uploads() {
                    println!(
                        "{} {:>10} {:>5.1}% {}",
                        entry.session_id,
                        entry.status.as_str(),
                        entry.progress,
                        entry.file_name
                    );
                }
            }
        }
    }

    polling.shutdown().await;
    Ok(())
}
