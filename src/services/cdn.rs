//! CDN maintenance: compare what the CDN stores with what boulders reference.

use crate::{
    errors::{CdnError, StoreError},
    models::boulder::QualityTier,
    services::quality_store::QualityStore,
};
use futures::{StreamExt, stream};
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
};
use tracing::{info, warn};

/// Deletes in flight at once during a confirmed reconcile.
pub const DELETE_CONCURRENCY: usize = 4;

/// Listing and deleting videos on the CDN.
pub trait VideoCatalog: Send + Sync {
    fn list_videos(&self) -> impl Future<Output = Result<Vec<String>, CdnError>> + Send;

    fn delete_video(&self, url: &str) -> impl Future<Output = Result<(), CdnError>> + Send;
}

#[derive(Clone, Debug)]
pub struct CdnClient {
    client: reqwest::Client,
    api_url: String,
}

#[derive(Serialize)]
struct DeleteRequest<'a> {
    url: &'a str,
}

impl CdnClient {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into(),
        }
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/{}", self.api_url.trim_end_matches('/'), name)
    }
}

impl VideoCatalog for CdnClient {
    async fn list_videos(&self) -> Result<Vec<String>, CdnError> {
        let response = self.client.get(self.endpoint("list-videos.php")).send().await?;
        let videos = ensure_success(response).await?.json::<Vec<String>>().await?;
        Ok(videos)
    }

    async fn delete_video(&self, url: &str) -> Result<(), CdnError> {
        let response = self
            .client
            .post(self.endpoint("delete.php"))
            .json(&DeleteRequest { url })
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, CdnError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CdnError::Status {
        status: status.as_u16(),
        body,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileMode {
    /// Report only.
    DryRun,
    /// Delete orphans and clear dangling tiers.
    Confirm,
}

/// A boulder tier pointing at a video the CDN no longer has.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DanglingTier {
    pub boulder_id: String,
    pub tier: QualityTier,
    pub url: String,
}

#[derive(Clone, Debug, Default)]
pub struct ReconcileReport {
    /// Videos listed by the CDN.
    pub listed: usize,
    /// CDN videos no boulder references, sorted.
    pub orphans: Vec<String>,
    pub dangling: Vec<DanglingTier>,
    /// Orphans actually deleted (confirm mode only), sorted.
    pub deleted: Vec<String>,
    pub delete_failures: Vec<(String, String)>,
    /// Tiers cleared from boulders (confirm mode only).
    pub cleared: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.orphans.is_empty() && self.dangling.is_empty()
    }
}

pub async fn reconcile<V: VideoCatalog>(
    cdn: &V,
    qualities: &QualityStore,
    mode: ReconcileMode,
) -> Result<ReconcileReport, CdnError> {
    let on_cdn: BTreeSet<String> = cdn.list_videos().await?.into_iter().collect();
    let referenced = qualities.referenced_urls().await?;

    let mut report = ReconcileReport {
        listed: on_cdn.len(),
        orphans: on_cdn.difference(&referenced).cloned().collect(),
        ..ReconcileReport::default()
    };

    for boulder in qualities.boulders_with_videos().await? {
        for (tier, url) in boulder.qualities().map_err(StoreError::from)?.iter() {
            if !on_cdn.contains(url) {
                report.dangling.push(DanglingTier {
                    boulder_id: boulder.id.clone(),
                    tier,
                    url: url.to_string(),
                });
            }
        }
    }

    info!(
        listed = report.listed,
        referenced = referenced.len(),
        orphans = report.orphans.len(),
        dangling = report.dangling.len(),
        ?mode,
        "CDN reconcile scanned"
    );

    if mode == ReconcileMode::DryRun {
        return Ok(report);
    }

    let results: Vec<(String, Result<(), CdnError>)> = stream::iter(report.orphans.clone())
        .map(|url| async move {
            let result = cdn.delete_video(&url).await;
            (url, result)
        })
        .buffer_unordered(DELETE_CONCURRENCY)
        .collect()
        .await;

    for (url, result) in results {
        match result {
            Ok(()) => report.deleted.push(url),
            Err(err) => {
                warn!(%url, error = %err, "could not delete orphaned video");
                report.delete_failures.push((url, err.to_string()));
            }
        }
    }
    report.deleted.sort();
    report.delete_failures.sort();

    let mut by_boulder: BTreeMap<&str, Vec<QualityTier>> = BTreeMap::new();
    for dangling in &report.dangling {
        by_boulder
            .entry(dangling.boulder_id.as_str())
            .or_default()
            .push(dangling.tier);
    }
    let mut cleared = 0;
    for (boulder_id, tiers) in by_boulder {
        qualities.clear_tiers(boulder_id, &tiers).await?;
        cleared += tiers.len();
    }
    report.cleared = cleared;

    info!(
        deleted = report.deleted.len(),
        failed = report.delete_failures.len(),
        cleared = report.cleared,
        "CDN reconcile applied"
    );
    Ok(report)
}
