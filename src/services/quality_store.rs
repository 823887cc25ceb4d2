//! Quality tier URLs on the `boulders` table.

use crate::{
    errors::{StoreError, StoreResult},
    models::boulder::{Boulder, QualityTier, VideoQualities},
};
use sqlx::SqlitePool;
use std::{collections::BTreeSet, sync::Arc};
use tracing::{debug, info};

const COLUMNS: &str = "id, name, sector_id, video_url, video_qualities";

#[derive(Clone)]
pub struct QualityStore {
    pub db: Arc<SqlitePool>,
}

impl QualityStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Insert or replace a boulder row.
    pub async fn upsert_boulder(&self, boulder: &Boulder) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO boulders (id, name, sector_id, video_url, video_qualities)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                sector_id = excluded.sector_id,
                video_url = excluded.video_url,
                video_qualities = excluded.video_qualities",
        )
        .bind(&boulder.id)
        .bind(&boulder.name)
        .bind(&boulder.sector_id)
        .bind(&boulder.video_url)
        .bind(&boulder.video_qualities)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn get_boulder(&self, boulder_id: &str) -> StoreResult<Boulder> {
        let sql = format!("SELECT {COLUMNS} FROM boulders WHERE id = ?");
        sqlx::query_as::<_, Boulder>(&sql)
            .bind(boulder_id)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| StoreError::BoulderNotFound(boulder_id.to_string()))
    }

    /// Boulders that carry any video URL, legacy or tiered.
    pub async fn boulders_with_videos(&self) -> StoreResult<Vec<Boulder>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM boulders
             WHERE video_url IS NOT NULL OR video_qualities IS NOT NULL
             ORDER BY id"
        );
        let rows = sqlx::query_as::<_, Boulder>(&sql)
            .fetch_all(&*self.db)
            .await?;
        Ok(rows)
    }

    /// Tiers of a boulder; the legacy `video_url` stands in for `hd`.
    pub async fn qualities_for(&self, boulder_id: &str) -> StoreResult<VideoQualities> {
        let boulder = self.get_boulder(boulder_id).await?;
        Ok(boulder.qualities()?)
    }

    /// Point one tier at `url`. Setting `hd` also updates the legacy field.
    pub async fn set_tier(
        &self,
        boulder_id: &str,
        tier: QualityTier,
        url: &str,
    ) -> StoreResult<VideoQualities> {
        let boulder = self.get_boulder(boulder_id).await?;
        let mut qualities = boulder.qualities()?;
        qualities.set(tier, url);

        let video_url = match tier {
            QualityTier::Hd => Some(url.to_string()),
            _ => boulder.video_url.clone(),
        };
        self.write(boulder_id, video_url.as_deref(), &qualities).await?;
        info!(%boulder_id, %tier, %url, "video quality set");
        Ok(qualities)
    }

    /// Remove tiers. Clearing `hd` also drops the legacy URL, whatever it
    /// holds, so the fallback cannot bring an `hd` back.
    pub async fn clear_tiers(
        &self,
        boulder_id: &str,
        tiers: &[QualityTier],
    ) -> StoreResult<VideoQualities> {
        let boulder = self.get_boulder(boulder_id).await?;
        let mut qualities = boulder.qualities()?;
        let mut video_url = boulder.video_url.clone();

        for &tier in tiers {
            qualities.clear(tier);
            if tier == QualityTier::Hd {
                video_url = None;
            }
        }
        self.write(boulder_id, video_url.as_deref(), &qualities).await?;
        debug!(%boulder_id, cleared = tiers.len(), "video qualities cleared");
        Ok(qualities)
    }

    /// Every video URL any boulder points at.
    pub async fn referenced_urls(&self) -> StoreResult<BTreeSet<String>> {
        let mut urls = BTreeSet::new();
        for boulder in self.boulders_with_videos().await? {
            if let Some(legacy) = &boulder.video_url {
                urls.insert(legacy.clone());
            }
            for (_, url) in boulder.qualities()?.iter() {
                urls.insert(url.to_string());
            }
        }
        Ok(urls)
    }

    async fn write(
        &self,
        boulder_id: &str,
        video_url: Option<&str>,
        qualities: &VideoQualities,
    ) -> StoreResult<()> {
        let raw = if qualities.is_empty() {
            None
        } else {
            Some(serde_json::to_string(qualities)?)
        };
        let result = sqlx::query("UPDATE boulders SET video_url = ?, video_qualities = ? WHERE id = ?")
            .bind(video_url)
            .bind(raw)
            .bind(boulder_id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::BoulderNotFound(boulder_id.to_string()));
        }
        Ok(())
    }
}
