//! Boulders and the video quality tiers attached to them.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};

/// A transcoded variant of an uploaded video.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Hd,
    Sd,
    Low,
}

impl QualityTier {
    pub const ALL: [QualityTier; 3] = [QualityTier::Hd, QualityTier::Sd, QualityTier::Low];

    pub fn as_str(self) -> &'static str {
        match self {
            QualityTier::Hd => "hd",
            QualityTier::Sd => "sd",
            QualityTier::Low => "low",
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hd" => Ok(QualityTier::Hd),
            "sd" => Ok(QualityTier::Sd),
            "low" => Ok(QualityTier::Low),
            other => Err(format!("unknown quality tier `{}` (expected hd, sd or low)", other)),
        }
    }
}

/// Tier -> URL map stored as JSON on the boulder row.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct VideoQualities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<String>,
}

impl VideoQualities {
    pub fn get(&self, tier: QualityTier) -> Option<&str> {
        match tier {
            QualityTier::Hd => self.hd.as_deref(),
            QualityTier::Sd => self.sd.as_deref(),
            QualityTier::Low => self.low.as_deref(),
        }
    }

    pub fn set(&mut self, tier: QualityTier, url: impl Into<String>) {
        *self.slot(tier) = Some(url.into());
    }

    pub fn clear(&mut self, tier: QualityTier) -> Option<String> {
        self.slot(tier).take()
    }

    fn slot(&mut self, tier: QualityTier) -> &mut Option<String> {
        match tier {
            QualityTier::Hd => &mut self.hd,
            QualityTier::Sd => &mut self.sd,
            QualityTier::Low => &mut self.low,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hd.is_none() && self.sd.is_none() && self.low.is_none()
    }

    /// Present tiers with their URLs, best quality first.
    pub fn iter(&self) -> impl Iterator<Item = (QualityTier, &str)> {
        QualityTier::ALL
            .into_iter()
            .filter_map(|tier| self.get(tier).map(|url| (tier, url)))
    }

    /// Let the legacy single-URL field stand in for a missing `hd`.
    pub fn with_legacy_fallback(mut self, legacy_url: Option<&str>) -> Self {
        if self.hd.is_none() {
            self.hd = legacy_url.map(str::to_string);
        }
        self
    }
}

/// The video-related columns of a boulder row.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Boulder {
    pub id: String,

    pub name: String,

    pub sector_id: Option<String>,

    /// Legacy single-URL video field, predating quality tiers.
    pub video_url: Option<String>,

    /// Raw JSON of [`VideoQualities`].
    pub video_qualities: Option<String>,
}

impl Boulder {
    /// Stored qualities with the legacy fallback applied.
    pub fn qualities(&self) -> Result<VideoQualities, serde_json::Error> {
        let stored = match self.video_qualities.as_deref() {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)?,
            _ => VideoQualities::default(),
        };
        Ok(stored.with_legacy_fallback(self.video_url.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boulder(video_url: Option<&str>, qualities: Option<&str>) -> Boulder {
        Boulder {
            id: "b1".into(),
            name: "Crimp Line".into(),
            sector_id: None,
            video_url: video_url.map(str::to_string),
            video_qualities: qualities.map(str::to_string),
        }
    }

    #[test]
    fn legacy_url_stands_in_for_hd() {
        let b = boulder(Some("https://cdn/legacy.mp4"), None);
        let q = b.qualities().unwrap();
        assert_eq!(q.get(QualityTier::Hd), Some("https://cdn/legacy.mp4"));
        assert!(q.sd.is_none());
    }

    #[test]
    fn stored_hd_wins_over_legacy() {
        let b = boulder(
            Some("https://cdn/legacy.mp4"),
            Some(r#"{"hd":"https://cdn/hd.mp4","low":"https://cdn/low.mp4"}"#),
        );
        let q = b.qualities().unwrap();
        assert_eq!(q.get(QualityTier::Hd), Some("https://cdn/hd.mp4"));
        assert_eq!(q.get(QualityTier::Low), Some("https://cdn/low.mp4"));
        assert_eq!(q.iter().count(), 2);
    }

    #[test]
    fn tier_parsing() {
        assert_eq!("HD".parse::<QualityTier>().unwrap(), QualityTier::Hd);
        assert!("4k".parse::<QualityTier>().is_err());
    }

    #[test]
    fn empty_qualities_serialize_to_empty_object() {
        let mut q = VideoQualities::default();
        assert_eq!(serde_json::to_string(&q).unwrap(), "{}");
        q.set(QualityTier::Sd, "u");
        assert_eq!(serde_json::to_string(&q).unwrap(), r#"{"sd":"u"}"#);
        assert_eq!(q.clear(QualityTier::Sd).as_deref(), Some("u"));
        assert!(q.is_empty());
    }
}
