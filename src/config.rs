use crate::models::boulder::QualityTier;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{env, path::PathBuf, str::FromStr, time::Duration};

const ENV_PREFIX: &str = "BETA_UPLOAD_";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub api_url: String,
    pub database_url: String,
    pub chunk_size: u64,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub stale_after_minutes: u64,
    pub reaper_interval_minutes: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable beta video uploads")]
pub struct Args {
    /// Upload API base URL (overrides BETA_UPLOAD_API_URL)
    #[arg(long, global = true)]
    pub api_url: Option<String>,

    /// Database URL (overrides BETA_UPLOAD_DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Chunk size in bytes (overrides BETA_UPLOAD_CHUNK_SIZE)
    #[arg(long, global = true)]
    pub chunk_size: Option<u64>,

    /// Attempts per chunk before giving up (overrides BETA_UPLOAD_MAX_ATTEMPTS)
    #[arg(long, global = true)]
    pub max_attempts: Option<u32>,

    /// First retry delay in milliseconds (overrides BETA_UPLOAD_RETRY_BASE_MS)
    #[arg(long, global = true)]
    pub retry_base_ms: Option<u64>,

    /// Age after which a hung upload is failed (overrides BETA_UPLOAD_STALE_AFTER_MINUTES)
    #[arg(long, global = true)]
    pub stale_after_minutes: Option<u64>,

    /// Minutes between reaper sweeps (overrides BETA_UPLOAD_REAPER_INTERVAL_MINUTES)
    #[arg(long, global = true)]
    pub reaper_interval_minutes: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run migrations and exit
    Migrate,
    /// Upload a video file
    Upload {
        path: PathBuf,
        /// Reuse an id to resume an interrupted upload
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        sector: Option<String>,
        /// Boulder to attach the uploaded video to
        #[arg(long)]
        boulder: Option<String>,
        #[arg(long, default_value = "hd")]
        tier: QualityTier,
    },
    /// Print active uploads as they change
    Watch,
    /// Mark an active upload as cancelled
    Cancel { session_id: String },
    /// Fail uploads stuck in an intermediate status
    Reap {
        /// Keep sweeping every reaper interval
        #[arg(long)]
        watch: bool,
    },
    /// Compare CDN videos with boulder references
    CdnReconcile {
        /// Only report (default)
        #[arg(long, conflicts_with = "confirm")]
        dry_run: bool,
        /// Delete orphaned videos and clear dangling tiers
        #[arg(long)]
        confirm: bool,
    },
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the command.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        // Parse CLI once
        let args = Args::parse();
        let cfg = Self::resolve(&args, |name| env::var(name).ok())?;
        Ok((cfg, args.command))
    }

    /// Merge `args` over variables looked up through `lookup`.
    pub fn resolve(args: &Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        // --- Environment fallback ---
        let env_api = var("API_URL").unwrap_or_else(|| "http://localhost:8080/api".into());
        let env_db =
            var("DATABASE_URL").unwrap_or_else(|| "sqlite://./data/beta_upload.db".into());
        let env_chunk = parse_var(&var, "CHUNK_SIZE", 5 * 1024 * 1024)?;
        let env_attempts = parse_var(&var, "MAX_ATTEMPTS", 5)?;
        let env_retry = parse_var(&var, "RETRY_BASE_MS", 1000)?;
        let env_stale = parse_var(&var, "STALE_AFTER_MINUTES", 30)?;
        let env_interval = parse_var(&var, "REAPER_INTERVAL_MINUTES", 5)?;

        // --- Merge ---
        let cfg = Self {
            api_url: args.api_url.clone().unwrap_or(env_api),
            database_url: args.database_url.clone().unwrap_or(env_db),
            chunk_size: args.chunk_size.unwrap_or(env_chunk),
            max_attempts: args.max_attempts.unwrap_or(env_attempts),
            retry_base_ms: args.retry_base_ms.unwrap_or(env_retry),
            stale_after_minutes: args.stale_after_minutes.unwrap_or(env_stale),
            reaper_interval_minutes: args.reaper_interval_minutes.unwrap_or(env_interval),
        };

        if cfg.chunk_size == 0 {
            anyhow::bail!("chunk size must be positive");
        }
        if cfg.max_attempts == 0 {
            anyhow::bail!("max attempts must be at least 1");
        }
        Ok(cfg)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_minutes * 60)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_minutes.max(1) * 60)
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {ENV_PREFIX}{name} value `{}`", value)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_without_env_or_flags() {
        let args = Args::try_parse_from(["beta-upload", "migrate"]).unwrap();
        let cfg = AppConfig::resolve(&args, env_of(&[])).unwrap();
        assert_eq!(cfg.chunk_size, 5 * 1024 * 1024);
        assert_eq!(cfg.max_attempts, 5);
        assert_eq!(cfg.retry_base(), Duration::from_secs(1));
        assert_eq!(cfg.stale_after(), Duration::from_secs(30 * 60));
        assert_eq!(args.command, Command::Migrate);
    }

    #[test]
    fn flags_override_environment() {
        let args = Args::try_parse_from([
            "beta-upload",
            "reap",
            "--watch",
            "--max-attempts",
            "3",
        ])
        .unwrap();
        let env = env_of(&[
            ("BETA_UPLOAD_MAX_ATTEMPTS", "9"),
            ("BETA_UPLOAD_API_URL", "https://gym.example.com/api"),
        ]);
        let cfg = AppConfig::resolve(&args, env).unwrap();
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.api_url, "https://gym.example.com/api");
        assert_eq!(args.command, Command::Reap { watch: true });
    }

    #[test]
    fn malformed_env_is_an_error() {
        let args = Args::try_parse_from(["beta-upload", "watch"]).unwrap();
        let err = AppConfig::resolve(&args, env_of(&[("BETA_UPLOAD_CHUNK_SIZE", "big")]))
            .unwrap_err();
        assert!(err.to_string().contains("BETA_UPLOAD_CHUNK_SIZE"));
    }

    #[test]
    fn upload_command_parses_tier() {
        let args = Args::try_parse_from([
            "beta-upload",
            "upload",
            "clip.mp4",
            "--boulder",
            "b1",
            "--tier",
            "sd",
        ])
        .unwrap();
        match args.command {
            Command::Upload { boulder, tier, session_id, .. } => {
                assert_eq!(boulder.as_deref(), Some("b1"));
                assert_eq!(tier, QualityTier::Sd);
                assert!(session_id.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn reconcile_modes_conflict() {
        assert!(
            Args::try_parse_from(["beta-upload", "cdn-reconcile", "--dry-run", "--confirm"])
                .is_err()
        );
    }
}
