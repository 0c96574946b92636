use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

use crate::services::sync_engine::{RetryPolicy, SyncSettings};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub page_size: i32,
    pub max_requests: u32,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub bucket_info_ttl_secs: u64,
    pub auto_sync: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            storage_dir: "./data/buckets".into(),
            database_url: "sqlite://./data/meta/bucket_index.db".into(),
            page_size: 1000,
            max_requests: 0,
            retry_max_attempts: 5,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 5000,
            bucket_info_ttl_secs: 3600,
            auto_sync: true,
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Persistent local index of object-storage buckets")]
pub struct Args {
    /// Host to bind to (overrides BUCKET_INDEX_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides BUCKET_INDEX_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Root directory served as buckets (overrides BUCKET_INDEX_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides BUCKET_INDEX_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Keys per listing page, 1..=1000 (overrides BUCKET_INDEX_PAGE_SIZE)
    #[arg(long)]
    pub page_size: Option<i32>,

    /// Default request budget per sync job, 0 = unlimited (overrides BUCKET_INDEX_MAX_REQUESTS)
    #[arg(long)]
    pub max_requests: Option<u32>,

    /// Attempts per page fetch (overrides BUCKET_INDEX_RETRY_MAX_ATTEMPTS)
    #[arg(long)]
    pub retry_max_attempts: Option<u32>,

    /// First retry delay in ms (overrides BUCKET_INDEX_RETRY_BASE_DELAY_MS)
    #[arg(long)]
    pub retry_base_delay_ms: Option<u64>,

    /// Retry delay cap in ms (overrides BUCKET_INDEX_RETRY_MAX_DELAY_MS)
    #[arg(long)]
    pub retry_max_delay_ms: Option<u64>,

    /// Bucket settings cache TTL in seconds (overrides BUCKET_INDEX_BUCKET_INFO_TTL_SECS)
    #[arg(long)]
    pub bucket_info_ttl_secs: Option<u64>,

    /// Start a background sync when a browse misses the index (overrides BUCKET_INDEX_AUTO_SYNC)
    #[arg(long)]
    pub auto_sync: Option<bool>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read `BUCKET_INDEX_{name}` and parse it, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let var = format!("BUCKET_INDEX_{}", name);
    match env::var(&var) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", var, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", var)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    /// CLI values win over environment values, which win over defaults.
    pub fn merge(args: Args) -> Result<Self> {
        let defaults = Self::default();

        // --- Environment fallback ---
        let env_cfg = Self {
            host: env_or("HOST", defaults.host)?,
            port: env_or("PORT", defaults.port)?,
            storage_dir: env_or("STORAGE_DIR", defaults.storage_dir)?,
            database_url: env_or("DATABASE_URL", defaults.database_url)?,
            page_size: env_or("PAGE_SIZE", defaults.page_size)?,
            max_requests: env_or("MAX_REQUESTS", defaults.max_requests)?,
            retry_max_attempts: env_or("RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts)?,
            retry_base_delay_ms: env_or("RETRY_BASE_DELAY_MS", defaults.retry_base_delay_ms)?,
            retry_max_delay_ms: env_or("RETRY_MAX_DELAY_MS", defaults.retry_max_delay_ms)?,
            bucket_info_ttl_secs: env_or("BUCKET_INFO_TTL_SECS", defaults.bucket_info_ttl_secs)?,
            auto_sync: env_or("AUTO_SYNC", defaults.auto_sync)?,
        };

        // --- Merge ---
        Ok(Self {
            host: args.host.unwrap_or(env_cfg.host),
            port: args.port.unwrap_or(env_cfg.port),
            storage_dir: args.storage_dir.unwrap_or(env_cfg.storage_dir),
            database_url: args.database_url.unwrap_or(env_cfg.database_url),
            page_size: args.page_size.unwrap_or(env_cfg.page_size).clamp(1, 1000),
            max_requests: args.max_requests.unwrap_or(env_cfg.max_requests),
            retry_max_attempts: args
                .retry_max_attempts
                .unwrap_or(env_cfg.retry_max_attempts)
                .max(1),
            retry_base_delay_ms: args
                .retry_base_delay_ms
                .unwrap_or(env_cfg.retry_base_delay_ms),
            retry_max_delay_ms: args.retry_max_delay_ms.unwrap_or(env_cfg.retry_max_delay_ms),
            bucket_info_ttl_secs: args
                .bucket_info_ttl_secs
                .unwrap_or(env_cfg.bucket_info_ttl_secs),
            auto_sync: args.auto_sync.unwrap_or(env_cfg.auto_sync),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Engine defaults derived from this configuration.
    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            page_size: self.page_size,
            max_requests: self.max_requests,
            retry: RetryPolicy {
                max_attempts: self.retry_max_attempts,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms.max(self.retry_base_delay_ms)),
            },
            bucket_info_ttl: chrono::Duration::seconds(
                i64::try_from(self.bucket_info_ttl_secs).unwrap_or(i64::MAX / 1000),
            ),
        }
    }
}
