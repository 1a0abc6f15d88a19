//! Ingestion configuration.
//!
//! Every setting has a default and can be overridden with an `INGEST_*`
//! environment variable (a `.env` file is honoured).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::DeduplicationAction;

pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;
pub const DEFAULT_MAX_ROWS_PER_CHUNK: usize = 1000;
pub const DEFAULT_MAX_CONCURRENT_CHUNKS: usize = 4;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_CHUNK_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_JOB_TIMEOUT_MS: u64 = 30 * 60 * 1000;
pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_PARALLELISM: usize = 4;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 250;

/// Whether `max_concurrent_chunks` bounds the whole service or each job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyScope {
    #[default]
    Global,
    PerJob,
}

impl std::str::FromStr for ConcurrencyScope {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "global" => Ok(ConcurrencyScope::Global),
            "per_job" | "per-job" | "job" => Ok(ConcurrencyScope::PerJob),
            _ => Err(AppError::Config(format!("Invalid concurrency scope: {}", s))),
        }
    }
}

/// Service-wide ingestion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Largest accepted upload in bytes
    pub max_file_size: u64,
    pub max_rows_per_chunk: usize,
    pub max_concurrent_chunks: usize,
    pub concurrency_scope: ConcurrencyScope,
    /// Retries per chunk after the first attempt
    pub max_retries: u32,
    pub chunk_timeout: Duration,
    pub job_timeout: Duration,
    /// Rows per write transaction
    pub batch_size: usize,
    /// Worker tasks pulling chunk assignments
    pub parallelism: usize,
    pub enable_deduplication: bool,
    pub enable_audit_log: bool,
    pub deduplication_action: DeduplicationAction,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Bound on queued chunks across all jobs
    pub queue_capacity: usize,
    /// Minimum gap between row-progress snapshots
    pub progress_interval: Duration,
    /// Where chunk files are spooled
    pub work_dir: PathBuf,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_rows_per_chunk: DEFAULT_MAX_ROWS_PER_CHUNK,
            max_concurrent_chunks: DEFAULT_MAX_CONCURRENT_CHUNKS,
            concurrency_scope: ConcurrencyScope::Global,
            max_retries: DEFAULT_MAX_RETRIES,
            chunk_timeout: Duration::from_millis(DEFAULT_CHUNK_TIMEOUT_MS),
            job_timeout: Duration::from_millis(DEFAULT_JOB_TIMEOUT_MS),
            batch_size: DEFAULT_BATCH_SIZE,
            parallelism: DEFAULT_PARALLELISM,
            enable_deduplication: true,
            enable_audit_log: true,
            deduplication_action: DeduplicationAction::Skip,
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            retry_max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            progress_interval: Duration::from_millis(DEFAULT_PROGRESS_INTERVAL_MS),
            work_dir: std::env::temp_dir().join("bulkload"),
        }
    }
}

/// Reads `name` and parses it, falling back to `default` when unset.
/// A value that is set but does not parse is a configuration error.
fn env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, AppError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("Invalid value for {}: {:?}", name, raw))),
        Err(std::env::VarError::NotPresent) => Ok(default),
        Err(std::env::VarError::NotUnicode(_)) => Err(AppError::Config(format!(
            "{} is not valid unicode",
            name
        ))),
    }
}

fn env_millis(name: &str, default_ms: u64) -> Result<Duration, AppError> {
    env_or(name, default_ms).map(Duration::from_millis)
}

impl IngestConfig {
    /// Loads configuration from the environment (and `.env`, if present).
    pub fn from_env() -> Result<Self, AppError> {
        // A missing .env file is fine.
        let _ = dotenvy::dotenv();

        let concurrency_scope = match std::env::var("INGEST_CONCURRENCY_SCOPE") {
            Ok(s) => s.parse()?,
            Err(_) => ConcurrencyScope::Global,
        };

        let deduplication_action = match std::env::var("INGEST_DEDUPLICATION_ACTION") {
            Ok(s) => DeduplicationAction::parse(&s).ok_or_else(|| {
                AppError::Config(format!("Invalid deduplication action: {}", s))
            })?,
            Err(_) => DeduplicationAction::Skip,
        };

        let work_dir = std::env::var("INGEST_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("bulkload"));

        let config = Self {
            max_file_size: env_or("INGEST_MAX_FILE_SIZE", DEFAULT_MAX_FILE_SIZE)?,
            max_rows_per_chunk: env_or("INGEST_MAX_ROWS_PER_CHUNK", DEFAULT_MAX_ROWS_PER_CHUNK)?,
            max_concurrent_chunks: env_or(
                "INGEST_MAX_CONCURRENT_CHUNKS",
                DEFAULT_MAX_CONCURRENT_CHUNKS,
            )?,
            concurrency_scope,
            max_retries: env_or("INGEST_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            chunk_timeout: env_millis("INGEST_CHUNK_TIMEOUT_MS", DEFAULT_CHUNK_TIMEOUT_MS)?,
            job_timeout: env_millis("INGEST_JOB_TIMEOUT_MS", DEFAULT_JOB_TIMEOUT_MS)?,
            batch_size: env_or("INGEST_BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
            parallelism: env_or("INGEST_PARALLELISM", DEFAULT_PARALLELISM)?,
            enable_deduplication: env_or("INGEST_ENABLE_DEDUPLICATION", true)?,
            enable_audit_log: env_or("INGEST_ENABLE_AUDIT_LOG", true)?,
            deduplication_action,
            retry_base_delay: env_millis("INGEST_RETRY_BASE_DELAY_MS", DEFAULT_RETRY_BASE_DELAY_MS)?,
            retry_max_delay: env_millis("INGEST_RETRY_MAX_DELAY_MS", DEFAULT_RETRY_MAX_DELAY_MS)?,
            queue_capacity: env_or("INGEST_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY)?,
            progress_interval: env_millis(
                "INGEST_PROGRESS_INTERVAL_MS",
                DEFAULT_PROGRESS_INTERVAL_MS,
            )?,
            work_dir,
        };

        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), AppError> {
        let positive = [
            ("INGEST_MAX_ROWS_PER_CHUNK", self.max_rows_per_chunk),
            ("INGEST_MAX_CONCURRENT_CHUNKS", self.max_concurrent_chunks),
            ("INGEST_BATCH_SIZE", self.batch_size),
            ("INGEST_PARALLELISM", self.parallelism),
            ("INGEST_QUEUE_CAPACITY", self.queue_capacity),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(AppError::Config(format!("{} must be greater than 0", name)));
            }
        }
        if self.max_file_size == 0 {
            return Err(AppError::Config(
                "INGEST_MAX_FILE_SIZE must be greater than 0".into(),
            ));
        }
        if self.chunk_timeout.is_zero() || self.job_timeout.is_zero() {
            return Err(AppError::Config("Timeouts must be greater than 0".into()));
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(AppError::Config(
                "INGEST_RETRY_BASE_DELAY_MS must not exceed INGEST_RETRY_MAX_DELAY_MS".into(),
            ));
        }
        Ok(())
    }

    /// Backoff before retry number `attempts`: `base * 2^attempts`, capped.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts.min(20));
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.retry_max_delay)
    }
}
