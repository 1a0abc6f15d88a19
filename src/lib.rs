//! Chunked bulk ingestion of invoice and order files into SQLite.
//!
//! A submitted file is validated, split into bounded chunks and processed by
//! a worker pool; every row ends up loaded, rejected with a recorded error,
//! or recognized as a duplicate of an earlier row.

pub mod config;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod models;
pub mod state;
pub mod storage;
pub mod streaming;
pub mod validation;

use std::path::PathBuf;

pub use crate::config::IngestConfig;
pub use crate::error::AppError;
pub use crate::state::IngestService;

/// Initializes logging and opens the service with configuration from the
/// environment (`INGEST_*` variables, `.env` if present).
pub async fn start_from_env(db_path: PathBuf) -> Result<IngestService, AppError> {
    let log_config = logging::LogConfig::from_env()?;
    logging::init_logging(&log_config)?;

    let config = IngestConfig::from_env()?;
    tracing::info!(
        db_path = %db_path.display(),
        max_rows_per_chunk = config.max_rows_per_chunk,
        max_concurrent_chunks = config.max_concurrent_chunks,
        parallelism = config.parallelism,
        "Starting ingest service"
    );

    IngestService::open(db_path, config).await
}
