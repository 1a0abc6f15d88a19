//! Ingestion service state.
//!
//! `IngestService` is the caller-facing facade: it owns the database handle,
//! the engine and the configuration, and exposes job submission, status,
//! progress streaming, cancellation and the read operations.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures_util::stream::{self, StreamExt};
use uuid::Uuid;

use crate::config::IngestConfig;
use crate::error::AppError;
use crate::ingest::dedup::{hash_file, hash_records, DedupPolicy};
use crate::ingest::progress::{follow, ProgressStream};
use crate::ingest::queue::{ChannelQueue, WorkQueue};
use crate::ingest::{IngestEngine, JobSettings};
use crate::models::{
    current_timestamp_ms, AuditLogEntry, DeduplicationAction, FileMeta, JobOptions, JobStatus,
    ProcessingError, ProgressUpdate, ResolutionStatus, RowSource, UploadChunk, UploadJob,
};
use crate::storage::jobs::{self, Auditor};
use crate::storage::records::{self, IngestedRecord, RowWriter, SqliteRowWriter};
use crate::storage::Database;
use crate::validation::RowSchema;

// ─────────────────────────────────────────────────────────────────────────────
// Service
// ─────────────────────────────────────────────────────────────────────────────

/// Shared ingestion state, safe to put behind an `Arc` and call concurrently.
pub struct IngestService {
    db: Database,
    config: Arc<IngestConfig>,
    engine: IngestEngine,
    auditor: Auditor,
    /// Schemas seen at submission, by version, for `retry_job`.
    schemas: Mutex<HashMap<String, RowSchema>>,
}

impl IngestService {
    /// Opens the database, reconciles jobs left unfinished by a previous
    /// process and starts the engine with the in-process queue.
    pub async fn open(db_path: PathBuf, config: IngestConfig) -> Result<Self, AppError> {
        config.validate()?;
        let db = Database::init(db_path).await?;
        let queue = Arc::new(ChannelQueue::new(config.queue_capacity));
        let writer = Arc::new(SqliteRowWriter::new(db.clone()));
        Self::with_parts(db, config, queue, writer).await
    }

    /// Starts the service over an explicit queue and row writer.
    pub async fn with_parts(
        db: Database,
        config: IngestConfig,
        queue: Arc<dyn WorkQueue>,
        writer: Arc<dyn RowWriter>,
    ) -> Result<Self, AppError> {
        let auditor = Auditor::new(config.enable_audit_log, "ingest-service");

        let reconciled = jobs::reconcile_interrupted_jobs(&db, &auditor).await?;
        if !reconciled.is_empty() {
            tracing::warn!(count = reconciled.len(), "Reconciled jobs interrupted by a restart");
        }

        let config = Arc::new(config);
        let engine = IngestEngine::start(
            db.clone(),
            config.clone(),
            queue,
            writer,
            auditor.with_actor("ingest-engine"),
        );

        Ok(Self {
            db,
            config,
            engine,
            auditor,
            schemas: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn engine(&self) -> &IngestEngine {
        &self.engine
    }

    // ─────────────────────────────────────────────────────────────────────
    // Jobs
    // ─────────────────────────────────────────────────────────────────────

    /// Registers an upload and starts processing it in the background.
    /// Returns the new job id as soon as the job is persisted.
    pub async fn submit_job(
        &self,
        meta: FileMeta,
        source: RowSource,
        options: JobOptions,
    ) -> Result<String, AppError> {
        let schema = options.schema.unwrap_or_default();
        let content_hash = content_hash(&meta, &source).await?;
        let now = current_timestamp_ms();

        let job = UploadJob {
            id: Uuid::new_v4().to_string(),
            content_hash,
            file_name: meta.file_name,
            file_type: meta.file_type,
            file_size: meta.file_size as i64,
            schema_version: meta
                .schema_version
                .or_else(|| Some(schema.version().to_string())),
            status: JobStatus::Pending,
            total_rows: 0,
            processed_rows: 0,
            successful_rows: 0,
            failed_rows: 0,
            duplicate_rows: 0,
            total_chunks: 0,
            strategy: options.strategy,
            priority: options.priority,
            retry_count: 0,
            max_retries: options.max_retries.unwrap_or(self.config.max_retries) as i64,
            retry_of: None,
            context: options.context,
            error_message: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            processing_time_ms: None,
            rows_per_second: None,
        };

        self.launch(job, source, schema, options.deduplication_action)
            .await
    }

    /// Resubmits the rows of a finished job as a new job linked to it.
    ///
    /// Rows the previous attempt already loaded are recognized by dedup.
    pub async fn retry_job(&self, job_id: &str, source: RowSource) -> Result<String, AppError> {
        let previous = self.get_job_status(job_id).await?;

        if !previous.status.is_terminal() {
            return Err(AppError::RetryRefused {
                job_id: job_id.to_string(),
                reason: format!("job is still {}", previous.status.as_str()),
            });
        }
        if previous.retry_count + 1 > previous.max_retries {
            return Err(AppError::RetryRefused {
                job_id: job_id.to_string(),
                reason: format!("retry limit of {} reached", previous.max_retries),
            });
        }

        let schema = previous
            .schema_version
            .as_deref()
            .and_then(|version| self.schemas().get(version).cloned())
            .unwrap_or_default();
        let meta = FileMeta {
            file_size: previous.file_size.max(0) as u64,
            ..FileMeta::default()
        };
        let content_hash = content_hash(&meta, &source).await?;
        let now = current_timestamp_ms();

        let job = UploadJob {
            id: Uuid::new_v4().to_string(),
            content_hash,
            status: JobStatus::Pending,
            total_rows: 0,
            processed_rows: 0,
            successful_rows: 0,
            failed_rows: 0,
            duplicate_rows: 0,
            total_chunks: 0,
            retry_count: previous.retry_count + 1,
            retry_of: Some(previous.id.clone()),
            error_message: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            processing_time_ms: None,
            rows_per_second: None,
            ..previous
        };

        tracing::info!(job_id, retry_count = job.retry_count, "Retrying job");
        self.launch(job, source, schema, None).await
    }

    async fn launch(
        &self,
        job: UploadJob,
        source: RowSource,
        schema: RowSchema,
        action: Option<DeduplicationAction>,
    ) -> Result<String, AppError> {
        jobs::insert_job(&self.db, &job, &self.auditor).await?;
        self.schemas()
            .insert(schema.version().to_string(), schema.clone());

        let settings = JobSettings {
            schema,
            dedup: DedupPolicy {
                enabled: self.config.enable_deduplication,
                action: action.unwrap_or(self.config.deduplication_action),
            },
            max_retries: job.max_retries.max(0) as u32,
            priority: job.priority,
            strategy: job.strategy,
        };

        let rt = self.engine.register_job(&job, settings);
        self.engine.spawn_planning(rt, source);

        tracing::info!(
            job_id = %job.id,
            file_name = %job.file_name,
            strategy = job.strategy.as_str(),
            priority = job.priority,
            "Job submitted"
        );
        Ok(job.id)
    }

    fn schemas(&self) -> std::sync::MutexGuard<'_, HashMap<String, RowSchema>> {
        self.schemas.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn get_job_status(&self, job_id: &str) -> Result<UploadJob, AppError> {
        jobs::get_job(&self.db, job_id)
            .await?
            .ok_or_else(|| AppError::JobNotFound(job_id.to_string()))
    }

    /// Progress snapshots until the job reaches a terminal status.
    pub async fn stream_progress(&self, job_id: &str) -> Result<ProgressStream, AppError> {
        let job = self.get_job_status(job_id).await?;
        if job.status.is_terminal() {
            return Ok(final_snapshot(&job));
        }

        let rx = self.engine.progress().subscribe(job_id);
        // Re-read after subscribing so no transition falls in between.
        let job = self.get_job_status(job_id).await?;
        if job.status.is_terminal() {
            drop(rx);
            if self.engine.runtime(job_id).is_none() {
                self.engine.progress().remove(job_id);
            }
            return Ok(final_snapshot(&job));
        }

        let settled = self
            .engine
            .runtime(job_id)
            .map_or(0, |rt| rt.settled_chunks());
        Ok(follow(ProgressUpdate::from_job(&job, settled), rx))
    }

    /// Requests cancellation. Chunks already running finish; the rest are cancelled.
    pub async fn cancel_job(&self, job_id: &str) -> Result<UploadJob, AppError> {
        self.engine
            .cancel_job(job_id, &self.auditor.with_actor("caller"))
            .await
    }

    pub async fn list_active_jobs(&self) -> Result<Vec<UploadJob>, AppError> {
        jobs::list_active_jobs(&self.db).await
    }

    pub async fn get_job_chunks(&self, job_id: &str) -> Result<Vec<UploadChunk>, AppError> {
        jobs::get_job_chunks(&self.db, job_id).await
    }

    pub async fn list_processing_errors(&self, job_id: &str) -> Result<Vec<ProcessingError>, AppError> {
        jobs::list_processing_errors(&self.db, job_id).await
    }

    pub async fn resolve_processing_error(
        &self,
        error_id: i64,
        resolution: ResolutionStatus,
    ) -> Result<bool, AppError> {
        jobs::resolve_processing_error(&self.db, error_id, resolution).await
    }

    pub async fn list_audit_log(&self, job_id: &str) -> Result<Vec<AuditLogEntry>, AppError> {
        jobs::list_audit_log(&self.db, job_id).await
    }

    /// Rows a job stored, in row order.
    pub async fn list_job_records(&self, job_id: &str) -> Result<Vec<IngestedRecord>, AppError> {
        records::list_job_records(&self.db, job_id).await
    }

    /// Deletes terminal jobs older than `retention_days`. Returns how many were removed.
    pub async fn cleanup_old_jobs(&self, retention_days: i64) -> Result<u64, AppError> {
        let removed = jobs::cleanup_old_jobs(&self.db, retention_days).await?;
        tracing::info!(removed, retention_days, "Old jobs cleaned up");
        Ok(removed)
    }

    /// Stops the engine. Interrupted jobs are reconciled on the next `open`.
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }
}

fn final_snapshot(job: &UploadJob) -> ProgressStream {
    let update = ProgressUpdate::from_job(job, job.total_chunks);
    stream::once(async move { update }).boxed()
}

async fn content_hash(meta: &FileMeta, source: &RowSource) -> Result<String, AppError> {
    if !meta.content_hash.is_empty() {
        return Ok(meta.content_hash.clone());
    }
    match source {
        RowSource::CsvFile(path) => hash_file(path).await,
        RowSource::Records { headers, rows } => Ok(hash_records(headers, rows)),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
