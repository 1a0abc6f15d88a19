//! Job, chunk, error and audit persistence for SQLite.
//!
//! Every status change runs in one transaction together with its audit entry,
//! and refuses transitions the status enums do not allow.

use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::error::{db_error, AppError};
use crate::models::{
    current_timestamp_ms, AuditEntity, AuditLogEntry, ChunkStatus, ErrorType, JobContext,
    JobStatus, NewProcessingError, ProcessingError, ProcessingStrategy, ResolutionStatus,
    UploadChunk, UploadJob,
};
use crate::storage::database::{open_connection, Database};

// ─────────────────────────────────────────────────────────────────────────────
// DTOs
// ─────────────────────────────────────────────────────────────────────────────

/// A chunk produced by the planner, not yet persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewChunk {
    pub chunk_number: i64,
    pub start_row: i64,
    pub end_row: i64,
    pub file_path: Option<String>,
}

/// Result of permanently failing a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkFailure {
    /// Rows of the chunk that had no recorded outcome and were counted as failed.
    pub failed_rows: i64,
}

/// Who is writing audit entries, and whether they are written at all.
#[derive(Debug, Clone)]
pub struct Auditor {
    enabled: bool,
    actor: String,
}

impl Auditor {
    pub fn new(enabled: bool, actor: impl Into<String>) -> Self {
        Self {
            enabled,
            actor: actor.into(),
        }
    }

    /// Same switch, different actor.
    pub fn with_actor(&self, actor: impl Into<String>) -> Self {
        Self {
            enabled: self.enabled,
            actor: actor.into(),
        }
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        conn: &Connection,
        entity: AuditEntity,
        job_id: &str,
        chunk_number: Option<i64>,
        previous_state: Option<&str>,
        new_state: &str,
        message: Option<&str>,
        now: i64,
    ) -> Result<(), AppError> {
        if !self.enabled {
            return Ok(());
        }

        conn.execute(
            r#"
            INSERT INTO audit_log (entity_type, job_id, chunk_number, actor, previous_state, new_state, message, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            rusqlite::params![
                entity.as_str(),
                job_id,
                chunk_number,
                self.actor,
                previous_state,
                new_state,
                message,
                now,
            ],
        )
        .map_err(|e| db_error("Failed to write audit entry", e))?;

        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────────────────────────

const JOB_COLUMNS: &str = "id, content_hash, file_name, file_type, file_size, schema_version, \
    status, total_rows, processed_rows, successful_rows, failed_rows, duplicate_rows, \
    total_chunks, strategy, priority, retry_count, max_retries, retry_of, user_id, \
    organization_id, ip_address, error_message, cancel_requested, created_at, updated_at, \
    started_at, completed_at, processing_time_ms, rows_per_second";

const CHUNK_COLUMNS: &str = "job_id, chunk_number, start_row, end_row, status, attempts, \
    successful_rows, failed_rows, duplicate_rows, worker_id, error_message, file_path, \
    created_at, updated_at, started_at, completed_at";

fn parse_column<T>(idx: usize, value: String, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parse(&value).ok_or(rusqlite::Error::InvalidColumnType(
        idx,
        value,
        rusqlite::types::Type::Text,
    ))
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UploadJob> {
    let strategy: String = row.get(13)?;
    Ok(UploadJob {
        id: row.get(0)?,
        content_hash: row.get(1)?,
        file_name: row.get(2)?,
        file_type: row.get(3)?,
        file_size: row.get(4)?,
        schema_version: row.get(5)?,
        status: parse_column(6, row.get(6)?, JobStatus::parse)?,
        total_rows: row.get(7)?,
        processed_rows: row.get(8)?,
        successful_rows: row.get(9)?,
        failed_rows: row.get(10)?,
        duplicate_rows: row.get(11)?,
        total_chunks: row.get(12)?,
        strategy: ProcessingStrategy::from_str_lossy(&strategy),
        priority: row.get(14)?,
        retry_count: row.get(15)?,
        max_retries: row.get(16)?,
        retry_of: row.get(17)?,
        context: JobContext {
            user_id: row.get(18)?,
            organization_id: row.get(19)?,
            ip_address: row.get(20)?,
        },
        error_message: row.get(21)?,
        cancel_requested: row.get(22)?,
        created_at: row.get(23)?,
        updated_at: row.get(24)?,
        started_at: row.get(25)?,
        completed_at: row.get(26)?,
        processing_time_ms: row.get(27)?,
        rows_per_second: row.get(28)?,
    })
}

fn chunk_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UploadChunk> {
    Ok(UploadChunk {
        job_id: row.get(0)?,
        chunk_number: row.get(1)?,
        start_row: row.get(2)?,
        end_row: row.get(3)?,
        status: parse_column(4, row.get(4)?, ChunkStatus::parse)?,
        attempts: row.get(5)?,
        successful_rows: row.get(6)?,
        failed_rows: row.get(7)?,
        duplicate_rows: row.get(8)?,
        worker_id: row.get(9)?,
        error_message: row.get(10)?,
        file_path: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        started_at: row.get(14)?,
        completed_at: row.get(15)?,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Runs `f` on a fresh connection in the blocking pool.
pub(super) async fn with_conn<T, F>(db: &Database, task: &'static str, f: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T, AppError> + Send + 'static,
{
    let db_path = db.db_path().clone();

    tokio::task::spawn_blocking(move || {
        let mut conn = open_connection(&db_path)?;
        f(&mut conn)
    })
    .await
    .map_err(|e| AppError::Internal(format!("{task} task failed: {e}")))?
}

pub(super) fn begin(conn: &mut Connection) -> Result<rusqlite::Transaction<'_>, AppError> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| db_error("Failed to start transaction", e))
}

fn load_job(conn: &Connection, job_id: &str) -> Result<Option<UploadJob>, AppError> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM upload_jobs WHERE id = ?1"),
        [job_id],
        job_from_row,
    )
    .optional()
    .map_err(|e| db_error("Failed to load job", e))
}

fn require_job(conn: &Connection, job_id: &str) -> Result<UploadJob, AppError> {
    load_job(conn, job_id)?.ok_or_else(|| AppError::JobNotFound(job_id.to_string()))
}

fn load_chunk(
    conn: &Connection,
    job_id: &str,
    chunk_number: i64,
) -> Result<UploadChunk, AppError> {
    conn.query_row(
        &format!("SELECT {CHUNK_COLUMNS} FROM upload_chunks WHERE job_id = ?1 AND chunk_number = ?2"),
        rusqlite::params![job_id, chunk_number],
        chunk_from_row,
    )
    .optional()
    .map_err(|e| db_error("Failed to load chunk", e))?
    .ok_or_else(|| AppError::NotFound(format!("Chunk {chunk_number} of job {job_id}")))
}

/// Moves a job to `next` inside an open transaction and writes the audit entry.
/// Terminal moves also stamp completion time and throughput.
fn transition_job(
    conn: &Connection,
    job_id: &str,
    next: JobStatus,
    error_message: Option<&str>,
    auditor: &Auditor,
    now: i64,
) -> Result<UploadJob, AppError> {
    let job = require_job(conn, job_id)?;
    if !job.status.can_transition_to(next) {
        return Err(AppError::InvalidTransition {
            entity: "job",
            from: job.status.as_str().to_string(),
            to: next.as_str().to_string(),
        });
    }

    let started_at = match (next, job.started_at) {
        (JobStatus::Processing, None) => Some(now),
        (_, started) => started,
    };

    let (completed_at, processing_time_ms, rows_per_second) = if next.is_terminal() {
        let elapsed_ms = (now - started_at.unwrap_or(job.created_at)).max(0);
        let rate = if elapsed_ms > 0 {
            job.processed_rows as f64 / (elapsed_ms as f64 / 1000.0)
        } else {
            job.processed_rows as f64
        };
        (Some(now), Some(elapsed_ms), Some(rate))
    } else {
        (None, None, None)
    };

    conn.execute(
        r#"
        UPDATE upload_jobs
        SET status = ?1,
            error_message = COALESCE(?2, error_message),
            started_at = ?3,
            completed_at = ?4,
            processing_time_ms = ?5,
            rows_per_second = ?6,
            updated_at = ?7
        WHERE id = ?8
        "#,
        rusqlite::params![
            next.as_str(),
            error_message,
            started_at,
            completed_at,
            processing_time_ms,
            rows_per_second,
            now,
            job_id,
        ],
    )
    .map_err(|e| db_error("Failed to update job status", e))?;

    auditor.record(
        conn,
        AuditEntity::Job,
        job_id,
        None,
        Some(job.status.as_str()),
        next.as_str(),
        error_message,
        now,
    )?;

    require_job(conn, job_id)
}

/// Moves a chunk to `next` inside an open transaction and writes the audit entry.
fn transition_chunk(
    conn: &Connection,
    chunk: &UploadChunk,
    next: ChunkStatus,
    message: Option<&str>,
    auditor: &Auditor,
    now: i64,
) -> Result<(), AppError> {
    if !chunk.status.can_transition_to(next) {
        return Err(AppError::InvalidTransition {
            entity: "chunk",
            from: chunk.status.as_str().to_string(),
            to: next.as_str().to_string(),
        });
    }

    conn.execute(
        r#"
        UPDATE upload_chunks
        SET status = ?1,
            error_message = COALESCE(?2, error_message),
            started_at = CASE WHEN ?1 = 'processing' THEN ?3 ELSE started_at END,
            completed_at = CASE WHEN ?1 IN ('completed', 'failed', 'cancelled') THEN ?3 ELSE completed_at END,
            updated_at = ?3
        WHERE job_id = ?4 AND chunk_number = ?5
        "#,
        rusqlite::params![next.as_str(), message, now, chunk.job_id, chunk.chunk_number],
    )
    .map_err(|e| db_error("Failed to update chunk status", e))?;

    auditor.record(
        conn,
        AuditEntity::Chunk,
        &chunk.job_id,
        Some(chunk.chunk_number),
        Some(chunk.status.as_str()),
        next.as_str(),
        message,
        now,
    )
}

/// Inserts a processing error row on an open connection or transaction.
pub(crate) fn insert_processing_error_with(
    conn: &Connection,
    error: &NewProcessingError,
    now: i64,
) -> Result<i64, AppError> {
    conn.execute(
        r#"
        INSERT INTO processing_errors (job_id, chunk_number, row_number, error_type, error_code, message, field, raw_row, retryable, resolution, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        rusqlite::params![
            error.job_id,
            error.chunk_number,
            error.row_number,
            error.error_type.as_str(),
            error.error_code,
            error.message,
            error.field,
            error.raw_row,
            error.retryable,
            ResolutionStatus::Unresolved.as_str(),
            now,
        ],
    )
    .map_err(|e| db_error("Failed to insert processing error", e))?;

    Ok(conn.last_insert_rowid())
}

// ─────────────────────────────────────────────────────────────────────────────
// Jobs
// ─────────────────────────────────────────────────────────────────────────────

/// Saves a new job and its creation audit entry.
pub async fn insert_job(db: &Database, job: &UploadJob, auditor: &Auditor) -> Result<(), AppError> {
    let job = job.clone();
    let auditor = auditor.clone();

    with_conn(db, "Insert job", move |conn| {
        let tx = begin(conn)?;

        tx.execute(
            &format!(
                "INSERT INTO upload_jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, \
                 ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29)"
            ),
            rusqlite::params![
                job.id,
                job.content_hash,
                job.file_name,
                job.file_type,
                job.file_size,
                job.schema_version,
                job.status.as_str(),
                job.total_rows,
                job.processed_rows,
                job.successful_rows,
                job.failed_rows,
                job.duplicate_rows,
                job.total_chunks,
                job.strategy.as_str(),
                job.priority,
                job.retry_count,
                job.max_retries,
                job.retry_of,
                job.context.user_id,
                job.context.organization_id,
                job.context.ip_address,
                job.error_message,
                job.cancel_requested,
                job.created_at,
                job.updated_at,
                job.started_at,
                job.completed_at,
                job.processing_time_ms,
                job.rows_per_second,
            ],
        )
        .map_err(|e| db_error("Failed to insert job", e))?;

        auditor.record(
            &tx,
            AuditEntity::Job,
            &job.id,
            None,
            None,
            job.status.as_str(),
            job.retry_of.as_deref().map(|_| "retry of a previous job"),
            job.created_at,
        )?;

        tx.commit().map_err(|e| db_error("Failed to commit job", e))?;
        Ok(())
    })
    .await
}

/// Gets a job by id.
pub async fn get_job(db: &Database, job_id: &str) -> Result<Option<UploadJob>, AppError> {
    let job_id = job_id.to_string();
    with_conn(db, "Get job", move |conn| load_job(conn, &job_id)).await
}

/// Lists non-terminal jobs, oldest first.
pub async fn list_active_jobs(db: &Database) -> Result<Vec<UploadJob>, AppError> {
    with_conn(db, "List active jobs", move |conn| {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM upload_jobs \
                 WHERE status NOT IN ('completed', 'failed', 'cancelled', 'partially_completed') \
                 ORDER BY created_at ASC"
            ))
            .map_err(|e| db_error("Failed to prepare query", e))?;

        let jobs = stmt
            .query_map([], job_from_row)
            .map_err(|e| db_error("Failed to query jobs", e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| db_error("Failed to collect jobs", e))?;

        Ok(jobs)
    })
    .await
}

/// Moves a job to `next`, recording `error_message` when given.
pub async fn set_job_status(
    db: &Database,
    job_id: &str,
    next: JobStatus,
    error_message: Option<&str>,
    auditor: &Auditor,
) -> Result<UploadJob, AppError> {
    let job_id = job_id.to_string();
    let error_message = error_message.map(|s| s.to_string());
    let auditor = auditor.clone();

    with_conn(db, "Set job status", move |conn| {
        let tx = begin(conn)?;
        let job = transition_job(
            &tx,
            &job_id,
            next,
            error_message.as_deref(),
            &auditor,
            current_timestamp_ms(),
        )?;
        tx.commit().map_err(|e| db_error("Failed to commit job status", e))?;
        Ok(job)
    })
    .await
}

/// Fails a job during planning and records why.
pub async fn fail_job(
    db: &Database,
    job_id: &str,
    error: &AppError,
    auditor: &Auditor,
) -> Result<UploadJob, AppError> {
    let job_id = job_id.to_string();
    let auditor = auditor.clone();
    let record = NewProcessingError {
        job_id: job_id.clone(),
        chunk_number: None,
        row_number: None,
        error_type: error.error_type(),
        error_code: error.code().to_string(),
        message: error.to_string(),
        field: None,
        raw_row: None,
        retryable: false,
    };

    with_conn(db, "Fail job", move |conn| {
        let now = current_timestamp_ms();
        let tx = begin(conn)?;
        insert_processing_error_with(&tx, &record, now)?;
        let job = transition_job(
            &tx,
            &job_id,
            JobStatus::Failed,
            Some(&record.message),
            &auditor,
            now,
        )?;
        tx.commit().map_err(|e| db_error("Failed to commit job failure", e))?;
        Ok(job)
    })
    .await
}

/// Persists the chunk plan and moves the job out of `chunking` in one transaction.
///
/// With no chunks the job completes immediately; otherwise it becomes `processing`.
pub async fn commit_plan(
    db: &Database,
    job_id: &str,
    total_rows: i64,
    chunks: Vec<NewChunk>,
    auditor: &Auditor,
) -> Result<UploadJob, AppError> {
    let job_id = job_id.to_string();
    let auditor = auditor.clone();

    with_conn(db, "Commit plan", move |conn| {
        let now = current_timestamp_ms();
        let tx = begin(conn)?;

        let job = require_job(&tx, &job_id)?;
        if job.status != JobStatus::Chunking {
            return Err(AppError::InvalidTransition {
                entity: "job",
                from: job.status.as_str().to_string(),
                to: JobStatus::Processing.as_str().to_string(),
            });
        }

        {
            let mut stmt = tx
                .prepare(
                    r#"
                    INSERT INTO upload_chunks (job_id, chunk_number, start_row, end_row, status, file_path, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                    "#,
                )
                .map_err(|e| db_error("Failed to prepare chunk insert", e))?;

            for chunk in &chunks {
                stmt.execute(rusqlite::params![
                    job_id,
                    chunk.chunk_number,
                    chunk.start_row,
                    chunk.end_row,
                    ChunkStatus::Pending.as_str(),
                    chunk.file_path,
                    now,
                ])
                .map_err(|e| db_error("Failed to insert chunk", e))?;

                auditor.record(
                    &tx,
                    AuditEntity::Chunk,
                    &job_id,
                    Some(chunk.chunk_number),
                    None,
                    ChunkStatus::Pending.as_str(),
                    None,
                    now,
                )?;
            }
        }

        tx.execute(
            "UPDATE upload_jobs SET total_rows = ?1, total_chunks = ?2, updated_at = ?3 WHERE id = ?4",
            rusqlite::params![total_rows, chunks.len() as i64, now, job_id],
        )
        .map_err(|e| db_error("Failed to record plan totals", e))?;

        let next = if chunks.is_empty() {
            JobStatus::Completed
        } else {
            JobStatus::Processing
        };
        let job = transition_job(&tx, &job_id, next, None, &auditor, now)?;

        tx.commit().map_err(|e| db_error("Failed to commit plan", e))?;
        Ok(job)
    })
    .await
}

/// Flags a job for cancellation. Returns the job; terminal jobs are left as they are.
pub async fn request_cancel(db: &Database, job_id: &str) -> Result<UploadJob, AppError> {
    let job_id = job_id.to_string();

    with_conn(db, "Request cancel", move |conn| {
        let now = current_timestamp_ms();
        conn.execute(
            r#"
            UPDATE upload_jobs SET cancel_requested = 1, updated_at = ?1
            WHERE id = ?2
              AND status NOT IN ('completed', 'failed', 'cancelled', 'partially_completed')
            "#,
            rusqlite::params![now, job_id],
        )
        .map_err(|e| db_error("Failed to flag cancellation", e))?;

        require_job(conn, &job_id)
    })
    .await
}

/// Decides the terminal status of a job whose chunks have all settled.
///
/// Already-terminal jobs are returned unchanged.
pub async fn finalize_job(
    db: &Database,
    job_id: &str,
    auditor: &Auditor,
) -> Result<UploadJob, AppError> {
    let job_id = job_id.to_string();
    let auditor = auditor.clone();

    with_conn(db, "Finalize job", move |conn| {
        let now = current_timestamp_ms();
        let tx = begin(conn)?;

        let job = require_job(&tx, &job_id)?;
        if job.status.is_terminal() {
            return Ok(job);
        }

        let (total, completed, unsettled): (i64, i64, i64) = tx
            .query_row(
                r#"
                SELECT COUNT(*),
                       COALESCE(SUM(status = 'completed'), 0),
                       COALESCE(SUM(status IN ('pending', 'processing', 'retrying')), 0)
                FROM upload_chunks WHERE job_id = ?1
                "#,
                [&job_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(|e| db_error("Failed to summarize chunks", e))?;

        if unsettled > 0 {
            return Err(AppError::Internal(format!(
                "Job {job_id} still has {unsettled} unsettled chunks"
            )));
        }

        let next = final_status(&job, total, completed);
        let job = transition_job(&tx, &job_id, next, None, &auditor, now)?;

        tx.commit().map_err(|e| db_error("Failed to commit finalization", e))?;
        Ok(job)
    })
    .await
}

/// Terminal status for a job whose chunks have settled.
fn final_status(job: &UploadJob, total_chunks: i64, completed_chunks: i64) -> JobStatus {
    let loaded = job.successful_rows + job.duplicate_rows;

    if job.cancel_requested {
        JobStatus::Cancelled
    } else if completed_chunks == total_chunks && job.failed_rows == 0 {
        JobStatus::Completed
    } else if completed_chunks == 0 || (loaded == 0 && job.failed_rows > 0) {
        JobStatus::Failed
    } else {
        JobStatus::PartiallyCompleted
    }
}

/// Deletes terminal jobs older than the retention window together with their
/// chunks and row ledger. Errors and audit entries are kept.
/// Returns the number of deleted jobs.
pub async fn cleanup_old_jobs(db: &Database, retention_days: i64) -> Result<u64, AppError> {
    let cutoff = current_timestamp_ms() - retention_days * 24 * 60 * 60 * 1000;

    with_conn(db, "Cleanup", move |conn| {
        let tx = begin(conn)?;

        let job_ids: Vec<String> = {
            let mut stmt = tx
                .prepare(
                    r#"
                    SELECT id FROM upload_jobs
                    WHERE status IN ('completed', 'failed', 'cancelled', 'partially_completed')
                    AND COALESCE(completed_at, updated_at) < ?1
                    "#,
                )
                .map_err(|e| db_error("Failed to prepare query", e))?;

            let rows = stmt
                .query_map([cutoff], |row| row.get(0))
                .map_err(|e| db_error("Failed to query old jobs", e))?;

            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| db_error("Failed to collect job IDs", e))?
        };

        for job_id in &job_ids {
            tx.execute("DELETE FROM chunk_row_outcomes WHERE job_id = ?1", [job_id])
                .map_err(|e| db_error("Failed to delete row outcomes", e))?;
            tx.execute("DELETE FROM upload_chunks WHERE job_id = ?1", [job_id])
                .map_err(|e| db_error("Failed to delete chunks", e))?;
            tx.execute("DELETE FROM upload_jobs WHERE id = ?1", [job_id])
                .map_err(|e| db_error("Failed to delete job", e))?;
        }

        tx.commit().map_err(|e| db_error("Failed to commit cleanup", e))?;

        Ok(job_ids.len() as u64)
    })
    .await
}

/// Settles jobs left unfinished by a previous process.
///
/// Jobs still planning are failed. Jobs that were processing get every
/// unsettled chunk failed (its unrecorded rows count as failed) and are then
/// finalized. Returns the ids of the jobs touched.
pub async fn reconcile_interrupted_jobs(
    db: &Database,
    auditor: &Auditor,
) -> Result<Vec<String>, AppError> {
    let jobs = list_active_jobs(db).await?;
    let interrupted = AppError::Internal("interrupted by a service restart".into());
    let mut touched = Vec::with_capacity(jobs.len());

    for job in jobs {
        if job.status == JobStatus::Processing {
            for chunk in get_job_chunks(db, &job.id).await? {
                if chunk.status.is_terminal() {
                    continue;
                }
                fail_chunk(db, &job.id, chunk.chunk_number, &interrupted, auditor).await?;
            }
            finalize_job(db, &job.id, auditor).await?;
        } else {
            fail_job(db, &job.id, &interrupted, auditor).await?;
        }

        tracing::warn!(job_id = %job.id, status = job.status.as_str(), "Reconciled interrupted job");
        touched.push(job.id);
    }

    Ok(touched)
}

// ─────────────────────────────────────────────────────────────────────────────
// Chunks
// ─────────────────────────────────────────────────────────────────────────────

/// Lists a job's chunks in chunk order.
pub async fn get_job_chunks(db: &Database, job_id: &str) -> Result<Vec<UploadChunk>, AppError> {
    let job_id = job_id.to_string();

    with_conn(db, "Get chunks", move |conn| {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CHUNK_COLUMNS} FROM upload_chunks WHERE job_id = ?1 ORDER BY chunk_number ASC"
            ))
            .map_err(|e| db_error("Failed to prepare query", e))?;

        let chunks = stmt
            .query_map([&job_id], chunk_from_row)
            .map_err(|e| db_error("Failed to query chunks", e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| db_error("Failed to collect chunks", e))?;

        Ok(chunks)
    })
    .await
}

/// Claims a waiting chunk for processing. A `retrying` chunk passes through
/// `pending` first so both moves are audited.
pub async fn start_chunk(
    db: &Database,
    job_id: &str,
    chunk_number: i64,
    auditor: &Auditor,
) -> Result<UploadChunk, AppError> {
    let job_id = job_id.to_string();
    let auditor = auditor.clone();

    with_conn(db, "Start chunk", move |conn| {
        let now = current_timestamp_ms();
        let tx = begin(conn)?;

        let mut chunk = load_chunk(&tx, &job_id, chunk_number)?;
        if chunk.status == ChunkStatus::Retrying {
            transition_chunk(&tx, &chunk, ChunkStatus::Pending, None, &auditor, now)?;
            chunk.status = ChunkStatus::Pending;
        }
        transition_chunk(&tx, &chunk, ChunkStatus::Processing, None, &auditor, now)?;

        let chunk = load_chunk(&tx, &job_id, chunk_number)?;
        tx.commit().map_err(|e| db_error("Failed to commit chunk start", e))?;
        Ok(chunk)
    })
    .await
}

/// Records which worker picked up a chunk.
pub async fn assign_worker(
    db: &Database,
    job_id: &str,
    chunk_number: i64,
    worker_id: &str,
) -> Result<(), AppError> {
    let job_id = job_id.to_string();
    let worker_id = worker_id.to_string();

    with_conn(db, "Assign worker", move |conn| {
        conn.execute(
            "UPDATE upload_chunks SET worker_id = ?1 WHERE job_id = ?2 AND chunk_number = ?3",
            rusqlite::params![worker_id, job_id, chunk_number],
        )
        .map_err(|e| db_error("Failed to assign worker", e))?;
        Ok(())
    })
    .await
}

/// Marks a processing chunk completed.
pub async fn complete_chunk(
    db: &Database,
    job_id: &str,
    chunk_number: i64,
    auditor: &Auditor,
) -> Result<UploadChunk, AppError> {
    let job_id = job_id.to_string();
    let auditor = auditor.clone();

    with_conn(db, "Complete chunk", move |conn| {
        let now = current_timestamp_ms();
        let tx = begin(conn)?;

        let chunk = load_chunk(&tx, &job_id, chunk_number)?;
        transition_chunk(&tx, &chunk, ChunkStatus::Completed, None, &auditor, now)?;

        let chunk = load_chunk(&tx, &job_id, chunk_number)?;
        tx.commit().map_err(|e| db_error("Failed to commit chunk completion", e))?;
        Ok(chunk)
    })
    .await
}

/// Sends a failed attempt back for retry. Returns the new attempt count.
pub async fn retry_chunk(
    db: &Database,
    job_id: &str,
    chunk_number: i64,
    error: &AppError,
    auditor: &Auditor,
) -> Result<i64, AppError> {
    let job_id = job_id.to_string();
    let message = error.to_string();
    let auditor = auditor.clone();

    with_conn(db, "Retry chunk", move |conn| {
        let now = current_timestamp_ms();
        let tx = begin(conn)?;

        let chunk = load_chunk(&tx, &job_id, chunk_number)?;
        transition_chunk(&tx, &chunk, ChunkStatus::Retrying, Some(&message), &auditor, now)?;

        tx.execute(
            "UPDATE upload_chunks SET attempts = attempts + 1 WHERE job_id = ?1 AND chunk_number = ?2",
            rusqlite::params![job_id, chunk_number],
        )
        .map_err(|e| db_error("Failed to bump attempts", e))?;

        tx.commit().map_err(|e| db_error("Failed to commit chunk retry", e))?;
        Ok(chunk.attempts + 1)
    })
    .await
}

/// Fails a chunk permanently.
///
/// Rows in the chunk's range without a recorded outcome are ledgered and
/// counted as failed on both the chunk and the job, and one chunk-level
/// processing error is written.
pub async fn fail_chunk(
    db: &Database,
    job_id: &str,
    chunk_number: i64,
    error: &AppError,
    auditor: &Auditor,
) -> Result<ChunkFailure, AppError> {
    let job_id = job_id.to_string();
    let auditor = auditor.clone();
    let record = NewProcessingError {
        job_id: job_id.clone(),
        chunk_number: Some(chunk_number),
        row_number: None,
        error_type: error.error_type(),
        error_code: error.code().to_string(),
        message: error.to_string(),
        field: None,
        raw_row: None,
        retryable: error.is_retryable(),
    };

    with_conn(db, "Fail chunk", move |conn| {
        let now = current_timestamp_ms();
        let tx = begin(conn)?;

        let chunk = load_chunk(&tx, &job_id, chunk_number)?;
        transition_chunk(&tx, &chunk, ChunkStatus::Failed, Some(&record.message), &auditor, now)?;

        if chunk.status == ChunkStatus::Processing {
            tx.execute(
                "UPDATE upload_chunks SET attempts = attempts + 1 WHERE job_id = ?1 AND chunk_number = ?2",
                rusqlite::params![job_id, chunk_number],
            )
            .map_err(|e| db_error("Failed to bump attempts", e))?;
        }

        let mut failed_rows = 0i64;
        {
            let mut stmt = tx
                .prepare(
                    r#"
                    INSERT OR IGNORE INTO chunk_row_outcomes (job_id, row_number, chunk_number, outcome)
                    VALUES (?1, ?2, ?3, 'failed')
                    "#,
                )
                .map_err(|e| db_error("Failed to prepare ledger insert", e))?;

            for row_number in chunk.start_row..chunk.end_row {
                failed_rows += stmt
                    .execute(rusqlite::params![job_id, row_number, chunk_number])
                    .map_err(|e| db_error("Failed to ledger failed row", e))?
                    as i64;
            }
        }

        if failed_rows > 0 {
            tx.execute(
                r#"
                UPDATE upload_chunks SET failed_rows = failed_rows + ?1
                WHERE job_id = ?2 AND chunk_number = ?3
                "#,
                rusqlite::params![failed_rows, job_id, chunk_number],
            )
            .map_err(|e| db_error("Failed to count chunk failures", e))?;

            tx.execute(
                r#"
                UPDATE upload_jobs
                SET failed_rows = failed_rows + ?1, processed_rows = processed_rows + ?1, updated_at = ?2
                WHERE id = ?3
                "#,
                rusqlite::params![failed_rows, now, job_id],
            )
            .map_err(|e| db_error("Failed to count job failures", e))?;
        }

        insert_processing_error_with(&tx, &record, now)?;

        tx.commit().map_err(|e| db_error("Failed to commit chunk failure", e))?;
        Ok(ChunkFailure { failed_rows })
    })
    .await
}

/// Cancels a chunk if it has not started. Returns false when it was no longer waiting.
pub async fn cancel_chunk(
    db: &Database,
    job_id: &str,
    chunk_number: i64,
    auditor: &Auditor,
) -> Result<bool, AppError> {
    let job_id = job_id.to_string();
    let auditor = auditor.clone();

    with_conn(db, "Cancel chunk", move |conn| {
        let now = current_timestamp_ms();
        let tx = begin(conn)?;

        let chunk = load_chunk(&tx, &job_id, chunk_number)?;
        if !chunk.status.can_transition_to(ChunkStatus::Cancelled) {
            return Ok(false);
        }
        transition_chunk(&tx, &chunk, ChunkStatus::Cancelled, None, &auditor, now)?;

        tx.commit().map_err(|e| db_error("Failed to commit chunk cancel", e))?;
        Ok(true)
    })
    .await
}

/// Cancels every chunk of a job that has not started. Returns their numbers.
pub async fn cancel_waiting_chunks(
    db: &Database,
    job_id: &str,
    auditor: &Auditor,
) -> Result<Vec<i64>, AppError> {
    let job_id = job_id.to_string();
    let auditor = auditor.clone();

    with_conn(db, "Cancel chunks", move |conn| {
        let now = current_timestamp_ms();
        let tx = begin(conn)?;

        let waiting: Vec<UploadChunk> = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT {CHUNK_COLUMNS} FROM upload_chunks \
                     WHERE job_id = ?1 AND status IN ('pending', 'retrying') \
                     ORDER BY chunk_number ASC"
                ))
                .map_err(|e| db_error("Failed to prepare query", e))?;

            let rows = stmt
                .query_map([&job_id], chunk_from_row)
                .map_err(|e| db_error("Failed to query waiting chunks", e))?;

            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| db_error("Failed to collect waiting chunks", e))?
        };

        for chunk in &waiting {
            transition_chunk(&tx, chunk, ChunkStatus::Cancelled, None, &auditor, now)?;
        }

        tx.commit().map_err(|e| db_error("Failed to commit chunk cancels", e))?;
        Ok(waiting.into_iter().map(|c| c.chunk_number).collect())
    })
    .await
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors and audit
// ─────────────────────────────────────────────────────────────────────────────

/// Records a processing error.
pub async fn insert_processing_error(
    db: &Database,
    error: NewProcessingError,
) -> Result<i64, AppError> {
    with_conn(db, "Insert processing error", move |conn| {
        insert_processing_error_with(conn, &error, current_timestamp_ms())
    })
    .await
}

/// Lists a job's processing errors in the order they were recorded.
pub async fn list_processing_errors(
    db: &Database,
    job_id: &str,
) -> Result<Vec<ProcessingError>, AppError> {
    let job_id = job_id.to_string();

    with_conn(db, "List processing errors", move |conn| {
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, job_id, chunk_number, row_number, error_type, error_code, message, field, raw_row, retryable, resolution, created_at
                FROM processing_errors
                WHERE job_id = ?1
                ORDER BY id ASC
                "#,
            )
            .map_err(|e| db_error("Failed to prepare query", e))?;

        let errors = stmt
            .query_map([&job_id], |row| {
                let error_type: String = row.get(4)?;
                let resolution: String = row.get(10)?;
                Ok(ProcessingError {
                    id: row.get(0)?,
                    job_id: row.get(1)?,
                    chunk_number: row.get(2)?,
                    row_number: row.get(3)?,
                    error_type: ErrorType::from_str_lossy(&error_type),
                    error_code: row.get(5)?,
                    message: row.get(6)?,
                    field: row.get(7)?,
                    raw_row: row.get(8)?,
                    retryable: row.get(9)?,
                    resolution: ResolutionStatus::from_str_lossy(&resolution),
                    created_at: row.get(11)?,
                })
            })
            .map_err(|e| db_error("Failed to query processing errors", e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| db_error("Failed to collect processing errors", e))?;

        Ok(errors)
    })
    .await
}

/// Marks a processing error resolved or ignored. Returns false if it does not exist.
pub async fn resolve_processing_error(
    db: &Database,
    error_id: i64,
    resolution: ResolutionStatus,
) -> Result<bool, AppError> {
    with_conn(db, "Resolve processing error", move |conn| {
        let changed = conn
            .execute(
                "UPDATE processing_errors SET resolution = ?1 WHERE id = ?2",
                rusqlite::params![resolution.as_str(), error_id],
            )
            .map_err(|e| db_error("Failed to resolve processing error", e))?;
        Ok(changed > 0)
    })
    .await
}

/// Lists a job's audit entries in write order.
pub async fn list_audit_log(db: &Database, job_id: &str) -> Result<Vec<AuditLogEntry>, AppError> {
    let job_id = job_id.to_string();

    with_conn(db, "List audit log", move |conn| {
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, entity_type, job_id, chunk_number, actor, previous_state, new_state, message, created_at
                FROM audit_log
                WHERE job_id = ?1
                ORDER BY id ASC
                "#,
            )
            .map_err(|e| db_error("Failed to prepare query", e))?;

        let entries = stmt
            .query_map([&job_id], |row| {
                let entity: String = row.get(1)?;
                Ok(AuditLogEntry {
                    id: row.get(0)?,
                    entity_type: if entity == "chunk" {
                        AuditEntity::Chunk
                    } else {
                        AuditEntity::Job
                    },
                    job_id: row.get(2)?,
                    chunk_number: row.get(3)?,
                    actor: row.get(4)?,
                    previous_state: row.get(5)?,
                    new_state: row.get(6)?,
                    message: row.get(7)?,
                    created_at: row.get(8)?,
                })
            })
            .map_err(|e| db_error("Failed to query audit log", e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| db_error("Failed to collect audit log", e))?;

        Ok(entries)
    })
    .await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) async fn test_db() -> (TempDir, Database) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = Database::init(temp_dir.path().join("test.db"))
            .await
            .expect("Failed to init database");
        (temp_dir, db)
    }

    pub(crate) fn new_job(id: &str) -> UploadJob {
        let now = current_timestamp_ms();
        UploadJob {
            id: id.to_string(),
            content_hash: "abc".into(),
            file_name: "invoices.csv".into(),
            file_type: "text/csv".into(),
            file_size: 1024,
            schema_version: None,
            status: JobStatus::Pending,
            total_rows: 0,
            processed_rows: 0,
            successful_rows: 0,
            failed_rows: 0,
            duplicate_rows: 0,
            total_chunks: 0,
            strategy: ProcessingStrategy::Parallel,
            priority: 0,
            retry_count: 0,
            max_retries: 3,
            retry_of: None,
            context: JobContext::default(),
            error_message: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            processing_time_ms: None,
            rows_per_second: None,
        }
    }

    fn auditor() -> Auditor {
        Auditor::new(true, "test")
    }

    /// Inserts a job and walks it to `processing` with chunks of `size` rows.
    pub(crate) async fn planned_job(db: &Database, id: &str, total_rows: i64, size: i64) -> UploadJob {
        let a = auditor();
        insert_job(db, &new_job(id), &a).await.expect("insert");
        set_job_status(db, id, JobStatus::Validating, None, &a).await.expect("validating");
        set_job_status(db, id, JobStatus::Chunking, None, &a).await.expect("chunking");

        let chunks = (0..total_rows)
            .step_by(size as usize)
            .enumerate()
            .map(|(n, start)| NewChunk {
                chunk_number: n as i64,
                start_row: start,
                end_row: (start + size).min(total_rows),
                file_path: None,
            })
            .collect();

        commit_plan(db, id, total_rows, chunks, &a).await.expect("plan")
    }

    #[tokio::test]
    async fn insert_and_get_job() {
        let (_dir, db) = test_db().await;
        insert_job(&db, &new_job("job-1"), &auditor()).await.expect("insert");

        let job = get_job(&db, "job-1").await.expect("get").expect("exists");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.file_name, "invoices.csv");

        assert!(get_job(&db, "missing").await.expect("get").is_none());

        let audit = list_audit_log(&db, "job-1").await.expect("audit");
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].previous_state, None);
        assert_eq!(audit[0].new_state, "pending");
    }

    #[tokio::test]
    async fn backwards_transition_is_refused() {
        let (_dir, db) = test_db().await;
        let a = auditor();
        insert_job(&db, &new_job("job-1"), &a).await.expect("insert");
        set_job_status(&db, "job-1", JobStatus::Validating, None, &a).await.expect("ok");

        let err = set_job_status(&db, "job-1", JobStatus::Pending, None, &a)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));

        let job = get_job(&db, "job-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Validating);
    }

    #[tokio::test]
    async fn commit_plan_moves_to_processing() {
        let (_dir, db) = test_db().await;
        let job = planned_job(&db, "job-1", 25, 10).await;

        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.total_rows, 25);
        assert_eq!(job.total_chunks, 3);
        assert!(job.started_at.is_some());

        let chunks = get_job_chunks(&db, "job-1").await.unwrap();
        let ranges: Vec<_> = chunks.iter().map(|c| (c.start_row, c.end_row)).collect();
        assert_eq!(ranges, vec![(0, 10), (10, 20), (20, 25)]);
        assert!(chunks.iter().all(|c| c.status == ChunkStatus::Pending));
    }

    #[tokio::test]
    async fn empty_plan_completes_job() {
        let (_dir, db) = test_db().await;
        let job = planned_job(&db, "job-1", 0, 10).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.total_chunks, 0);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn plan_requires_chunking_status() {
        let (_dir, db) = test_db().await;
        insert_job(&db, &new_job("job-1"), &auditor()).await.unwrap();

        let err = commit_plan(&db, "job-1", 0, vec![], &auditor()).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
        assert!(get_job_chunks(&db, "job-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn chunk_retry_cycle_is_audited() {
        let (_dir, db) = test_db().await;
        planned_job(&db, "job-1", 10, 10).await;
        let a = auditor();

        start_chunk(&db, "job-1", 0, &a).await.unwrap();
        let attempts = retry_chunk(&db, "job-1", 0, &AppError::ChunkIo("eof".into()), &a)
            .await
            .unwrap();
        assert_eq!(attempts, 1);

        let chunk = start_chunk(&db, "job-1", 0, &a).await.unwrap();
        assert_eq!(chunk.status, ChunkStatus::Processing);
        assert_eq!(chunk.attempts, 1);

        let chunk = complete_chunk(&db, "job-1", 0, &a).await.unwrap();
        assert_eq!(chunk.status, ChunkStatus::Completed);

        let states: Vec<_> = list_audit_log(&db, "job-1")
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.entity_type == AuditEntity::Chunk)
            .map(|e| e.new_state)
            .collect();
        assert_eq!(
            states,
            vec!["pending", "processing", "retrying", "pending", "processing", "completed"]
        );
    }

    #[tokio::test]
    async fn completed_chunk_cannot_restart() {
        let (_dir, db) = test_db().await;
        planned_job(&db, "job-1", 10, 10).await;
        let a = auditor();

        start_chunk(&db, "job-1", 0, &a).await.unwrap();
        complete_chunk(&db, "job-1", 0, &a).await.unwrap();

        let err = start_chunk(&db, "job-1", 0, &a).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
        assert!(!cancel_chunk(&db, "job-1", 0, &a).await.unwrap());
    }

    #[tokio::test]
    async fn fail_chunk_counts_unrecorded_rows() {
        let (_dir, db) = test_db().await;
        planned_job(&db, "job-1", 10, 10).await;
        let a = auditor();

        start_chunk(&db, "job-1", 0, &a).await.unwrap();

        // Three rows already have outcomes.
        let conn = open_connection(db.db_path()).unwrap();
        for row in 0..3 {
            conn.execute(
                "INSERT INTO chunk_row_outcomes (job_id, row_number, chunk_number, outcome) VALUES ('job-1', ?1, 0, 'success')",
                [row],
            )
            .unwrap();
        }

        let failure = fail_chunk(&db, "job-1", 0, &AppError::ChunkIo("gone".into()), &a)
            .await
            .unwrap();
        assert_eq!(failure.failed_rows, 7);

        let job = get_job(&db, "job-1").await.unwrap().unwrap();
        assert_eq!(job.failed_rows, 7);
        assert_eq!(job.processed_rows, 7);

        let errors = list_processing_errors(&db, "job-1").await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].chunk_number, Some(0));
        assert_eq!(errors[0].row_number, None);

        // Failing again is refused and counts nothing twice.
        assert!(fail_chunk(&db, "job-1", 0, &AppError::ChunkIo("gone".into()), &a)
            .await
            .is_err());
        let job = get_job(&db, "job-1").await.unwrap().unwrap();
        assert_eq!(job.failed_rows, 7);
    }

    #[tokio::test]
    async fn cancel_waiting_leaves_running_chunks() {
        let (_dir, db) = test_db().await;
        planned_job(&db, "job-1", 50, 10).await;
        let a = auditor();

        start_chunk(&db, "job-1", 0, &a).await.unwrap();
        start_chunk(&db, "job-1", 1, &a).await.unwrap();
        retry_chunk(&db, "job-1", 1, &AppError::ChunkIo("x".into()), &a)
            .await
            .unwrap();

        let cancelled = cancel_waiting_chunks(&db, "job-1", &a).await.unwrap();
        assert_eq!(cancelled, vec![1, 2, 3, 4]);

        let chunks = get_job_chunks(&db, "job-1").await.unwrap();
        assert_eq!(chunks[0].status, ChunkStatus::Processing);
        assert!(chunks[1..].iter().all(|c| c.status == ChunkStatus::Cancelled));

        assert!(cancel_waiting_chunks(&db, "job-1", &a).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finalize_decides_status() {
        let (_dir, db) = test_db().await;
        let a = auditor();

        // All chunks completed, nothing failed.
        planned_job(&db, "ok", 10, 10).await;
        start_chunk(&db, "ok", 0, &a).await.unwrap();
        complete_chunk(&db, "ok", 0, &a).await.unwrap();
        let conn = open_connection(db.db_path()).unwrap();
        conn.execute(
            "UPDATE upload_jobs SET successful_rows = 10, processed_rows = 10 WHERE id = 'ok'",
            [],
        )
        .unwrap();
        let job = finalize_job(&db, "ok", &a).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.processing_time_ms.is_some());
        assert!(job.rows_per_second.is_some());

        // One completed chunk, one failed chunk.
        planned_job(&db, "mixed", 20, 10).await;
        start_chunk(&db, "mixed", 0, &a).await.unwrap();
        complete_chunk(&db, "mixed", 0, &a).await.unwrap();
        conn.execute(
            "UPDATE upload_jobs SET successful_rows = 10, processed_rows = 10 WHERE id = 'mixed'",
            [],
        )
        .unwrap();
        fail_chunk(&db, "mixed", 1, &AppError::ChunkIo("x".into()), &a)
            .await
            .unwrap();
        let job = finalize_job(&db, "mixed", &a).await.unwrap();
        assert_eq!(job.status, JobStatus::PartiallyCompleted);
        assert_eq!(job.processed_rows, job.successful_rows + job.failed_rows + job.duplicate_rows);

        // Every chunk failed.
        planned_job(&db, "bad", 10, 10).await;
        fail_chunk(&db, "bad", 0, &AppError::ChunkIo("x".into()), &a)
            .await
            .unwrap();
        let job = finalize_job(&db, "bad", &a).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);

        // Finalizing twice returns the terminal job unchanged.
        let again = finalize_job(&db, "bad", &a).await.unwrap();
        assert_eq!(again.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn finalize_refuses_unsettled_chunks() {
        let (_dir, db) = test_db().await;
        planned_job(&db, "job-1", 10, 10).await;

        assert!(finalize_job(&db, "job-1", &auditor()).await.is_err());
    }

    #[tokio::test]
    async fn cancelled_job_finalizes_as_cancelled() {
        let (_dir, db) = test_db().await;
        let a = auditor();
        planned_job(&db, "job-1", 20, 10).await;

        start_chunk(&db, "job-1", 0, &a).await.unwrap();
        let job = request_cancel(&db, "job-1").await.unwrap();
        assert!(job.cancel_requested);

        cancel_waiting_chunks(&db, "job-1", &a).await.unwrap();
        complete_chunk(&db, "job-1", 0, &a).await.unwrap();

        let job = finalize_job(&db, "job-1", &a).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        // Cancelling a terminal job changes nothing.
        let job = request_cancel(&db, "job-1").await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn fail_job_records_error() {
        let (_dir, db) = test_db().await;
        let a = auditor();
        insert_job(&db, &new_job("job-1"), &a).await.unwrap();
        set_job_status(&db, "job-1", JobStatus::Validating, None, &a).await.unwrap();

        let job = fail_job(&db, "job-1", &AppError::CsvInvalid("no header".into()), &a)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("no header"));

        let errors = list_processing_errors(&db, "job-1").await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_type, ErrorType::Parsing);
    }

    #[tokio::test]
    async fn resolve_processing_error_updates_resolution() {
        let (_dir, db) = test_db().await;
        let id = insert_processing_error(
            &db,
            NewProcessingError {
                job_id: "job-1".into(),
                chunk_number: Some(0),
                row_number: Some(4),
                error_type: ErrorType::Validation,
                error_code: "VALIDATION_FAILED".into(),
                message: "bad".into(),
                field: Some("Quantity".into()),
                raw_row: None,
                retryable: false,
            },
        )
        .await
        .unwrap();

        assert!(resolve_processing_error(&db, id, ResolutionStatus::Ignored).await.unwrap());
        assert!(!resolve_processing_error(&db, 9999, ResolutionStatus::Resolved).await.unwrap());

        let errors = list_processing_errors(&db, "job-1").await.unwrap();
        assert_eq!(errors[0].resolution, ResolutionStatus::Ignored);
    }

    #[tokio::test]
    async fn audit_can_be_disabled() {
        let (_dir, db) = test_db().await;
        let quiet = Auditor::new(false, "test");
        insert_job(&db, &new_job("job-1"), &quiet).await.unwrap();
        set_job_status(&db, "job-1", JobStatus::Validating, None, &quiet)
            .await
            .unwrap();

        assert!(list_audit_log(&db, "job-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cleanup_keeps_errors_and_audit() {
        let (_dir, db) = test_db().await;
        let a = auditor();
        planned_job(&db, "old", 10, 10).await;
        fail_chunk(&db, "old", 0, &AppError::ChunkIo("x".into()), &a).await.unwrap();
        finalize_job(&db, "old", &a).await.unwrap();

        planned_job(&db, "active", 10, 10).await;

        // Push the finished job outside the retention window.
        let conn = open_connection(db.db_path()).unwrap();
        conn.execute("UPDATE upload_jobs SET completed_at = 0 WHERE id = 'old'", [])
            .unwrap();

        let deleted = cleanup_old_jobs(&db, 1).await.unwrap();
        assert_eq!(deleted, 1);

        assert!(get_job(&db, "old").await.unwrap().is_none());
        assert!(get_job_chunks(&db, "old").await.unwrap().is_empty());
        assert!(get_job(&db, "active").await.unwrap().is_some());
        assert_eq!(list_processing_errors(&db, "old").await.unwrap().len(), 1);
        assert!(!list_audit_log(&db, "old").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconcile_settles_interrupted_jobs() {
        let (_dir, db) = test_db().await;
        let a = auditor();

        planned_job(&db, "running", 20, 10).await;
        start_chunk(&db, "running", 0, &a).await.unwrap();
        complete_chunk(&db, "running", 0, &a).await.unwrap();
        let conn = open_connection(db.db_path()).unwrap();
        conn.execute(
            "UPDATE upload_jobs SET successful_rows = 10, processed_rows = 10 WHERE id = 'running'",
            [],
        )
        .unwrap();
        start_chunk(&db, "running", 1, &a).await.unwrap();

        insert_job(&db, &new_job("planning"), &a).await.unwrap();
        set_job_status(&db, "planning", JobStatus::Validating, None, &a).await.unwrap();

        let touched = reconcile_interrupted_jobs(&db, &a).await.unwrap();
        assert_eq!(touched.len(), 2);

        let running = get_job(&db, "running").await.unwrap().unwrap();
        assert_eq!(running.status, JobStatus::PartiallyCompleted);
        assert_eq!(running.failed_rows, 10);

        let planning = get_job(&db, "planning").await.unwrap().unwrap();
        assert_eq!(planning.status, JobStatus::Failed);

        assert!(list_active_jobs(&db).await.unwrap().is_empty());
    }
}
