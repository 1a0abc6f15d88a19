//! Validation and chunk planning for a submitted job.
//!
//! `pending -> validating -> chunking -> processing` happens here; the plan
//! and the `processing` transition are committed together before any chunk
//! is enqueued.

use std::sync::Arc;

use crate::error::AppError;
use crate::ingest::engine::{JobRuntime, Shared};
use crate::ingest::queue::WorkItem;
use crate::models::{JobStatus, RowSource};
use crate::storage::jobs::{self, NewChunk};
use crate::streaming::{split_file, split_records, SpoolResult};
use crate::validation::{validate, validate_records};

/// Plans the job and enqueues its chunks. Failures end the job.
pub(crate) async fn plan_job(shared: Arc<Shared>, rt: Arc<JobRuntime>, source: RowSource) {
    let job_id = rt.job_id.clone();

    match plan(&shared, &rt, source).await {
        Ok(0) => shared.finish_job(&rt).await,
        Ok(chunks) => {
            tracing::info!(job_id = %job_id, chunks, "Job planned");
        }
        Err(e) => {
            let result = if matches!(e, AppError::Cancelled) {
                jobs::set_job_status(&shared.db, &job_id, JobStatus::Cancelled, None, &shared.auditor).await
            } else {
                tracing::warn!(job_id = %job_id, error = %e, "Job planning failed");
                jobs::fail_job(&shared.db, &job_id, &e, &shared.auditor).await
            };
            if let Err(db_err) = result {
                tracing::error!(job_id = %job_id, error = %db_err, "Failed to record planning outcome");
            }

            if let Err(io_err) = tokio::fs::remove_dir_all(&rt.spool_dir).await {
                if io_err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(job_id = %job_id, error = %io_err, "Failed to remove spool directory");
                }
            }

            shared.publish_job(&job_id).await;
            shared.progress.remove(&job_id);
            shared.forget(&job_id);
        }
    }
}

fn check_cancel(rt: &JobRuntime) -> Result<(), AppError> {
    if rt.is_cancelled() {
        Err(AppError::Cancelled)
    } else {
        Ok(())
    }
}

/// Returns the number of chunks planned.
async fn plan(shared: &Shared, rt: &Arc<JobRuntime>, source: RowSource) -> Result<usize, AppError> {
    let config = &shared.config;
    check_cancel(rt)?;

    jobs::set_job_status(&shared.db, &rt.job_id, JobStatus::Validating, None, &shared.auditor).await?;
    shared.publish_job(&rt.job_id).await;

    let headers = match &source {
        RowSource::CsvFile(path) => {
            let report = validate(path, config.max_file_size).await?;
            for warning in &report.warnings {
                tracing::info!(job_id = %rt.job_id, warning = ?warning, "Validation warning");
            }
            report.into_result()?.headers
        }
        RowSource::Records { headers, rows } => {
            if let Some(job) = jobs::get_job(&shared.db, &rt.job_id).await? {
                let size = job.file_size.max(0) as u64;
                if size > config.max_file_size {
                    return Err(AppError::FileTooLarge {
                        size_bytes: size,
                        limit_bytes: config.max_file_size,
                    });
                }
            }
            for warning in validate_records(headers, rows)? {
                tracing::info!(job_id = %rt.job_id, warning = ?warning, "Validation warning");
            }
            headers.clone()
        }
    };

    rt.schema.bind(&headers)?;
    check_cancel(rt)?;

    jobs::set_job_status(&shared.db, &rt.job_id, JobStatus::Chunking, None, &shared.auditor).await?;
    shared.publish_job(&rt.job_id).await;

    let SpoolResult {
        total_rows, chunks, ..
    } = match source {
        RowSource::CsvFile(path) => split_file(&path, &rt.spool_dir, config.max_rows_per_chunk).await?,
        RowSource::Records { headers, rows } => {
            split_records(headers, rows, &rt.spool_dir, config.max_rows_per_chunk).await?
        }
    };
    check_cancel(rt)?;

    let plan: Vec<NewChunk> = chunks
        .iter()
        .map(|c| NewChunk {
            chunk_number: c.chunk_number,
            start_row: c.start_row,
            end_row: c.end_row,
            file_path: Some(c.path.to_string_lossy().into_owned()),
        })
        .collect();

    rt.expect_chunks(plan.len() as i64);
    let job = jobs::commit_plan(&shared.db, &rt.job_id, total_rows, plan, &shared.auditor).await?;

    tracing::info!(
        job_id = %rt.job_id,
        total_rows,
        total_chunks = job.total_chunks,
        status = job.status.as_str(),
        "Chunk plan committed"
    );
    shared.publish_job(&rt.job_id).await;

    for chunk in &chunks {
        let item = WorkItem {
            job_id: rt.job_id.clone(),
            chunk_number: chunk.chunk_number,
            priority: rt.priority,
            attempt: 0,
        };
        if let Err(e) = shared.queue.enqueue(item).await {
            tracing::error!(job_id = %rt.job_id, chunk_number = chunk.chunk_number, error = %e, "Failed to enqueue chunk");
            shared.settle_unqueued(rt, chunk.chunk_number, &e).await;
        }
    }

    Ok(chunks.len())
}
