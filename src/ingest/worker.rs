//! Processing of a single chunk.
//!
//! Rows are read from the chunk's spool file, checked against the job's
//! schema in their original order and written in batches. Rows already in
//! the ledger from an earlier attempt are skipped, so a retried chunk never
//! counts a row twice.
//!
//! A row that cannot be read (wrong column count, bytes that are not UTF-8)
//! fails on its own with a parsing error; the rest of the chunk carries on.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use csv::{ByteRecord, StringRecord};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::ingest::dedup::DedupPolicy;
use crate::storage::records::{BatchOutcome, BatchRow, RowBatch, RowWriter};
use crate::validation::{BoundSchema, FieldError, RowSchema, ValidatedRow};

/// Everything a worker needs to run one chunk attempt.
#[derive(Debug, Clone)]
pub struct ChunkWork {
    pub job_id: String,
    pub chunk_number: i64,
    pub start_row: i64,
    pub end_row: i64,
    pub file_path: PathBuf,
    pub schema: Arc<RowSchema>,
    pub dedup: DedupPolicy,
    pub batch_size: usize,
}

/// Runs one attempt of a chunk and returns the rows it settled.
///
/// `shutdown` is checked between batches; `on_batch` is called after every
/// committed batch and must not block.
pub async fn process_chunk(
    writer: &dyn RowWriter,
    work: &ChunkWork,
    shutdown: &CancellationToken,
    on_batch: &(dyn Fn(&BatchOutcome) + Send + Sync),
) -> Result<BatchOutcome, AppError> {
    let done = writer.completed_rows(&work.job_id, work.chunk_number).await?;
    let mut total = BatchOutcome::default();

    if done.len() as i64 >= work.end_row - work.start_row {
        total.skipped = done.len() as i64;
        return Ok(total);
    }

    let (headers, records) = read_chunk_file(&work.file_path).await?;
    if records.len() as i64 != work.end_row - work.start_row {
        return Err(AppError::CsvChunkError(format!(
            "chunk file {} holds {} rows, expected {}",
            work.file_path.display(),
            records.len(),
            work.end_row - work.start_row
        )));
    }

    let bound = work.schema.bind(&headers)?;
    let batch_size = work.batch_size.max(1);
    let mut rows = Vec::with_capacity(batch_size);

    for (offset, record) in records.into_iter().enumerate() {
        let row_number = work.start_row + offset as i64;
        if done.contains(&row_number) {
            total.skipped += 1;
            continue;
        }

        let (raw, result) = check_row(&bound, &headers, record);
        rows.push(BatchRow {
            row_number,
            raw,
            result,
        });

        if rows.len() >= batch_size {
            let outcome = flush(writer, work, &mut rows, shutdown).await?;
            on_batch(&outcome);
            total.absorb(outcome);
        }
    }

    if !rows.is_empty() {
        let outcome = flush(writer, work, &mut rows, shutdown).await?;
        on_batch(&outcome);
        total.absorb(outcome);
    }

    tracing::debug!(
        job_id = %work.job_id,
        chunk_number = work.chunk_number,
        successful = total.successful,
        failed = total.failed,
        duplicate = total.duplicate,
        skipped = total.skipped,
        "Chunk attempt finished"
    );

    Ok(total)
}

async fn flush(
    writer: &dyn RowWriter,
    work: &ChunkWork,
    rows: &mut Vec<BatchRow>,
    shutdown: &CancellationToken,
) -> Result<BatchOutcome, AppError> {
    if shutdown.is_cancelled() {
        return Err(AppError::Cancelled);
    }

    writer
        .write_batch(RowBatch {
            job_id: work.job_id.clone(),
            chunk_number: work.chunk_number,
            dedup: work.dedup,
            rows: std::mem::take(rows),
        })
        .await
}

/// Decodes one spooled record and runs it through the schema.
fn check_row(
    bound: &BoundSchema<'_>,
    headers: &[String],
    record: ByteRecord,
) -> (Option<String>, ValidatedRow) {
    let record = match StringRecord::from_byte_record(record) {
        Ok(record) => record,
        Err(e) => {
            let field = e.utf8_error().field();
            let lossy: Vec<String> = e
                .into_byte_record()
                .iter()
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .collect();
            let values: Vec<&str> = lossy.iter().map(String::as_str).collect();
            let name = headers
                .get(field)
                .cloned()
                .unwrap_or_else(|| column_name(field));
            return (
                raw_row(headers, &values),
                unreadable(
                    Some(name.clone()),
                    AppError::InvalidFieldFormat {
                        field: name,
                        message: "value is not valid UTF-8".into(),
                    },
                ),
            );
        }
    };

    let values: Vec<&str> = record.iter().collect();
    let raw = raw_row(headers, &values);
    if values.len() != headers.len() {
        let error = AppError::CsvInvalid(format!(
            "row has {} columns, header has {}",
            values.len(),
            headers.len()
        ));
        return (raw, unreadable(None, error));
    }

    (raw, bound.process(&values))
}

fn unreadable(field: Option<String>, error: AppError) -> ValidatedRow {
    ValidatedRow::Invalid(vec![FieldError { field, error }])
}

fn column_name(index: usize) -> String {
    format!("column_{}", index + 1)
}

/// Original values keyed by header, stored on processing errors.
/// Values past the last header are keyed by position.
fn raw_row(headers: &[String], values: &[&str]) -> Option<String> {
    let map: Map<String, Value> = values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let key = headers.get(i).cloned().unwrap_or_else(|| column_name(i));
            (key, Value::String((*v).to_string()))
        })
        .collect();
    serde_json::to_string(&map).ok()
}

async fn read_chunk_file(path: &Path) -> Result<(Vec<String>, Vec<ByteRecord>), AppError> {
    let path = path.to_owned();

    tokio::task::spawn_blocking(move || {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&path)
            .map_err(|e| AppError::ChunkIo(format!("Failed to open {}: {}", path.display(), e)))?;

        let headers = reader
            .headers()
            .map_err(|e| AppError::CsvChunkError(format!("Failed to read chunk header: {}", e)))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let records = reader
            .byte_records()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::CsvChunkError(format!("Failed to read chunk row: {}", e)))?;

        Ok((headers, records))
    })
    .await
    .map_err(|e| AppError::Internal(format!("Chunk read task failed: {}", e)))?
}
