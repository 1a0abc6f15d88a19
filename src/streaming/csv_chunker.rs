//! Record-aware splitting of a job's rows into chunk files.
//!
//! Uses the `csv` crate so embedded commas and newlines inside quoted fields
//! never split a record. Each chunk file carries the original header row and
//! covers the half-open data-row range `[start_row, end_row)`; ranges are
//! contiguous from 0 and every chunk but the last holds exactly
//! `max_rows_per_chunk` rows.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use csv::{ByteRecord, ReaderBuilder};

use super::atomic_writer::AtomicChunkWriter;
use crate::error::AppError;

/// One spooled chunk file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpooledChunk {
    pub chunk_number: i64,
    pub start_row: i64,
    pub end_row: i64,
    pub path: PathBuf,
}

impl SpooledChunk {
    pub fn row_count(&self) -> i64 {
        self.end_row - self.start_row
    }
}

/// Result of spooling a row source into chunk files.
#[derive(Debug, Clone, Default)]
pub struct SpoolResult {
    pub headers: Vec<String>,
    /// Total data rows (header excluded).
    pub total_rows: i64,
    pub chunks: Vec<SpooledChunk>,
}

/// File name of a chunk inside the job's spool directory.
pub fn chunk_file_name(chunk_number: i64) -> String {
    format!("chunk_{:04}.csv", chunk_number)
}

/// Computes the `[start, end)` ranges for `total_rows` rows.
///
/// Yields `ceil(total_rows / max_rows_per_chunk)` ranges; zero rows yield none.
pub fn plan_ranges(total_rows: i64, max_rows_per_chunk: usize) -> Vec<(i64, i64)> {
    let size = max_rows_per_chunk.max(1) as i64;
    (0..total_rows)
        .step_by(size as usize)
        .map(|start| (start, (start + size).min(total_rows)))
        .collect()
}

/// Splits a CSV file into chunk files under `spool_dir`.
///
/// # Errors
///
/// Returns `AppError::CsvChunkError` if the source cannot be read, has no
/// header or a chunk file cannot be written.
pub async fn split_file(
    source: &Path,
    spool_dir: &Path,
    max_rows_per_chunk: usize,
) -> Result<SpoolResult, AppError> {
    tokio::fs::create_dir_all(spool_dir)
        .await
        .map_err(|e| AppError::CsvChunkError(format!("Failed to create spool directory: {}", e)))?;

    let source = source.to_owned();
    let spool_dir = spool_dir.to_owned();

    tokio::task::spawn_blocking(move || {
        let file = File::open(&source)
            .map_err(|e| AppError::CsvChunkError(format!("Failed to open source file: {}", e)))?;

        // Ragged rows are spooled as-is and rejected one by one in the worker.
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(BufReader::new(file));

        let headers = reader
            .byte_headers()
            .map_err(|e| AppError::CsvChunkError(format!("Failed to read CSV headers: {}", e)))?
            .clone();

        let records = reader.into_byte_records().map(|r| {
            r.map_err(|e| AppError::CsvChunkError(format!("Failed to read CSV record: {}", e)))
        });

        spool_blocking(&headers, records, &spool_dir, max_rows_per_chunk)
    })
    .await
    .map_err(|e| AppError::CsvChunkError(format!("Task join error: {}", e)))?
}

/// Spools already-decoded rows into chunk files under `spool_dir`.
pub async fn split_records(
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    spool_dir: &Path,
    max_rows_per_chunk: usize,
) -> Result<SpoolResult, AppError> {
    tokio::fs::create_dir_all(spool_dir)
        .await
        .map_err(|e| AppError::CsvChunkError(format!("Failed to create spool directory: {}", e)))?;

    let spool_dir = spool_dir.to_owned();

    tokio::task::spawn_blocking(move || {
        let headers = ByteRecord::from(headers);
        let records = rows.into_iter().map(|row| Ok(ByteRecord::from(row)));
        spool_blocking(&headers, records, &spool_dir, max_rows_per_chunk)
    })
    .await
    .map_err(|e| AppError::CsvChunkError(format!("Task join error: {}", e)))?
}

fn spool_blocking<I>(
    headers: &ByteRecord,
    records: I,
    spool_dir: &Path,
    max_rows_per_chunk: usize,
) -> Result<SpoolResult, AppError>
where
    I: Iterator<Item = Result<ByteRecord, AppError>>,
{
    if headers.is_empty() || headers.iter().all(|h| h.iter().all(u8::is_ascii_whitespace)) {
        return Err(AppError::CsvChunkError("CSV file has no header row".to_string()));
    }

    let header_names = headers
        .iter()
        .map(|h| String::from_utf8_lossy(h).trim().to_string())
        .collect();

    let max_rows = max_rows_per_chunk.max(1) as u64;
    let mut chunks = Vec::new();
    let mut total_rows: i64 = 0;
    let mut current: Option<AtomicChunkWriter> = None;

    for record in records {
        let record = record?;

        if current.as_ref().map_or(true, |w| w.rows() >= max_rows) {
            if let Some(full) = current.take() {
                finish_chunk(full, &mut chunks, total_rows)?;
            }
            let path = spool_dir.join(chunk_file_name(chunks.len() as i64));
            current = Some(AtomicChunkWriter::create(path, headers)?);
        }

        if let Some(writer) = current.as_mut() {
            writer.write_row(&record)?;
            total_rows += 1;
        }
    }

    if let Some(last) = current.take() {
        finish_chunk(last, &mut chunks, total_rows)?;
    }

    tracing::debug!(
        spool_dir = %spool_dir.display(),
        total_rows,
        chunk_count = chunks.len(),
        "Spooled chunk files"
    );

    Ok(SpoolResult {
        headers: header_names,
        total_rows,
        chunks,
    })
}

fn finish_chunk(
    writer: AtomicChunkWriter,
    chunks: &mut Vec<SpooledChunk>,
    end_row: i64,
) -> Result<(), AppError> {
    let start_row = end_row - writer.rows() as i64;
    let path = writer.finish()?;
    chunks.push(SpooledChunk {
        chunk_number: chunks.len() as i64,
        start_row,
        end_row,
        path,
    });
    Ok(())
}
