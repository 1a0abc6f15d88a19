//! Atomic chunk file writer.
//!
//! A chunk file is written to a temporary file next to its destination and
//! only appears under its final name on `finish()`. A writer dropped before
//! finishing (planning failed, job cancelled mid-spool) leaves nothing behind,
//! so a worker never picks up a half-written chunk.

use std::io::BufWriter;
use std::path::{Path, PathBuf};

use csv::{ByteRecord, Writer, WriterBuilder};
use tempfile::NamedTempFile;

use crate::error::AppError;

pub struct AtomicChunkWriter {
    writer: Writer<BufWriter<NamedTempFile>>,
    final_path: PathBuf,
    rows: u64,
}

impl AtomicChunkWriter {
    /// Creates the temporary file beside `final_path` and writes the header row.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CsvChunkError` if the parent directory cannot be
    /// determined or the temporary file cannot be created.
    pub fn create(final_path: impl AsRef<Path>, headers: &ByteRecord) -> Result<Self, AppError> {
        let final_path = final_path.as_ref().to_path_buf();

        let parent_dir = final_path.parent().ok_or_else(|| {
            AppError::CsvChunkError(format!(
                "Cannot determine parent directory for: {}",
                final_path.display()
            ))
        })?;

        let temp_file = NamedTempFile::new_in(parent_dir).map_err(|e| {
            AppError::CsvChunkError(format!("Failed to create temporary file: {}", e))
        })?;

        let mut writer = WriterBuilder::new()
            .flexible(true)
            .from_writer(BufWriter::new(temp_file));
        writer
            .write_byte_record(headers)
            .map_err(|e| AppError::CsvChunkError(format!("Failed to write header: {}", e)))?;

        Ok(Self {
            writer,
            final_path,
            rows: 0,
        })
    }

    pub fn write_row(&mut self, record: &ByteRecord) -> Result<(), AppError> {
        self.writer
            .write_byte_record(record)
            .map_err(|e| AppError::CsvChunkError(format!("Failed to write row: {}", e)))?;
        self.rows += 1;
        Ok(())
    }

    /// Data rows written so far (header excluded).
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Flushes all buffers and moves the file to its final path.
    ///
    /// On error the temporary file is cleaned up automatically.
    pub fn finish(self) -> Result<PathBuf, AppError> {
        let buf_writer = self.writer.into_inner().map_err(|e| {
            AppError::CsvChunkError(format!("Failed to flush CSV writer: {}", e.error()))
        })?;

        let named_temp = buf_writer.into_inner().map_err(|e| {
            AppError::CsvChunkError(format!("Failed to flush buffer: {}", e.error()))
        })?;

        named_temp.persist(&self.final_path).map_err(|e| {
            AppError::CsvChunkError(format!(
                "Failed to persist chunk file {}: {}",
                self.final_path.display(),
                e.error
            ))
        })?;

        Ok(self.final_path)
    }
}
