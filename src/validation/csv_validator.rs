//! Upload validation for the `validating` phase of a job.
//!
//! CSV files are checked from a fixed-size sample (512 KB) so very large
//! uploads are rejected early without reading them twice:
//! - size limit
//! - UTF-8 encoding
//! - missing headers
//!
//! Rows whose column count differs from the header are only warned about
//! here; each one is rejected on its own when its chunk is processed.

use std::io::Cursor;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::AppError;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Size of the sample buffer for validation (512 KB).
pub const VALIDATION_SAMPLE_SIZE: usize = 512 * 1024;

/// Maximum number of records to validate in the sample.
const MAX_RECORDS_TO_VALIDATE: usize = 1000;

/// UTF-8 BOM bytes.
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

// ─────────────────────────────────────────────────────────────────────────────
// Public Types
// ─────────────────────────────────────────────────────────────────────────────

/// Result of upload validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvValidationResult {
    /// Whether the file passed validation (no errors).
    pub ok: bool,
    pub errors: Vec<CsvValidationError>,
    pub warnings: Vec<CsvValidationWarning>,
    pub stats: CsvValidationStats,
}

/// Statistics collected during validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CsvValidationStats {
    pub file_size_bytes: u64,
    /// Bytes actually inspected (sample size or file size if smaller).
    pub sample_bytes: u64,
    pub headers: Vec<String>,
    pub line_endings: LineEndings,
    /// Estimated data rows based on the sample average.
    pub estimated_total_rows: Option<u64>,
}

/// Detected line ending style.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineEndings {
    LF,
    CRLF,
    Mixed,
    #[default]
    Unknown,
}

/// Problems that stop a job in the `validating` phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CsvValidationError {
    TooLarge { size_bytes: u64, limit_bytes: u64 },
    NotUtf8,
    EmptyFile,
    NoHeaders,
    CsvParseError { message: String },
}

/// Issues worth logging that do not stop the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CsvValidationWarning {
    HasBom,
    MixedLineEndings,
    SampleOnlyValidation { validated_rows: u64 },
    InconsistentColumns {
        expected: usize,
        found: usize,
        /// 1-based line of the record, header included.
        row: u64,
    },
}

impl CsvValidationError {
    /// Converts the problem into the crate error recorded against the job.
    pub fn to_app_error(&self) -> AppError {
        match self {
            CsvValidationError::TooLarge {
                size_bytes,
                limit_bytes,
            } => AppError::FileTooLarge {
                size_bytes: *size_bytes,
                limit_bytes: *limit_bytes,
            },
            CsvValidationError::NotUtf8 => AppError::NotUtf8,
            CsvValidationError::EmptyFile => AppError::CsvInvalid("file is empty".into()),
            CsvValidationError::NoHeaders => AppError::CsvInvalid("no header row".into()),
            CsvValidationError::CsvParseError { message } => AppError::CsvInvalid(message.clone()),
        }
    }
}

impl CsvValidationResult {
    fn failed(error: CsvValidationError, warnings: Vec<CsvValidationWarning>, stats: CsvValidationStats) -> Self {
        Self {
            ok: false,
            errors: vec![error],
            warnings,
            stats,
        }
    }

    /// Returns the stats when the file passed, otherwise the first error.
    pub fn into_result(self) -> Result<CsvValidationStats, AppError> {
        match self.errors.first() {
            Some(error) => Err(error.to_app_error()),
            None => Ok(self.stats),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Public API
// ─────────────────────────────────────────────────────────────────────────────

/// Validates an uploaded CSV file from a sample of its first bytes.
///
/// Returns `AppError` only for I/O failures; validation problems are reported
/// in `CsvValidationResult.errors`.
pub async fn validate(path: &Path, max_file_size: u64) -> Result<CsvValidationResult, AppError> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| AppError::ChunkIo(format!("Failed to read file metadata: {}", e)))?;

    let file_size_bytes = metadata.len();
    let mut stats = CsvValidationStats {
        file_size_bytes,
        ..CsvValidationStats::default()
    };

    if file_size_bytes > max_file_size {
        return Ok(CsvValidationResult::failed(
            CsvValidationError::TooLarge {
                size_bytes: file_size_bytes,
                limit_bytes: max_file_size,
            },
            warnings,
            stats,
        ));
    }

    if file_size_bytes == 0 {
        return Ok(CsvValidationResult::failed(
            CsvValidationError::EmptyFile,
            warnings,
            stats,
        ));
    }

    // Read sample buffer
    let sample_size = (file_size_bytes as usize).min(VALIDATION_SAMPLE_SIZE);
    let mut buffer = vec![0u8; sample_size];

    let mut file = File::open(path)
        .await
        .map_err(|e| AppError::ChunkIo(format!("Failed to open file: {}", e)))?;

    file.read_exact(&mut buffer)
        .await
        .map_err(|e| AppError::ChunkIo(format!("Failed to read file: {}", e)))?;

    stats.sample_bytes = sample_size as u64;
    let is_sample_only = file_size_bytes > stats.sample_bytes;

    let has_bom = buffer.starts_with(UTF8_BOM);
    if has_bom {
        warnings.push(CsvValidationWarning::HasBom);
    }
    let data = &buffer[if has_bom { UTF8_BOM.len() } else { 0 }..];

    // A multi-byte character cut by the sample boundary is not an encoding error.
    if let Err(e) = std::str::from_utf8(data) {
        if !(is_sample_only && e.error_len().is_none()) {
            return Ok(CsvValidationResult::failed(
                CsvValidationError::NotUtf8,
                warnings,
                stats,
            ));
        }
    }

    stats.line_endings = detect_line_endings(data);
    if stats.line_endings == LineEndings::Mixed {
        warnings.push(CsvValidationWarning::MixedLineEndings);
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(Cursor::new(data));

    let headers: Vec<String> = match reader.headers() {
        Ok(h) => h.iter().map(|s| s.trim().to_string()).collect(),
        Err(e) => {
            return Ok(CsvValidationResult::failed(
                CsvValidationError::CsvParseError {
                    message: e.to_string(),
                },
                warnings,
                stats,
            ));
        }
    };

    if headers.iter().all(|h| h.is_empty()) {
        return Ok(CsvValidationResult::failed(
            CsvValidationError::NoHeaders,
            warnings,
            stats,
        ));
    }

    let column_count = headers.len();
    let mut validated_rows: u64 = 0;
    let mut total_record_bytes: usize = 0;
    // The last sampled record may be cut short by the sample boundary, so a
    // mismatch is only reported once a following record has been read.
    let mut pending: Option<CsvValidationWarning> = None;

    for result in reader.records().take(MAX_RECORDS_TO_VALIDATE) {
        match result {
            Ok(record) => {
                if let Some(warning) = pending.take() {
                    warnings.push(warning);
                }
                validated_rows += 1;
                total_record_bytes +=
                    record.iter().map(|f| f.len()).sum::<usize>() + record.len() + 1;

                if record.len() != column_count {
                    pending = Some(CsvValidationWarning::InconsistentColumns {
                        expected: column_count,
                        found: record.len(),
                        row: validated_rows + 1,
                    });
                }
            }
            Err(e) => {
                // A row cut off by the sample boundary is not a real error
                if is_sample_only && is_likely_truncation_error(&e) {
                    pending = None;
                    break;
                }

                errors.push(CsvValidationError::CsvParseError {
                    message: e.to_string(),
                });
                break;
            }
        }
    }

    if let Some(warning) = pending {
        if !is_sample_only {
            warnings.push(warning);
        }
    }

    if is_sample_only {
        warnings.push(CsvValidationWarning::SampleOnlyValidation { validated_rows });
    }

    stats.estimated_total_rows = if validated_rows > 0 && total_record_bytes > 0 {
        let avg_bytes_per_row = total_record_bytes as f64 / validated_rows as f64;
        let header_bytes = data.len().saturating_sub(total_record_bytes);
        let data_bytes = file_size_bytes.saturating_sub(header_bytes as u64);
        Some((data_bytes as f64 / avg_bytes_per_row).ceil() as u64)
    } else {
        Some(0)
    };
    stats.headers = headers;

    Ok(CsvValidationResult {
        ok: errors.is_empty(),
        errors,
        warnings,
        stats,
    })
}

/// Validates rows that intake already decoded (e.g. from a spreadsheet).
///
/// Ragged rows are returned as warnings; they fail individually later.
pub fn validate_records(
    headers: &[String],
    rows: &[Vec<String>],
) -> Result<Vec<CsvValidationWarning>, AppError> {
    if headers.iter().all(|h| h.trim().is_empty()) {
        return Err(CsvValidationError::NoHeaders.to_app_error());
    }

    Ok(rows
        .iter()
        .enumerate()
        .filter(|(_, row)| row.len() != headers.len())
        .map(|(idx, row)| CsvValidationWarning::InconsistentColumns {
            expected: headers.len(),
            found: row.len(),
            row: idx as u64 + 2,
        })
        .collect())
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Detects line ending style in the given bytes.
fn detect_line_endings(data: &[u8]) -> LineEndings {
    let mut has_lf = false;
    let mut has_crlf = false;

    let mut i = 0;
    while i < data.len() {
        if data[i] == b'\r' && i + 1 < data.len() && data[i + 1] == b'\n' {
            has_crlf = true;
            i += 2;
        } else if data[i] == b'\n' {
            has_lf = true;
            i += 1;
        } else {
            i += 1;
        }
    }

    match (has_lf, has_crlf) {
        (true, true) => LineEndings::Mixed,
        (true, false) => LineEndings::LF,
        (false, true) => LineEndings::CRLF,
        (false, false) => LineEndings::Unknown,
    }
}

/// Checks if the error is likely due to buffer truncation.
fn is_likely_truncation_error(err: &csv::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("unexpected eof") || msg.contains("premature eof")
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const NO_LIMIT: u64 = u64::MAX;

    fn create_temp_csv(content: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("Failed to create temp file");
        file.write_all(content).expect("Failed to write to temp file");
        file.flush().expect("Failed to flush temp file");
        file
    }

    #[tokio::test]
    async fn non_utf8_is_rejected() {
        let file = create_temp_csv(b"Name,Value\n\xff\xfe,123\n");

        let result = validate(file.path(), NO_LIMIT).await.expect("io ok");

        assert!(!result.ok);
        assert!(result.errors.contains(&CsvValidationError::NotUtf8));
        assert!(matches!(result.into_result(), Err(AppError::NotUtf8)));
    }

    #[tokio::test]
    async fn oversized_file_is_rejected_before_reading() {
        let file = create_temp_csv(b"Invoice ID,Item Name\n1,Rice\n");

        let result = validate(file.path(), 10).await.expect("io ok");

        assert!(matches!(
            result.errors[0],
            CsvValidationError::TooLarge { limit_bytes: 10, .. }
        ));
        assert!(matches!(
            result.into_result(),
            Err(AppError::FileTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn bom_is_a_warning() {
        let mut content = Vec::new();
        content.extend_from_slice(UTF8_BOM);
        content.extend_from_slice(b"Name,Value\nAlice,100\nBob,200\n");
        let file = create_temp_csv(&content);

        let result = validate(file.path(), NO_LIMIT).await.expect("io ok");

        assert!(result.ok);
        assert!(result.warnings.contains(&CsvValidationWarning::HasBom));
        assert_eq!(result.stats.headers, vec!["Name", "Value"]);
    }

    #[tokio::test]
    async fn truncated_row_at_sample_boundary_is_ignored() {
        let mut content = Vec::new();
        content.extend_from_slice(b"Id,Name,Description\n");
        let rows_needed = VALIDATION_SAMPLE_SIZE / 30 + 100;
        for i in 0..rows_needed {
            content.extend_from_slice(
                format!("{},\"Name{}\",\"Description for row {}\"\n", i, i, i).as_bytes(),
            );
        }
        assert!(content.len() > VALIDATION_SAMPLE_SIZE);
        let file = create_temp_csv(&content);

        let result = validate(file.path(), NO_LIMIT).await.expect("io ok");

        assert!(result.ok, "{:?}", result.errors);
        assert!(result
            .warnings
            .iter()
            .any(|w| matches!(w, CsvValidationWarning::SampleOnlyValidation { .. })));
        assert!(result.stats.estimated_total_rows.unwrap_or(0) > 1000);
    }

    #[tokio::test]
    async fn inconsistent_columns_are_a_warning() {
        let file = create_temp_csv(b"Name,Value\nAlice,100\nBob,200,Extra\nCharlie,300\n");

        let result = validate(file.path(), NO_LIMIT).await.expect("io ok");

        assert!(result.ok, "{:?}", result.errors);
        assert!(result.warnings.contains(&CsvValidationWarning::InconsistentColumns {
            expected: 2,
            found: 3,
            row: 3
        }));
        assert_eq!(result.into_result().unwrap().headers, vec!["Name", "Value"]);
    }

    #[tokio::test]
    async fn quoted_newlines_are_valid() {
        let file = create_temp_csv(b"Name,Desc\n\"John\",\"Line1\nLine2\"\n");

        let result = validate(file.path(), NO_LIMIT).await.expect("io ok");

        assert!(result.ok);
        assert_eq!(result.stats.line_endings, LineEndings::LF);
    }

    #[tokio::test]
    async fn empty_file_is_rejected() {
        let file = create_temp_csv(b"");

        let result = validate(file.path(), NO_LIMIT).await.expect("io ok");

        assert!(result.errors.contains(&CsvValidationError::EmptyFile));
    }

    #[tokio::test]
    async fn headers_only_is_valid() {
        let file = create_temp_csv(b"Name,Value,Description\n");

        let result = validate(file.path(), NO_LIMIT).await.expect("io ok");

        assert!(result.ok);
        assert_eq!(result.stats.estimated_total_rows, Some(0));
    }

    #[tokio::test]
    async fn mixed_line_endings_warn() {
        let file = create_temp_csv(b"Name,Value\r\nAlice,100\nBob,200\r\n");

        let result = validate(file.path(), NO_LIMIT).await.expect("io ok");

        assert_eq!(result.stats.line_endings, LineEndings::Mixed);
        assert!(result.warnings.contains(&CsvValidationWarning::MixedLineEndings));
    }

    #[test]
    fn ragged_records_are_warned_about() {
        let headers = vec!["a".to_string(), "b".to_string()];
        let good = vec![vec!["1".to_string(), "2".to_string()]];
        assert!(validate_records(&headers, &good).unwrap().is_empty());

        let ragged = vec![vec!["1".to_string(), "2".to_string()], vec!["3".to_string()]];
        let warnings = validate_records(&headers, &ragged).unwrap();
        assert_eq!(
            warnings,
            vec![CsvValidationWarning::InconsistentColumns {
                expected: 2,
                found: 1,
                row: 3
            }]
        );

        assert!(validate_records(&["".to_string()], &[]).is_err());
    }

    #[test]
    fn detects_line_endings() {
        assert_eq!(detect_line_endings(b"a\nb\n"), LineEndings::LF);
        assert_eq!(detect_line_endings(b"a\r\nb\r\n"), LineEndings::CRLF);
        assert_eq!(detect_line_endings(b"a\r\nb\n"), LineEndings::Mixed);
        assert_eq!(detect_line_endings(b"single line"), LineEndings::Unknown);
    }
}
