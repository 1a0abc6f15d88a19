use serde::Serialize;
use thiserror::Error;

use crate::models::ErrorType;

/// Patterns (lowercase) that indicate data not safe for display to uploaders.
/// Used by `contains_sensitive()` for case-insensitive matching.
pub(crate) const SENSITIVE_PATTERNS: &[&str] = &[
    "password=",
    "postgres://",
    "postgresql://",
    "secret",
    "authorization:",
];

/// Returns true if the message contains any sensitive pattern (case-insensitive).
fn contains_sensitive(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Sanitizes a message for display.
/// If sensitive content is detected, returns the fallback instead.
fn sanitize_message(msg: &str, fallback: &str) -> String {
    if contains_sensitive(msg) {
        fallback.into()
    } else {
        msg.to_string()
    }
}

/// User-friendly error presentation for API callers and dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPresentation {
    pub title: String,
    pub message: String,
    pub action: Option<String>,
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum AppError {
    // ── File / CSV ────────────────────────────────────────────────────────────
    #[error("File is not valid UTF-8")]
    NotUtf8,

    #[error("Invalid CSV: {0}")]
    CsvInvalid(String),

    #[error("CSV chunk error: {0}")]
    CsvChunkError(String),

    #[error("File is {size_bytes} bytes, limit is {limit_bytes}")]
    FileTooLarge { size_bytes: u64, limit_bytes: u64 },

    // ── Rows ──────────────────────────────────────────────────────────────────
    #[error("Field '{field}' has an invalid format: {message}")]
    InvalidFieldFormat { field: String, message: String },

    #[error("Field '{field}' failed validation: {message}")]
    ValidationFailed { field: String, message: String },

    #[error("Required field '{0}' is missing")]
    RequiredFieldMissing(String),

    #[error("Business rule violated: {0}")]
    BusinessRule(String),

    // ── Processing ────────────────────────────────────────────────────────────
    #[error("Chunk {chunk_number} timed out after {timeout_ms} ms")]
    ChunkTimeout { chunk_number: i64, timeout_ms: u64 },

    #[error("Job {job_id} exceeded its time budget")]
    JobTimeout { job_id: String },

    #[error("Chunk I/O error: {0}")]
    ChunkIo(String),

    #[error("Operation cancelled")]
    Cancelled,

    // ── Queue ─────────────────────────────────────────────────────────────────
    #[error("Work queue is full")]
    QueueFull,

    #[error("Work queue is closed")]
    QueueClosed,

    // ── Storage ───────────────────────────────────────────────────────────────
    #[error("Database error: {0}")]
    Database(String),

    #[error("Database busy: {0}")]
    DatabaseBusy(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Job {0} not found")]
    JobNotFound(String),

    // ── Lifecycle ─────────────────────────────────────────────────────────────
    #[error("Invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Job {job_id} cannot be retried: {reason}")]
    RetryRefused { job_id: String, reason: String },

    // ── Configuration ─────────────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Config(String),

    // ── Generic fallback ──────────────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Maps the error onto the persisted error taxonomy.
    pub fn error_type(&self) -> ErrorType {
        match self {
            AppError::NotUtf8
            | AppError::CsvInvalid(_)
            | AppError::CsvChunkError(_)
            | AppError::InvalidFieldFormat { .. } => ErrorType::Parsing,
            AppError::FileTooLarge { .. }
            | AppError::ValidationFailed { .. }
            | AppError::RequiredFieldMissing(_) => ErrorType::Validation,
            AppError::BusinessRule(_) => ErrorType::BusinessLogic,
            AppError::ChunkTimeout { .. } | AppError::JobTimeout { .. } => ErrorType::Timeout,
            AppError::ChunkIo(_) | AppError::Cancelled => ErrorType::Processing,
            AppError::Database(_) | AppError::DatabaseBusy(_) | AppError::NotFound(_) => {
                ErrorType::Database
            }
            AppError::ConstraintViolation(_) => ErrorType::ConstraintViolation,
            AppError::QueueFull
            | AppError::QueueClosed
            | AppError::JobNotFound(_)
            | AppError::InvalidTransition { .. }
            | AppError::RetryRefused { .. }
            | AppError::Config(_)
            | AppError::Internal(_) => ErrorType::System,
        }
    }

    /// Whether a chunk attempt that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::ChunkTimeout { .. } | AppError::DatabaseBusy(_) | AppError::ChunkIo(_)
        )
    }

    /// Short machine-readable code stored alongside processing errors.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidFieldFormat { .. } => "INVALID_FIELD_FORMAT",
            AppError::ValidationFailed { .. } => "VALIDATION_FAILED",
            AppError::RequiredFieldMissing(_) => "REQUIRED_FIELD_MISSING",
            AppError::FileTooLarge { .. } => "FILE_TOO_LARGE",
            AppError::NotUtf8 | AppError::CsvInvalid(_) | AppError::CsvChunkError(_) => {
                "INVALID_FILE"
            }
            AppError::BusinessRule(_) => "BUSINESS_RULE",
            AppError::ChunkTimeout { .. } => "CHUNK_TIMEOUT",
            AppError::JobTimeout { .. } => "JOB_TIMEOUT",
            AppError::ConstraintViolation(_) => "CONSTRAINT_VIOLATION",
            AppError::Database(_) | AppError::DatabaseBusy(_) | AppError::NotFound(_) => {
                "DATABASE_ERROR"
            }
            _ => "PROCESSING_ERROR",
        }
    }

    /// Converts the error into a user-friendly presentation.
    /// Never leaks connection strings or other sensitive payloads.
    pub fn to_presentation(&self) -> ErrorPresentation {
        match self {
            // ── File / CSV ────────────────────────────────────────────────────
            AppError::NotUtf8 => ErrorPresentation {
                title: "Invalid File Encoding".into(),
                message: "The file must be UTF-8 encoded. Please re-save your file with UTF-8 encoding.".into(),
                action: Some("Convert file to UTF-8".into()),
            },

            AppError::CsvInvalid(msg) => ErrorPresentation {
                title: "Invalid CSV".into(),
                message: format!("The CSV file has a formatting problem: {}", msg),
                action: Some("Fix the CSV file and try again".into()),
            },

            AppError::CsvChunkError(msg) => ErrorPresentation {
                title: "CSV Processing Error".into(),
                message: format!("Error while processing CSV: {}", msg),
                action: Some("Check your CSV file format".into()),
            },

            AppError::FileTooLarge {
                size_bytes,
                limit_bytes,
            } => ErrorPresentation {
                title: "File Too Large".into(),
                message: format!(
                    "The file is {} bytes; uploads are limited to {} bytes.",
                    size_bytes, limit_bytes
                ),
                action: Some("Split the file and upload the parts".into()),
            },

            // ── Rows ──────────────────────────────────────────────────────────
            AppError::InvalidFieldFormat { field, message } => ErrorPresentation {
                title: "Invalid Value".into(),
                message: format!("'{}' could not be read: {}", field, message),
                action: Some("Correct the value and re-upload the row".into()),
            },

            AppError::ValidationFailed { field, message } => ErrorPresentation {
                title: "Validation Failed".into(),
                message: format!("'{}' is not acceptable: {}", field, message),
                action: Some("Correct the value and re-upload the row".into()),
            },

            AppError::RequiredFieldMissing(field) => ErrorPresentation {
                title: "Missing Value".into(),
                message: format!("'{}' is required but empty.", field),
                action: Some("Fill in the value and re-upload the row".into()),
            },

            AppError::BusinessRule(msg) => ErrorPresentation {
                title: "Rule Violation".into(),
                message: sanitize_message(msg, "The row breaks a business rule."),
                action: None,
            },

            // ── Processing ────────────────────────────────────────────────────
            AppError::ChunkTimeout { chunk_number, .. } => ErrorPresentation {
                title: "Processing Timed Out".into(),
                message: format!("Chunk {} took too long to process.", chunk_number),
                action: Some("Wait for the automatic retry".into()),
            },

            AppError::JobTimeout { .. } => ErrorPresentation {
                title: "Upload Timed Out".into(),
                message: "The upload did not finish within its time budget.".into(),
                action: Some("Retry the upload".into()),
            },

            AppError::ChunkIo(_) => ErrorPresentation {
                title: "Processing Error".into(),
                message: "A temporary file could not be read.".into(),
                action: Some("Wait for the automatic retry".into()),
            },

            AppError::Cancelled => ErrorPresentation {
                title: "Cancelled".into(),
                message: "The operation was cancelled.".into(),
                action: None,
            },

            // ── Queue ─────────────────────────────────────────────────────────
            AppError::QueueFull => ErrorPresentation {
                title: "System Busy".into(),
                message: "Too much work is queued right now.".into(),
                action: Some("Wait and retry".into()),
            },

            AppError::QueueClosed => ErrorPresentation {
                title: "Service Stopping".into(),
                message: "The ingestion service is shutting down.".into(),
                action: Some("Wait and retry".into()),
            },

            // ── Storage ───────────────────────────────────────────────────────
            AppError::Database(msg) | AppError::DatabaseBusy(msg) => ErrorPresentation {
                title: "Storage Error".into(),
                message: sanitize_message(msg, "The database reported an error."),
                action: Some("Try again".into()),
            },

            AppError::ConstraintViolation(msg) => ErrorPresentation {
                title: "Constraint Violation".into(),
                message: sanitize_message(msg, "The row conflicts with existing data."),
                action: None,
            },

            AppError::NotFound(msg) => ErrorPresentation {
                title: "Not Found".into(),
                message: sanitize_message(msg, "The requested item does not exist."),
                action: None,
            },

            AppError::JobNotFound(job_id) => ErrorPresentation {
                title: "Upload Not Found".into(),
                message: format!("No upload with id {} exists.", job_id),
                action: None,
            },

            // ── Lifecycle ─────────────────────────────────────────────────────
            AppError::InvalidTransition { entity, from, to } => ErrorPresentation {
                title: "Invalid State Change".into(),
                message: format!("A {} cannot move from {} to {}.", entity, from, to),
                action: None,
            },

            AppError::RetryRefused { reason, .. } => ErrorPresentation {
                title: "Retry Not Allowed".into(),
                message: reason.clone(),
                action: None,
            },

            // ── Configuration ─────────────────────────────────────────────────
            AppError::Config(msg) => ErrorPresentation {
                title: "Configuration Error".into(),
                message: sanitize_message(msg, "The service is misconfigured."),
                action: Some("Check the INGEST_* settings".into()),
            },

            // ── Generic ───────────────────────────────────────────────────────
            AppError::Internal(_) => ErrorPresentation {
                title: "Unexpected Error".into(),
                message: "Something went wrong. Please try again.".into(),
                action: Some("Try again".into()),
            },
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_presentation().serialize(serializer)
    }
}

/// Classifies a SQLite error so busy/locked conditions can be retried and
/// constraint failures are reported as such.
pub(crate) fn db_error(context: &str, err: rusqlite::Error) -> AppError {
    use rusqlite::ErrorCode;

    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            AppError::DatabaseBusy(format!("{context}: {err}"))
        }
        Some(ErrorCode::ConstraintViolation) => {
            AppError::ConstraintViolation(format!("{context}: {err}"))
        }
        _ => AppError::Database(format!("{context}: {err}")),
    }
}
