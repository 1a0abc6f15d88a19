//! Domain model for bulk ingestion jobs.
//!
//! Status enums carry their own transition tables so storage can refuse
//! backwards moves without knowing the lifecycle rules.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::validation::schema::RowSchema;

// ─────────────────────────────────────────────────────────────────────────────
// JobStatus
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle status of an upload job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Validating,
    Chunking,
    Processing,
    Completed,
    Failed,
    Cancelled,
    PartiallyCompleted,
}

impl JobStatus {
    /// Converts the status to its string representation for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Validating => "validating",
            JobStatus::Chunking => "chunking",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::PartiallyCompleted => "partially_completed",
        }
    }

    /// Parses a stored status string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "validating" => Some(JobStatus::Validating),
            "chunking" => Some(JobStatus::Chunking),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            "partially_completed" => Some(JobStatus::PartiallyCompleted),
            _ => None,
        }
    }

    /// Returns true if no further automatic transition can occur.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::Failed
                | JobStatus::Cancelled
                | JobStatus::PartiallyCompleted
        )
    }

    /// Forward-only transition table.
    ///
    /// `Chunking -> Completed` covers zero-row files. Any non-terminal status may
    /// fail or be cancelled.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed | Cancelled) {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Validating)
                | (Validating, Chunking)
                | (Chunking, Processing)
                | (Chunking, Completed)
                | (Processing, Completed)
                | (Processing, PartiallyCompleted)
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ChunkStatus
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle status of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Processing => "processing",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Failed => "failed",
            ChunkStatus::Retrying => "retrying",
            ChunkStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ChunkStatus::Pending),
            "processing" => Some(ChunkStatus::Processing),
            "completed" => Some(ChunkStatus::Completed),
            "failed" => Some(ChunkStatus::Failed),
            "retrying" => Some(ChunkStatus::Retrying),
            "cancelled" => Some(ChunkStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChunkStatus::Completed | ChunkStatus::Failed | ChunkStatus::Cancelled
        )
    }

    /// `pending -> processing -> {completed | retrying -> pending | failed}`.
    ///
    /// Waiting chunks (`pending`, `retrying`) may also be cancelled, or failed
    /// when their job runs out of time.
    pub fn can_transition_to(&self, next: ChunkStatus) -> bool {
        use ChunkStatus::*;

        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Retrying)
                | (Processing, Failed)
                | (Retrying, Pending)
                | (Retrying, Cancelled)
                | (Retrying, Failed)
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Error taxonomy
// ─────────────────────────────────────────────────────────────────────────────

/// Category of a processing error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    Validation,
    Parsing,
    Processing,
    BusinessLogic,
    Database,
    Duplicate,
    ConstraintViolation,
    Timeout,
    System,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Validation => "VALIDATION",
            ErrorType::Parsing => "PARSING",
            ErrorType::Processing => "PROCESSING",
            ErrorType::BusinessLogic => "BUSINESS_LOGIC",
            ErrorType::Database => "DATABASE",
            ErrorType::Duplicate => "DUPLICATE",
            ErrorType::ConstraintViolation => "CONSTRAINT_VIOLATION",
            ErrorType::Timeout => "TIMEOUT",
            ErrorType::System => "SYSTEM",
        }
    }

    /// Unknown strings map to `System`.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "VALIDATION" => ErrorType::Validation,
            "PARSING" => ErrorType::Parsing,
            "PROCESSING" => ErrorType::Processing,
            "BUSINESS_LOGIC" => ErrorType::BusinessLogic,
            "DATABASE" => ErrorType::Database,
            "DUPLICATE" => ErrorType::Duplicate,
            "CONSTRAINT_VIOLATION" => ErrorType::ConstraintViolation,
            "TIMEOUT" => ErrorType::Timeout,
            _ => ErrorType::System,
        }
    }
}

/// Resolution state of a recorded processing error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Unresolved,
    Resolved,
    Ignored,
}

impl ResolutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStatus::Unresolved => "unresolved",
            ResolutionStatus::Resolved => "resolved",
            ResolutionStatus::Ignored => "ignored",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "resolved" => ResolutionStatus::Resolved,
            "ignored" => ResolutionStatus::Ignored,
            _ => ResolutionStatus::Unresolved,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Job options
// ─────────────────────────────────────────────────────────────────────────────

/// How a job's chunks are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStrategy {
    Stream,
    Batch,
    #[default]
    Parallel,
    /// One chunk of the job in flight at a time.
    Sequential,
}

impl ProcessingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStrategy::Stream => "stream",
            ProcessingStrategy::Batch => "batch",
            ProcessingStrategy::Parallel => "parallel",
            ProcessingStrategy::Sequential => "sequential",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "stream" => ProcessingStrategy::Stream,
            "batch" => ProcessingStrategy::Batch,
            "sequential" => ProcessingStrategy::Sequential,
            _ => ProcessingStrategy::Parallel,
        }
    }
}

/// Conflict resolution applied when a row's business key was seen before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeduplicationAction {
    #[default]
    Skip,
    Update,
    Merge,
    Append,
    Replace,
}

impl DeduplicationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeduplicationAction::Skip => "skip",
            DeduplicationAction::Update => "update",
            DeduplicationAction::Merge => "merge",
            DeduplicationAction::Append => "append",
            DeduplicationAction::Replace => "replace",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Some(DeduplicationAction::Skip),
            "update" => Some(DeduplicationAction::Update),
            "merge" => Some(DeduplicationAction::Merge),
            "append" => Some(DeduplicationAction::Append),
            "replace" => Some(DeduplicationAction::Replace),
            _ => None,
        }
    }
}

/// Who submitted a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobContext {
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
    pub ip_address: Option<String>,
}

/// Metadata handed over by upload intake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileMeta {
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    /// SHA-256 hex of the content. Computed by the service when empty.
    pub content_hash: String,
    pub schema_version: Option<String>,
}

/// Readable rows for one upload.
#[derive(Debug, Clone)]
pub enum RowSource {
    /// A CSV file with a header row.
    CsvFile(PathBuf),
    /// Rows already decoded by intake (e.g. a spreadsheet).
    Records {
        headers: Vec<String>,
        rows: Vec<Vec<String>>,
    },
}

/// Per-job overrides of the service configuration.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub priority: i32,
    pub strategy: ProcessingStrategy,
    /// Row schema; the invoice schema is used when absent.
    pub schema: Option<RowSchema>,
    pub deduplication_action: Option<DeduplicationAction>,
    pub max_retries: Option<u32>,
    pub context: JobContext,
}

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

/// One bulk-ingestion request for a single file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadJob {
    pub id: String,
    pub content_hash: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: i64,
    pub schema_version: Option<String>,
    pub status: JobStatus,
    pub total_rows: i64,
    pub processed_rows: i64,
    pub successful_rows: i64,
    pub failed_rows: i64,
    pub duplicate_rows: i64,
    pub total_chunks: i64,
    pub strategy: ProcessingStrategy,
    pub priority: i32,
    pub retry_count: i64,
    pub max_retries: i64,
    pub retry_of: Option<String>,
    pub context: JobContext,
    pub error_message: Option<String>,
    pub cancel_requested: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub processing_time_ms: Option<i64>,
    pub rows_per_second: Option<f64>,
}

/// A contiguous `[start_row, end_row)` slice of a job's rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadChunk {
    pub job_id: String,
    pub chunk_number: i64,
    pub start_row: i64,
    pub end_row: i64,
    pub status: ChunkStatus,
    pub attempts: i64,
    pub successful_rows: i64,
    pub failed_rows: i64,
    pub duplicate_rows: i64,
    pub worker_id: Option<String>,
    pub error_message: Option<String>,
    pub file_path: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl UploadChunk {
    pub fn row_count(&self) -> i64 {
        self.end_row - self.start_row
    }
}

/// A recorded row-level or chunk-level failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingError {
    pub id: i64,
    pub job_id: String,
    pub chunk_number: Option<i64>,
    pub row_number: Option<i64>,
    pub error_type: ErrorType,
    pub error_code: String,
    pub message: String,
    pub field: Option<String>,
    pub raw_row: Option<String>,
    pub retryable: bool,
    pub resolution: ResolutionStatus,
    pub created_at: i64,
}

/// Input for a new processing error row.
#[derive(Debug, Clone)]
pub struct NewProcessingError {
    pub job_id: String,
    pub chunk_number: Option<i64>,
    pub row_number: Option<i64>,
    pub error_type: ErrorType,
    pub error_code: String,
    pub message: String,
    pub field: Option<String>,
    pub raw_row: Option<String>,
    pub retryable: bool,
}

/// First sighting of a business key, plus how often it reappeared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeduplicationRecord {
    pub key_hash: String,
    pub business_key: String,
    pub original_upload_id: String,
    pub original_row_number: i64,
    pub record_id: i64,
    pub duplicate_count: i64,
    pub action: DeduplicationAction,
    pub created_at: i64,
    pub last_seen_at: i64,
}

/// Published snapshot of a job's progress. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub job_id: String,
    pub status: JobStatus,
    pub phase: String,
    pub total_rows: i64,
    pub processed_rows: i64,
    pub successful_rows: i64,
    pub failed_rows: i64,
    pub duplicate_rows: i64,
    pub percent_complete: f64,
    pub estimated_time_remaining_ms: Option<u64>,
    /// Chunks that reached a terminal status.
    pub current_chunk: i64,
    pub total_chunks: i64,
    pub rows_per_second: f64,
    pub timestamp: i64,
}

/// What an audit entry is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEntity {
    Job,
    Chunk,
}

impl AuditEntity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEntity::Job => "job",
            AuditEntity::Chunk => "chunk",
        }
    }
}

/// Immutable record of one state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: i64,
    pub entity_type: AuditEntity,
    pub job_id: String,
    pub chunk_number: Option<i64>,
    pub actor: String,
    pub previous_state: Option<String>,
    pub new_state: String,
    pub message: Option<String>,
    pub created_at: i64,
}

/// Returns current unix timestamp in milliseconds.
pub(crate) fn current_timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_JOB: [JobStatus; 8] = [
        JobStatus::Pending,
        JobStatus::Validating,
        JobStatus::Chunking,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::PartiallyCompleted,
    ];

    #[test]
    fn job_status_strings_parse_back() {
        for status in ALL_JOB {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("Running"), None);
    }

    #[test]
    fn terminal_job_status_never_transitions() {
        for from in ALL_JOB.iter().filter(|s| s.is_terminal()) {
            for to in ALL_JOB {
                assert!(!from.can_transition_to(to), "{:?} -> {:?}", from, to);
            }
        }
    }

    #[test]
    fn job_status_moves_forward_only() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Validating));
        assert!(JobStatus::Chunking.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::PartiallyCompleted));
        assert!(JobStatus::Validating.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Chunking));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Processing));
        assert!(!JobStatus::Validating.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn chunk_retry_cycle_is_allowed() {
        assert!(ChunkStatus::Pending.can_transition_to(ChunkStatus::Processing));
        assert!(ChunkStatus::Processing.can_transition_to(ChunkStatus::Retrying));
        assert!(ChunkStatus::Retrying.can_transition_to(ChunkStatus::Pending));
        assert!(!ChunkStatus::Retrying.can_transition_to(ChunkStatus::Processing));
        assert!(!ChunkStatus::Completed.can_transition_to(ChunkStatus::Processing));
        assert!(!ChunkStatus::Processing.can_transition_to(ChunkStatus::Cancelled));
    }

    #[test]
    fn dedup_action_parse_is_case_insensitive() {
        assert_eq!(DeduplicationAction::parse(" Merge "), Some(DeduplicationAction::Merge));
        assert_eq!(DeduplicationAction::parse("drop"), None);
    }

    #[test]
    fn error_type_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorType::BusinessLogic).unwrap();
        assert_eq!(json, "\"BUSINESS_LOGIC\"");
        assert_eq!(ErrorType::from_str_lossy("nope"), ErrorType::System);
    }
}
