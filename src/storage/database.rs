//! SQLite database module with schema migrations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;

use crate::error::{db_error, AppError};

/// Current schema version. Increment when adding new migrations.
const SCHEMA_VERSION: i32 = 1;

/// V1 schema: creates all initial tables, indexes and audit guards.
const V1_SCHEMA: &str = r#"
-- Upload jobs (one per submitted file)
CREATE TABLE IF NOT EXISTS upload_jobs (
    id TEXT PRIMARY KEY NOT NULL,
    content_hash TEXT NOT NULL,
    file_name TEXT NOT NULL,
    file_type TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    schema_version TEXT,
    status TEXT NOT NULL,
    total_rows INTEGER NOT NULL DEFAULT 0,
    processed_rows INTEGER NOT NULL DEFAULT 0,
    successful_rows INTEGER NOT NULL DEFAULT 0,
    failed_rows INTEGER NOT NULL DEFAULT 0,
    duplicate_rows INTEGER NOT NULL DEFAULT 0,
    total_chunks INTEGER NOT NULL DEFAULT 0,
    strategy TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL,
    retry_of TEXT,
    user_id TEXT,
    organization_id TEXT,
    ip_address TEXT,
    error_message TEXT,
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER,
    processing_time_ms INTEGER,
    rows_per_second REAL
);

CREATE INDEX IF NOT EXISTS idx_upload_jobs_status ON upload_jobs(status);
CREATE INDEX IF NOT EXISTS idx_upload_jobs_content_hash ON upload_jobs(content_hash);

-- Chunks: contiguous [start_row, end_row) slices of a job
CREATE TABLE IF NOT EXISTS upload_chunks (
    job_id TEXT NOT NULL REFERENCES upload_jobs(id),
    chunk_number INTEGER NOT NULL,
    start_row INTEGER NOT NULL,
    end_row INTEGER NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    successful_rows INTEGER NOT NULL DEFAULT 0,
    failed_rows INTEGER NOT NULL DEFAULT 0,
    duplicate_rows INTEGER NOT NULL DEFAULT 0,
    worker_id TEXT,
    error_message TEXT,
    file_path TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER,
    PRIMARY KEY (job_id, chunk_number),
    CHECK (end_row > start_row)
);

CREATE INDEX IF NOT EXISTS idx_upload_chunks_status ON upload_chunks(status);

-- Row-level and chunk-level failures (kept after job cleanup)
CREATE TABLE IF NOT EXISTS processing_errors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    chunk_number INTEGER,
    row_number INTEGER,
    error_type TEXT NOT NULL,
    error_code TEXT NOT NULL,
    message TEXT NOT NULL,
    field TEXT,
    raw_row TEXT,
    retryable INTEGER NOT NULL DEFAULT 0,
    resolution TEXT NOT NULL DEFAULT 'unresolved',
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_processing_errors_job_id ON processing_errors(job_id);

-- One record per business-key hash
CREATE TABLE IF NOT EXISTS deduplication_records (
    key_hash TEXT PRIMARY KEY NOT NULL,
    business_key TEXT NOT NULL,
    original_upload_id TEXT NOT NULL,
    original_row_number INTEGER NOT NULL,
    record_id INTEGER NOT NULL,
    duplicate_count INTEGER NOT NULL DEFAULT 0,
    action TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    last_seen_at INTEGER NOT NULL
);

-- Append-only transition log
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    job_id TEXT NOT NULL,
    chunk_number INTEGER,
    actor TEXT NOT NULL,
    previous_state TEXT,
    new_state TEXT NOT NULL,
    message TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_log_job_id ON audit_log(job_id);

CREATE TRIGGER IF NOT EXISTS audit_log_no_update
BEFORE UPDATE ON audit_log
BEGIN
    SELECT RAISE(ABORT, 'audit_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
BEFORE DELETE ON audit_log
BEGIN
    SELECT RAISE(ABORT, 'audit_log is append-only');
END;

-- Loaded rows
CREATE TABLE IF NOT EXISTS ingested_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    row_number INTEGER NOT NULL,
    key_hash TEXT,
    data TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ingested_records_job_id ON ingested_records(job_id);
CREATE INDEX IF NOT EXISTS idx_ingested_records_key_hash ON ingested_records(key_hash);

-- Terminal outcome per row, written with the row's data
CREATE TABLE IF NOT EXISTS chunk_row_outcomes (
    job_id TEXT NOT NULL,
    row_number INTEGER NOT NULL,
    chunk_number INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    PRIMARY KEY (job_id, row_number)
) WITHOUT ROWID;
"#;

/// Handle to the ingestion database file.
///
/// Connections are opened per operation inside `spawn_blocking`; WAL mode lets
/// concurrent workers read while one writes.
#[derive(Debug, Clone)]
pub struct Database {
    db_path: PathBuf,
}

impl Database {
    /// Initializes the database at the given path.
    /// Creates parent directories if needed, opens the SQLite file, and runs migrations.
    pub async fn init(db_path: PathBuf) -> Result<Self, AppError> {
        let path = db_path.clone();

        tokio::task::spawn_blocking(move || {
            // Create parent directory if needed
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AppError::Internal(format!("Failed to create database directory: {e}"))
                })?;
            }

            let mut conn = open_connection(&path)?;
            run_migrations(&mut conn)?;

            Ok::<_, AppError>(())
        })
        .await
        .map_err(|e| AppError::Internal(format!("Database init task failed: {e}")))??;

        Ok(Self { db_path })
    }

    /// Returns the database path for use by other storage modules.
    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    /// Simple health check: executes SELECT 1.
    pub async fn health_check(&self) -> Result<(), AppError> {
        let db_path = self.db_path.clone();

        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;

            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(|e| db_error("Health check failed", e))?;

            Ok::<_, AppError>(())
        })
        .await
        .map_err(|e| AppError::Internal(format!("Health check task failed: {e}")))??;

        Ok(())
    }
}

/// Opens and configures a connection.
pub(crate) fn open_connection(path: &Path) -> Result<Connection, AppError> {
    let conn = Connection::open(path).map_err(|e| db_error("Failed to open database", e))?;
    configure_connection(&conn)?;
    Ok(conn)
}

/// Configures connection with busy timeout and WAL mode.
fn configure_connection(conn: &Connection) -> Result<(), AppError> {
    conn.busy_timeout(Duration::from_secs(10))
        .map_err(|e| db_error("Failed to set busy timeout", e))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| db_error("Failed to set WAL mode", e))?;

    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(|e| db_error("Failed to set synchronous mode", e))?;

    Ok(())
}

/// Runs database migrations using PRAGMA user_version.
fn run_migrations(conn: &mut Connection) -> Result<(), AppError> {
    let current_version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| db_error("Failed to get schema version", e))?;

    if current_version >= SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .map_err(|e| db_error("Failed to start migration transaction", e))?;

    if current_version < 1 {
        tx.execute_batch(V1_SCHEMA)
            .map_err(|e| db_error("V1 migration failed", e))?;
    }

    tx.pragma_update(None, "user_version", SCHEMA_VERSION)
        .map_err(|e| db_error("Failed to update schema version", e))?;

    tx.commit()
        .map_err(|e| db_error("Failed to commit migration", e))?;

    Ok(())
}
