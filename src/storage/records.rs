//! Batched, transactional row persistence.
//!
//! One batch is one `BEGIN IMMEDIATE` transaction. Each row runs inside its own
//! savepoint, so a row that fails to store is rolled back alone and recorded
//! as failed while the rest of the batch commits. The row's data, its dedup
//! record, its ledger entry in `chunk_row_outcomes` and the job/chunk counters
//! all land in the same commit.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::jobs::{begin, insert_processing_error_with, with_conn};
use crate::error::{db_error, AppError};
use crate::ingest::dedup::{resolve, DedupKey, DedupPolicy, Resolution};
use crate::models::{
    current_timestamp_ms, DeduplicationAction, DeduplicationRecord, ErrorType, NewProcessingError,
};
use crate::storage::Database;
use crate::validation::{NormalizedRow, ValidatedRow};

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// One validated (or rejected) row on its way to storage.
#[derive(Debug)]
pub struct BatchRow {
    pub row_number: i64,
    /// Original field values as JSON, kept on processing errors.
    pub raw: Option<String>,
    pub result: ValidatedRow,
}

#[derive(Debug)]
pub struct RowBatch {
    pub job_id: String,
    pub chunk_number: i64,
    pub dedup: DedupPolicy,
    pub rows: Vec<BatchRow>,
}

/// Per-row attribution of one committed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub successful: i64,
    pub failed: i64,
    pub duplicate: i64,
    /// Rows that already had an outcome from an earlier attempt.
    pub skipped: i64,
}

impl BatchOutcome {
    pub fn processed(&self) -> i64 {
        self.successful + self.failed + self.duplicate
    }

    pub fn absorb(&mut self, other: BatchOutcome) {
        self.successful += other.successful;
        self.failed += other.failed;
        self.duplicate += other.duplicate;
        self.skipped += other.skipped;
    }
}

/// A loaded row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestedRecord {
    pub id: i64,
    pub job_id: String,
    pub row_number: i64,
    pub key_hash: Option<String>,
    pub data: Map<String, Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOutcome {
    Success,
    Failed,
    Duplicate,
}

impl RowOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            RowOutcome::Success => "success",
            RowOutcome::Failed => "failed",
            RowOutcome::Duplicate => "duplicate",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Writer seam
// ─────────────────────────────────────────────────────────────────────────────

/// Storage target for chunk workers.
pub trait RowWriter: Send + Sync {
    /// Persists a batch and returns how each row ended up.
    ///
    /// A retryable error (database busy) means nothing from the batch was kept.
    fn write_batch(
        &self,
        batch: RowBatch,
    ) -> Pin<Box<dyn Future<Output = Result<BatchOutcome, AppError>> + Send + '_>>;

    /// Row numbers of a chunk that already reached a terminal outcome.
    fn completed_rows<'a>(
        &'a self,
        job_id: &'a str,
        chunk_number: i64,
    ) -> Pin<Box<dyn Future<Output = Result<HashSet<i64>, AppError>> + Send + 'a>>;
}

/// `RowWriter` over the ingestion database.
#[derive(Debug, Clone)]
pub struct SqliteRowWriter {
    db: Database,
}

impl SqliteRowWriter {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl RowWriter for SqliteRowWriter {
    fn write_batch(
        &self,
        batch: RowBatch,
    ) -> Pin<Box<dyn Future<Output = Result<BatchOutcome, AppError>> + Send + '_>> {
        Box::pin(async move {
            with_conn(&self.db, "Write batch", move |conn| write_batch_blocking(conn, batch)).await
        })
    }

    fn completed_rows<'a>(
        &'a self,
        job_id: &'a str,
        chunk_number: i64,
    ) -> Pin<Box<dyn Future<Output = Result<HashSet<i64>, AppError>> + Send + 'a>> {
        let job_id = job_id.to_string();
        Box::pin(async move {
            with_conn(&self.db, "Load row ledger", move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT row_number FROM chunk_row_outcomes WHERE job_id = ?1 AND chunk_number = ?2",
                    )
                    .map_err(|e| db_error("Failed to prepare ledger query", e))?;

                let rows = stmt
                    .query_map(rusqlite::params![job_id, chunk_number], |row| row.get(0))
                    .map_err(|e| db_error("Failed to query ledger", e))?
                    .collect::<Result<HashSet<i64>, _>>()
                    .map_err(|e| db_error("Failed to read ledger", e))?;

                Ok(rows)
            })
            .await
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Batch write
// ─────────────────────────────────────────────────────────────────────────────

fn write_batch_blocking(conn: &mut Connection, batch: RowBatch) -> Result<BatchOutcome, AppError> {
    let now = current_timestamp_ms();
    let RowBatch {
        job_id,
        chunk_number,
        dedup,
        rows,
    } = batch;

    let mut tx = begin(conn)?;
    let mut outcome = BatchOutcome::default();

    for row in rows {
        if is_ledgered(&tx, &job_id, row.row_number)? {
            outcome.skipped += 1;
            continue;
        }

        let result = {
            let sp = tx
                .savepoint()
                .map_err(|e| db_error("Failed to open row savepoint", e))?;
            let written = write_row(&sp, &job_id, chunk_number, dedup, &row, now);
            match written {
                Ok(kind) => {
                    sp.commit()
                        .map_err(|e| db_error("Failed to release row savepoint", e))?;
                    Ok(kind)
                }
                // Dropping the savepoint rolls the row back.
                Err(e) => Err(e),
            }
        };

        let kind = match result {
            Ok(kind) => kind,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                tracing::warn!(
                    job_id = %job_id,
                    chunk_number,
                    row_number = row.row_number,
                    error = %e,
                    "Row could not be stored"
                );
                record_row_failure(&tx, &job_id, chunk_number, &row, &e, now)?;
                RowOutcome::Failed
            }
        };

        match kind {
            RowOutcome::Success => outcome.successful += 1,
            RowOutcome::Failed => outcome.failed += 1,
            RowOutcome::Duplicate => outcome.duplicate += 1,
        }
    }

    if outcome.processed() > 0 {
        tx.execute(
            r#"
            UPDATE upload_chunks
            SET successful_rows = successful_rows + ?1, failed_rows = failed_rows + ?2,
                duplicate_rows = duplicate_rows + ?3, updated_at = ?4
            WHERE job_id = ?5 AND chunk_number = ?6
            "#,
            rusqlite::params![
                outcome.successful,
                outcome.failed,
                outcome.duplicate,
                now,
                job_id,
                chunk_number
            ],
        )
        .map_err(|e| db_error("Failed to update chunk counters", e))?;

        tx.execute(
            r#"
            UPDATE upload_jobs
            SET processed_rows = processed_rows + ?1, successful_rows = successful_rows + ?2,
                failed_rows = failed_rows + ?3, duplicate_rows = duplicate_rows + ?4, updated_at = ?5
            WHERE id = ?6
            "#,
            rusqlite::params![
                outcome.processed(),
                outcome.successful,
                outcome.failed,
                outcome.duplicate,
                now,
                job_id
            ],
        )
        .map_err(|e| db_error("Failed to update job counters", e))?;
    }

    tx.commit().map_err(|e| db_error("Failed to commit batch", e))?;

    Ok(outcome)
}

fn write_row(
    conn: &Connection,
    job_id: &str,
    chunk_number: i64,
    dedup: DedupPolicy,
    row: &BatchRow,
    now: i64,
) -> Result<RowOutcome, AppError> {
    let kind = match &row.result {
        ValidatedRow::Invalid(errors) => {
            for field_error in errors {
                let err = &field_error.error;
                insert_processing_error_with(
                    conn,
                    &NewProcessingError {
                        job_id: job_id.to_string(),
                        chunk_number: Some(chunk_number),
                        row_number: Some(row.row_number),
                        error_type: err.error_type(),
                        error_code: err.code().to_string(),
                        message: err.to_string(),
                        field: field_error.field.clone(),
                        raw_row: row.raw.clone(),
                        retryable: false,
                    },
                    now,
                )?;
            }
            RowOutcome::Failed
        }
        ValidatedRow::Valid(normalized) => {
            let key = if dedup.enabled {
                DedupKey::from_parts(&normalized.key_parts)
            } else {
                None
            };
            match key {
                Some(key) => store_with_dedup(conn, job_id, row.row_number, normalized, &key, dedup.action, now)?,
                None => {
                    insert_record(conn, job_id, row.row_number, None, &normalized.data, now)?;
                    RowOutcome::Success
                }
            }
        }
    };

    ledger(conn, job_id, chunk_number, row.row_number, kind)?;
    Ok(kind)
}

fn store_with_dedup(
    conn: &Connection,
    job_id: &str,
    row_number: i64,
    row: &NormalizedRow,
    key: &DedupKey,
    action: DeduplicationAction,
    now: i64,
) -> Result<RowOutcome, AppError> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT record_id FROM deduplication_records WHERE key_hash = ?1",
            [&key.hash],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| db_error("Failed to look up dedup record", e))?;

    let Some(record_id) = existing else {
        let record_id = insert_record(conn, job_id, row_number, Some(&key.hash), &row.data, now)?;
        conn.execute(
            r#"
            INSERT INTO deduplication_records
                (key_hash, business_key, original_upload_id, original_row_number, record_id, duplicate_count, action, created_at, last_seen_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?7)
            "#,
            rusqlite::params![key.hash, key.business_key, job_id, row_number, record_id, action.as_str(), now],
        )
        .map_err(|e| db_error("Failed to insert dedup record", e))?;
        return Ok(RowOutcome::Success);
    };

    conn.execute(
        r#"
        UPDATE deduplication_records
        SET duplicate_count = duplicate_count + 1, last_seen_at = ?1, action = ?2
        WHERE key_hash = ?3
        "#,
        rusqlite::params![now, action.as_str(), key.hash],
    )
    .map_err(|e| db_error("Failed to update dedup record", e))?;

    let existing_data: Map<String, Value> = conn
        .query_row(
            "SELECT data FROM ingested_records WHERE id = ?1",
            [record_id],
            |r| r.get::<_, String>(0),
        )
        .optional()
        .map_err(|e| db_error("Failed to load existing record", e))?
        .and_then(|json| serde_json::from_str(&json).ok())
        .unwrap_or_default();

    match resolve(action, &existing_data, &row.data) {
        Resolution::Keep => {}
        Resolution::Rewrite(merged) => {
            conn.execute(
                "UPDATE ingested_records SET data = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![to_json(&merged)?, now, record_id],
            )
            .map_err(|e| db_error("Failed to rewrite record", e))?;
        }
        Resolution::Append => {
            insert_record(conn, job_id, row_number, Some(&key.hash), &row.data, now)?;
        }
        Resolution::Replace => {
            conn.execute(
                r#"
                UPDATE ingested_records
                SET data = ?1, job_id = ?2, row_number = ?3, updated_at = ?4
                WHERE id = ?5
                "#,
                rusqlite::params![to_json(&row.data)?, job_id, row_number, now, record_id],
            )
            .map_err(|e| db_error("Failed to replace record", e))?;

            conn.execute(
                r#"
                UPDATE deduplication_records
                SET original_upload_id = ?1, original_row_number = ?2
                WHERE key_hash = ?3
                "#,
                rusqlite::params![job_id, row_number, key.hash],
            )
            .map_err(|e| db_error("Failed to re-point dedup record", e))?;
        }
    }

    Ok(RowOutcome::Duplicate)
}

fn to_json(data: &Map<String, Value>) -> Result<String, AppError> {
    serde_json::to_string(data).map_err(|e| AppError::Internal(format!("Failed to encode row: {e}")))
}

fn insert_record(
    conn: &Connection,
    job_id: &str,
    row_number: i64,
    key_hash: Option<&str>,
    data: &Map<String, Value>,
    now: i64,
) -> Result<i64, AppError> {
    conn.execute(
        r#"
        INSERT INTO ingested_records (job_id, row_number, key_hash, data, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?5)
        "#,
        rusqlite::params![job_id, row_number, key_hash, to_json(data)?, now],
    )
    .map_err(|e| db_error("Failed to insert record", e))?;

    Ok(conn.last_insert_rowid())
}

fn is_ledgered(conn: &Connection, job_id: &str, row_number: i64) -> Result<bool, AppError> {
    conn.query_row(
        "SELECT 1 FROM chunk_row_outcomes WHERE job_id = ?1 AND row_number = ?2",
        rusqlite::params![job_id, row_number],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(|e| db_error("Failed to check row ledger", e))
}

fn ledger(
    conn: &Connection,
    job_id: &str,
    chunk_number: i64,
    row_number: i64,
    outcome: RowOutcome,
) -> Result<(), AppError> {
    conn.execute(
        r#"
        INSERT OR IGNORE INTO chunk_row_outcomes (job_id, row_number, chunk_number, outcome)
        VALUES (?1, ?2, ?3, ?4)
        "#,
        rusqlite::params![job_id, row_number, chunk_number, outcome.as_str()],
    )
    .map_err(|e| db_error("Failed to write row ledger", e))?;
    Ok(())
}

/// Records a row whose write was rolled back.
fn record_row_failure(
    conn: &Connection,
    job_id: &str,
    chunk_number: i64,
    row: &BatchRow,
    error: &AppError,
    now: i64,
) -> Result<(), AppError> {
    insert_processing_error_with(
        conn,
        &NewProcessingError {
            job_id: job_id.to_string(),
            chunk_number: Some(chunk_number),
            row_number: Some(row.row_number),
            error_type: match error.error_type() {
                ErrorType::ConstraintViolation => ErrorType::ConstraintViolation,
                _ => ErrorType::Database,
            },
            error_code: error.code().to_string(),
            message: error.to_string(),
            field: None,
            raw_row: row.raw.clone(),
            retryable: false,
        },
        now,
    )?;
    ledger(conn, job_id, chunk_number, row.row_number, RowOutcome::Failed)
}

// ─────────────────────────────────────────────────────────────────────────────
// Reads
// ─────────────────────────────────────────────────────────────────────────────

pub async fn get_dedup_record(
    db: &Database,
    key_hash: &str,
) -> Result<Option<DeduplicationRecord>, AppError> {
    let key_hash = key_hash.to_string();

    with_conn(db, "Get dedup record", move |conn| {
        conn.query_row(
            r#"
            SELECT key_hash, business_key, original_upload_id, original_row_number, record_id,
                   duplicate_count, action, created_at, last_seen_at
            FROM deduplication_records WHERE key_hash = ?1
            "#,
            [&key_hash],
            |r| {
                let action: String = r.get(6)?;
                Ok(DeduplicationRecord {
                    key_hash: r.get(0)?,
                    business_key: r.get(1)?,
                    original_upload_id: r.get(2)?,
                    original_row_number: r.get(3)?,
                    record_id: r.get(4)?,
                    duplicate_count: r.get(5)?,
                    action: DeduplicationAction::parse(&action).unwrap_or_default(),
                    created_at: r.get(7)?,
                    last_seen_at: r.get(8)?,
                })
            },
        )
        .optional()
        .map_err(|e| db_error("Failed to load dedup record", e))
    })
    .await
}

/// Rows currently attributed to a job, in row order.
pub async fn list_job_records(db: &Database, job_id: &str) -> Result<Vec<IngestedRecord>, AppError> {
    let job_id = job_id.to_string();

    with_conn(db, "List records", move |conn| {
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, job_id, row_number, key_hash, data, created_at, updated_at
                FROM ingested_records WHERE job_id = ?1 ORDER BY row_number, id
                "#,
            )
            .map_err(|e| db_error("Failed to prepare record query", e))?;

        let records = stmt
            .query_map([&job_id], |r| {
                let data: String = r.get(4)?;
                Ok(IngestedRecord {
                    id: r.get(0)?,
                    job_id: r.get(1)?,
                    row_number: r.get(2)?,
                    key_hash: r.get(3)?,
                    data: serde_json::from_str(&data).unwrap_or_default(),
                    created_at: r.get(5)?,
                    updated_at: r.get(6)?,
                })
            })
            .map_err(|e| db_error("Failed to query records", e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| db_error("Failed to read records", e))?;

        Ok(records)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobStatus;
    use crate::storage::jobs::tests::{planned_job, test_db};
    use crate::storage::jobs::{get_job, get_job_chunks, list_processing_errors};
    use crate::validation::RowSchema;

    const HEADERS: &[&str] = &["Invoice ID", "Item Name", "Quantity", "Customer"];

    fn batch(job_id: &str, chunk_number: i64, action: DeduplicationAction, rows: &[(i64, [&str; 4])]) -> RowBatch {
        let schema = RowSchema::invoice();
        let headers: Vec<String> = HEADERS.iter().map(|s| s.to_string()).collect();
        let bound = schema.bind(&headers).expect("bind");

        RowBatch {
            job_id: job_id.to_string(),
            chunk_number,
            dedup: DedupPolicy {
                enabled: true,
                action,
            },
            rows: rows
                .iter()
                .map(|(n, values)| BatchRow {
                    row_number: *n,
                    raw: Some(serde_json::to_string(values).unwrap()),
                    result: bound.process(values),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn rows_are_attributed_individually() {
        let (_dir, db) = test_db().await;
        planned_job(&db, "job-1", 4, 4).await;
        let writer = SqliteRowWriter::new(db.clone());

        let outcome = writer
            .write_batch(batch(
                "job-1",
                0,
                DeduplicationAction::Skip,
                &[
                    (0, ["INV-1", "Rice", "1", "Acme"]),
                    (1, ["INV-1", "Beans", "2", "Acme"]),
                    (2, ["INV-2", "Rice", "-5", "Acme"]),
                    (3, ["INV-1", "rice ", "3", "Acme"]),
                ],
            ))
            .await
            .expect("write");

        assert_eq!(
            outcome,
            BatchOutcome {
                successful: 2,
                failed: 1,
                duplicate: 1,
                skipped: 0
            }
        );

        let job = get_job(&db, "job-1").await.unwrap().unwrap();
        assert_eq!(job.processed_rows, 4);
        assert_eq!(job.successful_rows, 2);
        assert_eq!(job.failed_rows, 1);
        assert_eq!(job.duplicate_rows, 1);
        assert_eq!(job.status, JobStatus::Processing);

        let chunk = &get_job_chunks(&db, "job-1").await.unwrap()[0];
        assert_eq!(chunk.successful_rows + chunk.failed_rows + chunk.duplicate_rows, 4);

        let errors = list_processing_errors(&db, "job-1").await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].row_number, Some(2));
        assert_eq!(errors[0].error_type, ErrorType::Validation);
        assert_eq!(errors[0].field.as_deref(), Some("quantity"));
        assert!(errors[0].raw_row.as_deref().unwrap_or("").contains("INV-2"));

        assert_eq!(list_job_records(&db, "job-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn replayed_rows_are_skipped() {
        let (_dir, db) = test_db().await;
        planned_job(&db, "job-1", 2, 2).await;
        let writer = SqliteRowWriter::new(db.clone());
        let rows = [(0, ["INV-1", "Rice", "1", ""]), (1, ["INV-2", "Rice", "1", ""])];

        writer
            .write_batch(batch("job-1", 0, DeduplicationAction::Skip, &rows))
            .await
            .unwrap();
        let replay = writer
            .write_batch(batch("job-1", 0, DeduplicationAction::Skip, &rows))
            .await
            .unwrap();

        assert_eq!(replay.skipped, 2);
        assert_eq!(replay.processed(), 0);

        let job = get_job(&db, "job-1").await.unwrap().unwrap();
        assert_eq!(job.successful_rows, 2);
        assert_eq!(job.processed_rows, 2);

        let done = writer.completed_rows("job-1", 0).await.unwrap();
        assert_eq!(done, HashSet::from([0, 1]));
    }

    #[tokio::test]
    async fn duplicates_across_jobs_keep_one_record() {
        let (_dir, db) = test_db().await;
        planned_job(&db, "job-a", 1, 1).await;
        planned_job(&db, "job-b", 2, 2).await;
        let writer = SqliteRowWriter::new(db.clone());

        writer
            .write_batch(batch("job-a", 0, DeduplicationAction::Skip, &[(0, ["INV-9", "Tea", "1", ""])]))
            .await
            .unwrap();
        let outcome = writer
            .write_batch(batch(
                "job-b",
                0,
                DeduplicationAction::Skip,
                &[(0, ["INV-9", "Tea", "4", ""]), (1, ["inv-9", "TEA", "5", ""])],
            ))
            .await
            .unwrap();

        assert_eq!(outcome.duplicate, 2);
        assert!(list_job_records(&db, "job-b").await.unwrap().is_empty());

        let key = DedupKey::from_parts(&["INV-9", "Tea"]).unwrap();
        let record = get_dedup_record(&db, &key.hash).await.unwrap().unwrap();
        assert_eq!(record.duplicate_count, 2);
        assert_eq!(record.original_upload_id, "job-a");
        assert!(record.last_seen_at >= record.created_at);
    }

    #[tokio::test]
    async fn update_merge_append_and_replace() {
        let (_dir, db) = test_db().await;
        planned_job(&db, "job-1", 5, 5).await;
        let writer = SqliteRowWriter::new(db.clone());

        writer
            .write_batch(batch("job-1", 0, DeduplicationAction::Skip, &[(0, ["A", "X", "1", ""])]))
            .await
            .unwrap();

        writer
            .write_batch(batch("job-1", 0, DeduplicationAction::Merge, &[(1, ["A", "X", "9", "Acme"])]))
            .await
            .unwrap();
        let records = list_job_records(&db, "job-1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data["customer_name"], Value::from("Acme"));
        assert_eq!(records[0].data["quantity"].as_f64(), Some(1.0));

        writer
            .write_batch(batch("job-1", 0, DeduplicationAction::Update, &[(2, ["A", "X", "7", ""])]))
            .await
            .unwrap();
        let records = list_job_records(&db, "job-1").await.unwrap();
        assert_eq!(records[0].data["quantity"].as_f64(), Some(7.0));
        assert_eq!(records[0].data["customer_name"], Value::from("Acme"));

        writer
            .write_batch(batch("job-1", 0, DeduplicationAction::Append, &[(3, ["A", "X", "2", ""])]))
            .await
            .unwrap();
        assert_eq!(list_job_records(&db, "job-1").await.unwrap().len(), 2);

        writer
            .write_batch(batch("job-1", 0, DeduplicationAction::Replace, &[(4, ["A", "X", "3", ""])]))
            .await
            .unwrap();
        let key = DedupKey::from_parts(&["A", "X"]).unwrap();
        let record = get_dedup_record(&db, &key.hash).await.unwrap().unwrap();
        assert_eq!(record.original_row_number, 4);
        assert_eq!(record.duplicate_count, 4);
        assert_eq!(record.action, DeduplicationAction::Replace);

        let job = get_job(&db, "job-1").await.unwrap().unwrap();
        assert_eq!(job.successful_rows, 1);
        assert_eq!(job.duplicate_rows, 4);
    }

    #[tokio::test]
    async fn disabled_dedup_inserts_every_row() {
        let (_dir, db) = test_db().await;
        planned_job(&db, "job-1", 2, 2).await;
        let writer = SqliteRowWriter::new(db.clone());

        let mut b = batch(
            "job-1",
            0,
            DeduplicationAction::Skip,
            &[(0, ["A", "X", "1", ""]), (1, ["A", "X", "1", ""])],
        );
        b.dedup.enabled = false;
        let outcome = writer.write_batch(b).await.unwrap();

        assert_eq!(outcome.successful, 2);
        assert_eq!(list_job_records(&db, "job-1").await.unwrap().len(), 2);
    }
}
