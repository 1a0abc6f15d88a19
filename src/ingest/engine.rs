//! Chunk dispatch, worker pool and settlement.
//!
//! Three kinds of task cooperate through channels:
//! - the dispatcher pulls chunks off the work queue, takes a concurrency
//!   slot, claims the chunk and hands a `ChunkAssignment` to the pool
//! - `parallelism` workers run assignments and report back
//! - the coordinator records each attempt's result (complete, retry with
//!   backoff, or fail), releases the slot and finalizes jobs whose chunks
//!   have all settled
//!
//! Cancellation is cooperative: a cancelled job stops dispatching, its
//! waiting chunks are cancelled, and chunks already running finish.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{ConcurrencyScope, IngestConfig};
use crate::error::AppError;
use crate::ingest::dedup::DedupPolicy;
use crate::ingest::planner;
use crate::ingest::progress::ProgressHub;
use crate::ingest::queue::{Delivery, DeliveryTag, WorkQueue};
use crate::ingest::scheduler::{ChunkPermit, ChunkScheduler};
use crate::ingest::worker::{process_chunk, ChunkWork};
use crate::models::{JobStatus, ProcessingStrategy, ProgressUpdate, RowSource, UploadChunk, UploadJob};
use crate::storage::jobs::{self, Auditor};
use crate::storage::records::{BatchOutcome, RowWriter};
use crate::storage::Database;
use crate::validation::RowSchema;

/// Wait before offering a chunk again when its job has no free slot.
const JOB_SLOT_RETRY: Duration = Duration::from_millis(25);

/// Pause after an unexpected dequeue error.
const DEQUEUE_BACKOFF: Duration = Duration::from_millis(100);

/// Rows per transaction for the `stream` strategy.
const STREAM_BATCH_SIZE: usize = 100;

// ─────────────────────────────────────────────────────────────────────────────
// Job runtime
// ─────────────────────────────────────────────────────────────────────────────

/// Per-job processing settings decided at submission.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub schema: RowSchema,
    pub dedup: DedupPolicy,
    pub max_retries: u32,
    pub priority: i32,
    pub strategy: ProcessingStrategy,
}

/// In-memory state of a job the engine is driving.
pub struct JobRuntime {
    pub job_id: String,
    pub(crate) schema: Arc<RowSchema>,
    pub(crate) dedup: DedupPolicy,
    pub(crate) max_retries: u32,
    pub(crate) priority: i32,
    pub(crate) batch_size: usize,
    pub(crate) spool_dir: PathBuf,
    pub(crate) cancel: CancellationToken,
    slots: Option<ChunkScheduler>,
    deadline: Instant,
    /// Chunks not yet in a terminal status.
    outstanding: AtomicI64,
    settled: AtomicI64,
    finished: AtomicBool,
}

impl JobRuntime {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn settled_chunks(&self) -> i64 {
        self.settled.load(Ordering::SeqCst)
    }

    /// Sets how many chunks must settle before the job finalizes.
    pub(crate) fn expect_chunks(&self, count: i64) {
        self.outstanding.store(count, Ordering::SeqCst);
    }
}

/// A claimed chunk travelling to a worker. Dropping it frees the slots.
struct ChunkAssignment {
    tag: DeliveryTag,
    chunk: UploadChunk,
    runtime: Arc<JobRuntime>,
    _job_slot: Option<ChunkPermit>,
    _slot: ChunkPermit,
}

enum WorkerReport {
    BatchCommitted {
        job_id: String,
    },
    Finished {
        assignment: ChunkAssignment,
        result: Result<BatchOutcome, AppError>,
    },
}

enum Dispatch {
    Run(ChunkAssignment),
    Done,
    Stop,
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared state
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct Shared {
    pub(crate) db: Database,
    pub(crate) config: Arc<IngestConfig>,
    pub(crate) queue: Arc<dyn WorkQueue>,
    pub(crate) writer: Arc<dyn RowWriter>,
    pub(crate) progress: Arc<ProgressHub>,
    pub(crate) auditor: Auditor,
    pub(crate) shutdown: CancellationToken,
    global: ChunkScheduler,
    jobs: Mutex<HashMap<String, Arc<JobRuntime>>>,
}

impl Shared {
    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<JobRuntime>>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn runtime(&self, job_id: &str) -> Option<Arc<JobRuntime>> {
        self.jobs().get(job_id).cloned()
    }

    pub(crate) fn forget(&self, job_id: &str) {
        self.jobs().remove(job_id);
    }

    fn ack(&self, tag: DeliveryTag) {
        if let Err(e) = self.queue.ack(tag) {
            tracing::warn!(tag, error = %e, "Ack failed");
        }
    }

    fn nack(&self, tag: DeliveryTag, delay: Duration) {
        if let Err(e) = self.queue.nack_with_delay(tag, delay) {
            tracing::warn!(tag, error = %e, "Nack failed");
        }
    }

    /// Publishes the job's current counters.
    pub(crate) async fn publish_job(&self, job_id: &str) {
        let settled = self.runtime(job_id).map_or(0, |rt| rt.settled_chunks());
        match jobs::get_job(&self.db, job_id).await {
            Ok(Some(job)) => {
                self.progress.publish(ProgressUpdate::from_job(&job, settled));
            }
            Ok(None) => {}
            Err(e) => tracing::debug!(job_id, error = %e, "Progress snapshot skipped"),
        }
    }

    /// Counts `count` chunks as terminal and finalizes the job on the last one.
    async fn settle(&self, rt: &Arc<JobRuntime>, count: i64) {
        rt.settled.fetch_add(count, Ordering::SeqCst);
        let left = rt.outstanding.fetch_sub(count, Ordering::SeqCst) - count;

        if left <= 0 {
            self.finish_job(rt).await;
        } else {
            self.publish_job(&rt.job_id).await;
        }
    }

    /// Finalizes the job, publishes its last snapshot and drops its runtime.
    pub(crate) async fn finish_job(&self, rt: &Arc<JobRuntime>) {
        if rt.finished.swap(true, Ordering::SeqCst) {
            return;
        }

        let finalized = jobs::finalize_job(&self.db, &rt.job_id, &self.auditor).await;
        remove_spool_dir(&rt.spool_dir).await;

        match finalized {
            Ok(job) => {
                tracing::info!(
                    job_id = %job.id,
                    status = job.status.as_str(),
                    processed = job.processed_rows,
                    successful = job.successful_rows,
                    failed = job.failed_rows,
                    duplicate = job.duplicate_rows,
                    rows_per_second = job.rows_per_second.unwrap_or(0.0),
                    "Job finished"
                );
                self.progress
                    .publish(ProgressUpdate::from_job(&job, rt.settled_chunks()));
            }
            Err(e) => tracing::error!(job_id = %rt.job_id, error = %e, "Job finalization failed"),
        }

        self.progress.remove(&rt.job_id);
        self.forget(&rt.job_id);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Dispatch
    // ─────────────────────────────────────────────────────────────────────

    async fn prepare(&self, delivery: Delivery) -> Dispatch {
        let Delivery { tag, item } = delivery;

        let Some(rt) = self.runtime(&item.job_id) else {
            tracing::debug!(job_id = %item.job_id, chunk_number = item.chunk_number, "Dropping chunk of inactive job");
            self.ack(tag);
            return Dispatch::Done;
        };

        if rt.is_cancelled() {
            self.cancel_queued(&rt, tag, item.chunk_number).await;
            return Dispatch::Done;
        }

        if Instant::now() >= rt.deadline {
            self.expire_queued(&rt, tag, item.chunk_number).await;
            return Dispatch::Done;
        }

        let job_slot = match &rt.slots {
            Some(slots) => match slots.try_acquire() {
                Some(permit) => Some(permit),
                None => {
                    self.nack(tag, JOB_SLOT_RETRY);
                    return Dispatch::Done;
                }
            },
            None => None,
        };

        let slot = tokio::select! {
            _ = self.shutdown.cancelled() => return Dispatch::Stop,
            permit = self.global.acquire() => match permit {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::error!(error = %e, "Scheduler unavailable");
                    return Dispatch::Stop;
                }
            },
        };

        if rt.is_cancelled() {
            self.cancel_queued(&rt, tag, item.chunk_number).await;
            return Dispatch::Done;
        }

        match jobs::start_chunk(&self.db, &item.job_id, item.chunk_number, &self.auditor).await {
            Ok(chunk) => {
                tracing::debug!(
                    job_id = %item.job_id,
                    chunk_number = item.chunk_number,
                    attempt = chunk.attempts + 1,
                    active = slot.active_chunks(),
                    "Chunk dispatched"
                );
                Dispatch::Run(ChunkAssignment {
                    tag,
                    chunk,
                    runtime: rt,
                    _job_slot: job_slot,
                    _slot: slot,
                })
            }
            Err(e) if e.is_retryable() => {
                self.nack(tag, self.config.retry_delay(item.attempt));
                Dispatch::Done
            }
            Err(e) => {
                // Settled elsewhere, e.g. cancelled while waiting.
                tracing::debug!(job_id = %item.job_id, chunk_number = item.chunk_number, error = %e, "Chunk not started");
                self.ack(tag);
                Dispatch::Done
            }
        }
    }

    async fn cancel_queued(&self, rt: &Arc<JobRuntime>, tag: DeliveryTag, chunk_number: i64) {
        match jobs::cancel_chunk(&self.db, &rt.job_id, chunk_number, &self.auditor).await {
            Ok(changed) => {
                self.ack(tag);
                if changed {
                    self.settle(rt, 1).await;
                }
            }
            Err(e) if e.is_retryable() => self.nack(tag, JOB_SLOT_RETRY),
            Err(e) => {
                tracing::warn!(job_id = %rt.job_id, chunk_number, error = %e, "Chunk cancel failed");
                self.ack(tag);
            }
        }
    }

    async fn expire_queued(&self, rt: &Arc<JobRuntime>, tag: DeliveryTag, chunk_number: i64) {
        let error = AppError::JobTimeout {
            job_id: rt.job_id.clone(),
        };
        match jobs::fail_chunk(&self.db, &rt.job_id, chunk_number, &error, &self.auditor).await {
            Ok(failure) => {
                tracing::warn!(job_id = %rt.job_id, chunk_number, failed_rows = failure.failed_rows, "Chunk expired with its job");
                self.ack(tag);
                self.settle(rt, 1).await;
            }
            Err(e) if e.is_retryable() => self.nack(tag, JOB_SLOT_RETRY),
            Err(e) => {
                tracing::debug!(job_id = %rt.job_id, chunk_number, error = %e, "Chunk not expired");
                self.ack(tag);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Settlement
    // ─────────────────────────────────────────────────────────────────────

    /// Settles a planned chunk the queue refused, so its job still finalizes.
    /// A queue closed by shutdown cancels the chunk; any other error fails it.
    pub(crate) async fn settle_unqueued(&self, rt: &Arc<JobRuntime>, chunk_number: i64, error: &AppError) {
        let settled = if matches!(error, AppError::QueueClosed) && self.shutdown.is_cancelled() {
            jobs::cancel_chunk(&self.db, &rt.job_id, chunk_number, &self.auditor).await
        } else {
            jobs::fail_chunk(&self.db, &rt.job_id, chunk_number, error, &self.auditor)
                .await
                .map(|_| true)
        };

        match settled {
            Ok(true) => self.settle(rt, 1).await,
            Ok(false) => {}
            Err(e) => tracing::error!(job_id = %rt.job_id, chunk_number, error = %e, "Unqueued chunk could not be settled"),
        }
    }

    async fn record_attempt(&self, assignment: ChunkAssignment, result: Result<BatchOutcome, AppError>) {
        let job_id = assignment.runtime.job_id.clone();
        let chunk_number = assignment.chunk.chunk_number;

        let error = match result {
            Ok(outcome) => {
                match jobs::complete_chunk(&self.db, &job_id, chunk_number, &self.auditor).await {
                    Ok(_) => {
                        tracing::info!(
                            job_id = %job_id,
                            chunk_number,
                            successful = outcome.successful,
                            failed = outcome.failed,
                            duplicate = outcome.duplicate,
                            skipped = outcome.skipped,
                            "Chunk completed"
                        );
                        let tag = assignment.tag;
                        let runtime = assignment.runtime.clone();
                        drop(assignment);
                        self.ack(tag);
                        self.settle(&runtime, 1).await;
                        return;
                    }
                    Err(e) => e,
                }
            }
            Err(e) => e,
        };

        if matches!(error, AppError::Cancelled) && self.shutdown.is_cancelled() {
            tracing::warn!(job_id = %job_id, chunk_number, "Chunk interrupted by shutdown");
            return;
        }

        let rt = assignment.runtime.clone();
        let tag = assignment.tag;

        if error.is_retryable() && assignment.chunk.attempts < rt.max_retries as i64 {
            match jobs::retry_chunk(&self.db, &job_id, chunk_number, &error, &self.auditor).await {
                Ok(attempts) => {
                    let delay = self.config.retry_delay(attempts as u32);
                    tracing::warn!(
                        job_id = %job_id,
                        chunk_number,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Chunk attempt failed, retrying"
                    );
                    drop(assignment);
                    self.nack(tag, delay);
                    return;
                }
                Err(e) => tracing::error!(job_id = %job_id, chunk_number, error = %e, "Chunk retry could not be recorded"),
            }
        }

        match jobs::fail_chunk(&self.db, &job_id, chunk_number, &error, &self.auditor).await {
            Ok(failure) => {
                tracing::warn!(
                    job_id = %job_id,
                    chunk_number,
                    failed_rows = failure.failed_rows,
                    error = %error,
                    "Chunk failed"
                );
                drop(assignment);
                self.ack(tag);
                self.settle(&rt, 1).await;
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, chunk_number, error = %e, "Chunk failure could not be recorded");
                drop(assignment);
                self.ack(tag);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Cancellation
    // ─────────────────────────────────────────────────────────────────────

    pub(crate) async fn cancel_job(&self, job_id: &str, auditor: &Auditor) -> Result<UploadJob, AppError> {
        let job = jobs::request_cancel(&self.db, job_id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }

        tracing::info!(job_id, status = job.status.as_str(), actor = auditor.actor(), "Cancelling job");

        if let Some(rt) = self.runtime(job_id) {
            rt.cancel.cancel();
            if job.status == JobStatus::Processing {
                let cancelled = jobs::cancel_waiting_chunks(&self.db, job_id, auditor).await?;
                if !cancelled.is_empty() {
                    self.settle(&rt, cancelled.len() as i64).await;
                }
            }
        }

        self.publish_job(job_id).await;
        jobs::get_job(&self.db, job_id)
            .await?
            .ok_or_else(|| AppError::JobNotFound(job_id.to_string()))
    }
}

async fn remove_spool_dir(dir: &PathBuf) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "Failed to remove spool directory"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tasks
// ─────────────────────────────────────────────────────────────────────────────

async fn dispatch_loop(shared: Arc<Shared>, assignments: mpsc::Sender<ChunkAssignment>) {
    loop {
        let delivery = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            delivery = shared.queue.dequeue() => match delivery {
                Ok(delivery) => delivery,
                Err(AppError::QueueClosed) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Dequeue failed");
                    tokio::time::sleep(DEQUEUE_BACKOFF).await;
                    continue;
                }
            },
        };

        match shared.prepare(delivery).await {
            Dispatch::Run(assignment) => {
                if assignments.send(assignment).await.is_err() {
                    break;
                }
            }
            Dispatch::Done => {}
            Dispatch::Stop => break,
        }
    }

    tracing::debug!("Dispatcher stopped");
}

async fn worker_loop(
    shared: Arc<Shared>,
    worker_id: String,
    assignments: Arc<tokio::sync::Mutex<mpsc::Receiver<ChunkAssignment>>>,
    reports: mpsc::UnboundedSender<WorkerReport>,
) {
    loop {
        let next = {
            let mut rx = assignments.lock().await;
            rx.recv().await
        };
        let Some(assignment) = next else { break };

        let rt = assignment.runtime.clone();
        let chunk = &assignment.chunk;

        if let Err(e) = jobs::assign_worker(&shared.db, &rt.job_id, chunk.chunk_number, &worker_id).await {
            tracing::debug!(job_id = %rt.job_id, chunk_number = chunk.chunk_number, error = %e, "Worker not recorded");
        }

        let work = ChunkWork {
            job_id: rt.job_id.clone(),
            chunk_number: chunk.chunk_number,
            start_row: chunk.start_row,
            end_row: chunk.end_row,
            file_path: chunk
                .file_path
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| rt.spool_dir.join(crate::streaming::chunk_file_name(chunk.chunk_number))),
            schema: rt.schema.clone(),
            dedup: rt.dedup,
            batch_size: rt.batch_size,
        };

        let on_batch = {
            let reports = reports.clone();
            let job_id = rt.job_id.clone();
            move |_: &BatchOutcome| {
                let _ = reports.send(WorkerReport::BatchCommitted {
                    job_id: job_id.clone(),
                });
            }
        };

        let timeout = shared.config.chunk_timeout;
        let result = match tokio::time::timeout(
            timeout,
            process_chunk(shared.writer.as_ref(), &work, &shared.shutdown, &on_batch),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AppError::ChunkTimeout {
                chunk_number: work.chunk_number,
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        if reports
            .send(WorkerReport::Finished { assignment, result })
            .is_err()
        {
            break;
        }
    }

    tracing::debug!(worker_id = %worker_id, "Worker stopped");
}

async fn coordinate(shared: Arc<Shared>, mut reports: mpsc::UnboundedReceiver<WorkerReport>) {
    while let Some(report) = reports.recv().await {
        match report {
            WorkerReport::BatchCommitted { job_id } => {
                if shared.progress.is_due(&job_id) {
                    shared.publish_job(&job_id).await;
                }
            }
            WorkerReport::Finished { assignment, result } => {
                shared.record_attempt(assignment, result).await;
            }
        }
    }

    tracing::debug!("Coordinator stopped");
}

// ─────────────────────────────────────────────────────────────────────────────
// IngestEngine
// ─────────────────────────────────────────────────────────────────────────────

/// Owns the dispatcher, worker and coordinator tasks.
pub struct IngestEngine {
    shared: Arc<Shared>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
}

impl IngestEngine {
    /// Spawns the engine's tasks on the current runtime.
    pub fn start(
        db: Database,
        config: Arc<IngestConfig>,
        queue: Arc<dyn WorkQueue>,
        writer: Arc<dyn RowWriter>,
        auditor: Auditor,
    ) -> Self {
        let global_slots = match config.concurrency_scope {
            ConcurrencyScope::Global => config.max_concurrent_chunks,
            ConcurrencyScope::PerJob => config.parallelism,
        };
        let parallelism = config.parallelism.max(1);

        let shared = Arc::new(Shared {
            db,
            progress: Arc::new(ProgressHub::new(config.progress_interval)),
            global: ChunkScheduler::new(global_slots.max(1)),
            config,
            queue,
            writer,
            auditor,
            shutdown: CancellationToken::new(),
            jobs: Mutex::new(HashMap::new()),
        });

        let (assign_tx, assign_rx) = mpsc::channel(parallelism);
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let assign_rx = Arc::new(tokio::sync::Mutex::new(assign_rx));

        let mut tasks = JoinSet::new();
        tasks.spawn(dispatch_loop(shared.clone(), assign_tx));
        for i in 0..parallelism {
            tasks.spawn(worker_loop(
                shared.clone(),
                format!("worker-{}", i),
                assign_rx.clone(),
                report_tx.clone(),
            ));
        }
        tasks.spawn(coordinate(shared.clone(), report_rx));

        tracing::info!(
            parallelism,
            global_slots,
            scope = ?shared.config.concurrency_scope,
            "Ingest engine started"
        );

        Self {
            shared,
            tasks: tokio::sync::Mutex::new(tasks),
        }
    }

    /// Registers a submitted job so it can be planned, dispatched and cancelled.
    pub fn register_job(&self, job: &UploadJob, settings: JobSettings) -> Arc<JobRuntime> {
        let config = &self.shared.config;

        let slots = match (settings.strategy, config.concurrency_scope) {
            (ProcessingStrategy::Sequential, _) => Some(ChunkScheduler::new(1)),
            (_, ConcurrencyScope::PerJob) => Some(ChunkScheduler::new(config.max_concurrent_chunks.max(1))),
            _ => None,
        };

        let batch_size = match settings.strategy {
            ProcessingStrategy::Stream => config.batch_size.min(STREAM_BATCH_SIZE),
            ProcessingStrategy::Batch => config.max_rows_per_chunk,
            ProcessingStrategy::Parallel | ProcessingStrategy::Sequential => config.batch_size,
        };

        let rt = Arc::new(JobRuntime {
            job_id: job.id.clone(),
            schema: Arc::new(settings.schema),
            dedup: settings.dedup,
            max_retries: settings.max_retries,
            priority: settings.priority,
            batch_size,
            spool_dir: config.work_dir.join(&job.id),
            cancel: CancellationToken::new(),
            slots,
            deadline: Instant::now() + config.job_timeout,
            outstanding: AtomicI64::new(0),
            settled: AtomicI64::new(0),
            finished: AtomicBool::new(false),
        });

        self.shared.jobs().insert(job.id.clone(), rt.clone());
        rt
    }

    /// Runs validation, chunking and enqueueing for a registered job in the background.
    pub fn spawn_planning(&self, rt: Arc<JobRuntime>, source: RowSource) {
        tokio::spawn(planner::plan_job(self.shared.clone(), rt, source));
    }

    pub async fn cancel_job(&self, job_id: &str, auditor: &Auditor) -> Result<UploadJob, AppError> {
        self.shared.cancel_job(job_id, auditor).await
    }

    pub fn progress(&self) -> &Arc<ProgressHub> {
        &self.shared.progress
    }

    pub fn scheduler(&self) -> &ChunkScheduler {
        &self.shared.global
    }

    pub fn runtime(&self, job_id: &str) -> Option<Arc<JobRuntime>> {
        self.shared.runtime(job_id)
    }

    /// Ids of jobs currently planned or processed by this engine.
    pub fn active_job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.jobs().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stops dispatching, lets workers drain and waits for every task.
    ///
    /// Chunks interrupted mid-attempt stay `processing` and are reconciled
    /// the next time the service opens the database.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.shared.queue.close();

        let mut tasks = self.tasks.lock().await;
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Engine task ended abnormally");
            }
        }
        tracing::info!("Ingest engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;

    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    use crate::ingest::queue::{ChannelQueue, WorkItem};
    use crate::models::{ChunkStatus, ErrorType, JobOptions};
    use crate::state::tests::{invoice_csv, meta, test_config, wait_for_terminal, GatedWriter, HEADER};
    use crate::state::IngestService;
    use crate::storage::records::{RowBatch, SqliteRowWriter};

    // ── Fakes ─────────────────────────────────────────────────────────────────

    /// SQLite writer that records batch order and per-job overlap, and can
    /// hold batches until the test opens the gate.
    struct ObservedWriter {
        inner: SqliteRowWriter,
        gate: Semaphore,
        hold: Duration,
        order: Mutex<Vec<(String, i64)>>,
        active: Mutex<HashMap<String, usize>>,
        peaks: Mutex<HashMap<String, usize>>,
    }

    impl ObservedWriter {
        fn new(db: Database, open: bool, hold: Duration) -> Self {
            Self {
                inner: SqliteRowWriter::new(db),
                gate: Semaphore::new(if open { Semaphore::MAX_PERMITS } else { 0 }),
                hold,
                order: Mutex::new(Vec::new()),
                active: Mutex::new(HashMap::new()),
                peaks: Mutex::new(HashMap::new()),
            }
        }

        fn peak(&self, job_id: &str) -> usize {
            self.peaks.lock().unwrap().get(job_id).copied().unwrap_or(0)
        }

        fn order(&self) -> Vec<(String, i64)> {
            self.order.lock().unwrap().clone()
        }
    }

    impl RowWriter for ObservedWriter {
        fn write_batch(
            &self,
            batch: RowBatch,
        ) -> Pin<Box<dyn Future<Output = Result<BatchOutcome, AppError>> + Send + '_>> {
            Box::pin(async move {
                let job_id = batch.job_id.clone();
                self.order.lock().unwrap().push((job_id.clone(), batch.chunk_number));
                {
                    let mut active = self.active.lock().unwrap();
                    let now = active.entry(job_id.clone()).or_default();
                    *now += 1;
                    let mut peaks = self.peaks.lock().unwrap();
                    let peak = peaks.entry(job_id.clone()).or_default();
                    *peak = (*peak).max(*now);
                }

                let _open = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|_| AppError::Internal("gate closed".into()))?;
                tokio::time::sleep(self.hold).await;
                let result = self.inner.write_batch(batch).await;

                if let Some(now) = self.active.lock().unwrap().get_mut(&job_id) {
                    *now -= 1;
                }
                result
            })
        }

        fn completed_rows<'a>(
            &'a self,
            job_id: &'a str,
            chunk_number: i64,
        ) -> Pin<Box<dyn Future<Output = Result<HashSet<i64>, AppError>> + Send + 'a>> {
            self.inner.completed_rows(job_id, chunk_number)
        }
    }

    /// Reports a busy database for every batch of one chunk, or of all chunks.
    struct BrokenChunkWriter {
        inner: SqliteRowWriter,
        broken: Option<i64>,
        refusals: AtomicUsize,
    }

    impl RowWriter for BrokenChunkWriter {
        fn write_batch(
            &self,
            batch: RowBatch,
        ) -> Pin<Box<dyn Future<Output = Result<BatchOutcome, AppError>> + Send + '_>> {
            Box::pin(async move {
                if self.broken.map_or(true, |n| n == batch.chunk_number) {
                    self.refusals.fetch_add(1, Ordering::SeqCst);
                    return Err(AppError::DatabaseBusy("database is locked".into()));
                }
                self.inner.write_batch(batch).await
            })
        }

        fn completed_rows<'a>(
            &'a self,
            job_id: &'a str,
            chunk_number: i64,
        ) -> Pin<Box<dyn Future<Output = Result<HashSet<i64>, AppError>> + Send + 'a>> {
            self.inner.completed_rows(job_id, chunk_number)
        }
    }

    /// Channel queue that refuses one chunk at enqueue time.
    struct RefusingQueue {
        inner: ChannelQueue,
        refused_chunk: i64,
    }

    impl WorkQueue for RefusingQueue {
        fn enqueue(
            &self,
            item: WorkItem,
        ) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + '_>> {
            if item.chunk_number == self.refused_chunk {
                return Box::pin(async { Err::<(), AppError>(AppError::QueueFull) });
            }
            self.inner.enqueue(item)
        }

        fn try_enqueue(&self, item: WorkItem) -> Result<(), AppError> {
            self.inner.try_enqueue(item)
        }

        fn dequeue(&self) -> Pin<Box<dyn Future<Output = Result<Delivery, AppError>> + Send + '_>> {
            self.inner.dequeue()
        }

        fn ack(&self, tag: DeliveryTag) -> Result<(), AppError> {
            self.inner.ack(tag)
        }

        fn nack_with_delay(&self, tag: DeliveryTag, delay: Duration) -> Result<(), AppError> {
            self.inner.nack_with_delay(tag, delay)
        }

        fn close(&self) {
            self.inner.close()
        }

        fn len(&self) -> usize {
            self.inner.len()
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    async fn service_with<W, F>(dir: &TempDir, config: IngestConfig, make: F) -> (IngestService, Arc<W>)
    where
        W: RowWriter + 'static,
        F: FnOnce(Database) -> W,
    {
        let db = Database::init(dir.path().join("ingest.db")).await.unwrap();
        let writer = Arc::new(make(db.clone()));
        let queue = Arc::new(ChannelQueue::new(config.queue_capacity));
        let service = IngestService::with_parts(db, config, queue, writer.clone())
            .await
            .unwrap();
        (service, writer)
    }

    async fn submit(service: &IngestService, path: PathBuf, options: JobOptions) -> String {
        service
            .submit_job(meta("invoices.csv"), RowSource::CsvFile(path), options)
            .await
            .expect("submit")
    }

    fn small_chunks(dir: &TempDir) -> IngestConfig {
        IngestConfig {
            max_rows_per_chunk: 10,
            batch_size: 100,
            ..test_config(dir)
        }
    }

    // ── Retry and timeout ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn timed_out_chunk_is_retried_then_failed() {
        let dir = TempDir::new().unwrap();
        let config = IngestConfig {
            chunk_timeout: Duration::from_millis(50),
            ..small_chunks(&dir)
        };
        let (service, writer) = service_with(&dir, config, |_| GatedWriter::closed()).await;
        let path = invoice_csv(dir.path(), "stuck.csv", 10, &[]);

        let job_id = submit(
            &service,
            path,
            JobOptions {
                max_retries: Some(2),
                ..JobOptions::default()
            },
        )
        .await;
        let job = wait_for_terminal(&service, &job_id).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failed_rows, 10);
        assert_eq!(writer.started.load(Ordering::SeqCst), 3);

        let chunks = service.get_job_chunks(&job_id).await.unwrap();
        assert_eq!(chunks[0].status, ChunkStatus::Failed);
        assert_eq!(chunks[0].attempts, 3);

        let errors = service.list_processing_errors(&job_id).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_type, ErrorType::Timeout);
        assert_eq!(errors[0].error_code, "CHUNK_TIMEOUT");
        service.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_chunk_leaves_job_partially_completed() {
        let dir = TempDir::new().unwrap();
        let (service, writer) = service_with(&dir, small_chunks(&dir), |db| BrokenChunkWriter {
            inner: SqliteRowWriter::new(db),
            broken: Some(1),
            refusals: AtomicUsize::new(0),
        })
        .await;
        let path = invoice_csv(dir.path(), "thirty.csv", 30, &[]);

        let job_id = submit(
            &service,
            path,
            JobOptions {
                max_retries: Some(1),
                ..JobOptions::default()
            },
        )
        .await;
        let job = wait_for_terminal(&service, &job_id).await;

        assert_eq!(job.status, JobStatus::PartiallyCompleted);
        assert_eq!(job.successful_rows, 20);
        assert_eq!(job.failed_rows, 10);
        assert_eq!(writer.refusals.load(Ordering::SeqCst), 2);

        let chunks = service.get_job_chunks(&job_id).await.unwrap();
        let statuses: Vec<ChunkStatus> = chunks.iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            vec![ChunkStatus::Completed, ChunkStatus::Failed, ChunkStatus::Completed]
        );

        let errors = service.list_processing_errors(&job_id).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].chunk_number, Some(1));
        assert_eq!(errors[0].error_type, ErrorType::Database);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn job_fails_when_every_chunk_is_exhausted() {
        let dir = TempDir::new().unwrap();
        let (service, writer) = service_with(&dir, small_chunks(&dir), |db| BrokenChunkWriter {
            inner: SqliteRowWriter::new(db),
            broken: None,
            refusals: AtomicUsize::new(0),
        })
        .await;
        let path = invoice_csv(dir.path(), "twenty.csv", 20, &[]);

        let job_id = submit(
            &service,
            path,
            JobOptions {
                max_retries: Some(1),
                ..JobOptions::default()
            },
        )
        .await;
        let job = wait_for_terminal(&service, &job_id).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failed_rows, 20);
        assert_eq!(job.successful_rows, 0);
        assert_eq!(writer.refusals.load(Ordering::SeqCst), 4);
        service.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn chunks_dispatched_after_the_job_deadline_expire() {
        let dir = TempDir::new().unwrap();
        let config = IngestConfig {
            max_concurrent_chunks: 1,
            parallelism: 1,
            job_timeout: Duration::from_millis(500),
            ..small_chunks(&dir)
        };
        let (service, writer) =
            service_with(&dir, config, |db| ObservedWriter::new(db, false, Duration::ZERO)).await;
        let path = invoice_csv(dir.path(), "slow.csv", 50, &[]);

        let job_id = submit(&service, path, JobOptions::default()).await;

        tokio::time::timeout(Duration::from_secs(10), async {
            while writer.order().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first chunk should start");
        tokio::time::sleep(Duration::from_millis(700)).await;
        writer.gate.add_permits(Semaphore::MAX_PERMITS / 2);

        let job = wait_for_terminal(&service, &job_id).await;
        assert_eq!(job.status, JobStatus::PartiallyCompleted);

        let chunks = service.get_job_chunks(&job_id).await.unwrap();
        let completed = chunks.iter().filter(|c| c.status == ChunkStatus::Completed).count();
        let failed = chunks.iter().filter(|c| c.status == ChunkStatus::Failed).count();
        assert!(completed >= 1, "completed {}", completed);
        assert!(failed >= 3, "failed {}", failed);
        assert_eq!(completed + failed, 5);
        assert_eq!(job.failed_rows, failed as i64 * 10);

        let errors = service.list_processing_errors(&job_id).await.unwrap();
        assert_eq!(errors.len(), failed);
        assert!(errors
            .iter()
            .all(|e| e.error_type == ErrorType::Timeout && e.error_code == "JOB_TIMEOUT"));
        service.shutdown().await;
    }

    // ── Concurrency ───────────────────────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn per_job_scope_bounds_each_job_separately() {
        let dir = TempDir::new().unwrap();
        let config = IngestConfig {
            concurrency_scope: ConcurrencyScope::PerJob,
            max_concurrent_chunks: 1,
            parallelism: 4,
            ..small_chunks(&dir)
        };
        let (service, writer) = service_with(&dir, config, |db| {
            ObservedWriter::new(db, true, Duration::from_millis(20))
        })
        .await;

        let first = submit(&service, invoice_csv(dir.path(), "a.csv", 50, &[]), JobOptions::default()).await;
        let mut second_rows = String::from(HEADER);
        for i in 0..50 {
            second_rows.push_str(&format!("B-{i:05},2024-02-01,Beta Ltd,Gadget {i},1,4.50,4.50\n"));
        }
        let second_path = dir.path().join("b.csv");
        std::fs::write(&second_path, second_rows).unwrap();
        let second = submit(&service, second_path, JobOptions::default()).await;

        let a = wait_for_terminal(&service, &first).await;
        let b = wait_for_terminal(&service, &second).await;
        assert_eq!(a.status, JobStatus::Completed);
        assert_eq!(b.status, JobStatus::Completed);

        assert_eq!(writer.peak(&first), 1);
        assert_eq!(writer.peak(&second), 1);
        assert!(service.engine().scheduler().peak_active() <= 2);
        service.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sequential_job_runs_one_chunk_at_a_time() {
        let dir = TempDir::new().unwrap();
        let config = IngestConfig {
            max_concurrent_chunks: 4,
            parallelism: 4,
            ..small_chunks(&dir)
        };
        let (service, writer) = service_with(&dir, config, |db| {
            ObservedWriter::new(db, true, Duration::from_millis(20))
        })
        .await;
        let path = invoice_csv(dir.path(), "ordered.csv", 60, &[]);

        let job_id = submit(
            &service,
            path,
            JobOptions {
                strategy: ProcessingStrategy::Sequential,
                ..JobOptions::default()
            },
        )
        .await;
        let job = wait_for_terminal(&service, &job_id).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.total_chunks, 6);
        assert_eq!(writer.peak(&job_id), 1);
        let mut chunks: Vec<i64> = writer.order().into_iter().map(|(_, n)| n).collect();
        chunks.sort_unstable();
        assert_eq!(chunks, (0..6).collect::<Vec<i64>>());
        service.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn higher_priority_job_overtakes_queued_chunks() {
        let dir = TempDir::new().unwrap();
        let config = IngestConfig {
            max_concurrent_chunks: 1,
            parallelism: 1,
            ..small_chunks(&dir)
        };
        let db = Database::init(dir.path().join("ingest.db")).await.unwrap();
        let writer = Arc::new(ObservedWriter::new(db.clone(), false, Duration::ZERO));
        let queue = Arc::new(ChannelQueue::new(config.queue_capacity));
        let service = IngestService::with_parts(db, config, queue.clone(), writer.clone())
            .await
            .unwrap();

        let low = submit(&service, invoice_csv(dir.path(), "low.csv", 50, &[]), JobOptions::default()).await;
        tokio::time::timeout(Duration::from_secs(10), async {
            while writer.order().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first chunk should start");

        let mut urgent_rows = String::from(HEADER);
        for i in 0..30 {
            urgent_rows.push_str(&format!("U-{i:05},2024-03-01,Gamma,Part {i},1,1.00,1.00\n"));
        }
        let urgent_path = dir.path().join("urgent.csv");
        std::fs::write(&urgent_path, urgent_rows).unwrap();
        let high = submit(
            &service,
            urgent_path,
            JobOptions {
                priority: 10,
                ..JobOptions::default()
            },
        )
        .await;

        // Five low chunks are unacked (two delivered, three waiting) plus three urgent ones.
        tokio::time::timeout(Duration::from_secs(10), async {
            while queue.len() < 8 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("urgent chunks should be queued");

        writer.gate.add_permits(Semaphore::MAX_PERMITS / 2);
        wait_for_terminal(&service, &low).await;
        wait_for_terminal(&service, &high).await;

        // The running chunk and the one already waiting for a slot go first.
        let order = writer.order();
        assert_eq!(order.len(), 8);
        assert_eq!(order[0], (low.clone(), 0));
        assert_eq!(order[1], (low.clone(), 1));
        let expected: Vec<(String, i64)> = (0..3)
            .map(|n| (high.clone(), n))
            .chain((2..5).map(|n| (low.clone(), n)))
            .collect();
        assert_eq!(order[2..].to_vec(), expected);
        service.shutdown().await;
    }

    // ── Enqueue failures ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn refused_chunk_is_failed_and_job_still_finishes() {
        let dir = TempDir::new().unwrap();
        let config = small_chunks(&dir);
        let db = Database::init(dir.path().join("ingest.db")).await.unwrap();
        let queue = Arc::new(RefusingQueue {
            inner: ChannelQueue::new(config.queue_capacity),
            refused_chunk: 1,
        });
        let service = IngestService::with_parts(
            db.clone(),
            config,
            queue,
            Arc::new(SqliteRowWriter::new(db)),
        )
        .await
        .unwrap();
        let path = invoice_csv(dir.path(), "refused.csv", 30, &[]);

        let job_id = submit(&service, path, JobOptions::default()).await;
        let job = wait_for_terminal(&service, &job_id).await;

        assert_eq!(job.status, JobStatus::PartiallyCompleted);
        assert_eq!(job.successful_rows, 20);
        assert_eq!(job.failed_rows, 10);

        let chunks = service.get_job_chunks(&job_id).await.unwrap();
        assert_eq!(chunks[1].status, ChunkStatus::Failed);
        let errors = service.list_processing_errors(&job_id).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].chunk_number, Some(1));
        assert_eq!(errors[0].error_type, ErrorType::System);
        service.shutdown().await;
    }
}
