//! Coalesced progress publishing.
//!
//! Each job gets a broadcast channel. Row progress is published at most once
//! per interval; status changes always go out. Publishing never waits on
//! subscribers: a slow one lags and skips ahead, a missing one is ignored.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::models::{current_timestamp_ms, JobStatus, ProgressUpdate, UploadJob};

/// Buffered updates per job before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 64;

pub type ProgressStream = BoxStream<'static, ProgressUpdate>;

/// Human-readable phase for a status.
pub fn phase_for(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "queued",
        JobStatus::Validating => "validating file",
        JobStatus::Chunking => "splitting into chunks",
        JobStatus::Processing => "processing chunks",
        JobStatus::Completed => "completed",
        JobStatus::PartiallyCompleted => "completed with errors",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}

impl ProgressUpdate {
    /// Derives a snapshot from the job's counters.
    pub fn from_job(job: &UploadJob, settled_chunks: i64) -> Self {
        let now = current_timestamp_ms();

        let rows_per_second = job.rows_per_second.unwrap_or_else(|| match job.started_at {
            Some(started) if now > started => job.processed_rows as f64 * 1000.0 / (now - started) as f64,
            _ => 0.0,
        });

        let percent_complete = if job.total_rows > 0 {
            (job.processed_rows as f64 / job.total_rows as f64 * 100.0).min(100.0)
        } else if job.status.is_terminal() {
            100.0
        } else {
            0.0
        };

        let remaining = (job.total_rows - job.processed_rows).max(0);
        let estimated_time_remaining_ms = if job.status.is_terminal() {
            Some(0)
        } else if rows_per_second > 0.0 && remaining > 0 {
            Some((remaining as f64 / rows_per_second * 1000.0) as u64)
        } else {
            None
        };

        Self {
            job_id: job.id.clone(),
            status: job.status,
            phase: phase_for(job.status).to_string(),
            total_rows: job.total_rows,
            processed_rows: job.processed_rows,
            successful_rows: job.successful_rows,
            failed_rows: job.failed_rows,
            duplicate_rows: job.duplicate_rows,
            percent_complete,
            estimated_time_remaining_ms,
            current_chunk: settled_chunks,
            total_chunks: job.total_chunks,
            rows_per_second,
            timestamp: now,
        }
    }
}

struct JobChannel {
    tx: broadcast::Sender<ProgressUpdate>,
    last_status: Option<JobStatus>,
    last_sent: Option<Instant>,
}

impl JobChannel {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            last_status: None,
            last_sent: None,
        }
    }
}

/// Per-job progress fan-out.
pub struct ProgressHub {
    channels: Mutex<HashMap<String, JobChannel>>,
    interval: Duration,
}

impl ProgressHub {
    pub fn new(interval: Duration) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            interval,
        }
    }

    fn channels(&self) -> std::sync::MutexGuard<'_, HashMap<String, JobChannel>> {
        self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publishes unless a row-only update arrives within the interval.
    /// Returns whether the update went out.
    ///
    /// Channels exist only between `subscribe` and `remove`; updates for a
    /// job nobody subscribed to are dropped.
    pub fn publish(&self, update: ProgressUpdate) -> bool {
        let now = Instant::now();
        let mut channels = self.channels();
        let Some(channel) = channels.get_mut(&update.job_id) else {
            return false;
        };

        let status_changed = channel.last_status != Some(update.status);
        let due = channel
            .last_sent
            .map_or(true, |sent| now.duration_since(sent) >= self.interval);

        if !status_changed && !due {
            return false;
        }

        channel.last_status = Some(update.status);
        channel.last_sent = Some(now);
        // No subscribers is fine.
        let _ = channel.tx.send(update);
        true
    }

    /// Whether a row-only update for this job would go out now.
    pub fn is_due(&self, job_id: &str) -> bool {
        self.channels().get(job_id).map_or(true, |c| {
            c.last_sent
                .map_or(true, |sent| sent.elapsed() >= self.interval)
        })
    }

    pub fn subscribe(&self, job_id: &str) -> broadcast::Receiver<ProgressUpdate> {
        self.channels()
            .entry(job_id.to_string())
            .or_insert_with(JobChannel::new)
            .tx
            .subscribe()
    }

    /// Drops a finished job's channel; subscribers drain what was sent, then end.
    pub fn remove(&self, job_id: &str) {
        self.channels().remove(job_id);
    }

    pub fn subscriber_count(&self, job_id: &str) -> usize {
        self.channels()
            .get(job_id)
            .map_or(0, |c| c.tx.receiver_count())
    }
}

/// Yields `initial`, then updates from `rx` until a terminal status.
pub fn follow(initial: ProgressUpdate, rx: broadcast::Receiver<ProgressUpdate>) -> ProgressStream {
    if initial.status.is_terminal() {
        return stream::once(async move { initial }).boxed();
    }

    let rest = stream::unfold(Some(rx), |state| async move {
        let mut rx = state?;
        loop {
            match rx.recv().await {
                Ok(update) => {
                    let next = if update.status.is_terminal() { None } else { Some(rx) };
                    return Some((update, next));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Progress subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    stream::once(async move { initial }).chain(rest).boxed()
}
