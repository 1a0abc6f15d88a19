//! Chunk scheduler for concurrency control.
//!
//! Bounds how many chunks may hold `processing` at once. The engine owns one
//! global scheduler, plus one per job when the concurrency scope is per-job or
//! the job runs sequentially.
//!
//! ```ignore
//! let scheduler = ChunkScheduler::new(4);
//! let permit = scheduler.acquire().await?;
//! // chunk runs while the permit is held
//! drop(permit);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::AppError;

// ─────────────────────────────────────────────────────────────────────────────
// ChunkScheduler
// ─────────────────────────────────────────────────────────────────────────────

/// Semaphore-backed slot pool. Clones share the same slots.
#[derive(Clone)]
pub struct ChunkScheduler {
    sem: Arc<Semaphore>,
    max: usize,
    /// Highest number of slots ever held at once.
    peak: Arc<AtomicUsize>,
}

impl ChunkScheduler {
    /// # Panics
    ///
    /// Panics if `max_concurrent` is 0; `IngestConfig::validate` rejects that.
    pub fn new(max_concurrent: usize) -> Self {
        assert!(max_concurrent > 0, "max_concurrent must be greater than 0");

        Self {
            sem: Arc::new(Semaphore::new(max_concurrent)),
            max: max_concurrent,
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Waits for a free slot.
    pub async fn acquire(&self) -> Result<ChunkPermit, AppError> {
        let permit = self
            .sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::Internal("chunk scheduler closed".into()))?;

        Ok(self.wrap(permit))
    }

    /// Takes a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<ChunkPermit> {
        self.sem
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| self.wrap(permit))
    }

    fn wrap(&self, permit: OwnedSemaphorePermit) -> ChunkPermit {
        self.peak.fetch_max(self.active_chunks(), Ordering::SeqCst);
        ChunkPermit {
            _permit: permit,
            max: self.max,
            sem: self.sem.clone(),
        }
    }

    pub fn active_chunks(&self) -> usize {
        self.max - self.sem.available_permits()
    }

    pub fn available_slots(&self) -> usize {
        self.sem.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.max
    }

    pub fn peak_active(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ChunkPermit
// ─────────────────────────────────────────────────────────────────────────────

/// One occupied slot, released on drop.
pub struct ChunkPermit {
    _permit: OwnedSemaphorePermit,
    max: usize,
    sem: Arc<Semaphore>,
}

impl ChunkPermit {
    /// Active chunks including this one.
    pub fn active_chunks(&self) -> usize {
        self.max - self.sem.available_permits()
    }
}

impl std::fmt::Debug for ChunkPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkPermit")
            .field("active", &self.active_chunks())
            .field("max", &self.max)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
