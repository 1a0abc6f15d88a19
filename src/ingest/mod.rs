//! Chunk scheduling and processing.

pub mod dedup;
pub mod engine;
mod planner;
pub mod progress;
pub mod queue;
pub mod scheduler;
pub mod worker;

pub use dedup::{DedupKey, DedupPolicy};
pub use engine::{IngestEngine, JobRuntime, JobSettings};
pub use progress::{follow, ProgressHub, ProgressStream};
pub use queue::{ChannelQueue, Delivery, DeliveryTag, WorkItem, WorkQueue};
pub use scheduler::{ChunkPermit, ChunkScheduler};
pub use worker::{process_chunk, ChunkWork};
