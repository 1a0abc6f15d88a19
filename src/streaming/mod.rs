//! Chunk spooling for large uploads.
//!
//! Splits a job's rows into per-chunk CSV files, record-aware so quoted
//! commas and newlines never break a row, and writes each file atomically.

mod atomic_writer;
mod csv_chunker;

pub use atomic_writer::AtomicChunkWriter;
pub use csv_chunker::{
    chunk_file_name, plan_ranges, split_file, split_records, SpoolResult, SpooledChunk,
};
