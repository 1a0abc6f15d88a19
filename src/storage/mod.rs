//! SQLite persistence for jobs, chunks, errors, audit entries and loaded rows.

mod database;
pub mod jobs;
pub mod records;

pub use database::Database;
