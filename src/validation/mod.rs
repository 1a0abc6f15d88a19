//! Upload and row validation.
//!
//! `csv_validator` checks a whole file from a fixed-size sample before any
//! chunk is planned; `schema` checks and normalizes individual rows.

pub mod csv_validator;
pub mod schema;

pub use csv_validator::{
    validate, validate_records, CsvValidationError, CsvValidationResult, CsvValidationStats,
    CsvValidationWarning, LineEndings, VALIDATION_SAMPLE_SIZE,
};
pub use schema::{
    BoundSchema, FieldError, FieldSpec, FieldType, NormalizedRow, RowSchema, ValidatedRow,
};
