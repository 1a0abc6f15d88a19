//! Declarative per-row schema.
//!
//! A row goes through three steps, each producing a different error kind:
//! 1. type normalization (`INVALID_FIELD_FORMAT`, or `REQUIRED_FIELD_MISSING`)
//! 2. constraint checks after the transform hook (`VALIDATION_FAILED`)
//! 3. the validate hook (`BUSINESS_RULE`)
//!
//! Row errors never abort the chunk; the caller records them and moves on.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate};
use regex::Regex;
use serde_json::{Map, Number, Value};

use crate::error::AppError;

/// Accepted input date layouts, normalized to ISO `YYYY-MM-DD`.
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y", "%m-%d-%Y"];

/// Default schema version tag for the invoice layout.
pub const INVOICE_SCHEMA_VERSION: &str = "invoice-v1";

// ─────────────────────────────────────────────────────────────────────────────
// Field Specs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Decimal,
    /// Decimal that tolerates currency symbols and thousands separators.
    Money,
    Date,
    Boolean,
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    name: String,
    field_type: FieldType,
    required: bool,
    aliases: Vec<String>,
    pattern: Option<Regex>,
    min: Option<f64>,
    max: Option<f64>,
    allowed: Option<Vec<String>>,
    max_length: Option<usize>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            aliases: Vec::new(),
            pattern: None,
            min: None,
            max: None,
            allowed: None,
            max_length: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Adds an alternative header name that maps onto this field.
    pub fn alias(mut self, header: impl Into<String>) -> Self {
        self.aliases.push(header.into());
        self
    }

    pub fn pattern(mut self, pattern: &str) -> Result<Self, AppError> {
        let regex = Regex::new(pattern)
            .map_err(|e| AppError::Config(format!("Invalid pattern for {}: {}", self.name, e)))?;
        self.pattern = Some(regex);
        Ok(self)
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    /// Restricts the value to a fixed set (compared case-insensitively).
    pub fn one_of<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = Some(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn matches_header(&self, header: &str) -> bool {
        let header = header.trim();
        header.eq_ignore_ascii_case(&self.name)
            || self.aliases.iter().any(|a| header.eq_ignore_ascii_case(a))
    }

    /// Parses the trimmed raw text into the field's JSON type.
    fn normalize(&self, raw: &str) -> Result<Value, AppError> {
        let format_error = |expected: &str| AppError::InvalidFieldFormat {
            field: self.name.clone(),
            message: format!("expected {}, got '{}'", expected, raw),
        };

        match self.field_type {
            FieldType::String => Ok(Value::String(raw.to_string())),
            FieldType::Integer => raw
                .replace(',', "")
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format_error("an integer")),
            FieldType::Decimal => parse_decimal(&raw.replace(',', ""))
                .ok_or_else(|| format_error("a number")),
            FieldType::Money => {
                let cleaned: String = raw
                    .chars()
                    .filter(|c| !matches!(c, '$' | '€' | '£' | ',' | ' '))
                    .collect();
                parse_decimal(&cleaned).ok_or_else(|| format_error("a monetary amount"))
            }
            FieldType::Date => parse_date(raw)
                .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                .ok_or_else(|| format_error("a date")),
            FieldType::Boolean => match raw.to_ascii_lowercase().as_str() {
                "true" | "yes" | "y" | "1" => Ok(Value::Bool(true)),
                "false" | "no" | "n" | "0" => Ok(Value::Bool(false)),
                _ => Err(format_error("a boolean")),
            },
        }
    }

    /// Checks pattern, range, enum and length constraints on a normalized value.
    fn check(&self, value: &Value) -> Result<(), AppError> {
        let fail = |message: String| AppError::ValidationFailed {
            field: self.name.clone(),
            message,
        };

        if let Some(n) = value.as_f64() {
            if let Some(min) = self.min {
                if n < min {
                    return Err(fail(format!("{} is below the minimum {}", n, min)));
                }
            }
            if let Some(max) = self.max {
                if n > max {
                    return Err(fail(format!("{} is above the maximum {}", n, max)));
                }
            }
        }

        let text = value_text(value);

        if let Some(pattern) = &self.pattern {
            if !pattern.is_match(&text) {
                return Err(fail(format!("'{}' does not match {}", text, pattern.as_str())));
            }
        }

        if let Some(allowed) = &self.allowed {
            if !allowed.iter().any(|a| a.eq_ignore_ascii_case(&text)) {
                return Err(fail(format!("'{}' is not one of {}", text, allowed.join(", "))));
            }
        }

        if let Some(max_length) = self.max_length {
            if text.chars().count() > max_length {
                return Err(fail(format!("longer than {} characters", max_length)));
            }
        }

        Ok(())
    }
}

fn parse_decimal(text: &str) -> Option<Value> {
    let n = text.parse::<f64>().ok()?;
    Number::from_f64(n).map(Value::Number)
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
        .or_else(|| DateTime::parse_from_rfc3339(text).ok().map(|dt| dt.date_naive()))
}

/// String form used for pattern/enum checks and business keys.
pub(crate) fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row Schema
// ─────────────────────────────────────────────────────────────────────────────

/// Mutates a normalized row before constraints are checked.
pub type TransformHook = Arc<dyn Fn(&mut Map<String, Value>) + Send + Sync>;

/// Business rule over a whole row; `Err` carries the rule violation message.
pub type ValidateHook = Arc<dyn Fn(&Map<String, Value>) -> Result<(), String> + Send + Sync>;

#[derive(Clone)]
pub struct RowSchema {
    version: String,
    fields: Vec<FieldSpec>,
    key_fields: Vec<String>,
    transform: Option<TransformHook>,
    validate: Option<ValidateHook>,
}

impl fmt::Debug for RowSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowSchema")
            .field("version", &self.version)
            .field("fields", &self.fields)
            .field("key_fields", &self.key_fields)
            .field("transform", &self.transform.is_some())
            .field("validate", &self.validate.is_some())
            .finish()
    }
}

impl Default for RowSchema {
    fn default() -> Self {
        Self::invoice()
    }
}

impl RowSchema {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            fields: Vec::new(),
            key_fields: Vec::new(),
            transform: None,
            validate: None,
        }
    }

    /// Invoice line-item layout used when a job does not bring its own schema.
    pub fn invoice() -> Self {
        Self::new(INVOICE_SCHEMA_VERSION)
            .field(
                FieldSpec::new("invoice_number", FieldType::String)
                    .required()
                    .alias("Invoice ID")
                    .alias("Invoice Number")
                    .max_length(64),
            )
            .field(
                FieldSpec::new("invoice_date", FieldType::Date)
                    .alias("Date")
                    .alias("Invoice Date"),
            )
            .field(
                FieldSpec::new("customer_name", FieldType::String)
                    .alias("Customer")
                    .alias("Customer Name")
                    .max_length(256),
            )
            .field(
                FieldSpec::new("item_name", FieldType::String)
                    .required()
                    .alias("Item Name")
                    .alias("Item")
                    .max_length(256),
            )
            .field(
                FieldSpec::new("quantity", FieldType::Decimal)
                    .required()
                    .alias("Quantity")
                    .alias("Qty")
                    .min(0.0)
                    .max(100_000.0),
            )
            .field(
                FieldSpec::new("item_price", FieldType::Money)
                    .alias("Item Price")
                    .alias("Unit Price")
                    .min(0.0),
            )
            .field(
                FieldSpec::new("total", FieldType::Money)
                    .alias("Total")
                    .alias("Line Total")
                    .min(0.0),
            )
            .key_fields(["invoice_number", "item_name"])
    }

    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    /// Fields whose normalized values form the dedup business key.
    pub fn key_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_transform<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Map<String, Value>) + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(hook));
        self
    }

    pub fn with_validate<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(hook));
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Maps file headers onto schema fields.
    ///
    /// Fails when a required field has no matching column. Columns that
    /// match no field are carried through as plain strings.
    pub fn bind(&self, headers: &[String]) -> Result<BoundSchema<'_>, AppError> {
        let mut columns = Vec::with_capacity(self.fields.len());
        let mut missing = Vec::new();

        for spec in &self.fields {
            match headers.iter().position(|h| spec.matches_header(h)) {
                Some(idx) => columns.push((spec, Some(idx))),
                None if spec.required => missing.push(spec.name.clone()),
                None => columns.push((spec, None)),
            }
        }

        if !missing.is_empty() {
            return Err(AppError::CsvInvalid(format!(
                "missing required columns: {}",
                missing.join(", ")
            )));
        }

        let extras = headers
            .iter()
            .enumerate()
            .filter(|(idx, h)| {
                !h.trim().is_empty() && !columns.iter().any(|(_, col)| *col == Some(*idx))
            })
            .map(|(idx, h)| (idx, h.trim().to_string()))
            .collect();

        Ok(BoundSchema {
            schema: self,
            columns,
            extras,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row Processing
// ─────────────────────────────────────────────────────────────────────────────

/// A row that passed every check, ready for dedup and persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRow {
    pub data: Map<String, Value>,
    /// Values of the key fields in declared order ("" when absent).
    pub key_parts: Vec<String>,
}

#[derive(Debug)]
pub struct FieldError {
    pub field: Option<String>,
    pub error: AppError,
}

#[derive(Debug)]
pub enum ValidatedRow {
    Valid(NormalizedRow),
    Invalid(Vec<FieldError>),
}

/// A schema resolved against one file's header row.
#[derive(Debug)]
pub struct BoundSchema<'a> {
    schema: &'a RowSchema,
    columns: Vec<(&'a FieldSpec, Option<usize>)>,
    extras: Vec<(usize, String)>,
}

impl BoundSchema<'_> {
    pub fn process(&self, values: &[&str]) -> ValidatedRow {
        let mut data = Map::new();
        let mut errors = Vec::new();

        for (spec, idx) in &self.columns {
            let raw = idx.and_then(|i| values.get(i)).map(|v| v.trim()).unwrap_or("");
            if raw.is_empty() {
                if spec.required {
                    errors.push(FieldError {
                        field: Some(spec.name.clone()),
                        error: AppError::RequiredFieldMissing(spec.name.clone()),
                    });
                } else {
                    data.insert(spec.name.clone(), Value::Null);
                }
                continue;
            }
            match spec.normalize(raw) {
                Ok(value) => {
                    data.insert(spec.name.clone(), value);
                }
                Err(error) => errors.push(FieldError {
                    field: Some(spec.name.clone()),
                    error,
                }),
            }
        }

        if !errors.is_empty() {
            return ValidatedRow::Invalid(errors);
        }

        for (idx, header) in &self.extras {
            if let Some(value) = values.get(*idx) {
                data.insert(header.clone(), Value::String(value.trim().to_string()));
            }
        }

        if let Some(transform) = &self.schema.transform {
            transform(&mut data);
        }

        for (spec, _) in &self.columns {
            match data.get(&spec.name) {
                Some(Value::Null) | None => {}
                Some(value) => {
                    if let Err(error) = spec.check(value) {
                        errors.push(FieldError {
                            field: Some(spec.name.clone()),
                            error,
                        });
                    }
                }
            }
        }

        if !errors.is_empty() {
            return ValidatedRow::Invalid(errors);
        }

        if let Some(validate) = &self.schema.validate {
            if let Err(message) = validate(&data) {
                return ValidatedRow::Invalid(vec![FieldError {
                    field: None,
                    error: AppError::BusinessRule(message),
                }]);
            }
        }

        let key_parts = self
            .schema
            .key_fields
            .iter()
            .map(|k| data.get(k).map(value_text).unwrap_or_default())
            .collect();

        ValidatedRow::Valid(NormalizedRow { data, key_parts })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ErrorType;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn invoice_headers() -> Vec<String> {
        headers(&["Invoice ID", "Date", "Customer", "Item Name", "Quantity", "Item Price", "Total"])
    }

    fn expect_valid(row: ValidatedRow) -> NormalizedRow {
        match row {
            ValidatedRow::Valid(row) => row,
            ValidatedRow::Invalid(errors) => panic!("expected valid row, got {:?}", errors),
        }
    }

    fn expect_invalid(row: ValidatedRow) -> Vec<FieldError> {
        match row {
            ValidatedRow::Invalid(errors) => errors,
            ValidatedRow::Valid(row) => panic!("expected invalid row, got {:?}", row),
        }
    }

    #[test]
    fn invoice_row_is_normalized() {
        let schema = RowSchema::invoice();
        let bound = schema.bind(&invoice_headers()).unwrap();

        let row = expect_valid(bound.process(&[
            " INV-1 ", "03/15/2024", "Acme", "Widget", "2", "$1,250.50", "2501.00",
        ]));

        assert_eq!(row.data["invoice_number"], Value::from("INV-1"));
        assert_eq!(row.data["invoice_date"], Value::from("2024-03-15"));
        assert_eq!(row.data["quantity"].as_f64(), Some(2.0));
        assert_eq!(row.data["item_price"].as_f64(), Some(1250.5));
        assert_eq!(row.key_parts, vec!["INV-1".to_string(), "Widget".to_string()]);
    }

    #[test]
    fn format_and_range_errors_are_distinguishable() {
        let schema = RowSchema::invoice();
        let bound = schema.bind(&invoice_headers()).unwrap();

        let format = expect_invalid(bound.process(&["INV-1", "", "", "Widget", "two", "", ""]));
        assert_eq!(format[0].error.code(), "INVALID_FIELD_FORMAT");
        assert_eq!(format[0].error.error_type(), ErrorType::Parsing);

        let range = expect_invalid(bound.process(&["INV-1", "", "", "Widget", "-3", "", ""]));
        assert_eq!(range[0].error.code(), "VALIDATION_FAILED");
        assert_eq!(range[0].error.error_type(), ErrorType::Validation);
        assert_eq!(range[0].field.as_deref(), Some("quantity"));
    }

    #[test]
    fn missing_required_value_is_reported_per_field() {
        let schema = RowSchema::invoice();
        let bound = schema.bind(&invoice_headers()).unwrap();

        let errors = expect_invalid(bound.process(&["", "", "", "  ", "1", "", ""]));

        assert_eq!(errors.len(), 2);
        assert!(errors
            .iter()
            .all(|e| matches!(e.error, AppError::RequiredFieldMissing(_))));
    }

    #[test]
    fn bind_rejects_missing_required_column() {
        let schema = RowSchema::invoice();
        let err = schema
            .bind(&headers(&["Invoice ID", "Quantity"]))
            .unwrap_err();
        assert!(err.to_string().contains("item_name"));
    }

    #[test]
    fn extra_columns_are_carried_through() {
        let schema = RowSchema::invoice();
        let bound = schema
            .bind(&headers(&["invoice_number", "item_name", "quantity", "Notes"]))
            .unwrap();

        let row = expect_valid(bound.process(&["A", "B", "1", " rush "]));

        assert_eq!(row.data["Notes"], Value::from("rush"));
        assert_eq!(row.data["total"], Value::Null);
    }

    #[test]
    fn pattern_and_enum_constraints() {
        let schema = RowSchema::new("test")
            .field(
                FieldSpec::new("sku", FieldType::String)
                    .required()
                    .pattern(r"^[A-Z]{3}-\d+$")
                    .unwrap(),
            )
            .field(FieldSpec::new("unit", FieldType::String).one_of(["kg", "pcs"]));
        let bound = schema.bind(&headers(&["sku", "unit"])).unwrap();

        expect_valid(bound.process(&["ABC-12", "PCS"]));
        let errors = expect_invalid(bound.process(&["abc", "box"]));
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn transform_runs_before_constraints_and_validate_hook_last() {
        let schema = RowSchema::new("test")
            .field(FieldSpec::new("amount", FieldType::Decimal).required().max(100.0))
            .with_transform(|row| {
                if let Some(n) = row.get("amount").and_then(Value::as_f64) {
                    row.insert("amount".into(), Value::from(n / 100.0));
                }
            })
            .with_validate(|row| match row.get("amount").and_then(Value::as_f64) {
                Some(n) if n == 0.0 => Err("amount must not be zero".into()),
                _ => Ok(()),
            });
        let bound = schema.bind(&headers(&["amount"])).unwrap();

        let row = expect_valid(bound.process(&["5000"]));
        assert_eq!(row.data["amount"].as_f64(), Some(50.0));

        let errors = expect_invalid(bound.process(&["0"]));
        assert_eq!(errors[0].error.error_type(), ErrorType::BusinessLogic);
    }

    #[test]
    fn dates_and_booleans_parse() {
        assert_eq!(parse_date("2024-01-31"), NaiveDate::from_ymd_opt(2024, 1, 31));
        assert_eq!(parse_date("31.01.2024"), NaiveDate::from_ymd_opt(2024, 1, 31));
        assert_eq!(
            parse_date("2024-01-31T10:00:00Z"),
            NaiveDate::from_ymd_opt(2024, 1, 31)
        );
        assert!(parse_date("someday").is_none());

        let spec = FieldSpec::new("paid", FieldType::Boolean);
        assert_eq!(spec.normalize("Yes").unwrap(), Value::Bool(true));
        assert!(spec.normalize("maybe").is_err());
    }
}
