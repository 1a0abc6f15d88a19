//! Business keys, dedup hashes and conflict resolution.
//!
//! The hash lookup and the write it guards happen inside one `BEGIN IMMEDIATE`
//! transaction in `storage::records`, with `key_hash` as the primary key of
//! `deduplication_records`; two workers can never both see a key as new.

use std::path::Path;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::AppError;
use crate::models::DeduplicationAction;

/// Separates key parts so ("ab", "c") and ("a", "bc") never collide.
pub const KEY_SEPARATOR: char = '\u{1f}';

/// Normalized business key and its stable hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupKey {
    pub business_key: String,
    pub hash: String,
}

impl DedupKey {
    /// Builds the key from raw key-field values.
    ///
    /// Parts are trimmed and lower-cased. Returns `None` when every part is
    /// empty: such rows are never treated as duplicates.
    pub fn from_parts<S: AsRef<str>>(parts: &[S]) -> Option<Self> {
        let normalized: Vec<String> = parts
            .iter()
            .map(|p| p.as_ref().trim().to_lowercase())
            .collect();

        if normalized.iter().all(String::is_empty) {
            return None;
        }

        let business_key = normalized.join(&KEY_SEPARATOR.to_string());
        let hash = sha256_hex(business_key.as_bytes());
        Some(Self { business_key, hash })
    }
}

/// Per-job dedup switch and action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupPolicy {
    pub enabled: bool,
    pub action: DeduplicationAction,
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            action: DeduplicationAction::Skip,
        }
    }
}

/// What a dedup hit does to storage.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Leave the existing record alone.
    Keep,
    /// Rewrite the existing record's data in place.
    Rewrite(Map<String, Value>),
    /// Insert the incoming row as an extra record.
    Append,
    /// Overwrite the existing record and make the incoming row the original.
    Replace,
}

/// Decides how an incoming duplicate row lands on the existing record.
pub fn resolve(
    action: DeduplicationAction,
    existing: &Map<String, Value>,
    incoming: &Map<String, Value>,
) -> Resolution {
    match action {
        DeduplicationAction::Skip => Resolution::Keep,
        DeduplicationAction::Append => Resolution::Append,
        DeduplicationAction::Replace => Resolution::Replace,
        DeduplicationAction::Update => {
            let mut merged = existing.clone();
            for (field, value) in incoming {
                if !is_blank(value) {
                    merged.insert(field.clone(), value.clone());
                }
            }
            rewrite_if_changed(existing, merged)
        }
        DeduplicationAction::Merge => {
            let mut merged = existing.clone();
            for (field, value) in incoming {
                if merged.get(field).map_or(true, is_blank) && !is_blank(value) {
                    merged.insert(field.clone(), value.clone());
                }
            }
            rewrite_if_changed(existing, merged)
        }
    }
}

fn rewrite_if_changed(existing: &Map<String, Value>, merged: Map<String, Value>) -> Resolution {
    if &merged == existing {
        Resolution::Keep
    } else {
        Resolution::Rewrite(merged)
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Content hashes
// ─────────────────────────────────────────────────────────────────────────────

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// SHA-256 of a file, read in 64 KB blocks.
pub async fn hash_file(path: &Path) -> Result<String, AppError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| AppError::ChunkIo(format!("Failed to open {}: {}", path.display(), e)))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| AppError::ChunkIo(format!("Failed to read {}: {}", path.display(), e)))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 over decoded rows, header first, fields separated like business keys.
pub fn hash_records(headers: &[String], rows: &[Vec<String>]) -> String {
    let mut hasher = Sha256::new();
    for line in std::iter::once(headers).chain(rows.iter().map(Vec::as_slice)) {
        for field in line {
            hasher.update(field.as_bytes());
            hasher.update([KEY_SEPARATOR as u8]);
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
