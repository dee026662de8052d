use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde_json::Value;
use thiserror::Error;

use crate::backend::{BackendError, write_atomic};
use crate::types::{Snapshot, StoreData};

const REQUIRED_KEYS: [&str; 4] = ["plans", "projects", "tasks", "records"];

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Invalid import file: {0}")]
    Format(String),
    #[error("Failed to write export: {0}")]
    Write(#[from] BackendError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Snapshot of `data` for export. Record paths do not survive a session, so
/// records keep only `{id, name, size, type, uploadDate}`.
pub fn export_snapshot(data: &StoreData) -> Snapshot {
    let mut exported = data.clone();
    exported.records = data.records.iter().map(|r| r.to_exported()).collect();
    Snapshot::stamped(exported)
}

/// Parse an externally supplied snapshot. All four collections must be
/// present; `timestamp` and `version` are ignored. Entities are taken as
/// they come, with wrongly shaped fields coerced to defaults.
pub fn import_snapshot(raw: &str) -> Result<StoreData, TransferError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| TransferError::Format(e.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| TransferError::Format("expected a JSON object".to_string()))?;
    let missing: Vec<&str> = REQUIRED_KEYS
        .iter()
        .copied()
        .filter(|key| !object.contains_key(*key))
        .collect();
    if !missing.is_empty() {
        return Err(TransferError::Format(format!(
            "missing {}",
            missing.join(", ")
        )));
    }
    serde_json::from_value(value).map_err(|e| TransferError::Format(e.to_string()))
}

/// Replacing a store that already holds plans or projects needs the user's
/// consent first.
pub fn requires_confirmation(current: &StoreData) -> bool {
    !current.plans.is_empty() || !current.projects.is_empty()
}

pub fn export_file_name(date: NaiveDate) -> String {
    format!("project-data-{}.json", date.format("%Y-%m-%d"))
}

pub fn write_export(dir: &Path, snapshot: &Snapshot) -> Result<PathBuf, TransferError> {
    let date = snapshot
        .timestamp
        .as_deref()
        .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.date_naive())
        .unwrap_or_else(|| chrono::Utc::now().date_naive());
    let path = dir.join(export_file_name(date));
    let content = serde_json::to_string_pretty(snapshot)?;
    write_atomic(&path, &content)?;
    Ok(path)
}
