//! Persistence backends.
//!
//! Every backend serializes the store as JSON and commits it to one medium.
//! They are blocking; the sync manager drives them from tokio's blocking pool.

pub mod backup;
pub mod local;
pub mod remote;

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::types::Snapshot;

pub use backup::{BackupMode, FileBackupBackend};
pub use local::LocalStorageBackend;
pub use remote::RemoteBackend;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Payload is {size} bytes, limit is {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("Storage quota exceeded: {size} bytes, quota is {quota}")]
    QuotaExceeded { size: usize, quota: usize },
    #[error("Network error: {0}")]
    Transport(String),
    #[error("Server returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Server rejected save: {0}")]
    Rejected(String),
}

impl BackendError {
    /// Failures of the remote medium itself. Only these trigger the
    /// local-storage fallback.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BackendError::Transport(_) | BackendError::Status { .. } | BackendError::Rejected(_)
        )
    }
}

/// One persistence medium for the store.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` means no prior snapshot exists; it is not an error.
    fn load(&self) -> Result<Option<Snapshot>, BackendError>;

    fn save(&self, snapshot: &Snapshot) -> Result<(), BackendError>;

    /// Whether `load` can return what `save` wrote.
    fn reads_back(&self) -> bool {
        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendKind {
    /// Single key in the local key-value store
    Local,
    /// Timestamped backup file per save, no read-back
    Download,
    /// Latest file plus timestamped archive copies
    Archive,
    /// Remote data API with local fallback
    Remote,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Download => "download",
            BackendKind::Archive => "archive",
            BackendKind::Remote => "remote",
        }
    }
}

#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub data_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub server_url: String,
    pub quota_bytes: usize,
    pub timeout: Duration,
}

/// The primary backend and, for remote, its local-storage fallback.
pub struct BackendSet {
    pub primary: Arc<dyn Backend>,
    pub fallback: Option<Arc<dyn Backend>>,
}

pub fn open_backends(config: &BackendConfig) -> BackendSet {
    let local = || -> Arc<dyn Backend> {
        Arc::new(LocalStorageBackend::new(&config.data_dir).with_quota(config.quota_bytes))
    };
    match config.kind {
        BackendKind::Local => BackendSet {
            primary: local(),
            fallback: None,
        },
        BackendKind::Download => BackendSet {
            primary: Arc::new(FileBackupBackend::new(&config.backup_dir, BackupMode::Download)),
            fallback: None,
        },
        BackendKind::Archive => BackendSet {
            primary: Arc::new(FileBackupBackend::new(&config.backup_dir, BackupMode::Archive)),
            fallback: None,
        },
        BackendKind::Remote => BackendSet {
            primary: Arc::new(RemoteBackend::new(&config.server_url, config.timeout)),
            fallback: Some(local()),
        },
    }
}

/// Write through a temporary file and an atomic rename to avoid partial
/// writes.
pub(crate) fn write_atomic(path: &Path, content: &str) -> Result<(), BackendError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp = path.with_extension("tmp");
    let mut f = File::create(&temp)?;
    f.write_all(content.as_bytes())?;
    f.sync_all()?;
    fs::rename(temp, path)?;
    Ok(())
}
