use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{Backend, BackendError, write_atomic};
use crate::types::{Snapshot, StoreData};

pub const STORAGE_KEY: &str = "projectManagerData";
/// Typical per-origin local storage allowance.
pub const DEFAULT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

/// Key-value local storage: the four collections serialized under one key,
/// kept as `<dir>/<key>.json`.
pub struct LocalStorageBackend {
    dir: PathBuf,
    key: String,
    quota: usize,
}

impl LocalStorageBackend {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            key: STORAGE_KEY.to_string(),
            quota: DEFAULT_QUOTA_BYTES,
        }
    }

    pub fn with_quota(mut self, quota: usize) -> Self {
        self.quota = quota;
        self
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.key))
    }
}

impl Backend for LocalStorageBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn load(&self) -> Result<Option<Snapshot>, BackendError> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        match serde_json::from_str::<StoreData>(&contents) {
            Ok(data) => Ok(Some(Snapshot {
                data,
                timestamp: None,
                version: None,
            })),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unreadable local storage");
                Ok(None)
            }
        }
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), BackendError> {
        // Timestamp and version stay out of local storage.
        let content = serde_json::to_string(&snapshot.data)?;
        if content.len() > self.quota {
            return Err(BackendError::QuotaExceeded {
                size: content.len(),
                quota: self.quota,
            });
        }
        write_atomic(&self.path(), &content)?;
        debug!(bytes = content.len(), "local storage written");
        Ok(())
    }
}
