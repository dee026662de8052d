use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{info, warn};

use super::{Backend, BackendError, write_atomic};
use crate::types::Snapshot;

/// Fixed-name copy kept next to the archive.
pub const LATEST_FILE: &str = "projects_backup.json";
pub const DEFAULT_KEEP: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupMode {
    /// One `projects_backup_<stamp>.json` per save, nothing is read back.
    Download,
    /// `projects_backup.json` plus a `projects_<stamp>.json` archive copy.
    Archive,
}

/// ISO-8601 timestamp with `:` and `.` replaced by `-`, safe for file names.
pub fn backup_stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

pub struct FileBackupBackend {
    dir: PathBuf,
    mode: BackupMode,
    keep: usize,
}

impl FileBackupBackend {
    pub fn new(dir: impl AsRef<Path>, mode: BackupMode) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            mode,
            keep: DEFAULT_KEEP,
        }
    }

    pub fn with_keep(mut self, keep: usize) -> Self {
        self.keep = keep;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stamped_name(&self, stamp: &str) -> String {
        match self.mode {
            BackupMode::Download => format!("projects_backup_{stamp}.json"),
            BackupMode::Archive => format!("projects_{stamp}.json"),
        }
    }

    fn is_stamped(&self, name: &str) -> bool {
        let prefix = match self.mode {
            BackupMode::Download => "projects_backup_",
            BackupMode::Archive => "projects_",
        };
        // The stamp starts with the year, which keeps the two modes'
        // files apart in a shared directory.
        name.strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(".json"))
            .is_some_and(|stamp| stamp.starts_with(|c: char| c.is_ascii_digit()))
    }

    /// Timestamped backups, newest first.
    pub fn list_backups(&self) -> Result<Vec<PathBuf>, BackendError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| self.is_stamped(n))
            })
            .collect();
        // Stamps sort chronologically as strings.
        files.sort();
        files.reverse();
        Ok(files)
    }

    /// Delete all but the newest `keep` backups. Returns how many went.
    pub fn prune(&self, keep: usize) -> Result<usize, BackendError> {
        let files = self.list_backups()?;
        let mut removed = 0;
        for path in files.iter().skip(keep) {
            match fs::remove_file(path) {
                Ok(()) => {
                    info!(file = %path.display(), "removed old backup");
                    removed += 1;
                }
                Err(e) => warn!(file = %path.display(), error = %e, "failed to remove old backup"),
            }
        }
        Ok(removed)
    }
}

impl Backend for FileBackupBackend {
    fn name(&self) -> &'static str {
        match self.mode {
            BackupMode::Download => "download",
            BackupMode::Archive => "archive",
        }
    }

    fn load(&self) -> Result<Option<Snapshot>, BackendError> {
        if self.mode == BackupMode::Download {
            // Restoring a downloaded file goes through import.
            return Ok(None);
        }
        let path = self.dir.join(LATEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        match serde_json::from_str(&contents) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unreadable backup");
                Ok(None)
            }
        }
    }

    fn reads_back(&self) -> bool {
        self.mode == BackupMode::Archive
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), BackendError> {
        let at = snapshot
            .timestamp
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let content = serde_json::to_string_pretty(snapshot)?;
        let file_name = self.stamped_name(&backup_stamp(at));

        if self.mode == BackupMode::Archive {
            write_atomic(&self.dir.join(LATEST_FILE), &content)?;
        }
        write_atomic(&self.dir.join(&file_name), &content)?;
        info!(file = %file_name, "backup written");

        if self.mode == BackupMode::Archive {
            self.prune(self.keep)?;
        }
        Ok(())
    }
}
