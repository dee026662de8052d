//! Reconciliation between the in-memory store and the configured backends.
//!
//! Every mutation holds the store lock from the in-memory change until the
//! commit settles, so commits never interleave. A change that no backend
//! accepted is rolled back.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{error, info, warn};

use crate::backend::{Backend, BackendError, BackendSet};
use crate::storage::{Store, StoreError};
use crate::transfer::{self, TransferError};
use crate::types::{Record, Snapshot, StoreData};

const NOTICE_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Loading,
    Saving,
    Degraded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub state: SyncState,
    /// The last operation was served by the fallback backend.
    pub degraded: bool,
}

/// Which backend served an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncSource {
    Primary,
    Fallback,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Success,
    Info,
    Warning,
    Error,
}

/// User-facing outcome of an operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("{backend} backend failed: {source}")]
    Backend {
        backend: &'static str,
        source: BackendError,
    },
    #[error("{primary}; local fallback also failed: {fallback}")]
    FallbackFailed {
        primary: BackendError,
        fallback: BackendError,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct Committed<T> {
    pub value: T,
    pub source: SyncSource,
}

#[derive(Clone, Debug, Serialize)]
pub struct LoadReport {
    /// A prior snapshot existed in the backend that served the load.
    pub found: bool,
    pub source: SyncSource,
    pub seeded: usize,
}

async fn on_blocking_pool<T, F>(backend: Arc<dyn Backend>, op: F) -> Result<T, BackendError>
where
    T: Send + 'static,
    F: FnOnce(&dyn Backend) -> Result<T, BackendError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || op(backend.as_ref()))
        .await
        .map_err(|e| {
            BackendError::Io(std::io::Error::other(format!(
                "spawn_blocking failed: {}",
                e
            )))
        })?
}

pub struct SyncManager {
    store: Mutex<Store>,
    primary: Arc<dyn Backend>,
    fallback: Option<Arc<dyn Backend>>,
    status: watch::Sender<SyncStatus>,
    notices: broadcast::Sender<Notice>,
}

impl SyncManager {
    pub fn new(backends: BackendSet) -> Self {
        let (status, _) = watch::channel(SyncStatus {
            state: SyncState::Idle,
            degraded: false,
        });
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            store: Mutex::new(Store::new()),
            primary: backends.primary,
            fallback: backends.fallback,
            status,
            notices,
        }
    }

    pub fn primary_name(&self) -> &'static str {
        self.primary.name()
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        let notice = Notice {
            level,
            message: message.into(),
        };
        match level {
            NoticeLevel::Error => error!(message = %notice.message, "notice"),
            NoticeLevel::Warning => warn!(message = %notice.message, "notice"),
            _ => info!(message = %notice.message, "notice"),
        }
        // Nobody listening is fine.
        let _ = self.notices.send(notice);
    }

    fn set_state(&self, state: SyncState) {
        self.status.send_modify(|s| s.state = state);
    }

    fn settle(&self, degraded: bool) {
        self.status.send_replace(SyncStatus {
            state: SyncState::Idle,
            degraded,
        });
    }

    /// Run `f` against the current store without committing anything.
    pub async fn read<R>(&self, f: impl FnOnce(&Store) -> R) -> R {
        let store = self.store.lock().await;
        f(&store)
    }

    pub async fn data(&self) -> StoreData {
        self.read(|s| s.data().clone()).await
    }

    /// Populate the store from the primary backend, degrading to the local
    /// fallback on transport failure. The sample records are seeded when no
    /// snapshot existed anywhere and the record list is empty.
    pub async fn load(&self) -> Result<LoadReport, SyncError> {
        let mut store = self.store.lock().await;
        self.set_state(SyncState::Loading);

        let primary = on_blocking_pool(self.primary.clone(), |b| b.load()).await;
        let (snapshot, source) = match (primary, self.fallback.clone()) {
            (Ok(snapshot), _) => (snapshot, SyncSource::Primary),
            (Err(err), Some(fallback)) if err.is_transport() => {
                self.set_state(SyncState::Degraded);
                warn!(backend = self.primary.name(), error = %err, "load failed, using local fallback");
                match on_blocking_pool(fallback, |b| b.load()).await {
                    Ok(snapshot) => {
                        self.notify(
                            NoticeLevel::Warning,
                            "Server unavailable, using locally stored data",
                        );
                        (snapshot, SyncSource::Fallback)
                    }
                    Err(fallback) => {
                        self.settle(true);
                        self.notify(NoticeLevel::Error, format!("Failed to load data: {err}"));
                        return Err(SyncError::FallbackFailed {
                            primary: err,
                            fallback,
                        });
                    }
                }
            }
            (Err(err), _) => {
                self.settle(false);
                self.notify(NoticeLevel::Error, format!("Failed to load data: {err}"));
                return Err(SyncError::Backend {
                    backend: self.primary.name(),
                    source: err,
                });
            }
        };
        self.settle(source == SyncSource::Fallback);

        let found = snapshot.is_some();
        if let Some(snapshot) = snapshot {
            store.replace(snapshot.data);
        }

        let mut seeded = 0;
        if !found && store.get_all::<Record>().is_empty() {
            let before = store.data().clone();
            seeded = store.seed_default_records();
            // A write-only primary would get a new file on every start; the
            // samples ride along with the first real commit instead.
            if self.primary.reads_back() {
                if let Err(e) = self.commit(store.data().clone()).await {
                    warn!(error = %e, "could not persist sample records");
                    store.replace(before);
                    seeded = 0;
                }
            }
        }

        let data = store.data();
        info!(
            backend = self.primary.name(),
            ?source,
            found,
            plans = data.plans.len(),
            projects = data.projects.len(),
            tasks = data.tasks.len(),
            records = data.records.len(),
            "data loaded"
        );
        if found {
            self.notify(NoticeLevel::Success, "Data loaded");
        }
        Ok(LoadReport {
            found,
            source,
            seeded,
        })
    }

    /// Apply `f` to the store and commit the result. On any failure the
    /// store is restored to its state before `f` ran.
    pub async fn mutate<R, F>(&self, action: &str, f: F) -> Result<Committed<R>, SyncError>
    where
        R: Send,
        F: FnOnce(&mut Store) -> Result<R, StoreError> + Send,
    {
        let mut store = self.store.lock().await;
        let before = store.data().clone();

        let value = match f(&mut store) {
            Ok(value) => value,
            Err(e) => {
                store.replace(before);
                self.notify(NoticeLevel::Error, format!("{action} failed: {e}"));
                return Err(e.into());
            }
        };

        match self.commit(store.data().clone()).await {
            Ok(SyncSource::Primary) => {
                self.notify(NoticeLevel::Success, format!("{action} saved"));
                Ok(Committed {
                    value,
                    source: SyncSource::Primary,
                })
            }
            Ok(SyncSource::Fallback) => {
                self.notify(
                    NoticeLevel::Warning,
                    format!("{action} saved locally, server unavailable"),
                );
                Ok(Committed {
                    value,
                    source: SyncSource::Fallback,
                })
            }
            Err(e) => {
                store.replace(before);
                self.notify(NoticeLevel::Error, format!("{action} not saved: {e}"));
                Err(e)
            }
        }
    }

    async fn commit(&self, data: StoreData) -> Result<SyncSource, SyncError> {
        self.set_state(SyncState::Saving);
        let snapshot = Arc::new(Snapshot::stamped(data));

        let attempt = snapshot.clone();
        let primary = on_blocking_pool(self.primary.clone(), move |b| b.save(&attempt)).await;
        match (primary, self.fallback.clone()) {
            (Ok(()), _) => {
                self.settle(false);
                Ok(SyncSource::Primary)
            }
            (Err(err), Some(fallback)) if err.is_transport() => {
                self.set_state(SyncState::Degraded);
                warn!(backend = self.primary.name(), error = %err, "save failed, writing local fallback");
                let result = on_blocking_pool(fallback, move |b| b.save(&snapshot)).await;
                self.settle(true);
                match result {
                    Ok(()) => Ok(SyncSource::Fallback),
                    Err(fallback) => Err(SyncError::FallbackFailed {
                        primary: err,
                        fallback,
                    }),
                }
            }
            (Err(err), _) => {
                self.settle(false);
                Err(SyncError::Backend {
                    backend: self.primary.name(),
                    source: err,
                })
            }
        }
    }

    /// Replace all four collections with the parsed contents of `raw`.
    ///
    /// Callers must get the user's confirmation first when
    /// [`transfer::requires_confirmation`] holds.
    pub async fn import(&self, raw: &str) -> Result<Committed<usize>, SyncError> {
        let data = match transfer::import_snapshot(raw) {
            Ok(data) => data,
            Err(e) => {
                self.notify(NoticeLevel::Error, format!("Import failed: {e}"));
                return Err(e.into());
            }
        };
        self.mutate("Import", move |store| {
            let total = data.plans.len() + data.projects.len() + data.tasks.len() + data.records.len();
            store.replace(data);
            Ok(total)
        })
        .await
    }

    pub async fn export(&self) -> Snapshot {
        self.read(|s| transfer::export_snapshot(s.data())).await
    }

    pub async fn seed_defaults(&self) -> Result<Committed<usize>, SyncError> {
        self.mutate("Sample records", |store| Ok(store.seed_default_records()))
            .await
    }

    pub async fn seed_demo(&self) -> Result<Committed<usize>, SyncError> {
        self.mutate("Sample plan", |store| store.seed_demo_data()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackupMode, FileBackupBackend};
    use crate::storage::{DEFAULT_RECORDS, NewPlan, NewRecord};
    use crate::types::{Plan, PlanCategory, PlanStatus};
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone, Copy)]
    enum Failure {
        Transport,
        Quota,
    }

    /// In-memory backend that fails the next `failures` calls.
    struct MemoryBackend {
        name: &'static str,
        saved: StdMutex<Option<Snapshot>>,
        failures: AtomicUsize,
        failure: Failure,
        saves: AtomicUsize,
        delay: Duration,
    }

    impl MemoryBackend {
        fn new(name: &'static str) -> Arc<Self> {
            Self::failing(name, 0, Failure::Transport)
        }

        fn failing(name: &'static str, failures: usize, failure: Failure) -> Arc<Self> {
            Arc::new(Self {
                name,
                saved: StdMutex::new(None),
                failures: AtomicUsize::new(failures),
                failure,
                saves: AtomicUsize::new(0),
                delay: Duration::ZERO,
            })
        }

        fn slow(name: &'static str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name,
                saved: StdMutex::new(None),
                failures: AtomicUsize::new(0),
                failure: Failure::Transport,
                saves: AtomicUsize::new(0),
                delay,
            })
        }

        fn fail(&self) -> Option<BackendError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining == 0 {
                return None;
            }
            self.failures.store(remaining - 1, Ordering::SeqCst);
            Some(match self.failure {
                Failure::Transport => BackendError::Transport("connection refused".into()),
                Failure::Quota => BackendError::QuotaExceeded { size: 1, quota: 0 },
            })
        }

        fn saved(&self) -> Option<StoreData> {
            self.saved.lock().unwrap().as_ref().map(|s| s.data.clone())
        }
    }

    impl Backend for MemoryBackend {
        fn name(&self) -> &'static str {
            self.name
        }

        fn load(&self) -> Result<Option<Snapshot>, BackendError> {
            if let Some(e) = self.fail() {
                return Err(e);
            }
            Ok(self.saved.lock().unwrap().clone())
        }

        fn save(&self, snapshot: &Snapshot) -> Result<(), BackendError> {
            std::thread::sleep(self.delay);
            if let Some(e) = self.fail() {
                return Err(e);
            }
            self.saves.fetch_add(1, Ordering::SeqCst);
            *self.saved.lock().unwrap() = Some(snapshot.clone());
            Ok(())
        }
    }

    fn manager(primary: Arc<MemoryBackend>, fallback: Option<Arc<MemoryBackend>>) -> SyncManager {
        SyncManager::new(BackendSet {
            primary,
            fallback: fallback.map(|f| f as Arc<dyn Backend>),
        })
    }

    fn new_plan(name: &str) -> NewPlan {
        NewPlan {
            name: name.into(),
            description: None,
            category: PlanCategory::Life,
            status: PlanStatus::Draft,
            start_date: None,
            end_date: None,
            image: None,
        }
    }

    fn upload(name: &str) -> NewRecord {
        NewRecord {
            name: name.into(),
            size: 100,
            mime_type: "application/pdf".into(),
            path: None,
        }
    }

    #[tokio::test]
    async fn test_failed_remote_save_lands_in_local_fallback() {
        let remote = MemoryBackend::failing("remote", 1, Failure::Transport);
        let local = MemoryBackend::new("local");
        let sync = manager(remote.clone(), Some(local.clone()));

        let committed = sync
            .mutate("Create plan", |s| s.create_plan(new_plan("P")))
            .await
            .unwrap();
        assert_eq!(committed.source, SyncSource::Fallback);
        assert_eq!(local.saved(), Some(sync.data().await));
        assert!(remote.saved().is_none());
        assert_eq!(
            sync.status(),
            SyncStatus {
                state: SyncState::Idle,
                degraded: true
            }
        );

        // Next save reaches the server again and clears the flag.
        sync.mutate("Create plan", |s| s.create_plan(new_plan("Q")))
            .await
            .unwrap();
        assert_eq!(remote.saved().map(|d| d.plans.len()), Some(2));
        assert!(!sync.status().degraded);
    }

    #[tokio::test]
    async fn test_non_transport_failure_skips_fallback_and_rolls_back() {
        let remote = MemoryBackend::failing("remote", 1, Failure::Quota);
        let local = MemoryBackend::new("local");
        let sync = manager(remote, Some(local.clone()));
        let mut notices = sync.subscribe();

        let err = sync
            .mutate("Create plan", |s| s.create_plan(new_plan("P")))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Backend { backend: "remote", .. }));
        assert!(local.saved().is_none());
        assert!(sync.data().await.plans.is_empty());

        let notice = notices.recv().await.unwrap();
        assert_eq!(notice.level, NoticeLevel::Error);
    }

    #[tokio::test]
    async fn test_both_backends_failing_rolls_back_delete() {
        let remote = MemoryBackend::new("remote");
        let local = MemoryBackend::new("local");
        let sync = manager(remote.clone(), Some(local.clone()));
        let plan = sync
            .mutate("Create plan", |s| s.create_plan(new_plan("P")))
            .await
            .unwrap()
            .value;

        remote.failures.store(1, Ordering::SeqCst);
        local.failures.store(1, Ordering::SeqCst);
        let err = sync
            .mutate("Delete plan", |s| s.delete_plan(&plan.id))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::FallbackFailed { .. }));
        assert_eq!(sync.read(|s| s.get_all::<Plan>().len()).await, 1);
    }

    #[tokio::test]
    async fn test_store_error_leaves_data_untouched() {
        let primary = MemoryBackend::new("local");
        let sync = manager(primary.clone(), None);
        let err = sync
            .mutate("Delete plan", |s| s.delete_plan("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Store(StoreError::NotFound { .. })));
        assert_eq!(primary.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_first_load_seeds_once() {
        let primary = MemoryBackend::new("local");
        let sync = manager(primary.clone(), None);

        let report = sync.load().await.unwrap();
        assert!(!report.found);
        assert_eq!(report.seeded, 2);
        assert_eq!(primary.saved().map(|d| d.records.len()), Some(2));

        // Deleting the samples must not bring them back on the next load.
        for (id, _, _) in DEFAULT_RECORDS {
            sync.mutate("Delete record", |s| s.remove::<Record>(id).map(|_| ()))
                .await
                .unwrap();
        }
        let again = manager(primary.clone(), None);
        let report = again.load().await.unwrap();
        assert!(report.found);
        assert_eq!(report.seeded, 0);
        assert!(again.data().await.records.is_empty());
    }

    #[tokio::test]
    async fn test_write_only_primary_is_not_written_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let downloads = || -> Arc<dyn Backend> {
            Arc::new(FileBackupBackend::new(dir.path(), BackupMode::Download))
        };
        for _ in 0..2 {
            let sync = SyncManager::new(BackendSet {
                primary: downloads(),
                fallback: None,
            });
            assert_eq!(sync.load().await.unwrap().seeded, 2);
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let sync = SyncManager::new(BackendSet {
            primary: downloads(),
            fallback: None,
        });
        sync.load().await.unwrap();
        sync.mutate("Plan", |s| s.create_plan(new_plan("Trip")))
            .await
            .unwrap();
        let written = FileBackupBackend::new(dir.path(), BackupMode::Download)
            .list_backups()
            .unwrap();
        assert_eq!(written.len(), 1);
        let content = std::fs::read_to_string(&written[0]).unwrap();
        let snapshot: Snapshot = serde_json::from_str(&content).unwrap();
        assert_eq!(snapshot.data.records.len(), 2);
        assert_eq!(snapshot.data.plans.len(), 1);
    }

    #[tokio::test]
    async fn test_load_falls_back_to_local_on_transport_failure() {
        let remote = MemoryBackend::failing("remote", 1, Failure::Transport);
        let local = MemoryBackend::new("local");
        let mut cached = Store::new();
        cached.create_plan(new_plan("cached")).unwrap();
        *local.saved.lock().unwrap() = Some(Snapshot::stamped(cached.data().clone()));

        let sync = manager(remote, Some(local));
        let report = sync.load().await.unwrap();
        assert_eq!(report.source, SyncSource::Fallback);
        assert!(report.found);
        assert_eq!(sync.data().await.plans[0].name, "cached");
        assert!(sync.status().degraded);
    }

    #[tokio::test]
    async fn test_concurrent_mutations_do_not_lose_updates() {
        let primary = MemoryBackend::slow("local", Duration::from_millis(30));
        let sync = Arc::new(manager(primary.clone(), None));

        let a = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.mutate("Upload", |s| Ok(s.add_record(upload("a.pdf")))).await })
        };
        let b = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.mutate("Upload", |s| Ok(s.add_record(upload("b.pdf")))).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let saved = primary.saved().unwrap();
        let mut names: Vec<String> = saved.records.into_iter().map(|r| r.name).collect();
        names.sort();
        assert_eq!(names, vec!["a.pdf", "b.pdf"]);
    }

    #[tokio::test]
    async fn test_retry_after_transient_failure_keeps_both_uploads() {
        let primary = MemoryBackend::new("local");
        let sync = manager(primary.clone(), None);

        sync.mutate("Upload", |s| Ok(s.add_record(upload("first.pdf"))))
            .await
            .unwrap();
        primary.failures.store(1, Ordering::SeqCst);
        assert!(
            sync.mutate("Upload", |s| Ok(s.add_record(upload("second.pdf"))))
                .await
                .is_err()
        );
        sync.mutate("Upload", |s| Ok(s.add_record(upload("second.pdf"))))
            .await
            .unwrap();

        let names: Vec<String> = primary
            .saved()
            .unwrap()
            .records
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["first.pdf", "second.pdf"]);
    }

    #[tokio::test]
    async fn test_import_with_missing_keys_changes_nothing() {
        let primary = MemoryBackend::new("local");
        let sync = manager(primary.clone(), None);
        sync.mutate("Create plan", |s| s.create_plan(new_plan("keep")))
            .await
            .unwrap();
        let before = sync.data().await;

        let err = sync.import(r#"{"plans":[],"projects":[]}"#).await.unwrap_err();
        assert!(matches!(err, SyncError::Transfer(TransferError::Format(_))));
        assert_eq!(sync.data().await, before);
        assert_eq!(primary.saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_import_replaces_wholesale_and_commits() {
        let primary = MemoryBackend::new("local");
        let sync = manager(primary.clone(), None);
        sync.mutate("Create plan", |s| s.create_plan(new_plan("old")))
            .await
            .unwrap();

        let mut other = Store::new();
        other.create_plan(new_plan("new")).unwrap();
        let raw = serde_json::to_string(&transfer::export_snapshot(other.data())).unwrap();
        let committed = sync.import(&raw).await.unwrap();
        assert_eq!(committed.value, 1);

        let data = sync.data().await;
        assert_eq!(data.plans.len(), 1);
        assert_eq!(data.plans[0].name, "new");
        assert_eq!(primary.saved(), Some(data));
    }
}
