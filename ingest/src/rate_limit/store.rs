use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::state::RateLimiterState;
use crate::clock::Clock;
use crate::error::StateError;

const LOCK_STALE_AFTER: Duration = Duration::from_secs(10);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);
const LOCK_WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Durable home of the shared limiter budget.
///
/// `update` is the only write path and must be an atomic read-modify-write
/// with respect to every other process using the same store.
#[async_trait]
pub trait LimiterStateStore: Send + Sync + 'static {
    async fn load(&self) -> Result<RateLimiterState, StateError>;

    async fn update(
        &self,
        apply: &mut (dyn for<'s> FnMut(&'s mut RateLimiterState) + Send),
    ) -> Result<RateLimiterState, StateError>;

    fn describe(&self) -> String;
}

/// JSON document on local disk, shared by processes on one host.
pub struct FileStateStore {
    path: PathBuf,
    hourly_limit: u32,
    clock: Clock,
    guard: Mutex<()>,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>, hourly_limit: u32, clock: Clock) -> Self {
        Self {
            path: path.into(),
            hourly_limit,
            clock,
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self) -> PathBuf {
        sibling(&self.path, "bak")
    }

    fn lock_path(&self) -> PathBuf {
        sibling(&self.path, "lock")
    }

    fn read_document(&self) -> Result<RateLimiterState, StateError> {
        let now = self.clock.now_ms();
        let backup = self.backup_path();
        if backup.exists() {
            warn!(
                stage = "limiter_state",
                event = "state.backup.restore",
                path = %self.path.display(),
                "restoring rate limiter state from backup after interrupted write"
            );
            std::fs::copy(&backup, &self.path).map_err(|source| io_error(&self.path, source))?;
            std::fs::remove_file(&backup).map_err(|source| io_error(&backup, source))?;
        }

        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(RateLimiterState::fresh(self.hourly_limit, now));
            }
            Err(source) => return Err(io_error(&self.path, source)),
        };

        let mut state = match serde_json::from_str::<RateLimiterState>(&raw) {
            Ok(state) => state,
            Err(err) => {
                warn!(
                    stage = "limiter_state",
                    event = "state.corrupt",
                    path = %self.path.display(),
                    error = %err,
                    "rate limiter state is corrupt, falling back to a fresh budget"
                );
                RateLimiterState::fresh(self.hourly_limit, now)
            }
        };
        state.refresh(self.hourly_limit, now);
        Ok(state)
    }

    fn write_document(&self, state: &RateLimiterState) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
        }

        let raw = serde_json::to_vec_pretty(state)?;
        let backup = self.backup_path();
        if self.path.exists() {
            std::fs::copy(&self.path, &backup).map_err(|source| io_error(&backup, source))?;
        }
        std::fs::write(&self.path, raw).map_err(|source| io_error(&self.path, source))?;
        if backup.exists() {
            std::fs::remove_file(&backup).map_err(|source| io_error(&backup, source))?;
        }
        Ok(())
    }

    async fn acquire_lock_file(&self) -> Result<LockFile, StateError> {
        let path = self.lock_path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
        }

        let deadline = tokio::time::Instant::now() + LOCK_WAIT_LIMIT;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(LockFile { path }),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path) {
                        warn!(
                            stage = "limiter_state",
                            event = "state.lock.stale",
                            path = %path.display(),
                            "removing stale rate limiter lock"
                        );
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(StateError::LockTimeout(path));
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                Err(source) => return Err(io_error(&path, source)),
            }
        }
    }
}

#[async_trait]
impl LimiterStateStore for FileStateStore {
    async fn load(&self) -> Result<RateLimiterState, StateError> {
        let _guard = self.guard.lock().await;
        self.read_document()
    }

    async fn update(
        &self,
        apply: &mut (dyn for<'s> FnMut(&'s mut RateLimiterState) + Send),
    ) -> Result<RateLimiterState, StateError> {
        let _guard = self.guard.lock().await;
        let _lock = self.acquire_lock_file().await?;

        let mut state = self.read_document()?;
        apply(&mut state);
        self.write_document(&state)?;
        Ok(state)
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

struct LockFile {
    path: PathBuf,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                warn!(
                    stage = "limiter_state",
                    event = "state.lock.release",
                    result = "error",
                    path = %self.path.display(),
                    error = %err,
                    "failed to release rate limiter lock"
                );
            }
        }
    }
}

fn lock_is_stale(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > LOCK_STALE_AFTER)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn io_error(path: &Path, source: std::io::Error) -> StateError {
    StateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Process-local store with failure injection.
pub struct MemoryStateStore {
    hourly_limit: u32,
    clock: Clock,
    inner: StdMutex<MemoryInner>,
}

struct MemoryInner {
    state: Option<RateLimiterState>,
    failing_updates: u32,
    unavailable: bool,
}

impl MemoryStateStore {
    pub fn new(hourly_limit: u32, clock: Clock) -> Self {
        info!(
            stage = "limiter_state",
            event = "state.memory",
            hourly_limit,
            "rate limiter state kept in memory, not shared across processes"
        );
        Self {
            hourly_limit,
            clock,
            inner: StdMutex::new(MemoryInner {
                state: None,
                failing_updates: 0,
                unavailable: false,
            }),
        }
    }

    /// Makes the next `count` calls to `update` fail without applying.
    pub fn fail_next_updates(&self, count: u32) {
        self.lock().failing_updates = count;
    }

    /// While set, every `load` and `update` fails.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn replace(&self, state: RateLimiterState) {
        self.lock().state = Some(state);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current(&self, inner: &mut MemoryInner) -> RateLimiterState {
        let now = self.clock.now_ms();
        let mut state = inner
            .state
            .take()
            .unwrap_or_else(|| RateLimiterState::fresh(self.hourly_limit, now));
        state.refresh(self.hourly_limit, now);
        state
    }
}

#[async_trait]
impl LimiterStateStore for MemoryStateStore {
    async fn load(&self) -> Result<RateLimiterState, StateError> {
        let mut inner = self.lock();
        if inner.unavailable {
            return Err(StateError::Unavailable("memory store marked unavailable".into()));
        }
        let state = self.current(&mut inner);
        inner.state = Some(state.clone());
        Ok(state)
    }

    async fn update(
        &self,
        apply: &mut (dyn for<'s> FnMut(&'s mut RateLimiterState) + Send),
    ) -> Result<RateLimiterState, StateError> {
        let mut inner = self.lock();
        if inner.unavailable {
            return Err(StateError::Unavailable("memory store marked unavailable".into()));
        }
        if inner.failing_updates > 0 {
            inner.failing_updates -= 1;
            return Err(StateError::Unavailable("injected update failure".into()));
        }
        let mut state = self.current(&mut inner);
        apply(&mut state);
        inner.state = Some(state.clone());
        Ok(state)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn store(dir: &TempDir) -> FileStateStore {
        FileStateStore::new(dir.path().join("limiter.json"), 100, Clock::starting_at(NOW))
    }

    #[tokio::test]
    async fn missing_document_starts_with_full_budget() {
        let dir = TempDir::new().expect("tempdir");
        let state = store(&dir).load().await.expect("load");
        assert_eq!(state.tokens_remaining, 100);
        assert!(state.reset_at > NOW);
    }

    #[tokio::test]
    async fn update_persists_with_contract_field_names() {
        let dir = TempDir::new().expect("tempdir");
        let store = store(&dir);
        store
            .update(&mut |state| {
                state.try_admit(100, NOW);
            })
            .await
            .expect("update");

        let raw = std::fs::read_to_string(store.path()).expect("read");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["tokens"], 99);
        assert_eq!(value["totalRequestsThisHour"], 1);
        assert!(!store.backup_path().exists());
        assert!(!store.lock_path().exists());

        let reloaded = store.load().await.expect("reload");
        assert_eq!(reloaded.tokens_remaining, 99);
    }

    #[tokio::test]
    async fn corrupt_document_falls_back_to_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let store = store(&dir);
        std::fs::write(store.path(), "{ not json").expect("write");

        let state = store.load().await.expect("load");
        assert_eq!(state.tokens_remaining, 100);
    }

    #[tokio::test]
    async fn leftover_backup_is_restored() {
        let dir = TempDir::new().expect("tempdir");
        let store = store(&dir);
        let mut saved = RateLimiterState::fresh(100, NOW);
        saved.tokens_remaining = 7;
        std::fs::write(
            store.backup_path(),
            serde_json::to_vec(&saved).expect("serialize"),
        )
        .expect("write backup");
        std::fs::write(store.path(), "{\"tokens\": 1, \"resetT").expect("write torn");

        let state = store.load().await.expect("load");
        assert_eq!(state.tokens_remaining, 7);
        assert!(!store.backup_path().exists());
    }

    #[tokio::test]
    async fn stale_lock_is_broken() {
        let dir = TempDir::new().expect("tempdir");
        let store = store(&dir);
        let lock = store.lock_path();
        let file = std::fs::File::create(&lock).expect("create lock");
        file.set_modified(SystemTime::now() - Duration::from_secs(60))
            .expect("age lock");

        store.update(&mut |_| {}).await.expect("update");
        assert!(!lock.exists());
    }

    #[tokio::test]
    async fn memory_store_injects_failures() {
        let store = MemoryStateStore::new(10, Clock::starting_at(NOW));
        store.fail_next_updates(1);
        assert!(store.update(&mut |_| {}).await.is_err());
        assert!(store.update(&mut |_| {}).await.is_ok());

        store.set_unavailable(true);
        assert!(store.load().await.is_err());
    }
}
