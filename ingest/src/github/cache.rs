use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::id::RepoId;
use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Repository,
    Contributors,
    Languages,
}

impl ResourceKind {
    pub fn label(self) -> &'static str {
        match self {
            ResourceKind::Repository => "repository",
            ResourceKind::Contributors => "contributors",
            ResourceKind::Languages => "languages",
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            ResourceKind::Repository => "",
            ResourceKind::Contributors => "_contributors",
            ResourceKind::Languages => "_languages",
        }
    }
}

/// On-disk form. File names alone can collide across kinds (`a/b_contributors`
/// as a repository and `a/b` contributors), so each entry names its kind.
#[derive(Serialize, Deserialize)]
struct CacheEntry<T> {
    kind: String,
    data: T,
}

/// Normalized API payloads on disk, one file per repository and resource.
/// A file's mtime is its cache timestamp.
pub struct ResponseCache {
    dir: PathBuf,
    ttl: Duration,
    clock: Clock,
    tmp_counter: AtomicU64,
}

impl ResponseCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration, clock: Clock) -> Self {
        Self {
            dir: dir.into(),
            ttl,
            clock,
            tmp_counter: AtomicU64::new(0),
        }
    }

    pub fn path_for(&self, id: &RepoId, kind: ResourceKind) -> PathBuf {
        let file = format!(
            "{}_{}{}.json",
            id.owner.to_ascii_lowercase(),
            id.name.to_ascii_lowercase(),
            kind.suffix()
        );
        self.dir.join(file)
    }

    /// Fresh cached value, or `None` on a miss, a stale entry, an entry of
    /// another kind or an unreadable file.
    pub async fn get<T: DeserializeOwned>(&self, id: &RepoId, kind: ResourceKind) -> Option<T> {
        let path = self.path_for(id, kind);
        if !self.is_fresh(&path).await {
            return None;
        }
        let raw = tokio::fs::read(&path).await.ok()?;
        let entry: CacheEntry<serde_json::Value> = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                debug!(
                    stage = "cache",
                    event = "cache.decode",
                    result = "error",
                    path = %path.display(),
                    error = %err,
                    "ignoring unreadable cache entry"
                );
                return None;
            }
        };
        if entry.kind != kind.label() {
            debug!(
                stage = "cache",
                event = "cache.kind_mismatch",
                path = %path.display(),
                expected = kind.label(),
                found = %entry.kind,
                "cache entry belongs to another resource"
            );
            return None;
        }
        let data: T = match serde_json::from_value(entry.data) {
            Ok(data) => data,
            Err(err) => {
                debug!(
                    stage = "cache",
                    event = "cache.decode",
                    result = "error",
                    path = %path.display(),
                    error = %err,
                    "ignoring unreadable cache entry"
                );
                return None;
            }
        };
        debug!(stage = "cache", event = "cache.hit", repo = %id, resource = kind.label(), "cache hit");
        Some(data)
    }

    /// Write-through. Failures are logged and otherwise ignored.
    pub async fn put<T: Serialize>(&self, id: &RepoId, kind: ResourceKind, data: &T) {
        let path = self.path_for(id, kind);
        let entry = CacheEntry {
            kind: kind.label().to_string(),
            data,
        };
        if let Err(err) = self.write_entry(&path, &entry).await {
            warn!(
                stage = "cache",
                event = "cache.write",
                result = "error",
                path = %path.display(),
                error = %err,
                "failed to write cache entry"
            );
        }
    }

    async fn write_entry<T: Serialize>(&self, path: &Path, data: &T) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let raw = serde_json::to_vec(data).map_err(std::io::Error::other)?;

        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("json.{}.{n}.tmp", std::process::id()));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&raw).await?;
        file.flush().await?;
        file.into_std().await.set_modified(self.now())?;
        tokio::fs::rename(&tmp, path).await
    }

    /// Removes stale entries. Returns how many were removed.
    pub async fn purge_expired(&self) -> std::io::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };

        let mut removed = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if !self.is_fresh(&path).await {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }

        info!(
            stage = "cache",
            event = "cache.purge",
            dir = %self.dir.display(),
            removed,
            "purged expired cache entries"
        );
        Ok(removed)
    }

    async fn is_fresh(&self, path: &Path) -> bool {
        let Ok(modified) = tokio::fs::metadata(path).await.and_then(|meta| meta.modified()) else {
            return false;
        };
        // An mtime ahead of the clock counts as fresh.
        self.now()
            .duration_since(modified)
            .map_or(true, |age| age < self.ttl)
    }

    fn now(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(u64::try_from(self.clock.now_ms()).unwrap_or(0))
    }
}
