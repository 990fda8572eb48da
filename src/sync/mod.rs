pub mod decision;
pub mod local_watcher;
mod locks;
pub mod resolver;
pub mod state;

use std::fmt;
use std::path::{MAIN_SEPARATOR, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::storage::{DeleteOutcome, ObjectStore};
use crate::util::path as sync_path;

use decision::{Decision, RemoteState, SkipReason};
use local_watcher::{WatchEvent, WatchEventKind};
use locks::PathLocks;
use resolver::{Resolved, WatchMapping};
use state::StateCache;

/// What happened to one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Uploaded {
        container: String,
        key: String,
        request_id: Option<String>,
    },
    /// The remote object is gone; `existed` is false if it already was.
    Deleted {
        container: String,
        key: String,
        existed: bool,
    },
    Skipped(SkipReason),
    /// No watch root owns the path.
    Unresolved,
    Failed(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Uploaded {
                container,
                key,
                request_id,
            } => write!(
                f,
                "uploaded {container}/{key} (request {})",
                request_id.as_deref().unwrap_or("-")
            ),
            Outcome::Deleted {
                container,
                key,
                existed: true,
            } => write!(f, "deleted {container}/{key}"),
            Outcome::Deleted {
                container,
                key,
                existed: false,
            } => write!(f, "{container}/{key} already absent"),
            Outcome::Skipped(reason) => write!(f, "skipped: {reason}"),
            Outcome::Unresolved => f.write_str("not under any watch root"),
            Outcome::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// Totals from a full scan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ScanReport {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Uploaded { .. } => self.uploaded += 1,
            Outcome::Deleted { .. } | Outcome::Skipped(_) | Outcome::Unresolved => {
                self.skipped += 1
            }
            Outcome::Failed(_) => self.failed += 1,
        }
    }
}

/// Mirrors local changes to the object store.
///
/// Work for one path is serialized end to end (stat, cache read, remote
/// probe, upload, cache commit), so a later event for the same path always
/// sees the result of an earlier one. Different paths proceed concurrently,
/// bounded by `max_concurrent` storage operations. The cache is only
/// advanced after the store confirms an upload.
pub struct SyncEngine {
    mappings: Vec<WatchMapping>,
    store: Arc<dyn ObjectStore>,
    cache: Mutex<Box<dyn StateCache>>,
    locks: PathLocks,
    semaphore: Semaphore,
}

impl SyncEngine {
    pub fn new(
        mappings: Vec<WatchMapping>,
        store: Arc<dyn ObjectStore>,
        cache: Box<dyn StateCache>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            mappings,
            store,
            cache: Mutex::new(cache),
            locks: PathLocks::new(),
            semaphore: Semaphore::new(max_concurrent.max(1)),
        }
    }

    /// Route a watcher event to the upload or delete executor.
    pub async fn handle(&self, event: &WatchEvent) -> Outcome {
        match event.kind {
            WatchEventKind::Upsert => self.upload_path(&event.path).await,
            WatchEventKind::Remove => self.delete_path(&event.path).await,
        }
    }

    fn resolve(&self, local_path: &Path) -> Option<Resolved> {
        let resolved = resolver::resolve(local_path, &self.mappings);
        if resolved.is_none() {
            tracing::warn!(path = %local_path.display(), "path is not under any watch root, dropping");
        }
        resolved
    }

    fn is_excluded(&self, resolved: &Resolved) -> bool {
        let exclude = &self.mappings[resolved.root_index].exclude;
        let excluded = sync_path::matches_exclude(&resolved.relative, exclude);
        if excluded {
            tracing::debug!(path = %resolved.relative, "excluded");
        }
        excluded
    }

    /// Upload `local_path` if it is newer than both the last sync and the
    /// remote copy.
    pub async fn upload_path(&self, local_path: &Path) -> Outcome {
        let Some(resolved) = self.resolve(local_path) else {
            return Outcome::Unresolved;
        };
        if self.is_excluded(&resolved) {
            return Outcome::Skipped(SkipReason::Excluded);
        }

        let _path_guard = self.locks.lock(local_path).await;

        let local_mtime = match tokio::fs::symlink_metadata(local_path).await {
            Ok(meta) if meta.is_file() => match decision::mtime_ms(&meta) {
                Ok(ms) => ms,
                Err(e) => return failed(local_path, "cannot read mtime", e),
            },
            Ok(_) => return Outcome::Skipped(SkipReason::NotAFile),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %local_path.display(), "vanished before upload");
                return Outcome::Skipped(SkipReason::NotAFile);
            }
            Err(e) => return failed(local_path, "cannot stat", e.into()),
        };

        let last_synced = self.cache.lock().await.get(local_path);

        let Ok(_permit) = self.semaphore.acquire().await else {
            return Outcome::Failed("transfer slots closed".into());
        };

        let probe = self
            .store
            .metadata(&resolved.container, &resolved.object_key)
            .await;
        let remote = RemoteState::from_probe(probe);
        match &remote {
            RemoteState::Unavailable(e) => tracing::warn!(
                container = %resolved.container,
                key = %resolved.object_key,
                error = %e,
                "cannot read remote properties, skipping this change"
            ),
            RemoteState::Present(meta) => tracing::trace!(
                key = %resolved.object_key,
                remote_mtime = ?meta.last_modified_ms,
                remote_size = ?meta.size,
                "remote properties"
            ),
            RemoteState::Missing => {}
        }

        let local_mtime_ms = match decision::decide(local_mtime, last_synced, &remote) {
            Decision::Skip(reason) => {
                tracing::info!(path = %local_path.display(), %reason, "not uploading");
                return Outcome::Skipped(reason);
            }
            Decision::Sync { local_mtime_ms } => local_mtime_ms,
        };

        tracing::info!(
            path = %local_path.display(),
            container = %resolved.container,
            key = %resolved.object_key,
            "added/changed, uploading"
        );
        let request_id = match self
            .store
            .upload(&resolved.container, &resolved.object_key, local_path)
            .await
        {
            Ok(id) => id,
            Err(e) => return failed(local_path, "upload failed", e),
        };
        tracing::info!(
            key = %resolved.object_key,
            request_id = request_id.as_deref().unwrap_or("-"),
            "upload complete"
        );

        self.commit(local_path, local_mtime_ms).await;

        Outcome::Uploaded {
            container: resolved.container,
            key: resolved.object_key,
            request_id,
        }
    }

    /// Remove the remote object for a deleted local path. The local file is
    /// never consulted, and an already-absent object counts as success.
    ///
    /// A directory removed or moved away as a whole may be reported once, for
    /// the directory only. Files under it that the cache knows about are
    /// deleted as well.
    pub async fn delete_path(&self, local_path: &Path) -> Outcome {
        let Some(resolved) = self.resolve(local_path) else {
            return Outcome::Unresolved;
        };
        if self.is_excluded(&resolved) {
            return Outcome::Skipped(SkipReason::Excluded);
        }

        let mut failures = 0usize;
        for child in self.cached_children(local_path).await {
            let Some(child_resolved) = resolver::resolve(&child, &self.mappings) else {
                continue;
            };
            if self.is_excluded(&child_resolved) {
                continue;
            }
            if let Outcome::Failed(_) = self.delete_object(&child, child_resolved).await {
                failures += 1;
            }
        }

        let outcome = self.delete_object(local_path, resolved).await;
        if failures > 0 && !matches!(outcome, Outcome::Failed(_)) {
            return Outcome::Failed(format!(
                "{failures} object(s) under {} could not be deleted",
                local_path.display()
            ));
        }
        outcome
    }

    async fn delete_object(&self, local_path: &Path, resolved: Resolved) -> Outcome {
        let _path_guard = self.locks.lock(local_path).await;
        let Ok(_permit) = self.semaphore.acquire().await else {
            return Outcome::Failed("transfer slots closed".into());
        };

        tracing::info!(
            path = %local_path.display(),
            container = %resolved.container,
            key = %resolved.object_key,
            "deleted locally, removing remote copy"
        );
        let existed = match self
            .store
            .delete(&resolved.container, &resolved.object_key)
            .await
        {
            Ok(DeleteOutcome::Deleted { request_id }) => {
                tracing::info!(
                    key = %resolved.object_key,
                    request_id = request_id.as_deref().unwrap_or("-"),
                    "delete complete"
                );
                true
            }
            Ok(DeleteOutcome::NotFound) => {
                tracing::debug!(key = %resolved.object_key, "already absent remotely");
                false
            }
            Err(e) => return failed(local_path, "delete failed", e),
        };

        Outcome::Deleted {
            container: resolved.container,
            key: resolved.object_key,
            existed,
        }
    }

    /// Cached paths strictly below `dir`.
    async fn cached_children(&self, dir: &Path) -> Vec<PathBuf> {
        let mut prefix = dir.to_string_lossy().into_owned();
        if !prefix.ends_with(MAIN_SEPARATOR) {
            prefix.push(MAIN_SEPARATOR);
        }

        let cache = self.cache.lock().await;
        cache
            .entries()
            .range(prefix.clone()..)
            .map(|(path, _)| path)
            .take_while(|path| path.starts_with(&prefix))
            .map(PathBuf::from)
            .collect()
    }

    /// Record a confirmed upload. A failed flush keeps the in-memory value;
    /// the next successful flush persists it.
    async fn commit(&self, local_path: &Path, synced_at_ms: i64) {
        let mut cache = self.cache.lock().await;
        cache.set(local_path, synced_at_ms);
        if let Err(e) = cache.flush() {
            tracing::error!(error = %format!("{e:#}"), "failed to persist state cache");
        }
    }

    /// Run every file under every root through the upload executor.
    pub async fn scan_all(self: &Arc<Self>, cancel: &CancellationToken) -> ScanReport {
        let mut total = ScanReport::default();
        for index in 0..self.mappings.len() {
            if cancel.is_cancelled() {
                break;
            }
            match self.scan_root(index, cancel).await {
                Ok(report) => {
                    total.uploaded += report.uploaded;
                    total.skipped += report.skipped;
                    total.failed += report.failed;
                }
                Err(e) => {
                    tracing::error!(
                        root = %self.mappings[index].local_root.display(),
                        error = %format!("{e:#}"),
                        "scan failed"
                    );
                    total.failed += 1;
                }
            }
        }
        total
    }

    /// Scan one root, uploading whatever the decision engine says is stale.
    pub async fn scan_root(
        self: &Arc<Self>,
        root_index: usize,
        cancel: &CancellationToken,
    ) -> Result<ScanReport> {
        let mapping = &self.mappings[root_index];
        tracing::info!(
            root = %mapping.local_root.display(),
            container = %mapping.container,
            "scanning root {}/{}", root_index + 1, self.mappings.len(),
        );

        let mut files = Vec::new();
        walk_dir(mapping, &mapping.local_root, &mut files).await?;
        tracing::debug!(count = files.len(), "local files found");

        let mut tasks = JoinSet::new();
        for file in files {
            if cancel.is_cancelled() {
                break;
            }
            let engine = Arc::clone(self);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    outcome = engine.upload_path(&file) => Some(outcome),
                }
            });
        }

        let mut report = ScanReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(outcome)) => report.record(&outcome),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(error = %e, "scan task panicked");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            root = %mapping.local_root.display(),
            uploaded = report.uploaded,
            skipped = report.skipped,
            failed = report.failed,
            "scan finished"
        );
        Ok(report)
    }

    #[cfg(test)]
    async fn last_synced(&self, local_path: &Path) -> Option<i64> {
        self.cache.lock().await.get(local_path)
    }
}

fn failed(local_path: &Path, what: &str, e: anyhow::Error) -> Outcome {
    tracing::error!(path = %local_path.display(), error = %format!("{e:#}"), "{what}");
    Outcome::Failed(format!("{what}: {e:#}"))
}

/// Collect regular files under `dir`, skipping symlinks, excluded paths and
/// subdirectories that cannot be read. Fails only if `dir` itself cannot be
/// listed.
fn walk_dir<'a>(
    mapping: &'a WatchMapping,
    dir: &'a Path,
    files: &'a mut Vec<PathBuf>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let mut read_dir = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("Failed to read dir: {}", dir.display()))?;

        loop {
            let entry = match read_dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "listing interrupted, rest of directory skipped");
                    break;
                }
            };
            let path = entry.path();
            let meta = match tokio::fs::symlink_metadata(&path).await {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot stat, skipping");
                    continue;
                }
            };

            if meta.is_symlink() {
                tracing::debug!(path = %path.display(), "skipping symlink");
                continue;
            }

            if let Some(relative) = sync_path::object_key(&mapping.local_root, &path)
                && sync_path::matches_exclude(&relative, &mapping.exclude)
            {
                tracing::debug!(path = %relative, "excluded (scan)");
                continue;
            }

            if meta.is_dir() {
                // Only the root itself is fatal; an unreadable subtree is skipped.
                if let Err(e) = walk_dir(mapping, &path, files).await {
                    tracing::warn!(path = %path.display(), error = %format!("{e:#}"), "skipping unreadable directory");
                }
            } else if meta.is_file() {
                files.push(path);
            }
        }

        Ok(())
    })
}
