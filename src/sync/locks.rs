use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::util::path as sync_path;

/// One async mutex per local path, created on demand.
///
/// Holding the guard serializes everything done for that path; different
/// paths never wait on each other. An entry is dropped from the map when its
/// last holder releases it and nobody is waiting.
#[derive(Debug, Default)]
pub struct PathLocks {
    active: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, path: &Path) -> PathGuard<'_> {
        let key = sync_path::normalize(path);
        let lock = self.active.entry(key.clone()).or_default().clone();
        let guard = lock.lock_owned().await;
        PathGuard {
            locks: self,
            key,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.active.len()
    }
}

/// Held while work for one path is in progress.
pub struct PathGuard<'a> {
    locks: &'a PathLocks,
    key: PathBuf,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        // Release first so our own Arc no longer counts. Waiters hold a clone
        // taken under the shard lock, which keeps the entry alive for them.
        self.guard.take();
        self.locks
            .active
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}
