use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Last-synced timestamps keyed by absolute local path.
///
/// Values are epoch milliseconds and only ever move forward: `set` with an
/// older timestamp than the stored one is ignored.
pub trait StateCache: Send {
    /// Timestamp of the last successful sync of `path`, if any.
    fn get(&self, path: &Path) -> Option<i64>;

    /// Record that `path` was synced as of `synced_at_ms`.
    fn set(&mut self, path: &Path, synced_at_ms: i64);

    /// Persist the current snapshot.
    fn flush(&mut self) -> Result<()>;

    /// All entries, ordered by path.
    fn entries(&self) -> &BTreeMap<String, i64>;
}

fn cache_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Monotonic insert. Returns true if the stored value changed.
fn advance(entries: &mut BTreeMap<String, i64>, path: &Path, synced_at_ms: i64) -> bool {
    let current = entries.entry(cache_key(path)).or_insert(i64::MIN);
    if synced_at_ms > *current {
        *current = synced_at_ms;
        true
    } else {
        false
    }
}

/// Resolve the state file path: use the custom path if provided,
/// otherwise fall back to `$XDG_DATA_HOME/blobwatchd/file_states.json`.
pub fn resolve_state_path(custom: Option<&Path>) -> Result<PathBuf> {
    match custom {
        Some(p) => Ok(p.to_path_buf()),
        None => {
            let dir = dirs::data_dir().context("Could not determine data directory")?;
            Ok(dir.join("blobwatchd").join("file_states.json"))
        }
    }
}

/// State cache persisted as one pretty-printed JSON object.
#[derive(Debug)]
pub struct FileStateCache {
    path: PathBuf,
    entries: BTreeMap<String, i64>,
    dirty: bool,
}

impl FileStateCache {
    /// Load the snapshot at `path`. A missing or unparsable file yields an
    /// empty cache; this never fails.
    pub fn load(path: &Path) -> Self {
        let entries = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<BTreeMap<String, i64>>(&content) {
                Ok(entries) => {
                    tracing::debug!(path = %path.display(), count = entries.len(), "state cache loaded");
                    entries
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "state cache is corrupt, starting empty"
                    );
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no state cache yet, starting empty");
                BTreeMap::new()
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "cannot read state cache, starting empty"
                );
                BTreeMap::new()
            }
        };

        Self {
            path: path.to_path_buf(),
            entries,
            dirty: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateCache for FileStateCache {
    fn get(&self, path: &Path) -> Option<i64> {
        self.entries.get(&cache_key(path)).copied()
    }

    fn set(&mut self, path: &Path, synced_at_ms: i64) {
        if advance(&mut self.entries, path, synced_at_ms) {
            self.dirty = true;
        }
    }

    fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(&self.entries)?;

        // Atomic write: tmp file → rename
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)
            .with_context(|| format!("Failed to write state cache: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to save state cache: {}", self.path.display()))?;

        self.dirty = false;
        tracing::trace!(path = %self.path.display(), count = self.entries.len(), "state cache flushed");
        Ok(())
    }

    fn entries(&self) -> &BTreeMap<String, i64> {
        &self.entries
    }
}

/// Non-persistent cache for injecting into the engine under test.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryStateCache {
    entries: BTreeMap<String, i64>,
    flushes: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

#[cfg(test)]
impl MemoryStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts `flush` calls; stays readable after the cache is boxed away.
    pub fn flush_counter(&self) -> std::sync::Arc<std::sync::atomic::AtomicUsize> {
        self.flushes.clone()
    }
}

#[cfg(test)]
impl StateCache for MemoryStateCache {
    fn get(&self, path: &Path) -> Option<i64> {
        self.entries.get(&cache_key(path)).copied()
    }

    fn set(&mut self, path: &Path, synced_at_ms: i64) {
        advance(&mut self.entries, path, synced_at_ms);
    }

    fn flush(&mut self) -> Result<()> {
        self.flushes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn entries(&self) -> &BTreeMap<String, i64> {
        &self.entries
    }
}
