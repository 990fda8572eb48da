use std::path::{Path, PathBuf};

use crate::config::WatchRoot;
use crate::util::path as sync_path;

/// A watched local tree and where its files land remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchMapping {
    pub local_root: PathBuf,
    pub container: String,
    /// Key prefix inside the container, without leading/trailing slashes.
    pub prefix: Option<String>,
    pub exclude: Vec<String>,
}

impl WatchMapping {
    /// Split a `container_path` such as `"docs"` or `"docs/laptop/home"` into
    /// the container name and an optional key prefix.
    pub fn new(local_root: impl Into<PathBuf>, container_path: &str) -> Self {
        let trimmed = container_path.trim_matches('/');
        let (container, prefix) = match trimmed.split_once('/') {
            Some((c, p)) => {
                let p = p.trim_matches('/');
                (c, (!p.is_empty()).then(|| p.to_string()))
            }
            None => (trimmed, None),
        };

        Self {
            local_root: local_root.into(),
            container: container.to_string(),
            prefix,
            exclude: Vec::new(),
        }
    }

    pub fn with_exclude(mut self, exclude: Vec<String>) -> Self {
        self.exclude = exclude;
        self
    }

    pub fn from_config(root: &WatchRoot) -> Self {
        Self::new(&root.local_path, &root.container_path).with_exclude(root.exclude.clone())
    }
}

/// Where a local path goes remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// Index of the owning mapping in the configured list.
    pub root_index: usize,
    pub container: String,
    /// Full object key, prefix included.
    pub object_key: String,
    /// Key relative to the watch root, used for exclude matching.
    pub relative: String,
}

/// Map an absolute local path to its remote location.
///
/// The first mapping whose root contains `local_path` wins, so with nested
/// roots the order in the config decides ownership. Returns `None` when no
/// root contains the path, or when the path is a root itself.
pub fn resolve(local_path: &Path, mappings: &[WatchMapping]) -> Option<Resolved> {
    mappings.iter().enumerate().find_map(|(root_index, mapping)| {
        let relative = sync_path::object_key(&mapping.local_root, local_path)?;
        let object_key = match &mapping.prefix {
            Some(prefix) => format!("{prefix}/{relative}"),
            None => relative.clone(),
        };
        Some(Resolved {
            root_index,
            container: mapping.container.clone(),
            object_key,
            relative,
        })
    })
}
