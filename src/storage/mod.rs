pub mod azure;

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

/// Remote object properties the sync decision needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Last-modified time in epoch milliseconds, if reported.
    pub last_modified_ms: Option<i64>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted { request_id: Option<String> },
    /// Nothing to delete; the object is already absent.
    NotFound,
}

/// The remote side: a flat key space per container.
///
/// Implementations own transport concerns (auth, throttling retries);
/// "not found" is reported as a value, never as an error.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Properties of `container/key`, or `None` if it does not exist.
    async fn metadata(&self, container: &str, key: &str) -> Result<Option<ObjectMeta>>;

    /// Upload the file at `local_path`, replacing any existing object.
    /// Returns the service's request id for traceability.
    async fn upload(&self, container: &str, key: &str, local_path: &Path) -> Result<Option<String>>;

    async fn delete(&self, container: &str, key: &str) -> Result<DeleteOutcome>;
}
