use std::fmt;
use std::time::UNIX_EPOCH;

use anyhow::Result;

use crate::storage::ObjectMeta;

/// What the metadata probe learned about the remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteState {
    /// The object does not exist.
    Missing,
    Present(ObjectMeta),
    /// The probe failed for a reason other than "not found".
    Unavailable(String),
}

impl RemoteState {
    pub fn from_probe(probe: Result<Option<ObjectMeta>>) -> Self {
        match probe {
            Ok(Some(meta)) => Self::Present(meta),
            Ok(None) => Self::Missing,
            Err(e) => Self::Unavailable(format!("{e:#}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Upload; on success the cache records `local_mtime_ms`.
    Sync { local_mtime_ms: i64 },
    Skip(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The local mtime is not newer than the last recorded sync.
    AlreadySynced,
    /// The remote object is at least as new as the local file.
    RemoteNewer,
    /// The remote state could not be determined.
    RemoteUnavailable(String),
    /// The path vanished or is not a regular file.
    NotAFile,
    /// The path is in a root but matches an exclude pattern.
    Excluded,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadySynced => f.write_str("already up-to-date"),
            Self::RemoteNewer => f.write_str("remote copy is newer"),
            Self::RemoteUnavailable(e) => write!(f, "remote state unknown: {e}"),
            Self::NotAFile => f.write_str("not a regular file"),
            Self::Excluded => f.write_str("excluded"),
        }
    }
}

/// Decide whether a local file needs uploading.
///
/// A missing remote object always syncs. Otherwise the file syncs only if its
/// mtime is strictly newer than both the last sync and the remote
/// last-modified time; equal timestamps skip. Probe failures skip.
pub fn decide(local_mtime_ms: i64, last_synced_ms: Option<i64>, remote: &RemoteState) -> Decision {
    let last_synced = last_synced_ms.unwrap_or(0);

    match remote {
        RemoteState::Missing => Decision::Sync { local_mtime_ms },
        RemoteState::Unavailable(e) => Decision::Skip(SkipReason::RemoteUnavailable(e.clone())),
        RemoteState::Present(meta) => {
            let remote_mtime = meta.last_modified_ms.unwrap_or(0);
            if local_mtime_ms <= last_synced {
                Decision::Skip(SkipReason::AlreadySynced)
            } else if local_mtime_ms <= remote_mtime {
                Decision::Skip(SkipReason::RemoteNewer)
            } else {
                Decision::Sync { local_mtime_ms }
            }
        }
    }
}

/// A file's modification time in epoch milliseconds.
pub fn mtime_ms(meta: &std::fs::Metadata) -> Result<i64> {
    let ms = match meta.modified()?.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(before_epoch) => -(before_epoch.duration().as_millis() as i64),
    };
    Ok(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn present(ms: i64) -> RemoteState {
        RemoteState::Present(ObjectMeta {
            last_modified_ms: Some(ms),
            size: None,
        })
    }

    #[test]
    fn missing_remote_always_syncs() {
        assert_eq!(
            decide(1000, None, &RemoteState::Missing),
            Decision::Sync { local_mtime_ms: 1000 }
        );
        // even when the cache claims the file is current
        assert_eq!(
            decide(1000, Some(5000), &RemoteState::Missing),
            Decision::Sync { local_mtime_ms: 1000 }
        );
    }

    #[test]
    fn newer_than_cache_and_remote_syncs() {
        assert_eq!(
            decide(2000, Some(1000), &present(1500)),
            Decision::Sync { local_mtime_ms: 2000 }
        );
    }

    #[test]
    fn remote_newer_skips() {
        assert_eq!(
            decide(2000, Some(1000), &present(2500)),
            Decision::Skip(SkipReason::RemoteNewer)
        );
    }

    #[test]
    fn equal_to_last_synced_skips_even_if_remote_older() {
        assert_eq!(
            decide(1000, Some(1000), &present(10)),
            Decision::Skip(SkipReason::AlreadySynced)
        );
    }

    #[test]
    fn equal_to_remote_skips() {
        assert_eq!(
            decide(1500, None, &present(1500)),
            Decision::Skip(SkipReason::RemoteNewer)
        );
    }

    #[test]
    fn remote_without_timestamp_counts_as_zero() {
        let remote = RemoteState::Present(ObjectMeta::default());
        assert_eq!(
            decide(1, None, &remote),
            Decision::Sync { local_mtime_ms: 1 }
        );
    }

    #[test]
    fn probe_failure_skips() {
        let remote = RemoteState::from_probe(Err(anyhow::anyhow!("connection reset")));
        match decide(2000, None, &remote) {
            Decision::Skip(SkipReason::RemoteUnavailable(msg)) => {
                assert!(msg.contains("connection reset"))
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn probe_not_found_is_missing() {
        assert_eq!(RemoteState::from_probe(Ok(None)), RemoteState::Missing);
    }
}
