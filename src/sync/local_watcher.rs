use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{DebouncedEvent, DebouncedEventKind, Debouncer, new_debouncer_opt};
use tokio::sync::mpsc;

use crate::config::GeneralConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// A regular file appeared or changed.
    Upsert,
    /// Something at the path disappeared.
    Remove,
}

/// A change event from the local filesystem watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    /// Absolute path as reported by the watcher.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    pub use_polling: bool,
    pub poll_interval: Duration,
    pub debounce: Duration,
}

impl From<&GeneralConfig> for WatchOptions {
    fn from(general: &GeneralConfig) -> Self {
        Self {
            use_polling: general.use_polling,
            poll_interval: Duration::from_millis(general.poll_interval_ms),
            debounce: Duration::from_millis(general.debounce_ms),
        }
    }
}

/// Start watching all roots recursively.
///
/// Returns a receiver that produces `WatchEvent`s. Events are debounced so a
/// burst of writes to one file is reported once after it goes quiet. The
/// debouncer does not say what happened, so the kind is derived from what is
/// on disk when the event is delivered; directories produce no events.
///
/// The watcher runs until the returned `WatcherHandle` is dropped.
pub fn start_local_watchers(
    roots: &[PathBuf],
    options: WatchOptions,
) -> Result<(mpsc::UnboundedReceiver<WatchEvent>, WatcherHandle)> {
    let (tx, rx) = mpsc::unbounded_channel();

    let handle = if options.use_polling {
        WatcherHandle {
            _native: None,
            _polling: Some(build_debouncer::<PollWatcher>(roots, options, tx)?),
        }
    } else {
        WatcherHandle {
            _native: Some(build_debouncer::<RecommendedWatcher>(roots, options, tx)?),
            _polling: None,
        }
    };

    Ok((rx, handle))
}

fn build_debouncer<T: Watcher>(
    roots: &[PathBuf],
    options: WatchOptions,
    tx: mpsc::UnboundedSender<WatchEvent>,
) -> Result<Debouncer<T>> {
    let config = notify_debouncer_mini::Config::default()
        .with_timeout(options.debounce)
        .with_notify_config(notify::Config::default().with_poll_interval(options.poll_interval));

    let mut debouncer = new_debouncer_opt::<_, T>(
        config,
        move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
            Ok(events) => {
                for event in events {
                    if event.kind != DebouncedEventKind::Any
                        && event.kind != DebouncedEventKind::AnyContinuous
                    {
                        continue;
                    }

                    if let Some(kind) = classify(&event.path) {
                        let _ = tx.send(WatchEvent {
                            kind,
                            path: event.path,
                        });
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "local watcher error");
            }
        },
    )
    .context("Failed to create file watcher")?;

    let watcher = debouncer.watcher();
    for root in roots {
        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.display()))?;
        tracing::info!(
            root = %root.display(),
            polling = options.use_polling,
            "watching for local changes"
        );
    }

    Ok(debouncer)
}

/// Derive the event kind from the current state of `path`.
fn classify(path: &Path) -> Option<WatchEventKind> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_file() => Some(WatchEventKind::Upsert),
        Ok(_) => None,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Some(WatchEventKind::Remove),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot stat changed path, ignoring");
            None
        }
    }
}

/// Handle that keeps the watcher alive. Drop to stop watching.
pub struct WatcherHandle {
    _native: Option<Debouncer<RecommendedWatcher>>,
    _polling: Option<Debouncer<PollWatcher>>,
}
