use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

mod config;
mod storage;
mod sync;
mod util;

use storage::azure::AzureBlobClient;
use sync::SyncEngine;
use sync::local_watcher::{self, WatchOptions};
use sync::resolver::{self, WatchMapping};
use sync::state::{self, FileStateCache, StateCache};

#[derive(Parser)]
#[command(
    name = "blobwatchd",
    version,
    about = "Mirror local directory changes to Azure Blob Storage"
)]
struct Cli {
    /// Path to config file [default: ~/.config/blobwatchd/config.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch the configured directories and upload changes (foreground)
    Start,
    /// Upload everything that is out of date, then exit
    SyncNow,
    /// Show what the state cache knows about each watch root
    Status,
}

fn init_tracing(verbosity: u8) {
    let default_filter = match verbosity {
        0 => "blobwatchd=info",
        1 => "blobwatchd=debug",
        2 => "blobwatchd=trace",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

/// Check inotify watch limits on Linux and warn if they look too low.
fn check_inotify_limits() {
    let path = "/proc/sys/fs/inotify/max_user_watches";
    if let Ok(content) = std::fs::read_to_string(path)
        && let Ok(limit) = content.trim().parse::<u64>()
        && limit < 65536
    {
        tracing::warn!(
            max_user_watches = limit,
            "inotify watch limit is low; large trees may not be fully watched. \
             Raise it or set general.use_polling = true"
        );
    }
}

fn build_engine(cfg: &config::Config, state_path: &Path) -> Result<SyncEngine> {
    let client = AzureBlobClient::new(&cfg.storage)?;
    let cache = FileStateCache::load(state_path);
    let mappings = cfg.watch.iter().map(WatchMapping::from_config).collect();

    Ok(SyncEngine::new(
        mappings,
        Arc::new(client),
        Box::new(cache),
        cfg.general.max_concurrent_transfers,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = config::resolve_config_path(cli.config.as_deref())?;
    if config::ensure_config(&config_path)? {
        eprintln!(
            "Created config file at {}.\n\
             Edit the storage credentials and watch paths, then run blobwatchd again.",
            config_path.display()
        );
        std::process::exit(2);
    }

    let cfg = config::load_config(&config_path)?;
    let state_path = state::resolve_state_path(cfg.general.state_path.as_deref())?;

    match cli.command {
        Command::Start => run_daemon(&cfg, &state_path).await?,
        Command::SyncNow => {
            let engine = Arc::new(build_engine(&cfg, &state_path)?);
            tracing::info!("running full sync");
            let report = engine.scan_all(&CancellationToken::new()).await;
            println!(
                "sync complete: {} uploaded, {} up-to-date, {} failed",
                report.uploaded, report.skipped, report.failed
            );
            if report.failed > 0 {
                anyhow::bail!("{} file(s) could not be synced", report.failed);
            }
        }
        Command::Status => print_status(&cfg, &state_path),
    }

    Ok(())
}

async fn run_daemon(cfg: &config::Config, state_path: &Path) -> Result<()> {
    if !cfg.general.use_polling {
        check_inotify_limits();
    }

    let engine = Arc::new(build_engine(cfg, state_path)?);
    let cancel = CancellationToken::new();

    let roots: Vec<PathBuf> = cfg.watch.iter().map(|w| w.local_path.clone()).collect();
    let (mut events, _watcher_handle) =
        local_watcher::start_local_watchers(&roots, WatchOptions::from(&cfg.general))?;

    // Catch up on changes made while we were not running. Runs alongside the
    // event loop; per-path locking keeps the two from uploading twice.
    let initial_scan = cfg.general.initial_scan.then(|| {
        let engine = engine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let report = engine.scan_all(&cancel).await;
            tracing::info!(
                uploaded = report.uploaded,
                skipped = report.skipped,
                failed = report.failed,
                "initial scan finished"
            );
        })
    });

    // SIGTERM handling (for systemd graceful stop)
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tracing::info!(roots = roots.len(), "blobwatchd ready");

    let mut in_flight = JoinSet::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
                break;
            }

            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break;
            }

            event = events.recv() => {
                let Some(event) = event else {
                    tracing::error!("file watcher stopped unexpectedly");
                    break;
                };
                tracing::debug!(kind = ?event.kind, path = %event.path.display(), "local change detected");
                let engine = engine.clone();
                in_flight.spawn(async move { engine.handle(&event).await });
            }

            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                match joined {
                    Ok(outcome) => tracing::debug!(%outcome, "event handled"),
                    Err(e) => tracing::error!(error = %e, "event task panicked"),
                }
            }
        }
    }

    cancel.cancel();
    if !in_flight.is_empty() {
        tracing::info!(count = in_flight.len(), "waiting for in-flight transfers");
    }
    while in_flight.join_next().await.is_some() {}
    if let Some(scan) = initial_scan
        && let Err(e) = scan.await
    {
        tracing::error!(error = %e, "initial scan task panicked");
    }

    tracing::info!("blobwatchd stopped");
    Ok(())
}

/// Print a per-root summary of the state cache.
fn print_status(cfg: &config::Config, state_path: &Path) {
    let cache = FileStateCache::load(state_path);
    let mappings: Vec<WatchMapping> = cfg.watch.iter().map(WatchMapping::from_config).collect();

    let mut per_root = vec![(0usize, None::<i64>); mappings.len()];
    let mut orphaned = 0usize;
    for (path, &synced_at) in cache.entries() {
        match resolver::resolve(Path::new(path), &mappings) {
            Some(r) => {
                let (count, latest) = &mut per_root[r.root_index];
                *count += 1;
                *latest = Some(latest.map_or(synced_at, |l| l.max(synced_at)));
            }
            None => orphaned += 1,
        }
    }

    println!("blobwatchd status");
    println!("=================");
    println!("State file: {}", cache.path().display());
    println!("Tracked:    {} files", cache.entries().len());

    for (i, (mapping, (count, latest))) in mappings.iter().zip(&per_root).enumerate() {
        println!();
        println!(
            "Root #{}: {} -> {}{}",
            i,
            mapping.local_root.display(),
            mapping.container,
            mapping
                .prefix
                .as_deref()
                .map(|p| format!("/{p}"))
                .unwrap_or_default()
        );
        println!("  Files synced: {count}");
        match latest.and_then(chrono::DateTime::from_timestamp_millis) {
            Some(ts) => println!("  Newest:       {}", ts.to_rfc3339()),
            None => println!("  Newest:       never"),
        }
    }

    if orphaned > 0 {
        println!();
        println!("{orphaned} cached path(s) no longer belong to any watch root");
    }
}
