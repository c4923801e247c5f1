//! `coresyncd`: keeps a node's local index cores in sync with an object store.
//!
//! # Usage
//!
//! ```text
//! coresyncd start                                   # sync the configured cores
//! coresyncd start -c coresync.toml --core c/s/n     # add a core on the command line
//! coresyncd status                                  # local vs remote generations
//! coresyncd push --core books/shard1/replica_n1 ./segments
//! ```

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use coresync_engine::{PushOutcome, StoreManager};
use coresync_store::{BlobStore, CoreStore, FileBlobStore, FileCoreStore};
use coresync_types::events::{PullAbandoned, PullFailed};
use coresync_types::{CoreIdentity, Generation};
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{error, info, warn};

use config::CliConfig;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "coresyncd",
    version,
    about = "Index core synchronization daemon"
)]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true, env = "CORESYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync worker for the configured cores.
    Start {
        /// Override data directory (useful for running multiple instances).
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Override the object store root.
        #[arg(short, long)]
        blob_root: Option<PathBuf>,

        /// Additional core to serve, as `collection/shard/core`.
        ///
        /// Can be specified multiple times.
        #[arg(long)]
        core: Vec<String>,
    },

    /// Show local and remote generations of the configured cores.
    Status,

    /// Publish the files of a directory as a new generation of a core.
    Push {
        /// Core to publish, as `collection/shard/core`.
        #[arg(long)]
        core: String,

        /// Directory whose regular files become the segments.
        dir: PathBuf,
    },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    setup_tracing(&config.log.level);

    match cli.command {
        Commands::Start {
            data_dir,
            blob_root,
            core,
        } => {
            // CLI args override config file values.
            if let Some(dir) = data_dir {
                config.node.data_dir = dir;
            }
            if let Some(root) = blob_root {
                config.blob.root = Some(root);
            }
            config.node.cores.extend(core);
            cmd_start(config).await
        }
        Commands::Status => cmd_status(&config).await,
        Commands::Push { core, dir } => cmd_push(&config, &core, &dir).await,
    }
}

/// Initialize the `tracing` subscriber.
///
/// `RUST_LOG` wins over the configured level.
fn setup_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_manager(config: &CliConfig) -> Result<StoreManager> {
    let blob_root = config.blob_root();
    let cores_dir = config.cores_dir();
    info!(
        blob_root = %blob_root.display(),
        cores_dir = %cores_dir.display(),
        holder = %config.node.holder,
        "opening stores"
    );

    let blobs = FileBlobStore::new(&blob_root).context("failed to open object store")?;
    let local = FileCoreStore::new(&cores_dir).context("failed to open local cores")?;
    Ok(StoreManager::new(
        config.to_sync_config(),
        Arc::new(blobs),
        Arc::new(local),
    ))
}

// -----------------------------------------------------------------------
// coresyncd start
// -----------------------------------------------------------------------

async fn cmd_start(config: CliConfig) -> Result<()> {
    let cores = config.cores()?;
    if cores.is_empty() {
        warn!("no cores configured, the node will only sweep");
    }

    let manager = Arc::new(build_manager(&config)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    spawn_alert_logger(&manager, shutdown_rx.clone());

    let worker = manager.start().await;
    info!(worker = worker.id, cores = cores.len(), "coresyncd running");

    for core in &cores {
        manager.enqueue_pull(core, Generation::ZERO);
    }

    let refresh_task = config.refresh_interval().map(|interval| {
        tokio::spawn(refresh_loop(
            Arc::clone(&manager),
            cores.clone(),
            interval,
            shutdown_rx.clone(),
        ))
    });
    let sweep_task = tokio::spawn(
        Arc::clone(manager.delete_manager()).run(config.sweep_interval(), shutdown_rx.clone()),
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    let _ = shutdown_tx.send(true);
    if let Some(task) = refresh_task
        && let Err(e) = task.await
    {
        error!(error = %e, "refresh loop panicked");
    }
    if let Err(e) = sweep_task.await {
        error!(error = %e, "delete sweep panicked");
    }
    manager.stop().await.context("failed to stop sync worker")?;

    let failed = manager.permanent_failures();
    if !failed.is_empty() {
        warn!(count = failed.len(), "cores left permanently failed");
    }
    info!("coresyncd stopped");
    Ok(())
}

/// Request a pull of every served core on a fixed period.
///
/// Catches generations published without a coordination notification.
async fn refresh_loop(
    manager: Arc<StoreManager>,
    cores: Vec<CoreIdentity>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; startup already enqueued every core.
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                for core in &cores {
                    let known = manager
                        .controller()
                        .current_generation(core)
                        .unwrap_or(Generation::ZERO);
                    manager.enqueue_pull(core, known);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Log pull failures and abandoned cores as they happen.
fn spawn_alert_logger(manager: &StoreManager, mut shutdown: watch::Receiver<bool>) {
    let mut failed = manager.events().subscribe::<PullFailed>();
    let mut abandoned = manager.events().subscribe::<PullAbandoned>();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(event) = failed.recv() => {
                    warn!(core = %event.core, attempt = event.attempt,
                          retry_in = ?event.retry_in, reason = %event.reason, "pull failed");
                }
                Some(event) = abandoned.recv() => {
                    error!(core = %event.core, attempts = event.attempts,
                           reason = %event.reason,
                           "pull abandoned, core needs operator attention");
                }
                _ = shutdown.changed() => break,
            }
        }
    });
}

// -----------------------------------------------------------------------
// coresyncd status
// -----------------------------------------------------------------------

async fn cmd_status(config: &CliConfig) -> Result<()> {
    let cores = config.cores()?;
    let manager = build_manager(config)?;

    println!("Cores: {}", cores.len());
    for core in &cores {
        let local = manager.core_store().local_generation(core).await?;
        let remote = manager
            .blob_store()
            .list_metadata(core)
            .await?
            .map(|md| md.generation);
        let state = match remote {
            None => "no remote".to_string(),
            Some(remote) if remote == local => "in sync".to_string(),
            Some(remote) if remote > local => format!("behind by {}", remote.0 - local.0),
            Some(_) => "ahead of remote".to_string(),
        };
        println!(
            "  {core}: local={local} remote={} ({state})",
            remote.map_or_else(|| "-".to_string(), |g| g.to_string())
        );
    }
    Ok(())
}

// -----------------------------------------------------------------------
// coresyncd push
// -----------------------------------------------------------------------

async fn cmd_push(config: &CliConfig, core: &str, dir: &Path) -> Result<()> {
    let core: CoreIdentity = core
        .parse()
        .with_context(|| format!("invalid core {core:?}"))?;
    let files = read_segments(dir).await?;
    if files.is_empty() {
        bail!("{} contains no files", dir.display());
    }

    let manager = build_manager(config)?;
    match manager.push(&core, files).await? {
        PushOutcome::Pushed {
            generation,
            uploaded_files,
        } => println!("{core}: pushed generation {generation} ({uploaded_files} files uploaded)"),
        PushOutcome::Unchanged { generation } => {
            println!("{core}: unchanged, remote already at generation {generation}")
        }
        PushOutcome::Contended { held_by } => {
            bail!("{core} is busy with a {held_by} lease, try again later")
        }
    }
    Ok(())
}

/// Read the regular files of `dir`, sorted by name.
async fn read_segments(dir: &Path) -> Result<Vec<(String, Bytes)>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to read {}", dir.display()))?;

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let data = tokio::fs::read(entry.path()).await?;
        files.push((name, Bytes::from(data)));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_segments_sorted_and_skips_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("_1.cfs"), b"one").unwrap();
        std::fs::write(dir.path().join("_0.cfs"), b"zero").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let files = read_segments(dir.path()).await.unwrap();
        let names: Vec<_> = files.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["_0.cfs", "_1.cfs"]);
        assert_eq!(files[0].1, Bytes::from_static(b"zero"));
    }

    #[tokio::test]
    async fn test_push_then_status_over_file_stores() {
        let dir = tempfile::tempdir().unwrap();
        let segments = dir.path().join("segments");
        std::fs::create_dir(&segments).unwrap();
        std::fs::write(segments.join("_0.cfs"), b"segment zero").unwrap();

        let config = CliConfig::from_toml(&format!(
            "[node]\ndata_dir = {:?}\ncores = [\"books/shard1/replica_n1\"]\n",
            dir.path().join("node")
        ))
        .unwrap();

        cmd_push(&config, "books/shard1/replica_n1", &segments)
            .await
            .unwrap();
        cmd_status(&config).await.unwrap();

        let manager = build_manager(&config).unwrap();
        let core = config.cores().unwrap().remove(0);
        let remote = manager.blob_store().list_metadata(&core).await.unwrap();
        assert_eq!(remote.unwrap().generation, Generation(1));
        assert_eq!(
            manager.core_store().local_generation(&core).await.unwrap(),
            Generation(1)
        );
    }
}
