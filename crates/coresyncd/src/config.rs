//! TOML configuration for the coresync daemon.

use std::path::{Path, PathBuf};

use anyhow::Context;
use coresync_types::{CoreIdentity, SyncConfig};
use serde::Deserialize;
use tokio::time::Duration;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Node identity, local data, and the cores it serves.
    pub node: NodeSection,
    /// Remote object store.
    pub blob: BlobSection,
    /// Lease and retry tuning.
    pub sync: SyncSection,
    /// Deletion of superseded blobs.
    pub delete: DeleteSection,
    /// Periodic re-check of every served core.
    pub refresh: RefreshSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Directory holding the local cores.
    pub data_dir: PathBuf,
    /// Holder token written on this node's leases.
    pub holder: String,
    /// Cores this node serves, as `collection/shard/core`.
    pub cores: Vec<String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".coresync"))
            .unwrap_or_else(|| PathBuf::from(".coresync"));
        Self {
            data_dir,
            holder: "coresyncd".to_string(),
            cores: Vec::new(),
        }
    }
}

/// `[blob]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BlobSection {
    /// Root of the object store. Defaults to `{data_dir}/blobs`.
    pub root: Option<PathBuf>,
    /// Per-request timeout in seconds.
    pub fetch_timeout_secs: Option<u64>,
}

/// `[sync]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    /// How long to wait for a core's lease, in milliseconds.
    pub lease_timeout_ms: Option<u64>,
    /// Leases held longer than this many seconds are revoked.
    pub max_lease_hold_secs: Option<u64>,
    /// First retry delay in milliseconds.
    pub backoff_base_ms: Option<u64>,
    /// Largest retry delay in seconds.
    pub backoff_max_secs: Option<u64>,
    /// Failed attempts before a core is given up on.
    pub max_pull_attempts: Option<u32>,
}

/// `[delete]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DeleteSection {
    /// Minimum age in seconds of a superseded blob before it is deleted.
    pub grace_period_secs: Option<u64>,
    /// Seconds between delete sweeps.
    pub sweep_interval_secs: Option<u64>,
}

/// `[refresh]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RefreshSection {
    /// Seconds between pull requests for every served core. 0 disables.
    pub interval_secs: Option<u64>,
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read {}", p.display()))?;
                Ok(toml::from_str(&content)?)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Engine tunables, falling back to [`SyncConfig::default`] per field.
    pub fn to_sync_config(&self) -> SyncConfig {
        let defaults = SyncConfig::default();
        SyncConfig {
            lease_timeout: self
                .sync
                .lease_timeout_ms
                .map_or(defaults.lease_timeout, Duration::from_millis),
            max_lease_hold: self
                .sync
                .max_lease_hold_secs
                .map_or(defaults.max_lease_hold, Duration::from_secs),
            fetch_timeout: self
                .blob
                .fetch_timeout_secs
                .map_or(defaults.fetch_timeout, Duration::from_secs),
            backoff_base: self
                .sync
                .backoff_base_ms
                .map_or(defaults.backoff_base, Duration::from_millis),
            backoff_max: self
                .sync
                .backoff_max_secs
                .map_or(defaults.backoff_max, Duration::from_secs),
            max_pull_attempts: self
                .sync
                .max_pull_attempts
                .unwrap_or(defaults.max_pull_attempts),
            delete_grace_period: self
                .delete
                .grace_period_secs
                .map_or(defaults.delete_grace_period, Duration::from_secs),
            holder: self.node.holder.clone(),
        }
    }

    /// Effective object store root.
    pub fn blob_root(&self) -> PathBuf {
        self.blob
            .root
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("blobs"))
    }

    /// Directory of the local cores.
    pub fn cores_dir(&self) -> PathBuf {
        self.node.data_dir.join("cores")
    }

    /// Effective delete sweep interval. Defaults to one minute.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.delete.sweep_interval_secs.unwrap_or(60))
    }

    /// Effective refresh interval, `None` when disabled. Defaults to five minutes.
    pub fn refresh_interval(&self) -> Option<Duration> {
        match self.refresh.interval_secs.unwrap_or(300) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// The configured cores, parsed.
    pub fn cores(&self) -> anyhow::Result<Vec<CoreIdentity>> {
        self.node
            .cores
            .iter()
            .map(|s| {
                s.parse::<CoreIdentity>()
                    .with_context(|| format!("invalid core in [node] cores: {s:?}"))
            })
            .collect()
    }
}
