//! Driver configuration: state directory layout and the environment
//! variables the process honors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;

use crate::errors::{GravityError, Result};

/// Default node state directory.
pub const DEFAULT_STATE_DIR: &str = "/var/lib/gravity";

/// Sentinel set when the process has been re-executed under the correct
/// security context, so bootstrap does not recurse.
pub const SELINUX_BOOTSTRAPPED_ENV: &str = "GRAVITY_SELINUX_BOOTSTRAPPED";

/// Override for the status-collection deadline.
pub const AGENT_STATUS_TIMEOUT_ENV: &str = "AGENT_STATUS_TIMEOUT";

const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// The node state directory and the paths inside it. The directory is
/// owned by this node; a lock file keeps concurrent drivers out.
#[derive(Debug)]
pub struct StateDir {
    root: PathBuf,
    /// Held for the lifetime of the state dir handle.
    _lock: std::fs::File,
}

impl StateDir {
    /// Open the state directory, creating it and taking the exclusive
    /// node lock.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let lock_path = root.join(".lock");
        let lock = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        lock.try_lock_exclusive().map_err(|_| {
            GravityError::AlreadyExists(format!(
                "another gravity process holds {}",
                lock_path.display()
            ))
        })?;
        Ok(Self {
            root: root.to_path_buf(),
            _lock: lock,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Node-local replica of plans and operations.
    pub fn local_db(&self) -> PathBuf {
        self.root.join("local.db")
    }

    /// Cluster-backend database on the shared state volume.
    pub fn cluster_db(&self) -> PathBuf {
        self.root.join("cluster.db")
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.root.join("packages")
    }

    /// On-disk credentials archive the agent loads at startup.
    pub fn credentials_path(&self) -> PathBuf {
        self.root.join("agent-credentials.json")
    }
}

/// True when the process was already re-executed under the correct
/// security context.
pub fn selinux_bootstrapped() -> bool {
    std::env::var_os(SELINUX_BOOTSTRAPPED_ENV).is_some()
}

/// Status-collection deadline, overridable through the environment as
/// either seconds or a humane `30s`/`2m` form.
pub fn agent_status_timeout() -> Duration {
    let Some(raw) = std::env::var_os(AGENT_STATUS_TIMEOUT_ENV) else {
        return DEFAULT_STATUS_TIMEOUT;
    };
    let raw = raw.to_string_lossy();
    parse_duration(&raw).unwrap_or(DEFAULT_STATUS_TIMEOUT)
}

/// Parse `90`, `90s`, or `2m` into a duration.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let (value, unit) = raw.split_at(raw.len().checked_sub(1)?);
    let value: u64 = value.parse().ok()?;
    match unit {
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}
