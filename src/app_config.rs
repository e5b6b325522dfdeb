//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file. A missing file is not an error;
//! every setting has a default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use docfs::dispatch::{Backpressure, DispatcherOptions};
use docfs::watchdog;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

fn docfs_runtime_dir() -> Option<PathBuf> {
    let runtime_dir = dirs::runtime_dir();
    if let Some(path) = runtime_dir {
        return Some(path.join("docfs"));
    }

    let home_dir = dirs::home_dir();
    if let Some(path) = home_dir {
        return Some(path.join(".local").join("share").join("docfs"));
    }

    None
}

fn default_pid_file() -> PathBuf {
    docfs_runtime_dir().map_or_else(
        || PathBuf::from("/var/run/docfs.pid"),
        |rd| rd.join("docfs.pid"),
    )
}

fn default_log_file() -> Option<PathBuf> {
    docfs_runtime_dir().map(|rd| rd.join("docfs.log"))
}

fn default_mount_point() -> PathBuf {
    docfs_runtime_dir().map_or_else(|| PathBuf::from("/tmp/docfs/mnt"), |rd| rd.join("mnt"))
}

fn default_store_root() -> PathBuf {
    dirs::data_dir().map_or_else(
        || PathBuf::from("/srv/docfs"),
        |dd| dd.join("docfs").join("store"),
    )
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(4, |n| n.get().clamp(2, 16))
}

fn default_queue_depth() -> usize {
    64
}

fn default_watchdog_timeout_secs() -> u64 {
    watchdog::DEFAULT_DEADLINE.as_secs()
}

fn default_stats_capacity() -> usize {
    docfs::telemetry::DEFAULT_CAPACITY
}

fn current_uid() -> u32 {
    nix::unistd::Uid::current().as_raw()
}

fn current_gid() -> u32 {
    nix::unistd::Gid::current().as_raw()
}

/// Which store to mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum BackendConfig {
    /// An exported object tree rooted at a local directory.
    Directory {
        /// The directory to serve.
        root: PathBuf,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Directory {
            root: default_store_root(),
        }
    }
}

/// Backend worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DispatcherConfig {
    /// Number of threads running backend calls.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How many backend calls may wait for a worker.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// What to do when the queue is full.
    #[serde(default)]
    pub backpressure: Backpressure,

    /// Give up waiting on a backend call after this many milliseconds. Waits forever if unset.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_depth: default_queue_depth(),
            backpressure: Backpressure::default(),
            request_timeout_ms: None,
        }
    }
}

impl DispatcherConfig {
    /// Pool sizing for the library.
    pub fn options(&self) -> DispatcherOptions {
        DispatcherOptions {
            workers: self.workers,
            queue_depth: self.queue_depth,
            backpressure: self.backpressure,
        }
    }

    /// The per-request wait limit, if any.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

/// Unmount behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ShutdownConfig {
    /// Terminate the process if teardown takes longer than this.
    #[serde(default = "default_watchdog_timeout_secs")]
    pub watchdog_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout_secs: default_watchdog_timeout_secs(),
        }
    }
}

impl ShutdownConfig {
    /// The watchdog deadline.
    pub fn watchdog_deadline(&self) -> Duration {
        Duration::from_secs(self.watchdog_timeout_secs)
    }
}

/// Per-operation stats file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StatsConfig {
    /// Append JSON lines here. Stats are only traced if unset.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Records buffered in front of the writer before new ones are dropped.
    #[serde(default = "default_stats_capacity")]
    pub capacity: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            path: None,
            capacity: default_stats_capacity(),
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DaemonConfig {
    /// The path to the PID file for the daemon.
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    /// Where the daemon's stdout and stderr go. Discarded if unset.
    #[serde(default = "default_log_file")]
    pub log_file: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            log_file: default_log_file(),
        }
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,

    #[serde(default)]
    pub stats: StatsConfig,

    #[serde(default)]
    pub daemon: DaemonConfig,

    /// The mount point for the filesystem.
    #[serde(default = "default_mount_point")]
    pub mount_point: PathBuf,

    /// The user that owns every file in the mount. Defaults to the current user.
    #[serde(default = "current_uid")]
    pub uid: u32,

    /// The group that owns every file in the mount. Defaults to the current group.
    #[serde(default = "current_gid")]
    pub gid: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            dispatcher: DispatcherConfig::default(),
            shutdown: ShutdownConfig::default(),
            stats: StatsConfig::default(),
            daemon: DaemonConfig::default(),
            mount_point: default_mount_point(),
            uid: current_uid(),
            gid: current_gid(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("Failed to read '{path}': {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing a list of validation error messages otherwise.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.daemon.pid_file.parent().is_none() {
            errors.push(format!(
                "PID file path '{}' has no parent directory.",
                self.daemon.pid_file.display()
            ));
        }

        if self.dispatcher.workers == 0 {
            errors.push("dispatcher.workers must be at least 1.".to_owned());
        }

        if self.dispatcher.request_timeout_ms == Some(0) {
            errors.push(
                "dispatcher.request-timeout-ms must be positive; omit it to wait forever."
                    .to_owned(),
            );
        }

        if self.shutdown.watchdog_timeout_secs == 0 {
            errors.push("shutdown.watchdog-timeout-secs must be at least 1.".to_owned());
        }

        if self.stats.capacity == 0 {
            errors.push("stats.capacity must be at least 1.".to_owned());
        }

        match &self.backend {
            BackendConfig::Directory { root } => {
                if !root.is_absolute() {
                    errors.push(format!(
                        "Backend root '{}' must be an absolute path.",
                        root.display()
                    ));
                }
                if root.starts_with(&self.mount_point) || self.mount_point.starts_with(root) {
                    errors.push(format!(
                        "Backend root '{}' and mount point '{}' must not contain each other.",
                        root.display(),
                        self.mount_point.display()
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Returns config file paths in descending priority order.
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("docfs").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            let path = home.join(".config").join("docfs").join("config.toml");
            if !paths.contains(&path) {
                paths.push(path);
            }
        }

        paths.push(PathBuf::from("/etc/docfs/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Parses a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::IoError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Loads configuration from the external path if given, else from the first config file
    /// found, else the defaults. A given path that cannot be read is an error.
    pub fn load(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = external_config_path {
            return Self::load_from_file(path);
        }

        match Self::find_config_file() {
            Some(path) => Self::load_from_file(&path),
            None => {
                debug!("No configuration file found, using defaults.");
                Ok(Self::default())
            }
        }
    }
}
