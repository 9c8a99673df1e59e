use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::inventory::DEFAULT_ERROR_LOG_CAPACITY;
use crate::refresh::DEFAULT_REFRESH_INTERVAL;
use crate::remote::{SshOptions, DEFAULT_PROBE_TIMEOUT};
use crate::scan::{ScanOptions, DEFAULT_CAPTURE_LINES, DEFAULT_MAX_CONCURRENT_PROBES};
use crate::slurm::SlurmOptions;

/// Engine configuration, loaded from TOML. Every key is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub refresh_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_concurrent_probes: usize,
    pub error_log_capacity: usize,
    /// Capture recent pane output of every live session on each scan.
    pub snapshot_mode: bool,
    pub capture_lines: usize,
    pub notes_path: Option<PathBuf>,
    pub snapshots_path: Option<PathBuf>,
    pub scheduler: SchedulerConfig,
    pub ssh: SshConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Whose jobs to list. Defaults to `$USER`.
    pub user: Option<String>,
    pub squeue: String,
    pub scontrol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub program: String,
    /// Passed to ssh verbatim, before the destination.
    pub extra_options: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL.as_secs(),
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT.as_secs(),
            connect_timeout_secs: 2,
            max_concurrent_probes: DEFAULT_MAX_CONCURRENT_PROBES,
            error_log_capacity: DEFAULT_ERROR_LOG_CAPACITY,
            snapshot_mode: false,
            capture_lines: DEFAULT_CAPTURE_LINES,
            notes_path: None,
            snapshots_path: None,
            scheduler: SchedulerConfig::default(),
            ssh: SshConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let slurm = SlurmOptions::default();
        Self {
            user: None,
            squeue: slurm.squeue,
            scontrol: slurm.scontrol,
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: SshOptions::default().program,
            extra_options: Vec::new(),
        }
    }
}

impl Config {
    /// Load config from a TOML file path. Returns None if the file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config
            .validate()
            .map_err(|reason| ConfigError::Invalid(path.to_path_buf(), reason))?;
        Ok(Some(config))
    }

    /// Load from `path`, falling back to defaults when it is missing.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::load(path)?.unwrap_or_default())
    }

    fn validate(&self) -> Result<(), String> {
        if self.refresh_interval_secs == 0 {
            return Err("refresh_interval_secs must be at least 1".into());
        }
        if self.probe_timeout_secs == 0 {
            return Err("probe_timeout_secs must be at least 1".into());
        }
        if self.max_concurrent_probes == 0 {
            return Err("max_concurrent_probes must be at least 1".into());
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }

    pub fn slurm_options(&self) -> SlurmOptions {
        SlurmOptions {
            user: self.scheduler.user.clone(),
            squeue: self.scheduler.squeue.clone(),
            scontrol: self.scheduler.scontrol.clone(),
            ..SlurmOptions::default()
        }
    }

    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            program: self.ssh.program.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            extra_options: self.ssh.extra_options.clone(),
        }
    }

    /// The coordinator's per-call deadline sits just above the probe's own
    /// timeout so the probe normally reports first.
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            max_concurrent: self.max_concurrent_probes.max(1),
            deadline: self.probe_timeout() + Duration::from_secs(1),
            capture_lines: self.snapshot_mode.then_some(self.capture_lines),
        }
    }

    pub fn notes_path(&self) -> PathBuf {
        self.notes_path
            .clone()
            .unwrap_or_else(|| home_dir().join(".nodemux_notes.json"))
    }

    pub fn snapshots_path(&self) -> PathBuf {
        self.snapshots_path
            .clone()
            .unwrap_or_else(|| home_dir().join(".nodemux_snapshots.json"))
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// `$XDG_CONFIG_HOME/nodemux/config.toml`, or the platform equivalent.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| home_dir().join(".config"))
        .join("nodemux")
        .join("config.toml")
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(PathBuf, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(path, reason) => {
                write!(f, "Invalid config {}: {}", path.display(), reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFailed(_, e) => Some(e),
            Self::ParseFailed(_, e) => Some(e),
            Self::Invalid(..) => None,
        }
    }
}

/// Warn if a config file is world-readable.
///
/// The file can name the scheduler user and ssh options; there is no reason
/// for other users to read it.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "Config file {} is world-readable (mode {:o}). \
             Consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// Returns true if the given file mode has the world-readable bit set.
#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
