use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from harness.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct HarnessConfig {
    pub runner: RunnerConfig,
    pub teardown: TeardownConfig,
    pub scheduler: SchedulerConfig,
    pub readiness: ReadinessConfig,
    pub cluster: ClusterConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Successful commands slower than this get a completion log line.
    pub slow_command_threshold_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TeardownConfig {
    /// Pause between SIGTERM and SIGKILL for each process.
    pub grace_period_ms: u64,
    /// procfs mount used to discover child processes.
    pub proc_root: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub start_offset_ms: u64,
    /// false when cases share one host-level cluster and never run in parallel.
    pub parallel: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub poll_interval_ms: u64,
    pub min_uptime_secs: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Binary that manages the cluster under test.
    pub target: PathBuf,
    pub kubectl: PathBuf,
    pub profile: String,
    pub cleanup: bool,
    pub post_mortem_logs: bool,
}

/// Errors produced while loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// Load config from `path`. A missing file yields defaults.
pub fn load_config(path: &Path) -> Result<HarnessConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(HarnessConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

impl RunnerConfig {
    pub fn slow_command_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_command_threshold_ms)
    }
}

impl TeardownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl SchedulerConfig {
    pub fn start_offset(&self) -> Duration {
        Duration::from_millis(self.start_offset_ms)
    }
}

impl ReadinessConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn min_uptime(&self) -> Duration {
        Duration::from_secs(self.min_uptime_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// --- Default implementations ---

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            slow_command_threshold_ms: 1000,
        }
    }
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 100,
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            start_offset_ms: 30_000,
            parallel: true,
        }
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            min_uptime_secs: 5,
            timeout_secs: 240,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            target: PathBuf::from("minikube"),
            kubectl: PathBuf::from("kubectl"),
            profile: "minikube".to_string(),
            cleanup: true,
            post_mortem_logs: true,
        }
    }
}
