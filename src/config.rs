// Agent configuration from the environment, with CLI overrides.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_RUN_DIR: &str = "/run/edgenet";
pub const DEFAULT_CONFIG_PATH: &str = "/var/lib/edgenet/config.json";
pub const DEFAULT_METADATA_PORT: u16 = 80;
pub const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_METRICS_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_DNSMASQ_BIN: &str = "dnsmasq";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Hosts directories, dnsmasq files and published status
    pub run_dir: PathBuf,
    /// Declarative intake file
    pub config_path: PathBuf,
    pub metadata_port: u16,
    pub monitor_interval: Duration,
    pub metrics_interval: Duration,
    pub dnsmasq_bin: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from(DEFAULT_RUN_DIR),
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            metadata_port: DEFAULT_METADATA_PORT,
            monitor_interval: Duration::from_secs(DEFAULT_MONITOR_INTERVAL_SECS),
            metrics_interval: Duration::from_secs(DEFAULT_METRICS_INTERVAL_SECS),
            dnsmasq_bin: DEFAULT_DNSMASQ_BIN.to_string(),
        }
    }
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> T {
    match raw {
        Some(value) => match value.trim().parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                tracing::warn!("Ignoring invalid {}='{}', using default", key, value);
                default
            }
        },
        None => default,
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup (the process
    /// environment in production).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            run_dir: lookup("EDGENET_RUN_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.run_dir),
            config_path: lookup("EDGENET_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.config_path),
            metadata_port: parse_or(
                "EDGENET_METADATA_PORT",
                lookup("EDGENET_METADATA_PORT"),
                DEFAULT_METADATA_PORT,
            ),
            monitor_interval: Duration::from_secs(parse_or(
                "EDGENET_MONITOR_INTERVAL_SECS",
                lookup("EDGENET_MONITOR_INTERVAL_SECS"),
                DEFAULT_MONITOR_INTERVAL_SECS,
            )),
            metrics_interval: Duration::from_secs(parse_or(
                "EDGENET_METRICS_INTERVAL_SECS",
                lookup("EDGENET_METRICS_INTERVAL_SECS"),
                DEFAULT_METRICS_INTERVAL_SECS,
            )),
            dnsmasq_bin: lookup("EDGENET_DNSMASQ_BIN").unwrap_or(defaults.dnsmasq_bin),
        }
    }

    pub fn with_overrides(mut self, config_path: Option<PathBuf>, run_dir: Option<PathBuf>) -> Self {
        if let Some(path) = config_path {
            self.config_path = path;
        }
        if let Some(dir) = run_dir {
            self.run_dir = dir;
        }
        self
    }

    pub fn status_dir(&self) -> PathBuf {
        self.run_dir.join("status")
    }
}

/// Log filter directive: `EDGENET_LOG`, then `RUST_LOG`, then `info`.
pub fn log_filter() -> String {
    std::env::var("EDGENET_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string())
}
