//! CPU reservation daemon configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuReserveConfig {
    /// Reservation table settings
    #[serde(default)]
    pub table: TableConfig,

    /// Preemption watcher settings
    #[serde(default)]
    pub watch: WatchConfig,

    /// Kernel backend settings
    #[serde(default)]
    pub kernel: KernelConfig,

    /// Daemon settings
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Reservation table configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    /// Maximum number of reservations, fixed at startup
    #[serde(default = "default_max_reservations")]
    pub max_reservations: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            max_reservations: default_max_reservations(),
        }
    }
}

/// Preemption watcher configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Log every observed preemption at info level
    #[serde(default)]
    pub verbose: bool,

    /// Feed deadline preemptions into a per-reservation histogram
    #[serde(default)]
    pub monitor: bool,

    /// Histogram layout
    #[serde(default)]
    pub histogram: HistogramConfig,
}

/// Deadline histogram layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramConfig {
    /// Lower bound of the first bin (microseconds)
    #[serde(default)]
    pub low_us: u64,

    /// Upper bound of the last bin (microseconds)
    #[serde(default = "default_histogram_high")]
    pub high_us: u64,

    /// Number of bins
    #[serde(default = "default_histogram_bins")]
    pub bins: usize,
}

impl Default for HistogramConfig {
    fn default() -> Self {
        Self {
            low_us: 0,
            high_us: default_histogram_high(),
            bins: default_histogram_bins(),
        }
    }
}

/// Kernel backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Scheduler tick size reported by the simulated kernel (microseconds)
    #[serde(default = "default_granularity")]
    pub granularity_us: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            granularity_us: default_granularity(),
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Socket path for IPC
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            log_level: default_log_level(),
        }
    }
}

// Default value functions
fn default_max_reservations() -> usize {
    1000
}

fn default_histogram_high() -> u64 {
    10_000
}

fn default_histogram_bins() -> usize {
    100
}

fn default_granularity() -> u64 {
    1000
}

pub fn default_socket_path() -> String {
    "/run/cpu-reserve/cpu-reserve.sock".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl CpuReserveConfig {
    /// Load configuration from file, falling back to defaults if absent
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}
