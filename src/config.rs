//! TOML configuration for a ctlbench execution.
//!
//! Every section has compiled-in defaults, so a config file only needs the
//! handler locations and the dimensions it wants to sweep.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dimensions::DimensionValue;
use crate::error::TestError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for one test execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub test: TestConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    /// Swept parameters, in enumeration order (first varies slowest).
    #[serde(default)]
    pub dimensions: Vec<DimensionConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BenchConfig {
    /// Load and validate configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), test = %config.test.name, "loaded test configuration");
        Ok(config)
    }

    /// Reject configurations that parse but cannot run.
    pub fn validate(&self) -> std::result::Result<(), TestError> {
        let mut seen = HashSet::new();
        for dim in &self.dimensions {
            if dim.name.is_empty() {
                return Err(TestError::Config("dimension with empty name".into()));
            }
            if !seen.insert(dim.name.as_str()) {
                return Err(TestError::Config(format!(
                    "dimension '{}' declared twice",
                    dim.name
                )));
            }
        }
        if self.test.test_repeats.is_some() && seen.contains(crate::dimensions::REPEAT_DIMENSION) {
            return Err(TestError::Config(format!(
                "'{}' is generated from test_repeats and cannot also be declared",
                crate::dimensions::REPEAT_DIMENSION
            )));
        }
        if self.monitor.channel_capacity == 0 {
            return Err(TestError::Config("monitor.channel_capacity must be > 0".into()));
        }
        if self.controller.poll_interval_ms == 0 || self.watcher.poll_interval_ms == 0 {
            return Err(TestError::Config("poll intervals must be > 0".into()));
        }
        if self.watcher.source == CountSourceKind::Handler && self.watcher.count_handler.is_none() {
            return Err(TestError::Config(
                "watcher.source = \"handler\" requires watcher.count_handler".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Test
// ---------------------------------------------------------------------------

/// Which pipeline runs per combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    /// Generator + Monitor: one sample per result line.
    Throughput,
    /// Generator + Watcher: one sample per combination with discovery time.
    Discovery,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    /// Name used in logs and the results file.
    pub name: String,
    pub kind: TestKind,
    /// Appends a `repeat_id` dimension with values `0..test_repeats`.
    pub test_repeats: Option<u32>,
    pub output_dir: PathBuf,
    /// Results file name, relative to `output_dir`.
    pub results_file: String,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            name: "sb_active_stability".to_string(),
            kind: TestKind::Throughput,
            test_repeats: None,
            output_dir: PathBuf::from("results"),
            results_file: "results.json".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// SSH coordinates of a remote node. Absent means "run locally".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub user: String,
    #[serde(default)]
    pub identity_file: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Controller handlers and lifecycle settings. Handler paths are relative to
/// `base_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub name: String,
    pub base_dir: PathBuf,
    pub node: Option<NodeConfig>,
    /// Southbound address the generator connects to.
    pub ip: String,
    /// Southbound (OpenFlow) listening port.
    pub port: u16,
    pub restconf_port: u16,
    pub restconf_user: String,
    pub restconf_password: String,

    pub build_handler: String,
    pub start_handler: String,
    pub stop_handler: String,
    pub status_handler: String,
    pub clean_handler: String,
    pub statistics_handler: String,
    /// Controller log directory, copied into the output directory at teardown.
    pub logs_dir: Option<String>,

    pub rebuild: bool,
    pub cleanup: bool,
    /// Passed to the start handler as `JAVA_OPTS`.
    pub jvm_opts: Vec<String>,
    /// CPU list for `taskset -c`.
    pub cpus: Option<String>,
    /// Used when no `controller_statistics_period_ms` dimension is swept.
    pub statistics_period_ms: Option<u64>,
    pub start_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "ODL".to_string(),
            base_dir: PathBuf::from("controller"),
            node: None,
            ip: "127.0.0.1".to_string(),
            port: 6653,
            restconf_port: 8181,
            restconf_user: "admin".to_string(),
            restconf_password: "admin".to_string(),
            build_handler: "build_handler.sh".to_string(),
            start_handler: "start_handler.sh".to_string(),
            stop_handler: "stop_handler.sh".to_string(),
            status_handler: "status_handler.sh".to_string(),
            clean_handler: "clean_handler.sh".to_string(),
            statistics_handler: "statistics_handler.sh".to_string(),
            logs_dir: None,
            rebuild: false,
            cleanup: true,
            jvm_opts: Vec::new(),
            cpus: None,
            statistics_period_ms: None,
            start_timeout_secs: 420,
            poll_interval_ms: 1000,
        }
    }
}

impl ControllerConfig {
    pub fn handler_path(&self, handler: &str) -> PathBuf {
        self.base_dir.join(handler)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// Load generator handler and its static parameters. Any parameter can be
/// overridden per combination by a dimension of the same name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub base_dir: PathBuf,
    pub node: Option<NodeConfig>,
    pub run_handler: String,
    pub build_handler: Option<String>,
    pub clean_handler: Option<String>,
    pub rebuild: bool,
    pub cleanup: bool,
    /// CPU affinity list, passed as the first positional argument.
    pub cpus: String,

    pub threads: u64,
    pub switches_per_thread: u64,
    pub thread_creation_delay_ms: u64,
    pub delay_before_traffic_ms: u64,
    pub ms_per_test: u64,
    pub internal_repeats: u64,
    pub simulated_hosts: u64,
    pub warmup: u64,
    pub mode: String,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("generator"),
            node: None,
            run_handler: "run_handler.sh".to_string(),
            build_handler: None,
            clean_handler: None,
            rebuild: false,
            cleanup: false,
            cpus: "0".to_string(),
            threads: 1,
            switches_per_thread: 50,
            thread_creation_delay_ms: 500,
            delay_before_traffic_ms: 1000,
            ms_per_test: 10_000,
            internal_repeats: 10,
            simulated_hosts: 1000,
            warmup: 2,
            mode: "Latency".to_string(),
        }
    }
}

impl GeneratorConfig {
    pub fn handler_path(&self, handler: &str) -> PathBuf {
        self.base_dir.join(handler)
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Bound of the generator -> monitor channel.
    pub channel_capacity: usize,
    /// Longest silence tolerated between two generator messages.
    pub channel_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            channel_timeout_secs: 300,
        }
    }
}

impl MonitorConfig {
    pub fn channel_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

/// Where the watcher reads the discovered-entity count from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountSourceKind {
    /// Controller operational datastore over RESTCONF.
    Restconf,
    /// An executable printing the count on stdout.
    Handler,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub source: CountSourceKind,
    /// Absolute path, or relative to the controller base directory.
    pub count_handler: Option<String>,
    /// Time budget per expected entity.
    pub per_entity_ms: u64,
    /// Fixed offset added to every discovery deadline.
    pub startup_offset_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            source: CountSourceKind::Restconf,
            count_handler: None,
            per_entity_ms: 7000,
            startup_offset_ms: 0,
            poll_interval_ms: 1000,
        }
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Dimensions
// ---------------------------------------------------------------------------

/// One swept parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionConfig {
    pub name: String,
    pub values: Vec<DimensionValue>,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
