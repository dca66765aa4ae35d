//! Runtime configuration
//!
//! # Configuration hierarchy
//!
//! ```text
//! Priority (high → low):
//! 1. Environment variables (CODELET_*)
//! 2. RON configuration file
//! 3. Default values
//! ```
//!
//! # Usage
//!
//! ```rust
//! use codelet_rt::util::config::RuntimeConfig;
//!
//! let mut config = RuntimeConfig::default();
//! config.machine.ncpus = 2;
//! assert!(config.validate().is_ok());
//! ```

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Full runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    /// Workers to start
    #[serde(default)]
    pub machine: MachineConfig,
    /// Node capacities
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Link characteristics
    #[serde(default)]
    pub bus: BusConfig,
    /// Policy selection and DMDA weights
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Worker loop behaviour
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Performance model calibration
    #[serde(default)]
    pub perfmodel: PerfModelConfig,
    /// Coherency engine tuning
    #[serde(default)]
    pub coherency: CoherencyConfig,
}

/// Machine description: how many workers of each architecture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// CPU workers, all attached to host RAM
    #[serde(default = "default_ncpus")]
    pub ncpus: usize,
    /// CUDA workers, one accelerator node each
    #[serde(default)]
    pub ncuda: usize,
    /// OpenCL workers, one accelerator node each
    #[serde(default)]
    pub nopencl: usize,
    /// Disk nodes (no worker attached)
    #[serde(default)]
    pub ndisk: usize,
}

fn default_ncpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ncpus: default_ncpus(),
            ncuda: 0,
            nopencl: 0,
            ndisk: 0,
        }
    }
}

/// Per-kind node capacities in bytes; `None` is unbounded.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MemoryConfig {
    #[serde(default)]
    pub host_capacity: Option<usize>,
    #[serde(default)]
    pub accelerator_capacity: Option<usize>,
    #[serde(default)]
    pub disk_capacity: Option<usize>,
}

/// Link characteristics used to fill the bus table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_accelerator_latency")]
    pub accelerator_latency_us: f64,
    /// Bytes per microsecond
    #[serde(default = "default_accelerator_bandwidth")]
    pub accelerator_bandwidth: f64,
    #[serde(default = "default_disk_latency")]
    pub disk_latency_us: f64,
    /// Bytes per microsecond
    #[serde(default = "default_disk_bandwidth")]
    pub disk_bandwidth: f64,
}

fn default_accelerator_latency() -> f64 {
    10.0
}

fn default_accelerator_bandwidth() -> f64 {
    8_000.0
}

fn default_disk_latency() -> f64 {
    1_000.0
}

fn default_disk_bandwidth() -> f64 {
    500.0
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            accelerator_latency_us: default_accelerator_latency(),
            accelerator_bandwidth: default_accelerator_bandwidth(),
            disk_latency_us: default_disk_latency(),
            disk_bandwidth: default_disk_bandwidth(),
        }
    }
}

/// Scheduling policy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// Central FIFO, first idle worker wins
    Eager,
    /// Central queue ordered by priority
    Prio,
    /// Model-driven, per-worker FIFOs
    #[default]
    Dmda,
    /// Model-driven, per-worker queues sorted by priority
    Dmdas,
}

impl PolicyKind {
    /// Every policy, in declaration order.
    pub const ALL: [PolicyKind; 4] = [PolicyKind::Eager, PolicyKind::Prio, PolicyKind::Dmda, PolicyKind::Dmdas];

    /// Policy name as accepted by `CODELET_SCHED`.
    pub fn name(&self) -> &'static str {
        match self {
            PolicyKind::Eager => "eager",
            PolicyKind::Prio => "prio",
            PolicyKind::Dmda => "dmda",
            PolicyKind::Dmdas => "dmdas",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PolicyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eager" | "greedy" => Ok(PolicyKind::Eager),
            "prio" => Ok(PolicyKind::Prio),
            "dmda" => Ok(PolicyKind::Dmda),
            "dmdas" => Ok(PolicyKind::Dmdas),
            other => Err(ConfigError::InvalidValue {
                key: "scheduler.policy".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub policy: PolicyKind,
    /// Weight of the predicted finish time
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Weight of the data transfer penalty
    #[serde(default = "default_beta")]
    pub beta: f64,
    /// Weight of the predicted energy
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    /// Prefetch read inputs to the chosen worker's node
    #[serde(default = "default_prefetch")]
    pub prefetch: bool,
}

fn default_alpha() -> f64 {
    1.0
}

fn default_beta() -> f64 {
    1.0
}

fn default_gamma() -> f64 {
    1000.0
}

fn default_prefetch() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::default(),
            alpha: default_alpha(),
            beta: default_beta(),
            gamma: default_gamma(),
            prefetch: default_prefetch(),
        }
    }
}

/// What an idle worker does while waiting for work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IdleMode {
    /// Sleep on the worker's condition variable
    #[default]
    Block,
    /// Spin with exponential backoff
    Spin,
}

/// Worker loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Jobs a worker may hold while their data is in flight
    #[serde(default = "default_pipeline_depth")]
    pub pipeline_depth: usize,
    #[serde(default)]
    pub idle: IdleMode,
    /// Upper bound on a single idle wait
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

fn default_pipeline_depth() -> usize {
    2
}

fn default_idle_timeout_ms() -> u64 {
    10
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pipeline_depth: default_pipeline_depth(),
            idle: IdleMode::default(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

/// Performance model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerfModelConfig {
    /// Measurements needed before a prediction is trusted
    #[serde(default = "default_calibration_min_samples")]
    pub calibration_min_samples: usize,
}

fn default_calibration_min_samples() -> usize {
    10
}

impl Default for PerfModelConfig {
    fn default() -> Self {
        Self {
            calibration_min_samples: default_calibration_min_samples(),
        }
    }
}

/// Coherency engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoherencyConfig {
    /// Eviction attempts before an allocation is reported as failed
    #[serde(default = "default_alloc_retries")]
    pub alloc_retries: usize,
    /// Times a job is pushed back after running out of memory before it is
    /// rejected
    #[serde(default = "default_oom_requeues")]
    pub oom_requeues: usize,
}

fn default_alloc_retries() -> usize {
    8
}

fn default_oom_requeues() -> usize {
    1024
}

impl Default for CoherencyConfig {
    fn default() -> Self {
        Self {
            alloc_retries: default_alloc_retries(),
            oom_requeues: default_oom_requeues(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load a RON file, then apply environment overrides.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::IoError)?;
        let mut config = Self::from_ron(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse a RON document.
    pub fn from_ron(content: &str) -> Result<Self, ConfigError> {
        let config: Self = ron::from_str(content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty RON.
    pub fn to_ron(&self) -> Result<String, ConfigError> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(ConfigError::SerializeError)
    }

    /// Apply `CODELET_*` overrides using `lookup` to read variables.
    pub fn apply_overrides<F>(
        &mut self,
        lookup: F,
    ) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn number(
            key: &str,
            value: String,
        ) -> Result<usize, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            })
        }

        if let Some(v) = lookup("CODELET_NCPU") {
            self.machine.ncpus = number("CODELET_NCPU", v)?;
        }
        if let Some(v) = lookup("CODELET_NCUDA") {
            self.machine.ncuda = number("CODELET_NCUDA", v)?;
        }
        if let Some(v) = lookup("CODELET_NOPENCL") {
            self.machine.nopencl = number("CODELET_NOPENCL", v)?;
        }
        if let Some(v) = lookup("CODELET_PIPELINE") {
            self.worker.pipeline_depth = number("CODELET_PIPELINE", v)?;
        }
        if let Some(v) = lookup("CODELET_CALIBRATE_MIN") {
            self.perfmodel.calibration_min_samples = number("CODELET_CALIBRATE_MIN", v)?;
        }
        if let Some(v) = lookup("CODELET_SCHED") {
            self.scheduler.policy = v.parse()?;
        }
        self.validate()
    }

    /// Reject configurations the runtime cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let workers = self.machine.ncpus + self.machine.ncuda + self.machine.nopencl;
        if workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "machine".to_string(),
                value: "no worker configured".to_string(),
            });
        }
        if self.worker.pipeline_depth == 0 {
            return Err(ConfigError::InvalidValue {
                key: "worker.pipeline_depth".to_string(),
                value: "0".to_string(),
            });
        }
        if self.bus.accelerator_bandwidth <= 0.0 || self.bus.disk_bandwidth <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "bus".to_string(),
                value: "bandwidth must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Total number of workers.
    pub fn num_workers(&self) -> usize {
        self.machine.ncpus + self.machine.ncuda + self.machine.nopencl
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(std::io::Error),
    #[error("Config parse error: {0}")]
    ParseError(ron::error::SpannedError),
    #[error("Config serialize error: {0}")]
    SerializeError(ron::Error),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}
