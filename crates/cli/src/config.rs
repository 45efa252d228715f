//! Configuration persistence for the benchmark CLI.
//!
//! Configuration is resolved with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (~/.config/lora-bench/config.toml or `--config`)
//! 3. Built-in sweep defaults (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use lora_bench_core::check::Precision;
use lora_bench_core::problem::OpType;
use lora_bench_core::sweep::SweepConfig;
use serde::{Deserialize, Serialize};

/// Persistent configuration stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Directory for the record document and plots.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,

    /// Hidden sizes to sweep.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hidden_sizes: Option<Vec<usize>>,

    /// Batch counts to sweep (0 runs as 1).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_counts: Option<Vec<usize>>,

    /// Shrink scale factors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scales: Option<Vec<f64>>,

    /// Data types (f16, bf16, f32).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtypes: Option<Vec<Precision>>,

    /// Operations (shrink, expand).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op_types: Option<Vec<OpType>>,

    /// RNG seeds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seeds: Option<Vec<u64>>,

    /// Devices (cpu, cuda:N).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub devices: Option<Vec<String>>,

    /// Number of adapters in the weight tensor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_count: Option<usize>,

    /// Adapter rank.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<usize>,

    /// Tokens per batch item.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq_len: Option<usize>,

    /// Hidden sizes that are never run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excluded_hidden_sizes: Option<Vec<usize>>,

    /// Data types that are never run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excluded_dtypes: Option<Vec<Precision>>,

    /// Launches recorded per captured unit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_size: Option<usize>,

    /// Timed replays per measurement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replays: Option<usize>,

    /// Render plots after the sweep.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plot: Option<bool>,

    /// Log level filter when `RUST_LOG` is unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl BenchConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("lora-bench").join("config.toml"))
    }

    /// Load configuration from the default path, or defaults if absent.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }

        let content = self.to_toml()?;
        fs::write(path, content).map_err(ConfigError::Io)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &BenchConfig) {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(
                    if other.$field.is_some() {
                        self.$field = other.$field.clone();
                    }
                )*
            };
        }
        take!(
            output_dir,
            hidden_sizes,
            batch_counts,
            scales,
            dtypes,
            op_types,
            seeds,
            devices,
            group_count,
            rank,
            seq_len,
            excluded_hidden_sizes,
            excluded_dtypes,
            capture_size,
            replays,
            plot,
            log_level,
        );
    }

    /// Resolve against the built-in defaults.
    pub fn sweep_config(&self) -> SweepConfig {
        let mut config = SweepConfig::default();
        macro_rules! apply {
            ($($field:ident),* $(,)?) => {
                $(
                    if let Some(value) = &self.$field {
                        config.$field = value.clone();
                    }
                )*
            };
        }
        apply!(
            hidden_sizes,
            batch_counts,
            scales,
            dtypes,
            op_types,
            seeds,
            devices,
            group_count,
            rank,
            seq_len,
            excluded_hidden_sizes,
            excluded_dtypes,
        );
        if let Some(capture_size) = self.capture_size {
            config.timing.capture_size = capture_size;
        }
        if let Some(replays) = self.replays {
            config.timing.replays = replays;
        }
        config
    }

    /// Fully populated config holding every value of `sweep`.
    pub fn from_sweep(sweep: &SweepConfig) -> Self {
        Self {
            hidden_sizes: Some(sweep.hidden_sizes.clone()),
            batch_counts: Some(sweep.batch_counts.clone()),
            scales: Some(sweep.scales.clone()),
            dtypes: Some(sweep.dtypes.clone()),
            op_types: Some(sweep.op_types.clone()),
            seeds: Some(sweep.seeds.clone()),
            devices: Some(sweep.devices.clone()),
            group_count: Some(sweep.group_count),
            rank: Some(sweep.rank),
            seq_len: Some(sweep.seq_len),
            excluded_hidden_sizes: Some(sweep.excluded_hidden_sizes.clone()),
            excluded_dtypes: Some(sweep.excluded_dtypes.clone()),
            capture_size: Some(sweep.timing.capture_size),
            replays: Some(sweep.timing.replays),
            ..Default::default()
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn plot_enabled(&self) -> bool {
        self.plot.unwrap_or(true)
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading/writing config file.
    Io(std::io::Error),
    /// Error parsing TOML.
    Parse(toml::de::Error),
    /// Error serializing to TOML.
    Serialize(toml::ser::Error),
    /// No config directory available.
    NoConfigDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
            ConfigError::NoConfigDir => write!(f, "No config directory available"),
        }
    }
}

impl std::error::Error for ConfigError {}
