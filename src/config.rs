//! Configuration for the virtbench binary
//!
//! Loaded and merged from several sources, later ones winning:
//! - Default values
//! - System configuration (/etc/virtbench/virtbench.toml)
//! - User configuration (~/.config/virtbench/virtbench.toml)
//! - Project configuration (./virtbench.toml)
//! - `$VIRTBENCH_CONFIG`, then `--config`
//! - Environment variables
//!
//! Command-line flags are applied on top by each command.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use virtbench::capacity::ProbeSettings;
use virtbench::poller::PollSettings;
use virtbench::retry::RetryPolicy;
use virtbench::telemetry::{LogLevel, LoggingConfig};
use virtbench::tracker::MigrationSettings;
use virtbench::workload::cleanup::DEFAULT_CLEANUP_CONCURRENCY;
use virtbench::workload::creation::DEFAULT_SCOPE_CONCURRENCY;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Polling and concurrency defaults shared by every workload
    pub defaults: Defaults,

    /// Control-plane call retries
    pub retry: RetryConfig,

    /// Capacity probe settings
    pub capacity: CapacityConfig,

    /// Live migration settings
    pub migration: MigrationConfig,

    /// Logging settings
    pub logging: LoggingConfig,

    /// Result files and console output
    pub output: OutputConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Upper bound for any single wait
    #[serde(with = "humantime_serde")]
    pub global_timeout: Duration,

    /// Worker count for every workload; each workload has its own default
    /// when unset
    pub concurrency: Option<usize>,

    /// Namespaces created in parallel
    pub scope_concurrency: usize,

    /// Namespaces deleted in parallel
    pub cleanup_concurrency: usize,
}

impl Default for Defaults {
    fn default() -> Self {
        let poll = PollSettings::default();
        Self {
            poll_interval: poll.poll_interval,
            global_timeout: poll.global_timeout,
            concurrency: None,
            scope_concurrency: DEFAULT_SCOPE_CONCURRENCY,
            cleanup_concurrency: DEFAULT_CLEANUP_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,

    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    pub multiplier: f64,

    /// Appended to the built-in retryable error patterns
    pub extra_patterns: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts(),
            initial_delay: policy.initial_delay(),
            multiplier: policy.backoff_multiplier(),
            extra_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityConfig {
    /// Time a VM may sit in `Scheduling` before the cluster counts as full
    #[serde(with = "humantime_serde")]
    pub exhaustion_timeout: Duration,

    /// 0 runs until a stop condition
    pub max_iterations: u32,

    /// Pause between iterations
    #[serde(with = "humantime_serde")]
    pub pause: Duration,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            exhaustion_timeout: PollSettings::default().exhaustion_timeout,
            max_iterations: 0,
            pause: ProbeSettings::default().pause,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    pub max_operation_attempts: u32,

    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        let settings = MigrationSettings::default();
        Self {
            timeout: settings.timeout,
            max_operation_attempts: settings.max_operation_attempts,
            retry_delay: settings.retry_delay,
            poll_interval: settings.poll_interval,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Root of `{workload}/{timestamp}/` result directories
    pub results_dir: PathBuf,

    pub color: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("results"),
            color: true,
        }
    }
}

impl Config {
    /// Load configuration from all sources
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut merged = serde_json::to_value(Config::default()).context("Failed to encode default config")?;

        for path in Self::get_config_paths(config_path) {
            if path.exists() {
                let layer = Self::read_layer(&path)?;
                merge_values(&mut merged, layer);
            } else if config_path == Some(&path) {
                anyhow::bail!("Config file not found: {}", path.display());
            }
        }

        let mut config: Config = serde_json::from_value(merged).context("Invalid configuration")?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Configuration file paths in merge order
    fn get_config_paths(explicit_path: Option<&PathBuf>) -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/virtbench/virtbench.toml")];

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("virtbench").join("virtbench.toml"));
        }

        paths.push(PathBuf::from("virtbench.toml"));

        if let Ok(env_config) = std::env::var("VIRTBENCH_CONFIG") {
            paths.push(PathBuf::from(env_config));
        }

        if let Some(path) = explicit_path {
            if !paths.contains(path) {
                paths.push(path.clone());
            }
        }

        paths
    }

    /// Parse one file into an untyped tree so partial files merge field by
    /// field.
    fn read_layer(path: &Path) -> Result<Value> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let value = match extension {
            "yml" | "yaml" => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?,
            "json" => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?,
            _ => toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display()))?,
        };

        Ok(value)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        // VIRTBENCH_POLL_INTERVAL
        if let Ok(interval) = std::env::var("VIRTBENCH_POLL_INTERVAL") {
            self.defaults.poll_interval = humantime::parse_duration(&interval)
                .with_context(|| format!("Invalid VIRTBENCH_POLL_INTERVAL '{}'", interval))?;
        }

        // VIRTBENCH_CONCURRENCY
        if let Ok(concurrency) = std::env::var("VIRTBENCH_CONCURRENCY") {
            let n: usize = concurrency
                .parse()
                .with_context(|| format!("Invalid VIRTBENCH_CONCURRENCY '{}'", concurrency))?;
            self.defaults.concurrency = Some(n);
        }

        // VIRTBENCH_RESULTS_DIR
        if let Ok(dir) = std::env::var("VIRTBENCH_RESULTS_DIR") {
            self.output.results_dir = PathBuf::from(dir);
        }

        // VIRTBENCH_LOG_LEVEL
        if let Ok(level) = std::env::var("VIRTBENCH_LOG_LEVEL") {
            self.logging.level = level.parse::<LogLevel>()?;
        }

        // NO_COLOR
        if std::env::var("NO_COLOR").is_ok() {
            self.output.color = false;
            self.logging.ansi_colors = false;
        }

        Ok(())
    }

    /// Poll timing for VM, volume and snapshot waits
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            poll_interval: self.defaults.poll_interval,
            global_timeout: self.defaults.global_timeout,
            exhaustion_timeout: self.capacity.exhaustion_timeout,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let mut builder = RetryPolicy::builder()
            .max_attempts(self.retry.max_attempts)
            .initial_delay(self.retry.initial_delay)
            .backoff_multiplier(self.retry.multiplier);
        for pattern in &self.retry.extra_patterns {
            builder = builder.add_retryable_pattern(pattern);
        }
        builder.build()
    }

    pub fn migration_settings(&self) -> MigrationSettings {
        MigrationSettings {
            poll_interval: self.migration.poll_interval,
            timeout: self.migration.timeout,
            max_operation_attempts: self.migration.max_operation_attempts,
            retry_delay: self.migration.retry_delay,
        }
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            max_iterations: (self.capacity.max_iterations > 0).then_some(self.capacity.max_iterations),
            pause: self.capacity.pause,
        }
    }

    /// Worker count for a workload whose own default is `fallback`
    pub fn concurrency_or(&self, fallback: usize) -> usize {
        self.defaults.concurrency.unwrap_or(fallback)
    }

    /// Load from a single file on top of the defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut merged = serde_json::to_value(Config::default())?;
        merge_values(&mut merged, Self::read_layer(path.as_ref())?);
        serde_json::from_value(merged).context("Invalid configuration")
    }
}

/// Recursively merge `overlay` into `base`. Tables merge key by key; any
/// other value replaces what was there.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
