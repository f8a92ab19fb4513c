//! Structured logging setup using the tracing crate.
//!
//! Supports pretty, compact and JSON output on stderr or to a log file.
//! `RUST_LOG` takes precedence over the configured level when it is set.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::error::{Error, Result};

/// Log level filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    #[default]
    Warn,
    Error,
}

impl LogLevel {
    /// Convert from CLI verbosity (number of `-v` flags).
    pub fn from_verbosity(verbosity: u8) -> Self {
        match verbosity {
            0 => LogLevel::Warn,
            1 => LogLevel::Info,
            2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(Error::InvalidConfig {
                key: "logging.level".into(),
                message: format!("unknown log level '{}'", other),
            }),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human output
    Pretty,
    /// Single-line output
    #[default]
    Compact,
    /// JSON lines
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Include the event target (module path)
    pub with_target: bool,
    /// Colored output; ignored when writing to a file
    pub ansi_colors: bool,
    /// Append logs to this file instead of stderr
    pub file: Option<PathBuf>,
    /// Extra `EnvFilter` directives, e.g. `kube=warn`
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Warn,
            format: LogFormat::Compact,
            with_target: false,
            ansi_colors: true,
            file: None,
            filter: None,
        }
    }
}

/// Builder for the global tracing subscriber.
pub struct LoggingBuilder {
    config: LoggingConfig,
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self {
            config: LoggingConfig::default(),
        }
    }

    pub fn from_config(config: LoggingConfig) -> Self {
        Self { config }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.config.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.config.ansi_colors = enabled;
        self
    }

    pub fn with_target(mut self, enabled: bool) -> Self {
        self.config.with_target = enabled;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.config.filter = Some(filter.into());
        self
    }

    pub fn with_file_output(mut self, path: impl AsRef<Path>) -> Self {
        self.config.file = Some(path.as_ref().to_path_buf());
        self
    }

    /// The configuration this builder will apply.
    pub fn config(&self) -> &LoggingConfig {
        &self.config
    }

    /// Install the global subscriber.
    pub fn init(self) -> Result<()> {
        let layer = self.build_layer()?;
        tracing_subscriber::registry()
            .with(layer)
            .try_init()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Build the formatting layer without installing it.
    pub fn build_layer(&self) -> Result<Box<dyn Layer<Registry> + Send + Sync + 'static>> {
        let (writer, ansi) = match &self.config.file {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                (BoxMakeWriter::new(Arc::new(file)), false)
            }
            None => (BoxMakeWriter::new(std::io::stderr), self.config.ansi_colors),
        };
        let filter = self.build_filter();
        let with_target = self.config.with_target;

        let layer = match self.config.format {
            LogFormat::Pretty => tracing_subscriber::fmt::layer()
                .pretty()
                .with_ansi(ansi)
                .with_target(with_target)
                .with_writer(writer)
                .with_filter(filter)
                .boxed(),
            LogFormat::Compact => tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(ansi)
                .with_target(with_target)
                .with_writer(writer)
                .with_filter(filter)
                .boxed(),
            LogFormat::Json => tracing_subscriber::fmt::layer()
                .json()
                .with_target(with_target)
                .with_writer(writer)
                .with_filter(filter)
                .boxed(),
        };
        Ok(layer)
    }

    fn build_filter(&self) -> EnvFilter {
        let mut directives = self.config.level.as_str().to_string();
        if let Some(extra) = &self.config.filter {
            directives.push(',');
            directives.push_str(extra);
        }
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&directives))
            .unwrap_or_else(|_| EnvFilter::new(self.config.level.as_str()))
    }
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_levels() {
        assert_eq!(LogLevel::from_verbosity(0), LogLevel::Warn);
        assert_eq!(LogLevel::from_verbosity(1), LogLevel::Info);
        assert_eq!(LogLevel::from_verbosity(2), LogLevel::Debug);
        assert_eq!(LogLevel::from_verbosity(7), LogLevel::Trace);
    }

    #[test]
    fn parse_level() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn builder_sets_fields() {
        let builder = LoggingBuilder::new()
            .with_level(LogLevel::Debug)
            .with_format(LogFormat::Json)
            .with_filter("kube=warn");
        assert_eq!(builder.config().level, LogLevel::Debug);
        assert_eq!(builder.config().format, LogFormat::Json);
        assert_eq!(builder.config().filter.as_deref(), Some("kube=warn"));
    }

    #[test]
    fn file_layer_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.log");
        let builder = LoggingBuilder::new().with_file_output(&path);
        assert!(builder.build_layer().is_ok());
        assert!(path.exists());
    }
}
