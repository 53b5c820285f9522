//! Declarative stream configuration.
//!
//! ```json
//! {
//!   "inputs": [{ "type": "generate", "config": { "payload": "hello", "count": 10 } }],
//!   "pipeline": { "threads": 2, "processors": [{ "type": "split" }] },
//!   "outputs": [{ "type": "stdout" }],
//!   "delivery": { "max_in_flight": 4 }
//! }
//! ```

mod create;

pub use create::{create_config, render};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
pub use crate::registry::ComponentConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamConfig {
    pub inputs: Vec<ComponentConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer: Option<ComponentConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    pub outputs: Vec<ComponentConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cache_resources: Vec<ComponentConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rate_limit_resources: Vec<ComponentConfig>,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub logger: LoggerConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            inputs: vec![ComponentConfig::new("stdin")],
            buffer: None,
            pipeline: PipelineConfig::default(),
            outputs: vec![ComponentConfig::new("stdout")],
            cache_resources: Vec::new(),
            rate_limit_resources: Vec::new(),
            delivery: DeliveryConfig::default(),
            logger: LoggerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Transform workers; defaults to `delivery.max_in_flight`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,
    #[serde(default)]
    pub processors: Vec<ComponentConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DeliveryConfig {
    /// Capacity of every stage boundary.
    pub max_in_flight: usize,
    /// Grace period for draining before in-flight work is failed.
    pub shutdown_timeout_ms: u64,
    /// Pause after a transient source read error.
    pub read_backoff_ms: u64,
    pub retry: RetryConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            shutdown_timeout_ms: 20_000,
            read_backoff_ms: 1_000,
            retry: RetryConfig::default(),
        }
    }
}

impl DeliveryConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn read_backoff(&self) -> Duration {
        Duration::from_millis(self.read_backoff_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryConfig {
    pub backoff: BackoffKind,
    pub base_ms: u64,
    pub max_ms: u64,
    /// Total write attempts per batch, including the first.
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffKind::Exponential,
            base_ms: 100,
            max_ms: 10_000,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggerConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl StreamConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: StreamConfig = serde_json::from_str(raw)?;
        config.check()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Worker count for the transform pool.
    pub fn threads(&self) -> usize {
        self.pipeline
            .threads
            .unwrap_or(self.delivery.max_in_flight)
            .max(1)
    }

    /// Structural checks that do not need the registry.
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.inputs.is_empty() {
            return Err(ConfigError::Invalid("at least one input is required".into()));
        }
        if self.outputs.is_empty() {
            return Err(ConfigError::Invalid("at least one output is required".into()));
        }
        if self.delivery.max_in_flight == 0 {
            return Err(ConfigError::Invalid(
                "delivery.max_in_flight must be at least 1".into(),
            ));
        }
        if self.pipeline.threads == Some(0) {
            return Err(ConfigError::Invalid("pipeline.threads must be at least 1".into()));
        }
        if self.delivery.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "delivery.retry.max_attempts must be at least 1".into(),
            ));
        }

        let mut labels = std::collections::HashSet::new();
        for resource in self.cache_resources.iter().chain(&self.rate_limit_resources) {
            if resource.label.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "{} resource is missing a label",
                    resource.type_name
                )));
            }
        }
        for (kind, resources) in [("cache", &self.cache_resources), ("rate_limit", &self.rate_limit_resources)] {
            labels.clear();
            for resource in resources {
                let label = resource.display_name();
                if !labels.insert(label) {
                    return Err(ConfigError::Invalid(format!(
                        "{kind} resource label '{label}' is declared more than once"
                    )));
                }
            }
        }
        Ok(())
    }
}
