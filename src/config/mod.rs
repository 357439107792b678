//! Typed configuration from environment variables or a TOML file.
//!
//! Every field has a default, so an empty environment yields a usable
//! config. Values that are present but unparsable fail fast.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::dispatcher::{
    DEFAULT_BATCH_SIZE, DEFAULT_COMPLETION_POLL, DEFAULT_IDLE_POLL, DispatcherOptions,
};
use crate::error::{Error, Result};
use crate::telemetry::TelemetryConfig;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Number of worker threads passed to `start`.
    pub workers: usize,
    pub batch_size: usize,
    /// Idle worker re-check interval, in milliseconds.
    pub idle_poll_ms: u64,
    /// `wait_for_completion` re-check interval, in milliseconds.
    pub completion_poll_ms: u64,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: DEFAULT_BATCH_SIZE,
            idle_poll_ms: DEFAULT_IDLE_POLL.as_millis() as u64,
            completion_poll_ms: DEFAULT_COMPLETION_POLL.as_millis() as u64,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            workers: parsed_var("DISPATCH_WORKERS")?.unwrap_or(defaults.workers),
            batch_size: parsed_var("DISPATCH_BATCH_SIZE")?.unwrap_or(defaults.batch_size),
            idle_poll_ms: parsed_var("DISPATCH_IDLE_POLL_MS")?.unwrap_or(defaults.idle_poll_ms),
            completion_poll_ms: parsed_var("DISPATCH_COMPLETION_POLL_MS")?
                .unwrap_or(defaults.completion_poll_ms),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| Error::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn dispatcher_options(&self) -> DispatcherOptions {
        DispatcherOptions {
            batch_size: self.batch_size,
            idle_poll: Duration::from_millis(self.idle_poll_ms),
            completion_poll: Duration::from_millis(self.completion_poll_ms),
        }
    }

    pub fn telemetry(&self, service_name: &str) -> TelemetryConfig {
        TelemetryConfig {
            endpoint: self.otel_endpoint.clone(),
            service_name: service_name.to_string(),
            log_level: self.log_level.clone(),
        }
    }
}

fn parsed_var<V>(name: &str) -> Result<Option<V>>
where
    V: std::str::FromStr,
    V::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("environment variable {name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
