//! Queue engine configuration.

use crate::validation;
use config::{Config, ConfigError, Environment, File};
use keel_core::{KeelError, KeelResult, RetryPolicy, TelemetryConfig};
use keel_store::StoreConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Configuration for one queue engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Stable queue name, used as the `queue` label on metrics.
    #[serde(default = "default_name")]
    pub name: String,

    /// Maximum number of jobs dispatched at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Polling interval in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How long a handler may take to report, in seconds.
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_secs: u64,

    /// How long `shutdown` waits for in-flight jobs, in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Buffered events per subscriber before a slow subscriber lags.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Retry defaults for jobs that don't override them.
    #[serde(default)]
    pub retry: RetryDefaults,

    /// Backing store.
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval(),
            handler_timeout_secs: default_handler_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            event_capacity: default_event_capacity(),
            retry: RetryDefaults::default(),
            store: StoreConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

fn default_name() -> String {
    "default".to_string()
}

fn default_concurrency() -> usize {
    1
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_handler_timeout() -> u64 {
    300
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_event_capacity() -> usize {
    256
}

impl QueueConfig {
    /// Returns the poll interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the handler timeout as Duration.
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    /// Returns the shutdown timeout as Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Policy applied to jobs without overrides.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.retry.max_attempts, self.retry.retry_interval())
    }

    /// Checks the configuration, reporting every problem at once.
    pub fn validate(&self) -> KeelResult<()> {
        validation::validate(self).map_err(validation::into_keel_error)
    }

    /// Loads configuration from layered sources.
    ///
    /// Sources, later ones overriding earlier ones:
    /// 1. `{dir}/default.toml`
    /// 2. `{dir}/{KEEL_ENVIRONMENT}.toml` (`development` when unset)
    /// 3. `{dir}/local.toml`
    /// 4. Environment variables such as `KEEL__CONCURRENCY` or `KEEL__STORE__PATH`
    ///
    /// A `.env` file in the working directory is loaded first. Missing
    /// files are skipped. The result is validated before it is returned.
    pub fn load(dir: impl AsRef<Path>) -> KeelResult<Self> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file loaded: {}", e);
        }

        let dir = dir.as_ref();
        let environment =
            std::env::var("KEEL_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
        info!(dir = %dir.display(), environment = %environment, "Loading queue configuration");

        let mut builder = Config::builder();
        for name in ["default", environment.as_str(), "local"] {
            let path = dir.join(format!("{name}.toml"));
            if path.exists() {
                debug!(path = %path.display(), "Adding config file");
                builder =
                    builder.add_source(File::with_name(&path.to_string_lossy()).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("KEEL")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder
            .build()
            .and_then(Config::try_deserialize)
            .map_err(config_error_to_keel_error)?;

        config.validate()?;
        Ok(config)
    }
}

fn config_error_to_keel_error(err: ConfigError) -> KeelError {
    KeelError::Configuration(err.to_string())
}

/// Retry defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryDefaults {
    /// Attempts before a job is dropped (0 = unlimited).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before a failed job is eligible again, in milliseconds.
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_interval_ms: default_retry_interval(),
        }
    }
}

fn default_max_attempts() -> u32 {
    keel_core::DEFAULT_MAX_ATTEMPTS
}

fn default_retry_interval() -> u64 {
    u64::try_from(keel_core::DEFAULT_RETRY_INTERVAL.as_millis()).unwrap_or(u64::MAX)
}

impl RetryDefaults {
    /// Returns the retry interval as Duration.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}
