//! Process configuration, loaded once at startup and injected into the services.

use std::time::Duration;

use crmflow_core::DEFAULT_BATCH_SIZE;

use crate::jobs::{DEFAULT_CLAIM_LEASE, RetryPolicy};

/// Path appended to the worker base URL.
pub const WORKER_PATH: &str = "/pipeline-worker";

/// How one tick fans out over the worker groups.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// One group at a time, in tick order.
    #[default]
    Sequential,
    /// All groups at once; results are still reported per group.
    Concurrent,
}

impl std::str::FromStr for DispatchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(DispatchMode::Sequential),
            "concurrent" => Ok(DispatchMode::Concurrent),
            other => Err(ConfigError::Invalid {
                key: "PIPELINE_DISPATCH_MODE",
                message: format!("expected 'sequential' or 'concurrent', got '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Pipeline service configuration.
///
/// | Env var                        | Default      |
/// |--------------------------------|--------------|
/// | `HOST`                         | `0.0.0.0`    |
/// | `PORT`                         | `8080`       |
/// | `DATABASE_URL`                 | in-memory    |
/// | `PIPELINE_WORKER_URL`          | in-process   |
/// | `PIPELINE_SERVICE_KEY`         | none         |
/// | `PIPELINE_BATCH_SIZE`          | `20`         |
/// | `PIPELINE_DISPATCH_MODE`       | `sequential` |
/// | `PIPELINE_WORKER_TIMEOUT_SECS` | `120`        |
/// | `PIPELINE_MAX_ATTEMPTS`        | `3`          |
/// | `PIPELINE_RETRY_BASE_MS`       | `2000`       |
/// | `PIPELINE_DEFER_SECS`          | `30`         |
/// | `PIPELINE_CLAIM_LEASE_SECS`    | `600`        |
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub host: String,
    pub port: u16,
    /// Postgres connection string; `None` selects the in-memory stores.
    pub database_url: Option<String>,
    /// Base URL of the worker; `None` dispatches to the in-process worker.
    pub worker_url: Option<String>,
    /// Bearer credential sent to, and required by, the worker endpoint.
    pub service_key: Option<String>,
    pub batch_size: u32,
    pub dispatch_mode: DispatchMode,
    pub worker_timeout: Duration,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    /// How long a job whose upstream record is missing waits before it is claimable again.
    pub defer_delay: Duration,
    /// How long a claimed job may stay `processing` before another batch may reclaim it.
    pub claim_lease: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            database_url: None,
            worker_url: None,
            service_key: None,
            batch_size: DEFAULT_BATCH_SIZE,
            dispatch_mode: DispatchMode::Sequential,
            worker_timeout: Duration::from_secs(120),
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(2000),
            defer_delay: Duration::from_secs(30),
            claim_lease: DEFAULT_CLAIM_LEASE,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let batch_size = parse_or(&get, "PIPELINE_BATCH_SIZE", defaults.batch_size)?;
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "PIPELINE_BATCH_SIZE",
                message: "must be greater than zero".to_string(),
            });
        }

        let dispatch_mode = match get("PIPELINE_DISPATCH_MODE") {
            Some(v) => v.parse()?,
            None => defaults.dispatch_mode,
        };

        let claim_lease = Duration::from_secs(parse_or(
            &get,
            "PIPELINE_CLAIM_LEASE_SECS",
            defaults.claim_lease.as_secs(),
        )?);
        if claim_lease.is_zero() {
            return Err(ConfigError::Invalid {
                key: "PIPELINE_CLAIM_LEASE_SECS",
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            host: get("HOST").unwrap_or(defaults.host),
            port: parse_or(&get, "PORT", defaults.port)?,
            database_url: get("DATABASE_URL"),
            worker_url: get("PIPELINE_WORKER_URL"),
            service_key: get("PIPELINE_SERVICE_KEY"),
            batch_size,
            dispatch_mode,
            worker_timeout: Duration::from_secs(parse_or(
                &get,
                "PIPELINE_WORKER_TIMEOUT_SECS",
                defaults.worker_timeout.as_secs(),
            )?),
            max_attempts: parse_or(&get, "PIPELINE_MAX_ATTEMPTS", defaults.max_attempts)?,
            retry_base_delay: Duration::from_millis(parse_or(
                &get,
                "PIPELINE_RETRY_BASE_MS",
                defaults.retry_base_delay.as_millis() as u64,
            )?),
            defer_delay: Duration::from_secs(parse_or(
                &get,
                "PIPELINE_DEFER_SECS",
                defaults.defer_delay.as_secs(),
            )?),
            claim_lease,
        })
    }

    /// Full URL of the worker endpoint, when an external worker is configured.
    pub fn worker_endpoint(&self) -> Option<String> {
        self.worker_url
            .as_deref()
            .map(|base| format!("{}{}", base.trim_end_matches('/'), WORKER_PATH))
    }

    /// Retry policy applied by the worker to failed jobs.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_attempts,
            self.retry_base_delay,
            self.retry_base_delay.saturating_mul(32),
        )
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            message: format!("'{raw}': {e}"),
        }),
        None => Ok(default),
    }
}
