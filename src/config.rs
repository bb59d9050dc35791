//! Gateway configuration
//!
//! `GatewayConfig` is assembled by the binary from CLI flags and environment
//! variables and checked once with [`GatewayConfig::validate`] before any
//! state is built.

use std::time::Duration;

use crate::queue::JobQueueConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Invalid value for field '{field}': {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible configuration: {reason}")]
    IncompatibleConfig { reason: String },

    #[error("Missing required field: {field}")]
    MissingRequired { field: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Base URL of the processing stage
    pub processing_url: String,
    /// Base URL of the inference stage
    pub inference_url: String,
    /// Redis connection URL; the in-memory store is used when absent
    pub redis_url: Option<String>,
    pub redis_pool_max: usize,
    pub stage_timeout_ms: u64,
    pub health_timeout_ms: u64,
    /// How long `/api/predict` waits before answering "still processing"
    pub poll_deadline_ms: u64,
    pub poll_interval_ms: u64,
    pub queue_capacity: usize,
    pub max_concurrent_jobs: usize,
    /// Requests allowed per client per window; 0 disables rate limiting
    pub rate_limit_max: u32,
    pub rate_limit_window_secs: u64,
    pub log_interval_secs: u64,
    pub log_level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            processing_url: "http://data-processor:3002".to_string(),
            inference_url: "http://inference-engine:3001".to_string(),
            redis_url: None,
            redis_pool_max: 16,
            stage_timeout_ms: 10_000,
            health_timeout_ms: 5_000,
            poll_deadline_ms: 15_000,
            poll_interval_ms: 500,
            queue_capacity: 1000,
            max_concurrent_jobs: 32,
            rate_limit_max: 10,
            rate_limit_window_secs: 60,
            log_interval_secs: 30,
            log_level: "info".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn poll_deadline(&self) -> Duration {
        Duration::from_millis(self.poll_deadline_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn job_queue_config(&self) -> JobQueueConfig {
        JobQueueConfig {
            queue_capacity: self.queue_capacity,
            max_concurrent_jobs: self.max_concurrent_jobs,
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        Self::require_url("processing_url", &self.processing_url)?;
        Self::require_url("inference_url", &self.inference_url)?;
        if let Some(url) = &self.redis_url {
            if url.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "redis_url".to_string(),
                    value: url.clone(),
                    reason: "must not be empty when set".to_string(),
                });
            }
        }

        for (field, value) in [
            ("stage_timeout_ms", self.stage_timeout_ms),
            ("health_timeout_ms", self.health_timeout_ms),
            ("poll_deadline_ms", self.poll_deadline_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("rate_limit_window_secs", self.rate_limit_window_secs),
            ("log_interval_secs", self.log_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: value.to_string(),
                    reason: "must be greater than 0".to_string(),
                });
            }
        }

        for (field, value) in [
            ("queue_capacity", self.queue_capacity),
            ("max_concurrent_jobs", self.max_concurrent_jobs),
            ("redis_pool_max", self.redis_pool_max),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: value.to_string(),
                    reason: "must be greater than 0".to_string(),
                });
            }
        }

        if self.poll_interval_ms > self.poll_deadline_ms {
            return Err(ConfigError::IncompatibleConfig {
                reason: format!(
                    "poll_interval_ms ({}) exceeds poll_deadline_ms ({})",
                    self.poll_interval_ms, self.poll_deadline_ms
                ),
            });
        }

        // A single stage call must be able to finish inside one client wait.
        if self.stage_timeout_ms > self.poll_deadline_ms {
            return Err(ConfigError::IncompatibleConfig {
                reason: format!(
                    "stage_timeout_ms ({}) exceeds poll_deadline_ms ({})",
                    self.stage_timeout_ms, self.poll_deadline_ms
                ),
            });
        }

        if self.log_level.parse::<log::LevelFilter>().is_err() {
            return Err(ConfigError::InvalidValue {
                field: "log_level".to_string(),
                value: self.log_level.clone(),
                reason: "expected one of off, error, warn, info, debug, trace".to_string(),
            });
        }

        Ok(())
    }

    fn require_url(field: &str, url: &str) -> ConfigResult<()> {
        if url.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: field.to_string(),
            });
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::ValidationFailed {
                reason: format!("{} must be an http(s) URL, got '{}'", field, url),
            });
        }
        Ok(())
    }
}
