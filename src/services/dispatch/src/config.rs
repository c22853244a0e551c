//! Configuration module for the dispatch service
//!
//! This module provides configuration structures and defaults for the queue,
//! retry policy, worker pool, receipt aggregation and per-platform settings.

use crate::error::{DispatchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Main configuration structure for the dispatch service
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DispatchConfig {
    /// Queue backend configuration
    pub queue: QueueConfig,

    /// Retry and dead-letter policy
    pub retry: RetryConfig,

    /// Worker pool sizing and autoscaling
    pub worker_pool: WorkerPoolConfig,

    /// Receipt aggregation and storage
    pub aggregator: AggregatorConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Platform configuration keyed by platform name
    #[serde(default)]
    pub platforms: HashMap<String, PlatformConfig>,
}

/// Queue backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    #[default]
    Memory,
    Redis,
}

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub kind: QueueKind,
    pub capacity: usize,
    pub dead_letter_enabled: bool,
    pub dead_letter_capacity: usize,
    pub redis: RedisQueueConfig,
}

/// Connection options for the Redis queue backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisQueueConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub pool_size: usize,
    pub key_prefix: String,
    pub connection_timeout_ms: u64,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
    pub max_elapsed_time_ms: Option<u64>,
    pub jitter: bool,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub autoscale_enabled: bool,
    pub autoscale_interval_ms: u64,
    /// Queue depth above which the pool grows
    pub scale_up_threshold: usize,
    /// Queue depth below which the pool shrinks
    pub scale_down_threshold: usize,
    pub scale_up_step: usize,
    pub scale_down_step: usize,
    /// Sleep after an empty dequeue
    pub poll_interval_ms: u64,
    /// Sleep after a queue error
    pub error_backoff_ms: u64,
    pub degraded_error_rate: f64,
    pub unhealthy_error_rate: f64,
    /// Number of recent outcomes used for the health error rate
    pub health_window: usize,
}

/// Receipt aggregation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Failure ratio at or above which a receipt is marked failed
    pub partial_failure_threshold: f64,
    /// Absolute number of failures still treated as completed
    pub failure_tolerance: usize,
    /// Maximum receipts kept in the in-memory index
    pub max_memory_receipts: usize,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceKind {
    #[default]
    None,
    Memory,
    File,
}

/// Fallback receipt persistence
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistenceConfig {
    pub kind: PersistenceKind,
    pub path: Option<String>,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub namespace: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// One of "json", "pretty", "compact"
    pub format: String,
}

/// Per-platform configuration, one variant per platform kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlatformConfig {
    Webhook(WebhookPlatformConfig),
    Email(EmailPlatformConfig),
    Sms(SmsPlatformConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPlatformConfig {
    pub url: String,
    #[serde(default = "default_platform_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailPlatformConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from_address: String,
    #[serde(default = "default_true")]
    pub use_tls: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmsPlatformConfig {
    pub provider: String,
    pub account_id: String,
    pub auth_token: String,
    pub from_number: String,
}

fn default_platform_timeout_ms() -> u64 {
    10_000
}

fn default_user_agent() -> String {
    format!("dispatch-service/{}", env!("CARGO_PKG_VERSION"))
}

fn default_true() -> bool {
    true
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            kind: QueueKind::Memory,
            capacity: 10_000,
            dead_letter_enabled: true,
            dead_letter_capacity: 10_000,
            redis: RedisQueueConfig::default(),
        }
    }
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            username: None,
            password: None,
            pool_size: 16,
            key_prefix: "dispatch".to_string(),
            connection_timeout_ms: 5_000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval_ms: 1_000,
            max_interval_ms: 60_000,
            multiplier: 2.0,
            max_elapsed_time_ms: None,
            jitter: false,
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 16,
            autoscale_enabled: true,
            autoscale_interval_ms: 5_000,
            scale_up_threshold: 100,
            scale_down_threshold: 10,
            scale_up_step: 2,
            scale_down_step: 1,
            poll_interval_ms: 100,
            error_backoff_ms: 1_000,
            degraded_error_rate: 0.1,
            unhealthy_error_rate: 0.5,
            health_window: 100,
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            partial_failure_threshold: 0.5,
            failure_tolerance: 0,
            max_memory_receipts: 10_000,
            persistence: PersistenceConfig::default(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "dispatch".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl RetryConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn max_elapsed_time(&self) -> Option<Duration> {
        self.max_elapsed_time_ms.map(Duration::from_millis)
    }
}

impl WorkerPoolConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn autoscale_interval(&self) -> Duration {
        Duration::from_millis(self.autoscale_interval_ms)
    }
}

impl PlatformConfig {
    /// Platform kind, used to pick a sender creator
    pub fn kind(&self) -> &'static str {
        match self {
            PlatformConfig::Webhook(_) => "webhook",
            PlatformConfig::Email(_) => "email",
            PlatformConfig::Sms(_) => "sms",
        }
    }

    /// Check required fields for the variant
    pub fn validate(&self, name: &str) -> Result<()> {
        let missing = |field: &str| {
            DispatchError::config(format!("platform '{}': {} is required", name, field))
        };

        match self {
            PlatformConfig::Webhook(cfg) => {
                if cfg.url.is_empty() {
                    return Err(missing("url"));
                }
                if !cfg.url.starts_with("http://") && !cfg.url.starts_with("https://") {
                    return Err(DispatchError::config(format!(
                        "platform '{}': url must be http(s), got '{}'",
                        name, cfg.url
                    )));
                }
                if cfg.timeout_ms == 0 {
                    return Err(missing("timeout_ms"));
                }
            }
            PlatformConfig::Email(cfg) => {
                if cfg.smtp_host.is_empty() {
                    return Err(missing("smtp_host"));
                }
                if cfg.smtp_port == 0 {
                    return Err(missing("smtp_port"));
                }
                if cfg.from_address.is_empty() {
                    return Err(missing("from_address"));
                }
            }
            PlatformConfig::Sms(cfg) => {
                if cfg.provider.is_empty() {
                    return Err(missing("provider"));
                }
                if cfg.account_id.is_empty() || cfg.auth_token.is_empty() {
                    return Err(missing("account_id and auth_token"));
                }
                if cfg.from_number.is_empty() {
                    return Err(missing("from_number"));
                }
            }
        }
        Ok(())
    }
}

impl DispatchConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn from_env() -> std::result::Result<Self, config::ConfigError> {
        let mut cfg = config::Config::builder();

        cfg = cfg.add_source(config::Config::try_from(&DispatchConfig::default())?);

        if let Ok(config_file) = std::env::var("DISPATCH_CONFIG_FILE") {
            cfg = cfg.add_source(config::File::with_name(&config_file).required(false));
        }

        cfg = cfg.add_source(
            config::Environment::with_prefix("DISPATCH")
                .separator("__")
                .try_parsing(true),
        );

        cfg.build()?.try_deserialize()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.queue.capacity == 0 {
            return Err(DispatchError::config("queue capacity must be greater than 0"));
        }
        if self.queue.dead_letter_enabled && self.queue.dead_letter_capacity == 0 {
            return Err(DispatchError::config(
                "dead letter capacity must be greater than 0 when dead lettering is enabled",
            ));
        }
        if self.queue.kind == QueueKind::Redis && self.queue.redis.url.is_empty() {
            return Err(DispatchError::config("redis url is required for the redis queue"));
        }

        if self.retry.multiplier < 1.0 {
            return Err(DispatchError::config("retry multiplier must be at least 1.0"));
        }
        if self.retry.initial_interval_ms > self.retry.max_interval_ms {
            return Err(DispatchError::config(
                "retry initial interval must not exceed the max interval",
            ));
        }

        let pool = &self.worker_pool;
        if pool.min_workers == 0 {
            return Err(DispatchError::config("min_workers must be at least 1"));
        }
        if pool.min_workers > pool.max_workers {
            return Err(DispatchError::config(format!(
                "min_workers ({}) exceeds max_workers ({})",
                pool.min_workers, pool.max_workers
            )));
        }
        if pool.scale_down_threshold > pool.scale_up_threshold {
            return Err(DispatchError::config(
                "scale_down_threshold must not exceed scale_up_threshold",
            ));
        }

        let threshold = self.aggregator.partial_failure_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(DispatchError::config(format!(
                "partial_failure_threshold must be within 0..=1, got {}",
                threshold
            )));
        }
        if self.aggregator.persistence.kind == PersistenceKind::File
            && self.aggregator.persistence.path.is_none()
        {
            return Err(DispatchError::config(
                "persistence path is required for file persistence",
            ));
        }

        for (name, platform) in &self.platforms {
            if name.is_empty() {
                return Err(DispatchError::config("platform name must not be empty"));
            }
            platform.validate(name)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn webhook(url: &str) -> PlatformConfig {
        PlatformConfig::Webhook(WebhookPlatformConfig {
            url: url.to_string(),
            timeout_ms: 1_000,
            headers: HashMap::new(),
            user_agent: "test".to_string(),
        })
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(DispatchConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_worker_bounds() {
        let mut config = DispatchConfig::default();
        config.worker_pool.min_workers = 8;
        config.worker_pool.max_workers = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_threshold() {
        let mut config = DispatchConfig::default();
        config.aggregator.partial_failure_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_platform_validation() {
        let mut config = DispatchConfig::default();
        config
            .platforms
            .insert("chat".to_string(), webhook("https://hooks.example.com/x"));
        assert!(config.validate().is_ok());

        config.platforms.insert("broken".to_string(), webhook(""));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_platform_config_tagged_serde() {
        let json = serde_json::json!({
            "kind": "sms",
            "provider": "twilio",
            "account_id": "AC1",
            "auth_token": "secret",
            "from_number": "+15550000000"
        });
        let parsed: PlatformConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.kind(), "sms");
        assert!(parsed.validate("sms").is_ok());

        let webhook: PlatformConfig = serde_json::from_value(serde_json::json!({
            "kind": "webhook",
            "url": "http://localhost:9000/hook"
        }))
        .unwrap();
        match webhook {
            PlatformConfig::Webhook(cfg) => assert_eq!(cfg.timeout_ms, 10_000),
            other => panic!("unexpected variant {:?}", other),
        }
    }

    #[test]
    fn test_retry_durations() {
        let retry = RetryConfig {
            max_elapsed_time_ms: Some(30_000),
            ..RetryConfig::default()
        };
        assert_eq!(retry.initial_interval(), Duration::from_secs(1));
        assert_eq!(retry.max_interval(), Duration::from_secs(60));
        assert_eq!(retry.max_elapsed_time(), Some(Duration::from_secs(30)));
    }
}
