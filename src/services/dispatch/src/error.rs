//! Error handling for the dispatch service
//!
//! Every fallible operation in the crate returns [`DispatchError`]. Errors are
//! grouped the same way the queue and worker pool react to them: capacity and
//! empty-queue conditions are expected flow control, missing platforms are
//! configuration defects, and transport failures are eligible for retry.

use thiserror::Error;

/// Result type alias for dispatch service operations
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Main error type for the dispatch service
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Queue is at capacity
    #[error("Queue capacity exceeded: {capacity} items")]
    QueueFull { capacity: usize },

    /// No visible work item
    #[error("Queue is empty")]
    QueueEmpty,

    /// Queue has been closed
    #[error("Queue is closed")]
    QueueClosed,

    /// No creator registered for a platform
    #[error("Platform not registered: {platform}")]
    PlatformNotRegistered { platform: String },

    /// Creator registered but no configuration present
    #[error("Platform not configured: {platform}")]
    PlatformNotConfigured { platform: String },

    /// Sender reported an outright failure
    #[error("Platform error: {platform}: {message}")]
    Platform { platform: String, message: String },

    /// Several platforms errored during one dispatch, each with its own error
    #[error("Dispatch failed on platforms: {}", platform_names(.failures))]
    PlatformFailures {
        failures: Vec<(String, DispatchError)>,
    },

    /// Component started twice
    #[error("{component} is already running")]
    AlreadyRunning { component: String },

    /// Component stopped while not running
    #[error("{component} is not running")]
    NotRunning { component: String },

    /// Worker count outside configured bounds
    #[error("Worker count {requested} out of range [{min}, {max}]")]
    ScaleOutOfRange {
        requested: usize,
        min: usize,
        max: usize,
    },

    /// Rate limiting errors
    #[error("Rate limit exceeded: {message}")]
    RateLimit { message: String },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Cancellation requested by the caller
    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    /// Network/connection errors
    #[error("Network error: {message}")]
    Network { message: String },

    /// Service unavailable errors
    #[error("Service unavailable: {service}")]
    ServiceUnavailable { service: String },

    /// Authentication/authorization errors
    #[error("Authentication error: {message}")]
    Auth { message: String },

    /// Validation errors
    #[error("Validation error: {field}: {message}")]
    Validation { field: String, message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Receipt or queue storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Not found errors
    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal service errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DispatchError {
    /// Get the error code for logs and receipts
    pub fn error_code(&self) -> &'static str {
        match self {
            DispatchError::QueueFull { .. } => "QUEUE_FULL",
            DispatchError::QueueEmpty => "QUEUE_EMPTY",
            DispatchError::QueueClosed => "QUEUE_CLOSED",
            DispatchError::PlatformNotRegistered { .. } => "PLATFORM_NOT_REGISTERED",
            DispatchError::PlatformNotConfigured { .. } => "PLATFORM_NOT_CONFIGURED",
            DispatchError::Platform { .. } => "PLATFORM_ERROR",
            DispatchError::PlatformFailures { .. } => "PLATFORM_FAILURES",
            DispatchError::AlreadyRunning { .. } => "ALREADY_RUNNING",
            DispatchError::NotRunning { .. } => "NOT_RUNNING",
            DispatchError::ScaleOutOfRange { .. } => "SCALE_OUT_OF_RANGE",
            DispatchError::RateLimit { .. } => "RATE_LIMIT_EXCEEDED",
            DispatchError::Timeout { .. } => "TIMEOUT",
            DispatchError::Cancelled { .. } => "CANCELLED",
            DispatchError::Network { .. } => "NETWORK_ERROR",
            DispatchError::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            DispatchError::Auth { .. } => "AUTH_ERROR",
            DispatchError::Validation { .. } => "VALIDATION_ERROR",
            DispatchError::Config { .. } => "CONFIG_ERROR",
            DispatchError::Storage { .. } => "STORAGE_ERROR",
            DispatchError::NotFound { .. } => "NOT_FOUND",
            DispatchError::Serialization(_) => "SERIALIZATION_ERROR",
            DispatchError::Io(_) => "IO_ERROR",
            DispatchError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::QueueFull { .. } => true,
            DispatchError::QueueEmpty => false,
            DispatchError::QueueClosed => false,
            DispatchError::PlatformNotRegistered { .. } => false,
            DispatchError::PlatformNotConfigured { .. } => false,
            DispatchError::Platform { .. } => true,
            DispatchError::PlatformFailures { failures } => {
                failures.iter().any(|(_, e)| e.is_retryable())
            }
            DispatchError::AlreadyRunning { .. } => false,
            DispatchError::NotRunning { .. } => false,
            DispatchError::ScaleOutOfRange { .. } => false,
            DispatchError::RateLimit { .. } => true,
            DispatchError::Timeout { .. } => true,
            DispatchError::Cancelled { .. } => false,
            DispatchError::Network { .. } => true,
            DispatchError::ServiceUnavailable { .. } => true,
            DispatchError::Auth { .. } => false,
            DispatchError::Validation { .. } => false,
            DispatchError::Config { .. } => false,
            DispatchError::Storage { .. } => true,
            DispatchError::NotFound { .. } => false,
            DispatchError::Serialization(_) => false,
            DispatchError::Io(_) => true,
            DispatchError::Internal { .. } => true,
        }
    }

    /// Whether the error signals a missing or unconfigured platform
    pub fn is_configuration_defect(&self) -> bool {
        match self {
            DispatchError::PlatformNotRegistered { .. }
            | DispatchError::PlatformNotConfigured { .. }
            | DispatchError::Config { .. } => true,
            DispatchError::PlatformFailures { failures } => {
                !failures.is_empty() && failures.iter().all(|(_, e)| e.is_configuration_defect())
            }
            _ => false,
        }
    }

    /// Platforms named by this error, in dispatch order
    pub fn failed_platforms(&self) -> Vec<&str> {
        match self {
            DispatchError::PlatformNotRegistered { platform }
            | DispatchError::PlatformNotConfigured { platform }
            | DispatchError::Platform { platform, .. } => vec![platform.as_str()],
            DispatchError::PlatformFailures { failures } => {
                failures.iter().map(|(p, _)| p.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

fn platform_names(failures: &[(String, DispatchError)]) -> String {
    failures
        .iter()
        .map(|(platform, _)| platform.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

// Helper functions for creating specific error types
impl DispatchError {
    pub fn platform_not_registered<S: Into<String>>(platform: S) -> Self {
        Self::PlatformNotRegistered {
            platform: platform.into(),
        }
    }

    pub fn platform_not_configured<S: Into<String>>(platform: S) -> Self {
        Self::PlatformNotConfigured {
            platform: platform.into(),
        }
    }

    pub fn platform<P: Into<String>, M: Into<String>>(platform: P, message: M) -> Self {
        Self::Platform {
            platform: platform.into(),
            message: message.into(),
        }
    }

    pub fn already_running<S: Into<String>>(component: S) -> Self {
        Self::AlreadyRunning {
            component: component.into(),
        }
    }

    pub fn not_running<S: Into<String>>(component: S) -> Self {
        Self::NotRunning {
            component: component.into(),
        }
    }

    pub fn rate_limit<S: Into<String>>(message: S) -> Self {
        Self::RateLimit {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn service_unavailable<S: Into<String>>(service: S) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
        }
    }

    pub fn auth<S: Into<String>>(message: S) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    pub fn validation<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<redis::RedisError> for DispatchError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            DispatchError::timeout(format!("redis: {}", err))
        } else if err.is_connection_refusal() || err.is_io_error() {
            DispatchError::network(format!("redis: {}", err))
        } else {
            DispatchError::storage(format!("redis: {}", err))
        }
    }
}

impl From<deadpool_redis::PoolError> for DispatchError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        DispatchError::service_unavailable(format!("redis pool: {}", err))
    }
}

impl From<validator::ValidationErrors> for DispatchError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let field = errors
            .field_errors()
            .keys()
            .next()
            .map(|k| k.to_string())
            .unwrap_or_else(|| "message".to_string());
        DispatchError::validation(field, errors.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            DispatchError::QueueFull { capacity: 10 }.error_code(),
            "QUEUE_FULL"
        );
        assert_eq!(DispatchError::QueueEmpty.error_code(), "QUEUE_EMPTY");
        assert_eq!(
            DispatchError::platform_not_registered("slack").error_code(),
            "PLATFORM_NOT_REGISTERED"
        );
    }

    #[test]
    fn test_retry_classification() {
        assert!(DispatchError::network("connection reset").is_retryable());
        assert!(DispatchError::timeout("send").is_retryable());
        assert!(DispatchError::rate_limit("429").is_retryable());
        assert!(DispatchError::service_unavailable("sms").is_retryable());

        assert!(!DispatchError::validation("target", "empty").is_retryable());
        assert!(!DispatchError::config("bad").is_retryable());
        assert!(!DispatchError::platform_not_configured("email").is_retryable());
        assert!(!DispatchError::QueueEmpty.is_retryable());
    }

    #[test]
    fn test_configuration_defects() {
        assert!(DispatchError::platform_not_registered("x").is_configuration_defect());
        assert!(DispatchError::platform_not_configured("x").is_configuration_defect());
        assert!(!DispatchError::network("x").is_configuration_defect());
    }

    #[test]
    fn test_error_display() {
        let err = DispatchError::ScaleOutOfRange {
            requested: 12,
            min: 1,
            max: 10,
        };
        assert_eq!(err.to_string(), "Worker count 12 out of range [1, 10]");

        let err = DispatchError::PlatformFailures {
            failures: vec![
                ("email".to_string(), DispatchError::network("reset")),
                ("sms".to_string(), DispatchError::platform_not_registered("sms")),
            ],
        };
        assert_eq!(err.to_string(), "Dispatch failed on platforms: email, sms");
        assert_eq!(err.failed_platforms(), vec!["email", "sms"]);
    }

    #[test]
    fn test_platform_failures_classified_by_members() {
        let defects = DispatchError::PlatformFailures {
            failures: vec![
                ("x".to_string(), DispatchError::platform_not_registered("x")),
                ("y".to_string(), DispatchError::platform_not_configured("y")),
            ],
        };
        assert!(!defects.is_retryable());
        assert!(defects.is_configuration_defect());

        let mixed = DispatchError::PlatformFailures {
            failures: vec![
                ("x".to_string(), DispatchError::platform_not_registered("x")),
                ("y".to_string(), DispatchError::timeout("send to y")),
            ],
        };
        assert!(mixed.is_retryable());
        assert!(!mixed.is_configuration_defect());

        let empty = DispatchError::PlatformFailures { failures: Vec::new() };
        assert!(!empty.is_retryable());
        assert!(!empty.is_configuration_defect());
    }
}
