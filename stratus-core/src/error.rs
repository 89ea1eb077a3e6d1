//! Error types for the stratus execution engine.
//!
//! Uses `thiserror` for public API error types. Every concrete error maps onto
//! one [`ErrorKind`], which is the taxonomy the pipeline reasons about when it
//! decides whether to retry, fail an entity, or refuse to start.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level error type for the stratus core library.
#[derive(Debug, thiserror::Error)]
pub enum StratusError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StratusError {
    /// The taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch(e) => e.kind(),
            Self::Storage(_) | Self::Io(_) => ErrorKind::Storage,
            Self::Transform(_) | Self::Serialization(_) => ErrorKind::Transform,
            Self::Config(_) | Self::Scheduler(_) => ErrorKind::Configuration,
        }
    }
}

/// Coarse error classification shared by logs, outcomes and run summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network failures, timeouts, rate limiting, upstream busy. Retryable.
    TransientIo,
    /// Malformed request, auth failure, missing resource, unusable response. Terminal.
    Request,
    /// Durable store rejected a read or write. Terminal for the step.
    Storage,
    /// Payload did not have the expected shape. Terminal for the entity.
    Transform,
    /// Startup configuration is missing or malformed. Fatal.
    Configuration,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::TransientIo => write!(f, "transient_io"),
            ErrorKind::Request => write!(f, "request"),
            ErrorKind::Storage => write!(f, "storage"),
            ErrorKind::Transform => write!(f, "transform"),
            ErrorKind::Configuration => write!(f, "configuration"),
        }
    }
}

/// Errors from a single upstream retrieval.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Upstream connection failed: {message}")]
    Connection { message: String },

    #[error("Rate limited by upstream, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Upstream unavailable (HTTP {status}): {message}")]
    ServerUnavailable { status: u16, message: String },

    #[error("Upstream rejected request (HTTP {status}): {message}")]
    BadRequest { status: u16, message: String },

    #[error("Authentication failed (HTTP {status})")]
    AuthFailed { status: u16 },

    #[error("Upstream resource not found: {message}")]
    NotFound { message: String },

    #[error("Unexpected upstream status HTTP {status}: {message}")]
    UnexpectedStatus { status: u16, message: String },

    #[error("Invalid upstream response: {message}")]
    InvalidResponse { message: String },
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Timeout { .. }
            | FetchError::Connection { .. }
            | FetchError::RateLimited { .. }
            | FetchError::ServerUnavailable { .. } => ErrorKind::TransientIo,
            FetchError::BadRequest { .. }
            | FetchError::AuthFailed { .. }
            | FetchError::NotFound { .. }
            | FetchError::UnexpectedStatus { .. }
            | FetchError::InvalidResponse { .. } => ErrorKind::Request,
        }
    }
}

/// Errors from the partitioned object store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("Failed to write {key}: {message}")]
    WriteFailed { key: String, message: String },

    #[error("Failed to read {key}: {message}")]
    ReadFailed { key: String, message: String },

    #[error("Invalid object key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },
}

/// Errors from normalizing a raw payload.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransformError {
    #[error("Payload is not valid JSON: {message}")]
    InvalidJson { message: String },

    #[error("Payload is missing expected field: {field}")]
    MissingField { field: String },

    #[error("Field '{field}' has unexpected shape: {message}")]
    UnexpectedShape { field: String, message: String },

    #[error("Column '{column}' has {actual} values but 'time' has {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },

    #[error("Configuration validation failed with {} error(s):\n{}", .problems.len(), format_problems(.problems))]
    Invalid { problems: Vec<String> },
}

fn format_problems(problems: &[String]) -> String {
    problems
        .iter()
        .map(|p| format!("  - {}", p))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Errors from the schedule controller.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Invalid cron expression '{expression}': {message}")]
    InvalidCronExpression { expression: String, message: String },

    #[error("Cron expression '{expression}' has no upcoming fire time")]
    NoUpcomingFire { expression: String },

    #[error("Invalid backfill range: {from} is after {to}")]
    InvalidRange { from: String, to: String },

    #[error("Schedule state persistence error: {message}")]
    PersistenceError { message: String },
}

/// A type alias for results using the top-level `StratusError`.
pub type Result<T> = std::result::Result<T, StratusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_kinds() {
        assert_eq!(
            FetchError::Timeout { timeout_secs: 30 }.kind(),
            ErrorKind::TransientIo
        );
        assert_eq!(
            FetchError::RateLimited {
                retry_after_secs: 5
            }
            .kind(),
            ErrorKind::TransientIo
        );
        assert_eq!(
            FetchError::ServerUnavailable {
                status: 503,
                message: "busy".into()
            }
            .kind(),
            ErrorKind::TransientIo
        );
        assert_eq!(FetchError::AuthFailed { status: 401 }.kind(), ErrorKind::Request);
        assert_eq!(
            FetchError::NotFound {
                message: "gone".into()
            }
            .kind(),
            ErrorKind::Request
        );
        assert_eq!(
            FetchError::InvalidResponse {
                message: "no hourly".into()
            }
            .kind(),
            ErrorKind::Request
        );
    }

    #[test]
    fn test_error_display_fetch() {
        let err = StratusError::Fetch(FetchError::Connection {
            message: "connection refused".into(),
        });
        assert_eq!(
            err.to_string(),
            "Fetch error: Upstream connection failed: connection refused"
        );
        assert_eq!(err.kind(), ErrorKind::TransientIo);
    }

    #[test]
    fn test_error_display_storage() {
        let err = StratusError::Storage(StorageError::NotFound {
            key: "raw/year=2024/month=01/day=15/london.json".into(),
        });
        assert_eq!(
            err.to_string(),
            "Storage error: Object not found: raw/year=2024/month=01/day=15/london.json"
        );
        assert_eq!(err.kind(), ErrorKind::Storage);
    }

    #[test]
    fn test_config_invalid_lists_every_problem() {
        let err = ConfigError::Invalid {
            problems: vec!["no entities defined".into(), "max_attempts is 0".into()],
        };
        let text = err.to_string();
        assert!(text.starts_with("Configuration validation failed with 2 error(s)"));
        assert!(text.contains("  - no entities defined"));
        assert!(text.contains("  - max_attempts is 0"));
    }

    #[test]
    fn test_transform_length_mismatch_display() {
        let err = TransformError::LengthMismatch {
            column: "temperature_2m".into(),
            expected: 24,
            actual: 23,
        };
        assert_eq!(
            err.to_string(),
            "Column 'temperature_2m' has 23 values but 'time' has 24"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: StratusError = io_err.into();
        assert!(matches!(err, StratusError::Io(_)));
        assert_eq!(err.kind(), ErrorKind::Storage);
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::TransientIo.to_string(), "transient_io");
        assert_eq!(ErrorKind::Configuration.to_string(), "configuration");
    }
}
