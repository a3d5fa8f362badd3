//! Error types for visitor identity operations

use thiserror::Error;

/// Kind of a failed identity service call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No transport available.
    NotConnected,
    /// Response payload could not be parsed.
    InvalidResponse,
    /// Payload parsed but the identity fields were missing or invalid.
    InvalidIdentityPayload,
    /// Transport-level failure.
    RequestFailed,
}

/// Identity service errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Not connected: {reason}")]
    NotConnected { reason: String },

    #[error("Invalid response: {reason}")]
    InvalidResponse { reason: String },

    #[error("Invalid identity payload: {reason}")]
    InvalidIdentityPayload { reason: String },

    #[error("Request failed with status {status}: {message}")]
    RequestFailed { status: i32, message: String },
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::NotConnected { .. } => ErrorKind::NotConnected,
            ServiceError::InvalidResponse { .. } => ErrorKind::InvalidResponse,
            ServiceError::InvalidIdentityPayload { .. } => ErrorKind::InvalidIdentityPayload,
            ServiceError::RequestFailed { .. } => ErrorKind::RequestFailed,
        }
    }
}

/// Durable storage errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("I/O error on {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("LMDB error: {reason}")]
    Lmdb { reason: String },

    #[error("Refusing to persist record: {reason}")]
    InvalidRecord { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing configuration file path (set VISITOR_ID_CONFIG)")]
    MissingConfigPath,

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },
}

/// Master error type for all visitor errors.
#[derive(Debug, Clone, Error)]
pub enum VisitorError {
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Runtime error: {reason}")]
    Runtime { reason: String },
}

/// Result of a single identity service call.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Result type alias for visitor operations.
pub type VisitorResult<T> = Result<T, VisitorError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_error_kinds() {
        let cases = [
            (
                ServiceError::NotConnected {
                    reason: "offline".to_string(),
                },
                ErrorKind::NotConnected,
            ),
            (
                ServiceError::InvalidResponse {
                    reason: "not json".to_string(),
                },
                ErrorKind::InvalidResponse,
            ),
            (
                ServiceError::InvalidIdentityPayload {
                    reason: "missing d_mid".to_string(),
                },
                ErrorKind::InvalidIdentityPayload,
            ),
            (
                ServiceError::RequestFailed {
                    status: 503,
                    message: "unavailable".to_string(),
                },
                ErrorKind::RequestFailed,
            ),
        ];

        for (err, kind) in cases {
            assert_eq!(err.kind(), kind);
        }
    }

    #[test]
    fn test_request_failed_display() {
        let err = ServiceError::RequestFailed {
            status: 503,
            message: "unavailable".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("503"));
        assert!(msg.contains("unavailable"));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "request_timeout_ms".to_string(),
            value: "0".to_string(),
            reason: "must be > 0".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("request_timeout_ms"));
        assert!(msg.contains("must be > 0"));
    }

    #[test]
    fn test_visitor_error_from_storage() {
        let err: VisitorError = StorageError::LockPoisoned.into();
        assert!(matches!(err, VisitorError::Storage(StorageError::LockPoisoned)));
        assert!(format!("{}", err).contains("Storage lock poisoned"));
    }
}
