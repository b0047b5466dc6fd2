//! Unified error handling for homewatt crates
//!
//! Every fallible operation in the connection layer, the scheduler and the
//! device modules returns [`HomewattResult`]. The variants follow the failure
//! kinds a poll cycle can hit: precondition violations, transport failures,
//! payload/shape failures and persistence failures.

use thiserror::Error;

// ============================================================================
// HomewattError - Main error type
// ============================================================================

/// Main error type for all homewatt crates
#[derive(Debug, Error)]
pub enum HomewattError {
    // ======================================
    // Precondition Errors
    // ======================================
    #[error("{0} is not initialized")]
    NotInitialized(String),

    // ======================================
    // Transport Errors
    // ======================================
    #[error("Connection failed: {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("Timeout waiting for response from {0}")]
    Timeout(String),

    #[error("Modbus error: {0}")]
    Modbus(String),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // ======================================
    // Protocol & Payload Errors
    // ======================================
    #[error("Unexpected HTTP status {status} from {endpoint}")]
    UnexpectedStatus { endpoint: String, status: u16 },

    #[error("Protocol error: {device}: {message}")]
    Protocol { device: String, message: String },

    #[error("Missing field in {device} payload: {field}")]
    MissingField { device: String, field: String },

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    // ======================================
    // Persistence Errors
    // ======================================
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Persistence error: {0}")]
    Persistence(String),

    // ======================================
    // Configuration Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // ======================================
    // File, I/O & Serialization Errors
    // ======================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // ======================================
    // Catch-all
    // ======================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using HomewattError
pub type HomewattResult<T> = Result<T, HomewattError>;

/// Coarse classification used for log levels and the `result` metric label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    NotInitialized,
    Transport,
    Protocol,
    Persistence,
    Configuration,
    Internal,
}

impl HomewattError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotInitialized(_) => ErrorCategory::NotInitialized,

            Self::ConnectionFailed { .. }
            | Self::Timeout(_)
            | Self::Modbus(_)
            | Self::HttpClient(_) => ErrorCategory::Transport,

            Self::UnexpectedStatus { .. }
            | Self::Protocol { .. }
            | Self::MissingField { .. }
            | Self::NotFound { .. } => ErrorCategory::Protocol,

            Self::Database(_) | Self::Persistence(_) => ErrorCategory::Persistence,

            Self::Configuration(_) | Self::InvalidConfig { .. } => ErrorCategory::Configuration,

            Self::Io(_) | Self::Serialization(_) | Self::Internal(_) | Self::Other(_) => {
                ErrorCategory::Internal
            },
        }
    }

    /// Stable machine-readable code (logs, status API)
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotInitialized(_) => "NOT_INITIALIZED",
            Self::ConnectionFailed { .. } => "CONNECTION_FAILED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Modbus(_) => "MODBUS_ERROR",
            Self::HttpClient(_) => "HTTP_CLIENT_ERROR",
            Self::UnexpectedStatus { .. } => "UNEXPECTED_STATUS",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::MissingField { .. } => "MISSING_FIELD",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
            Self::Configuration(_) => "CONFIG_ERROR",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Other(_) => "UNKNOWN_ERROR",
        }
    }

    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::NotInitialized(_) => 503,
            Self::Timeout(_) => 504,
            _ => match self.category() {
                ErrorCategory::Transport | ErrorCategory::Protocol => 502,
                _ => 500,
            },
        }
    }

    /// Transport failures are worth another attempt at connect time.
    /// Payload and persistence failures are not.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transport
    }

    pub fn log_level(&self) -> tracing::Level {
        match self.category() {
            ErrorCategory::Internal | ErrorCategory::Persistence => tracing::Level::ERROR,
            ErrorCategory::Configuration => tracing::Level::ERROR,
            _ => tracing::Level::WARN,
        }
    }
}

// Conversion traits for common error types
impl From<serde_json::Error> for HomewattError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for HomewattError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

// Helper macros for creating errors
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::HomewattError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::HomewattError::Configuration(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! protocol_error {
    ($device:expr, $msg:expr) => {
        $crate::HomewattError::Protocol {
            device: $device.to_string(),
            message: $msg.to_string(),
        }
    };
    ($device:expr, $fmt:expr, $($arg:tt)*) => {
        $crate::HomewattError::Protocol {
            device: $device.to_string(),
            message: format!($fmt, $($arg)*),
        }
    };
}

#[macro_export]
macro_rules! missing_field {
    ($device:expr, $field:expr) => {
        $crate::HomewattError::MissingField {
            device: $device.to_string(),
            field: $field.to_string(),
        }
    };
}
