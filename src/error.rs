//! Unified error hierarchy for hrrs
//!
//! Only run-level failures live here. Per-interval problems (short windows,
//! non-convergent fits, low R², re-exertion) are recorded on the interval
//! itself and never surface as errors.

use thiserror::Error;

/// Top-level error type for all hrrs operations
#[derive(Debug, Error)]
pub enum HrrError {
    /// Threshold configuration could not be loaded or failed validation
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Persistence layer errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Offline threshold derivation failed
    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    /// Input data validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization of persisted payloads
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying SQLite failure
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Session has no record in the store
    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// Threshold set version missing from the store
    #[error("Threshold set not found: {version}")]
    ThresholdSetNotFound { version: String },

    /// A stored value could not be decoded
    #[error("Corrupt value in {table}.{column}: {reason}")]
    Corrupt {
        table: String,
        column: String,
        reason: String,
    },
}

/// Calibration errors
#[derive(Debug, Error)]
pub enum CalibrationError {
    /// Not enough evidence to derive a threshold
    #[error("Insufficient data for {quantity}: found {found}, need {required}")]
    InsufficientData {
        quantity: String,
        found: usize,
        required: usize,
    },

    /// A derived value was not finite or out of range
    #[error("Derived threshold {name} is invalid: {value}")]
    InvalidThreshold { name: String, value: f64 },

    /// Statistical distribution setup failed
    #[error("Statistics error: {0}")]
    Statistics(String),
}

/// Result type alias for hrrs operations
pub type Result<T> = std::result::Result<T, HrrError>;

impl From<rusqlite::Error> for HrrError {
    fn from(err: rusqlite::Error) -> Self {
        HrrError::Database(DatabaseError::Sqlite(err))
    }
}

impl HrrError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            HrrError::Database(DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(e, _))) => {
                matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
            }
            HrrError::Io(_) => true,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            HrrError::Database(DatabaseError::SessionNotFound { .. }) => ErrorSeverity::Warning,
            HrrError::Validation(_) => ErrorSeverity::Warning,
            HrrError::Configuration(_) => ErrorSeverity::Critical,
            HrrError::Calibration(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            HrrError::Database(DatabaseError::SessionNotFound { session_id }) => {
                format!("No heart-rate session with id '{}' exists in the store", session_id)
            }
            HrrError::Calibration(CalibrationError::InsufficientData {
                quantity,
                found,
                required,
            }) => {
                format!(
                    "Not enough data to calibrate {} ({} of {} required). Add more sessions and retry.",
                    quantity, found, required
                )
            }
            HrrError::Configuration(reason) => {
                format!("Threshold configuration is unusable: {}", reason)
            }
            _ => self.to_string(),
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Aborts the whole batch run
    Critical,
    /// Error that prevents the operation
    Error,
    /// Warning that doesn't prevent operation
    Warning,
}

impl ErrorSeverity {
    /// Convert to tracing level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            ErrorSeverity::Critical => tracing::Level::ERROR,
            ErrorSeverity::Error => tracing::Level::ERROR,
            ErrorSeverity::Warning => tracing::Level::WARN,
        }
    }
}
