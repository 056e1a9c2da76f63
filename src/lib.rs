// Library interface for hrrs
// Integration tests and the CLI binary both go through these modules

pub mod calibration;
pub mod config;
pub mod database;
pub mod detection;
pub mod error;
pub mod fitting;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod quality;
pub mod reanchor;
pub mod signal;

// Re-export commonly used types for convenience
pub use calibration::{calibrate, CalibrationResult, CalibrationSettings};
pub use config::{AppConfig, BatchSettings, FitBounds, HrrConfig};
pub use database::Database;
pub use error::{CalibrationError, DatabaseError, HrrError, Result};
pub use logging::{init_logging, LogConfig, LogFormat, LogLevel};
pub use models::*;
pub use pipeline::{
    detect_session, BatchSummary, IntervalStore, SampleSource, SessionProcessor, SessionSummary,
};
