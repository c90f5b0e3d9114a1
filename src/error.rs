//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the kinds of errors that can occur while preparing and running a field-sweep campaign.
//!
//! ## Error Hierarchy
//!
//! - **`ConfigLoad`**: Wraps errors from `figment` when the layered configuration
//!   cannot be extracted (bad TOML, wrong types in environment overrides).
//! - **`Configuration`**: Semantic errors in user input that pass parsing but are
//!   unusable, such as a frequency/field pair without a `:` or a non-numeric linewidth.
//!   These are always reported before any hardware moves.
//! - **`Plan`**: A field plan that would degenerate (zero step, a density segment with
//!   fewer than two points).
//! - **`Hardware`**: A communication failure or timeout from any instrument call. These
//!   are not retried; the campaign stops and the caller decides what to do next.
//! - **`AlreadyRunning`**: `start` was called while a campaign worker is still alive.
//! - **`Io`** / **`Storage`**: Output file problems.
//!
//! Instrument capability traits return `anyhow::Result`; [`HardwareContext`] turns those
//! into `DaqError::Hardware` with the failing operation attached.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Field plan error: {0}")]
    Plan(String),

    #[error("Hardware error while {operation}: {message}")]
    Hardware { operation: String, message: String },

    #[error("A campaign is already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Tokio runtime error: {0}")]
    Runtime(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Feature '{0}' is enabled but not yet implemented. {1}")]
    FeatureIncomplete(String, String),
}

impl DaqError {
    /// Shorthand for a hardware failure on `operation`.
    pub fn hardware(operation: impl Into<String>, message: impl Into<String>) -> Self {
        DaqError::Hardware {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// True for errors raised before any hardware motion took place.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            DaqError::Configuration(_) | DaqError::ConfigLoad(_) | DaqError::Plan(_)
        )
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::ConfigLoad(Box::new(err))
    }
}

#[cfg(feature = "storage_csv")]
impl From<csv::Error> for DaqError {
    fn from(err: csv::Error) -> Self {
        DaqError::Storage(err.to_string())
    }
}

/// Attaches an operation name to instrument results.
pub trait HardwareContext<T> {
    /// Converts an instrument failure into [`DaqError::Hardware`].
    fn hardware(self, operation: &str) -> AppResult<T>;
}

impl<T> HardwareContext<T> for anyhow::Result<T> {
    fn hardware(self, operation: &str) -> AppResult<T> {
        self.map_err(|err| DaqError::hardware(operation, format!("{err:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_error_display() {
        let err = DaqError::Configuration("':' is missing in '19 6000'".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration validation error: ':' is missing in '19 6000'"
        );
    }

    #[test]
    fn test_hardware_context_keeps_operation() {
        let result: anyhow::Result<()> = Err(anyhow!("GPIB timeout"));
        let err = result.hardware("setting field").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Hardware error while setting field: GPIB timeout"
        );
        assert!(!err.is_input_error());
    }

    #[test]
    fn test_input_errors_are_classified() {
        assert!(DaqError::Plan("empty segment".into()).is_input_error());
        assert!(!DaqError::AlreadyRunning.is_input_error());
    }
}
