//! Scheduler errors

use thiserror::Error;
use weir_core::CoreError;

/// Result type for scheduler operations
pub type ScheduleResult<T> = Result<T, ScheduleError>;

/// Scheduler error
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Failure reported by the engine
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Invalid budget, missing profile or mismatched solution
    #[error("invalid schedule configuration: {reason}")]
    Configuration {
        /// What is wrong
        reason: String,
    },

    /// Schedule file could not be read
    #[error("cannot read schedule file: {0}")]
    Io(#[from] std::io::Error),

    /// Schedule file is not valid JSON
    #[error("cannot parse schedule file: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ScheduleError {
    /// Build a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Whether this is a configuration error, including engine ones
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::Configuration { .. } => true,
            Self::Core(e) => e.is_configuration(),
            _ => false,
        }
    }
}
