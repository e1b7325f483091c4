//! Core error types for weir.
//!
//! Three families of failure exist:
//! - configuration errors, reported by the call that introduced them,
//! - invariant violations, which have no recovery path,
//! - cooperative cancellation, used only to shut down blocked waiters.
//!
//! Task failures are not errors: they travel as [`crate::Status`] values.

use thiserror::Error;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Invalid size, count or budget supplied by the caller
    #[error("invalid configuration for {field}: {reason}")]
    Configuration {
        /// Offending parameter
        field: String,
        /// Why it was rejected
        reason: String,
    },

    /// Two sockets cannot be bound together
    #[error("cannot bind {input} to {output}: {reason}")]
    Binding {
        /// Consumer socket
        input: String,
        /// Producer socket
        output: String,
        /// Why the binding was rejected
        reason: String,
    },

    /// Not found
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of the missing entity
        kind: String,
        /// Its identifier
        id: String,
    },

    /// Internal invariant violated
    #[error("invariant violated: {message}")]
    Invariant {
        /// What went wrong
        message: String,
    },

    /// A blocked wait was cancelled
    #[error("operation cancelled")]
    Cancelled,
}

impl CoreError {
    /// Build a configuration error
    #[must_use]
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Build an invariant violation
    #[must_use]
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant {
            message: message.into(),
        }
    }

    /// Build a not-found error
    #[must_use]
    pub fn not_found(kind: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.to_string(),
        }
    }

    /// Whether this is the cooperative cancellation condition
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this is a configuration error (including binding errors)
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. } | Self::Binding { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::config("buffer_size", "must be greater than zero");
        assert_eq!(
            format!("{}", err),
            "invalid configuration for buffer_size: must be greater than zero"
        );

        let err = CoreError::not_found("Task", "task_7");
        assert_eq!(format!("{}", err), "Task not found: task_7");
    }

    #[test]
    fn test_error_classification() {
        assert!(CoreError::Cancelled.is_cancelled());
        assert!(!CoreError::invariant("x").is_cancelled());
        assert!(CoreError::config("a", "b").is_configuration());
        assert!(
            CoreError::Binding {
                input: "i".to_string(),
                output: "o".to_string(),
                reason: "r".to_string(),
            }
            .is_configuration()
        );
        assert!(!CoreError::Cancelled.is_configuration());
    }

    #[test]
    fn test_error_equality() {
        assert_eq!(CoreError::Cancelled, CoreError::Cancelled);
        assert_ne!(CoreError::Cancelled, CoreError::invariant("double allocation"));
    }
}
