//! Stop conditions evaluated by sequence workers after every pass.

use std::fmt;
use std::sync::Arc;
use weir_core::Status;

/// When a worker thread leaves its execution loop
#[derive(Clone, Default)]
pub enum StopCondition {
    /// Only a `FailureStop` status, an error or an interrupt stops the loop
    #[default]
    Never,
    /// Predicate without arguments
    Plain(Arc<dyn Fn() -> bool + Send + Sync>),
    /// Predicate over the statuses of the pass just executed
    Statuses(Arc<dyn Fn(&[Status]) -> bool + Send + Sync>),
}

impl StopCondition {
    /// Wrap a plain predicate
    pub fn plain(f: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Self::Plain(Arc::new(f))
    }

    /// Wrap a predicate over pass statuses
    pub fn statuses(f: impl Fn(&[Status]) -> bool + Send + Sync + 'static) -> Self {
        Self::Statuses(Arc::new(f))
    }

    /// Evaluate against the statuses of the last pass
    #[must_use]
    pub fn holds(&self, statuses: &[Status]) -> bool {
        match self {
            Self::Never => false,
            Self::Plain(f) => f(),
            Self::Statuses(f) => f(statuses),
        }
    }
}

impl fmt::Debug for StopCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("Never"),
            Self::Plain(_) => f.write_str("Plain(..)"),
            Self::Statuses(_) => f.write_str("Statuses(..)"),
        }
    }
}
