use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

use crate::connection::Position;
use crate::operation::Phase;

/// Which way a transaction is being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    Commit,
    Rollback,
}

impl Resolution {
    /// The callback chain this resolution runs on each swept operation.
    pub fn phase(self) -> Phase {
        match self {
            Resolution::Commit => Phase::Commit,
            Resolution::Rollback => Phase::Rollback,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Commit => write!(f, "commit"),
            Resolution::Rollback => write!(f, "rollback"),
        }
    }
}

/// Error returned by a lifecycle callback.
#[derive(Debug)]
pub struct CallbackError(Box<dyn StdError + Send + Sync>);

impl fmt::Display for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl StdError for CallbackError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.0.as_ref())
    }
}

impl CallbackError {
    /// Create an error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        CallbackError(message.into().into())
    }

    /// Wrap any error type.
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        CallbackError(Box::new(error))
    }

    /// Borrow the wrapped error.
    pub fn inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.0.as_ref()
    }
}

impl From<TransactionError> for CallbackError {
    fn from(err: TransactionError) -> Self {
        CallbackError::new(err)
    }
}

impl From<serde_json::Error> for CallbackError {
    fn from(err: serde_json::Error) -> Self {
        CallbackError::new(err)
    }
}

impl From<String> for CallbackError {
    fn from(message: String) -> Self {
        CallbackError::msg(message)
    }
}

impl From<&str> for CallbackError {
    fn from(message: &str) -> Self {
        CallbackError::msg(message)
    }
}

/// A callback chain that failed for one operation.
#[derive(Debug, Error)]
#[error("{phase} callback failed{}: {error}", at(.position))]
pub struct CallbackFailure {
    pub phase: Phase,
    /// Buffer slot of the operation, `None` when it ran unbuffered at depth 0.
    pub position: Option<Position>,
    #[source]
    pub error: CallbackError,
}

fn at(position: &Option<Position>) -> String {
    match position {
        Some(position) => format!(" at position {}", position),
        None => String::new(),
    }
}

#[derive(Debug, Error)]
pub enum TransactionError {
    /// Commit or rollback without a matching open transaction.
    #[error("trying to {resolution} a non-existent transaction")]
    InvalidTransaction { resolution: Resolution },

    #[error(transparent)]
    Callback(#[from] CallbackFailure),

    /// One or more operations failed while a transaction was being resolved.
    /// Every operation of the sweep was still resolved and removed.
    #[error("{resolution} finished with {} failed operation(s)", .failures.len())]
    Sweep {
        resolution: Resolution,
        failures: Vec<CallbackFailure>,
    },
}

impl TransactionError {
    /// All callback failures carried by this error.
    pub fn failures(&self) -> &[CallbackFailure] {
        match self {
            TransactionError::InvalidTransaction { .. } => &[],
            TransactionError::Callback(failure) => std::slice::from_ref(failure),
            TransactionError::Sweep { failures, .. } => failures,
        }
    }
}
