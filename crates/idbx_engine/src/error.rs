//! Error types for the storage engine.

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in engine operations.
///
/// Variants mirror the failure categories a transactional object-store
/// engine reports to clients, so callers can tell a constraint violation
/// apart from a lifecycle mistake without parsing messages.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A value could not be used as (or yield) a storable key.
    #[error("data error: {message}")]
    Data {
        /// Description of the offending data.
        message: String,
    },

    /// A uniqueness rule was violated.
    #[error("constraint violation: {message}")]
    Constraint {
        /// Description of the violated constraint.
        message: String,
    },

    /// A named database, store, or index does not exist.
    #[error("not found: {message}")]
    NotFound {
        /// What was looked up and missed.
        message: String,
    },

    /// Operation not permitted in the current lifecycle state.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of the state conflict.
        message: String,
    },

    /// The transaction is not accepting requests.
    #[error("transaction inactive: {message}")]
    TransactionInactive {
        /// Why the transaction cannot take the request.
        message: String,
    },

    /// A mutation was attempted through a read-only transaction.
    #[error("read-only transaction: {message}")]
    ReadOnly {
        /// The rejected mutation.
        message: String,
    },

    /// A version upgrade request went backwards.
    #[error("version error: {message}")]
    Version {
        /// Description of the version conflict.
        message: String,
    },

    /// Arguments that can never be satisfied, regardless of state.
    #[error("invalid access: {message}")]
    InvalidAccess {
        /// Description of the bad arguments.
        message: String,
    },

    /// The transaction was aborted before the request could complete.
    #[error("transaction aborted: {message}")]
    Abort {
        /// Why the transaction went away.
        message: String,
    },
}

impl EngineError {
    /// Creates a data error.
    pub fn data(message: impl Into<String>) -> Self {
        Self::Data {
            message: message.into(),
        }
    }

    /// Creates a constraint violation error.
    pub fn constraint(message: impl Into<String>) -> Self {
        Self::Constraint {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates a transaction-inactive error.
    pub fn inactive(message: impl Into<String>) -> Self {
        Self::TransactionInactive {
            message: message.into(),
        }
    }

    /// Creates a read-only error.
    pub fn read_only(message: impl Into<String>) -> Self {
        Self::ReadOnly {
            message: message.into(),
        }
    }

    /// Creates a version error.
    pub fn version(message: impl Into<String>) -> Self {
        Self::Version {
            message: message.into(),
        }
    }

    /// Creates an invalid access error.
    pub fn invalid_access(message: impl Into<String>) -> Self {
        Self::InvalidAccess {
            message: message.into(),
        }
    }

    /// Creates an abort error.
    pub fn abort(message: impl Into<String>) -> Self {
        Self::Abort {
            message: message.into(),
        }
    }

    /// Returns `true` for the constraint-violation category.
    #[must_use]
    pub fn is_constraint(&self) -> bool {
        matches!(self, Self::Constraint { .. })
    }

    /// Returns `true` if the error reports an aborted transaction.
    #[must_use]
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Abort { .. })
    }
}
