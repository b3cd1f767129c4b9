//! Error types for the client bindings.

use thiserror::Error;

use idbx_engine::EngineError;

/// Result type for client operations.
pub type IdbResult<T> = Result<T, IdbError>;

/// Errors delivered by the client bindings.
///
/// Engine failures pass through unchanged; the remaining variants are
/// conditions the binding layer itself detects.
#[derive(Debug, Clone, Error)]
pub enum IdbError {
    /// The engine refused or failed an operation.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// The surrounding transaction aborted, rolling the operation back.
    #[error("transaction aborted: {cause}")]
    TransactionAborted {
        /// The engine error that ended the transaction.
        cause: EngineError,
    },

    /// A handle was used after its transaction finished.
    #[error("transaction finished: {message}")]
    TransactionFinished {
        /// What was attempted on the finished transaction.
        message: String,
    },

    /// The engine answered with a payload of the wrong shape.
    #[error("unexpected engine response: {message}")]
    Unexpected {
        /// Description of the mismatch.
        message: String,
    },
}

impl IdbError {
    /// Creates a [`IdbError::TransactionAborted`] error.
    pub fn aborted(cause: EngineError) -> Self {
        Self::TransactionAborted { cause }
    }

    /// Creates a [`IdbError::TransactionFinished`] error.
    pub fn finished(message: impl Into<String>) -> Self {
        Self::TransactionFinished {
            message: message.into(),
        }
    }

    /// Creates an [`IdbError::Unexpected`] error.
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected {
            message: message.into(),
        }
    }

    /// Returns `true` for the transaction-abort terminal channel.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::TransactionAborted { .. })
    }
}
