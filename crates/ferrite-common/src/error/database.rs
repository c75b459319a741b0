//! Database error types.
//!
//! Provides error types for all database operations.

use std::fmt;
use thiserror::Error;

use crate::types::{PageId, TxnId};

/// Error codes for categorizing errors.
///
/// These codes can be used for programmatic error handling and
/// are stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // General errors (0x0000 - 0x00FF)
    /// Unknown or unspecified error.
    Unknown = 0x0000,
    /// Internal error (bug).
    Internal = 0x0001,
    /// Invalid argument provided.
    InvalidArgument = 0x0002,
    /// Operation timed out.
    Timeout = 0x0003,
    /// Operation was interrupted by a session kill.
    Interrupted = 0x0004,

    // Storage errors (0x0100 - 0x01FF)
    /// Data corruption detected.
    Corruption = 0x0100,
    /// Page not found.
    PageNotFound = 0x0101,

    // Transaction errors (0x0200 - 0x02FF)
    /// Deadlock detected.
    Deadlock = 0x0200,
    /// Lock acquisition failed.
    LockFailed = 0x0201,
    /// Transaction not found.
    TransactionNotFound = 0x0202,
    /// Transaction is not in the expected state.
    InvalidTransactionState = 0x0203,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the error category name.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match (*self as u16) >> 8 {
            0x00 => "General",
            0x01 => "Storage",
            0x02 => "Transaction",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The main error type for FerriteDB.
///
/// Each variant includes relevant context for debugging.
///
/// # Example
///
/// ```rust
/// use ferrite_common::error::{FerriteError, FerriteResult};
/// use ferrite_common::types::TxnId;
///
/// fn abort_victim(txn_id: TxnId) -> FerriteResult<()> {
///     Err(FerriteError::Deadlock { txn_id })
/// }
/// ```
#[derive(Debug, Error)]
pub enum FerriteError {
    /// Internal error - this indicates a bug.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Error message.
        message: String,
    },

    /// A lock wait exceeded the configured timeout.
    #[error("lock wait timed out after {duration_ms}ms")]
    Timeout {
        /// How long the waiter slept, in milliseconds.
        duration_ms: u64,
    },

    /// A lock wait was interrupted by a session kill.
    #[error("lock wait interrupted for transaction {txn_id}")]
    Interrupted {
        /// The interrupted transaction.
        txn_id: TxnId,
    },

    /// Data corruption detected.
    #[error("data corruption detected: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// Page not found.
    #[error("page {page_id} not found")]
    PageNotFound {
        /// The missing page ID.
        page_id: PageId,
    },

    /// Deadlock detected.
    #[error("deadlock detected, transaction {txn_id} was chosen as victim")]
    Deadlock {
        /// The transaction that was chosen as the victim.
        txn_id: TxnId,
    },

    /// Lock acquisition failed.
    #[error("failed to acquire lock for transaction {txn_id}: {reason}")]
    LockFailed {
        /// The transaction that could not acquire the lock.
        txn_id: TxnId,
        /// Reason for failure.
        reason: String,
    },

    /// Transaction not found.
    #[error("transaction {txn_id} not found")]
    TransactionNotFound {
        /// The missing transaction.
        txn_id: TxnId,
    },

    /// Transaction is not in the expected state.
    #[error("transaction {txn_id} in state {current}, expected {expected}")]
    InvalidTransactionState {
        /// The transaction ID.
        txn_id: TxnId,
        /// The current state, rendered.
        current: String,
        /// The expected state(s).
        expected: &'static str,
    },
}

impl FerriteError {
    /// Returns the error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Internal { .. } => ErrorCode::Internal,
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Interrupted { .. } => ErrorCode::Interrupted,
            Self::Corruption { .. } => ErrorCode::Corruption,
            Self::PageNotFound { .. } => ErrorCode::PageNotFound,
            Self::Deadlock { .. } => ErrorCode::Deadlock,
            Self::LockFailed { .. } => ErrorCode::LockFailed,
            Self::TransactionNotFound { .. } => ErrorCode::TransactionNotFound,
            Self::InvalidTransactionState { .. } => ErrorCode::InvalidTransactionState,
        }
    }

    /// Returns true if this error is retryable by re-running the statement.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::LockFailed { .. })
    }

    /// Returns true if this error requires the transaction to roll back.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Deadlock { .. })
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    #[must_use]
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = FerriteError::Deadlock {
            txn_id: TxnId::new(7),
        };
        assert_eq!(err.code(), ErrorCode::Deadlock);
        assert_eq!(err.code().category(), "Transaction");
    }

    #[test]
    fn test_error_display() {
        let err = FerriteError::PageNotFound {
            page_id: PageId::new(42),
        };
        assert_eq!(err.to_string(), "page 42 not found");
    }

    #[test]
    fn test_retryable() {
        let timeout = FerriteError::Timeout { duration_ms: 100 };
        assert!(timeout.is_retryable());
        assert!(!timeout.is_conflict());
    }

    #[test]
    fn test_conflict() {
        let err = FerriteError::Deadlock {
            txn_id: TxnId::new(1),
        };
        assert!(err.is_conflict());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_corruption_helper() {
        let err = FerriteError::corruption("row transaction id in the future");
        assert_eq!(err.code(), ErrorCode::Corruption);
        assert_eq!(err.code().category(), "Storage");
    }
}
