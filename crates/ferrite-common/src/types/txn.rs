//! Transaction state and isolation level types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle state of a transaction as seen by the lock manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    /// Transaction has been allocated but not started.
    NotStarted,
    /// Transaction is active and can acquire locks.
    Active,
    /// Transaction is prepared (XA); its locks are still held.
    Prepared,
    /// Transaction has committed; its locks are being torn down.
    Committed,
}

impl TxnState {
    /// Returns true if the transaction may still own row versions,
    /// i.e. an implicit lock attributed to it must be honored.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, TxnState::Active | TxnState::Prepared)
    }

    /// Returns true if the transaction has finished.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        *self == TxnState::Committed
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnState::NotStarted => write!(f, "NotStarted"),
            TxnState::Active => write!(f, "Active"),
            TxnState::Prepared => write!(f, "Prepared"),
            TxnState::Committed => write!(f, "Committed"),
        }
    }
}

/// Transaction isolation level.
///
/// The lock manager consults the level in two places: next-key locking is
/// the default at `RepeatableRead` and above, and gap inheritance on
/// delete skips X locks held at `ReadCommitted` or weaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Reads see uncommitted changes; no read locks.
    ReadUncommitted,
    /// Reads see only committed data; gap locks are not inherited.
    ReadCommitted,
    /// Repeatable reads with next-key locking (the default).
    RepeatableRead,
    /// Full serializability; reads lock like writes.
    Serializable,
}

impl IsolationLevel {
    /// Returns true if gap locks taken by this transaction should survive
    /// structural page changes (inheritance on delete and merge).
    #[must_use]
    pub fn inherits_gap_locks(&self) -> bool {
        *self > IsolationLevel::ReadCommitted
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadUncommitted => write!(f, "READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE READ"),
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txn_state() {
        assert!(TxnState::Active.is_active());
        assert!(TxnState::Prepared.is_active());
        assert!(!TxnState::Committed.is_active());
        assert!(TxnState::Committed.is_ended());
        assert!(!TxnState::NotStarted.is_ended());
    }

    #[test]
    fn test_isolation_ordering() {
        assert!(IsolationLevel::ReadCommitted < IsolationLevel::RepeatableRead);
        assert!(IsolationLevel::RepeatableRead.inherits_gap_locks());
        assert!(!IsolationLevel::ReadCommitted.inherits_gap_locks());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", TxnState::Active), "Active");
        assert_eq!(
            format!("{}", IsolationLevel::RepeatableRead),
            "REPEATABLE READ"
        );
    }
}
