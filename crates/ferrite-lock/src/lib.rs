//! # ferrite-lock
//!
//! The transactional lock manager of FerriteDB.
//!
//! Arbitrates concurrent access by in-flight transactions to records,
//! identified by a (page, heap-slot) pair inside a clustered or secondary
//! index, and to whole tables. Enforces two-phase locking with next-key
//! semantics, detects deadlocks, and unblocks waiters as locks are
//! released.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            LockSys                              │
//! │                                                                 │
//! │  ┌─────────┐  ┌──────────┐  ┌──────────────┐  ┌─────────────┐   │
//! │  │  mode   │  │  object  │  │     hash     │  │    wait     │   │
//! │  │ algebra │  │   pool   │  │  page chains │  │  suspension │   │
//! │  └─────────┘  └──────────┘  └──────────────┘  └─────────────┘   │
//! │       │             │               │                │          │
//! │       ▼             ▼               ▼                ▼          │
//! │  ┌──────────────────────┐  ┌─────────────┐  ┌───────────────┐   │
//! │  │  record / table ops  │  │   migrate   │  │   deadlock    │   │
//! │  │  (acquire, release)  │  │ page events │  │   detector    │   │
//! │  └──────────────────────┘  └─────────────┘  └───────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Locks exist only in memory for live transactions; there is no
//! persisted state.
//!
//! # Example
//!
//! ```rust
//! use ferrite_common::types::{HeapNo, IndexId, IsolationLevel, PageId, TableId, TxnId};
//! use ferrite_lock::{GapMode, IndexRef, LockMode, LockSys, PageRef, RequestStatus};
//!
//! let sys = LockSys::new();
//! let trx = TxnId::new(1);
//! sys.register_txn(trx, IsolationLevel::RepeatableRead);
//!
//! let page = PageRef::new(PageId::new(7), 16);
//! let index = IndexRef::clustered(IndexId::new(1), TableId::new(1));
//! let status = sys.request_record_lock(
//!     trx,
//!     LockMode::Exclusive,
//!     GapMode::RecNotGap,
//!     page,
//!     HeapNo::new(3),
//!     index,
//!     false,
//! );
//! assert_eq!(status, RequestStatus::GrantedNew);
//! sys.release(trx);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod deadlock;
pub mod hash;
pub mod implicit;
pub mod migrate;
pub mod mode;
pub mod object;
pub mod record;
pub mod sys;
pub mod table;
pub mod validate;
pub mod wait;

// Re-export the public surface at the crate root.

pub use mode::{GapMode, LockMode, TypeMode};
pub use object::{IndexRef, Lock, LockId, LockPayload, PageRef, RecLock, TabLock};
pub use sys::{
    DeadlockReport, LockStats, LockStatus, LockSys, LockSysConfig, RequestStatus,
};
