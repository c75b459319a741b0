//! # ferrite-common
//!
//! Common types, errors, and utilities for FerriteDB.
//!
//! This crate provides the foundational vocabulary shared by all FerriteDB
//! components:
//!
//! - **Types**: core identifiers (`PageId`, `TxnId`, `TableId`, `IndexId`,
//!   `HeapNo`), transaction states, and isolation levels
//! - **Errors**: unified error handling with `FerriteError`
//!
//! ## Example
//!
//! ```rust
//! use ferrite_common::types::{PageId, TxnId, HeapNo};
//! use ferrite_common::error::FerriteResult;
//!
//! fn example() -> FerriteResult<()> {
//!     let page = PageId::new(42);
//!     let txn = TxnId::new(1);
//!     let heap = HeapNo::new(2);
//!     assert!(page.is_valid() && txn.is_valid() && heap.is_user_rec());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod types;

// Re-export commonly used items at the crate root
pub use error::{ErrorCode, FerriteError, FerriteResult};
pub use types::{HeapNo, IndexId, IsolationLevel, PageId, TableId, TxnId, TxnState};
