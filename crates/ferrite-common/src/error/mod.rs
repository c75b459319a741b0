//! Error handling for FerriteDB.
//!
//! This module provides a unified error type and result alias used
//! across all FerriteDB components.

mod database;

pub use database::{ErrorCode, FerriteError};

/// Result type alias for FerriteDB operations.
pub type FerriteResult<T> = std::result::Result<T, FerriteError>;
