#![forbid(unsafe_code)]
//! Error types for shadowfs.
//!
//! Defines `StoreError` and a `Result<T>` alias used throughout the
//! workspace. Invariant violations are asserts, never error values.

use thiserror::Error;

/// Unified error type for all shadowfs operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no disk space: {needed_sectors} sectors requested")]
    NoSpaceDisk { needed_sectors: u64 },

    #[error("no journal space: {needed_u64s} u64s requested")]
    NoSpaceJournal { needed_u64s: u64 },

    /// A non-blocking path chose not to wait; the caller converts this
    /// into a retry.
    #[error("operation would block")]
    WouldBlock,

    /// The caller's lock snapshot was dropped; it must restart its
    /// transaction.
    #[error("transaction restart required")]
    Interrupted,

    /// The journal has failed permanently; no new topology changes may
    /// start. In-flight updates still shed their resources.
    #[error("journal in error state")]
    JournalError,

    #[error("operation cancelled")]
    Cancelled,

    #[error("corrupt metadata at {location}: {detail}")]
    Corruption { location: String, detail: String },
}

impl StoreError {
    /// Whether the caller should relock and retry the whole transaction.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::WouldBlock | StoreError::Interrupted)
    }
}

/// Result alias using `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(StoreError::WouldBlock.is_transient());
        assert!(StoreError::Interrupted.is_transient());
        assert!(!StoreError::JournalError.is_transient());
        assert!(!StoreError::NoSpaceDisk { needed_sectors: 8 }.is_transient());
    }
}
