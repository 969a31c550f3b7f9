#![forbid(unsafe_code)]
//! Error types for the bktfs bucket-tree workspace.
//!
//! Defines `BktError` and a `Result<T>` alias used throughout the workspace.

use thiserror::Error;

/// Unified error type for all bucket-tree operations.
#[derive(Debug, Error)]
pub enum BktError {
    #[error("invalid bucket tree format: {detail}")]
    InvalidFormat { detail: String },

    #[error("node {index}: entry count {count} outside [1, {capacity}]")]
    InvalidNodeEntryCount { index: i32, count: i32, capacity: i32 },

    #[error("node {index}: offset {offset:#x} inconsistent with node position")]
    InvalidNodeEntryOffset { index: i32, offset: i64 },

    #[error("offset {offset:#x} outside [{start:#x}, {end:#x})")]
    OutOfRange { offset: i64, start: i64, end: i64 },

    #[error("allocation of {size} bytes failed")]
    OutOfMemory { size: usize },

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl BktError {
    /// Shorthand for `InvalidFormat` with a formatted detail message.
    pub fn format(detail: impl Into<String>) -> Self {
        Self::InvalidFormat {
            detail: detail.into(),
        }
    }
}

/// Result alias using `BktError`.
pub type Result<T> = std::result::Result<T, BktError>;
