// ============================================
// File: crates/tunlink-common/src/error.rs
// ============================================
//! # Common Error Types
//!
//! ## Creation Reason
//! Provides the error type returned by the buffered I/O contracts and
//! the flow adapters built on top of them.
//!
//! ## Main Functionality
//! - `CommonError`: Base error enum for buffer and flow operations
//! - `Result<T>`: Type alias using `CommonError`
//!
//! ## ⚠️ Important Note for Next Developer
//! - `PartialWrite.written` counts buffers fully written before the
//!   failure; callers that retry resume from that index
//! - `EndOfStream` is the normal end of a flow, not a failure
//!
//! ## Last Modified
//! v0.1.0 - Initial error definitions

use thiserror::Error;

// ============================================
// Result Type Alias
// ============================================

/// Common result type for operations that may fail.
pub type Result<T> = std::result::Result<T, CommonError>;

// ============================================
// CommonError
// ============================================

/// Common error types shared across tunlink crates.
///
/// # Example
/// ```
/// use tunlink_common::error::{CommonError, Result};
///
/// fn validate_input(data: &[u8]) -> Result<()> {
///     if data.is_empty() {
///         return Err(CommonError::invalid_input("data", "cannot be empty"));
///     }
///     Ok(())
/// }
/// ```
#[derive(Error, Debug)]
pub enum CommonError {
    // ========================================
    // Validation Errors
    // ========================================

    /// Invalid input data provided.
    #[error("Invalid input for '{field}': {reason}")]
    InvalidInput {
        /// Name of the field or parameter
        field: String,
        /// Description of what's wrong
        reason: String,
    },

    /// Value is out of acceptable range.
    #[error("Value out of range: {value} not in [{min}, {max}]")]
    OutOfRange {
        /// The value that was out of range
        value: String,
        /// Minimum acceptable value
        min: String,
        /// Maximum acceptable value
        max: String,
    },

    /// A buffer that must carry a peer address had none.
    #[error("Missing destination on datagram buffer")]
    MissingDestination,

    // ========================================
    // Flow Errors
    // ========================================

    /// The peer finished the flow.
    #[error("End of stream")]
    EndOfStream,

    /// The flow was closed locally.
    #[error("Connection closed")]
    Closed,

    /// A multi-buffer write failed part way through.
    #[error("Partial write: {written} of {total} buffers written")]
    PartialWrite {
        /// Buffers fully written before the failure
        written: usize,
        /// Buffers in the multi-buffer
        total: usize,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    // ========================================
    // IO Errors
    // ========================================

    /// System I/O error occurred.
    #[error("I/O error: {context}")]
    Io {
        /// What operation was being performed
        context: String,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },
}

impl CommonError {
    // ========================================
    // Convenience Constructors
    // ========================================

    /// Creates an `InvalidInput` error.
    pub fn invalid_input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates an `OutOfRange` error.
    pub fn out_of_range(
        value: impl ToString,
        min: impl ToString,
        max: impl ToString,
    ) -> Self {
        Self::OutOfRange {
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
        }
    }

    /// Creates an `Io` error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    // ========================================
    // Error Classification
    // ========================================

    /// Returns `true` if the flow ended normally or was closed.
    #[must_use]
    pub const fn is_end_of_flow(&self) -> bool {
        matches!(self, Self::EndOfStream | Self::Closed)
    }

    /// Returns `true` if this error indicates a caller mistake.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput { .. } | Self::OutOfRange { .. } | Self::MissingDestination
        )
    }
}

// ============================================
// Error Conversions
// ============================================

impl From<std::io::Error> for CommonError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::EndOfStream,
            _ => Self::Io {
                context: "unspecified I/O operation".into(),
                source: err,
            },
        }
    }
}

// ============================================
// Tests
// ============================================
