// ============================================
// File: crates/tunlink-core/src/error.rs
// ============================================
//! # Core Error Types
//!
//! ## Creation Reason
//! Defines error types for the link bridge, the protocol engine and
//! the stack bring-up in the tunlink core crate.
//!
//! ## Main Functionality
//! - `CoreError`: Primary error enum for core operations
//! - `LinkWriteError`: partial delivery of an outbound packet batch
//!
//! ## Error Categories
//! 1. **Setup Errors**: NIC registration, routes, options; fatal to startup
//! 2. **Engine Errors**: bad NIC id, unsupported route, closed engine
//! 3. **Per-connection Errors**: endpoint creation; isolated to one flow
//!
//! ## ⚠️ Important Note for Next Developer
//! - Setup failures must leave nothing half configured; `NetStack::start`
//!   closes the engine before returning `Setup`
//! - Per-connection errors are logged at `debug!`, never propagated
//!
//! ## Last Modified
//! v0.1.0 - Initial error definitions

use thiserror::Error;

use tunlink_common::error::CommonError;
use tunlink_transport::TransportError;

// ============================================
// Result Type Alias
// ============================================

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

// ============================================
// CoreError
// ============================================

/// Core error types for the link bridge and protocol engine.
#[derive(Error, Debug)]
pub enum CoreError {
    // ========================================
    // Setup Errors
    // ========================================

    /// A bring-up step failed; the engine has been torn down.
    #[error("Stack setup failed at '{step}': {reason}")]
    Setup {
        /// Which step failed
        step: &'static str,
        /// Why it failed
        reason: String,
    },

    /// A NIC with this id is already registered.
    #[error("NIC {id} already exists")]
    DuplicateNic {
        /// NIC id
        id: u32,
    },

    /// No NIC with this id is registered.
    #[error("Unknown NIC {id}")]
    UnknownNic {
        /// NIC id
        id: u32,
    },

    /// The route cannot be expressed by this engine.
    #[error("Unsupported route: {destination}")]
    UnsupportedRoute {
        /// Route destination subnet
        destination: String,
    },

    /// A protocol option was rejected.
    #[error("Invalid option '{option}': {reason}")]
    InvalidOption {
        /// Option name
        option: &'static str,
        /// Why it was rejected
        reason: String,
    },

    // ========================================
    // Engine Errors
    // ========================================

    /// The engine has been closed.
    #[error("Protocol engine closed")]
    EngineClosed,

    /// The engine refused to create an endpoint for a flow.
    #[error("Endpoint creation failed: {reason}")]
    Endpoint {
        /// Why the endpoint could not be created
        reason: String,
    },

    // ========================================
    // Wrapped Errors
    // ========================================

    /// Error from the device layer.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Error from common utilities.
    #[error(transparent)]
    Common(#[from] CommonError),
}

impl CoreError {
    // ========================================
    // Convenience Constructors
    // ========================================

    /// Creates a setup error.
    pub fn setup(step: &'static str, reason: impl ToString) -> Self {
        Self::Setup {
            step,
            reason: reason.to_string(),
        }
    }

    /// Creates an invalid option error.
    pub fn invalid_option(option: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            option,
            reason: reason.into(),
        }
    }

    /// Creates an endpoint creation error.
    pub fn endpoint(reason: impl Into<String>) -> Self {
        Self::Endpoint {
            reason: reason.into(),
        }
    }

    // ========================================
    // Error Classification
    // ========================================

    /// Returns true if this error aborted stack bring-up.
    #[must_use]
    pub const fn is_setup_error(&self) -> bool {
        matches!(
            self,
            Self::Setup { .. }
                | Self::DuplicateNic { .. }
                | Self::UnknownNic { .. }
                | Self::UnsupportedRoute { .. }
                | Self::InvalidOption { .. }
        )
    }

    /// Returns true if this error only affects a single flow.
    #[must_use]
    pub const fn is_per_connection(&self) -> bool {
        matches!(self, Self::Endpoint { .. })
    }
}

// ============================================
// LinkWriteError
// ============================================

/// An outbound batch stopped part way through.
///
/// Packets before `delivered` reached the device; the rest did not.
#[derive(Error, Debug)]
#[error("Link write failed after {delivered} packets: {source}")]
pub struct LinkWriteError {
    /// Packets written before the failure
    pub delivered: usize,
    /// Device error
    #[source]
    pub source: TransportError,
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::setup("create nic", "NIC 1 already exists");
        assert_eq!(
            err.to_string(),
            "Stack setup failed at 'create nic': NIC 1 already exists"
        );

        let err = CoreError::UnsupportedRoute {
            destination: "10.0.0.0/8".into(),
        };
        assert!(err.to_string().contains("10.0.0.0/8"));
    }

    #[test]
    fn test_error_classification() {
        assert!(CoreError::setup("x", "y").is_setup_error());
        assert!(CoreError::DuplicateNic { id: 1 }.is_setup_error());
        assert!(!CoreError::EngineClosed.is_setup_error());

        assert!(CoreError::endpoint("spoofing disabled").is_per_connection());
        assert!(!CoreError::EngineClosed.is_per_connection());
    }

    #[test]
    fn test_link_write_error_reports_progress() {
        let err = LinkWriteError {
            delivered: 2,
            source: TransportError::Closed,
        };
        assert_eq!(err.delivered, 2);
        assert!(err.to_string().starts_with("Link write failed after 2 packets"));
    }
}
