// ============================================
// File: crates/tunlink-transport/src/error.rs
// ============================================
//! # Transport Error Types
//!
//! ## Creation Reason
//! Defines the errors a TUN device adapter can surface. Transient
//! conditions (nothing to read yet) never appear here; they are absorbed
//! by the adapter's poll loop.
//!
//! ## Main Functionality
//! - `TransportError`: Primary error enum for device operations
//! - Classification of end-of-life, fatal and privilege errors
//!
//! ## Error Categories
//! 1. **Lifecycle**: `Closed` - the device is shutting down or gone
//! 2. **Fatal I/O**: ring corruption, OS read/write failures
//! 3. **Setup**: device creation and provisioning failures
//! 4. **Configuration**: invalid name, MTU, address
//!
//! ## ⚠️ Important Note for Next Developer
//! - `Closed` is never retried; callers treat it as end of life
//! - Send-buffer overflow is NOT an error: `write` returns `Ok(0)`
//!
//! ## Last Modified
//! v0.1.0 - Initial error definitions

use std::io;

use thiserror::Error;

// ============================================
// Result Type Alias
// ============================================

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

// ============================================
// TransportError
// ============================================

/// Device adapter error types.
#[derive(Error, Debug)]
pub enum TransportError {
    // ========================================
    // Lifecycle Errors
    // ========================================

    /// Operation attempted after close was requested, or the device
    /// went away underneath us.
    #[error("TUN device is closed")]
    Closed,

    // ========================================
    // Fatal I/O Errors
    // ========================================

    /// The device's packet ring is in an inconsistent state.
    #[error("TUN ring corrupted: {reason}")]
    RingCorrupt {
        /// What the ring reported
        reason: String,
    },

    /// I/O error from the system.
    #[error("I/O error: {context}")]
    Io {
        /// What was happening when the error occurred
        context: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    // ========================================
    // Setup Errors
    // ========================================

    /// Failed to create TUN device.
    #[error("Failed to create TUN device '{name}': {reason}")]
    TunCreateFailed {
        /// Requested device name
        name: String,
        /// Why creation failed
        reason: String,
    },

    /// Failed to configure TUN device.
    #[error("Failed to configure TUN device '{name}': {reason}")]
    TunConfigFailed {
        /// Device name
        name: String,
        /// Why configuration failed
        reason: String,
    },

    /// Permission denied for operation.
    #[error("Permission denied: {operation}")]
    PermissionDenied {
        /// What operation was denied
        operation: String,
    },

    /// The platform has no device adapter.
    #[error("TUN devices are not supported on this platform")]
    Unsupported,

    // ========================================
    // Configuration Errors
    // ========================================

    /// Invalid configuration.
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig {
        /// Configuration field name
        field: String,
        /// Why it's invalid
        reason: String,
    },
}

impl TransportError {
    // ========================================
    // Convenience Constructors
    // ========================================

    /// Creates a `TunCreateFailed` error.
    pub fn tun_create_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TunCreateFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `TunConfigFailed` error.
    pub fn tun_config_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TunConfigFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `RingCorrupt` error.
    pub fn ring_corrupt(reason: impl Into<String>) -> Self {
        Self::RingCorrupt {
            reason: reason.into(),
        }
    }

    /// Creates an `Io` error with context.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Creates an `InvalidConfig` error.
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    // ========================================
    // Error Classification
    // ========================================

    /// Returns `true` if the device is closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Returns `true` if the I/O path that produced this error is dead.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::RingCorrupt { .. } | Self::Io { .. })
    }

    /// Returns `true` if this error requires elevated privileges.
    #[must_use]
    pub const fn requires_privileges(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied { .. } | Self::TunCreateFailed { .. }
        )
    }
}

// ============================================
// Error Conversions
// ============================================

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                operation: err.to_string(),
            },
            _ => Self::Io {
                context: "unspecified I/O operation".into(),
                source: err,
            },
        }
    }
}

impl From<TransportError> for io::Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => io::Error::new(io::ErrorKind::NotConnected, err),
            TransportError::Io { source, .. } => source,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::tun_create_failed("tun0", "device busy");
        assert!(err.to_string().contains("tun0"));
        assert!(err.to_string().contains("device busy"));
    }

    #[test]
    fn test_error_classification() {
        assert!(TransportError::Closed.is_closed());
        assert!(!TransportError::Closed.is_fatal());

        let corrupt = TransportError::ring_corrupt("head beyond capacity");
        assert!(corrupt.is_fatal());

        let tun_err = TransportError::tun_create_failed("tun0", "permission denied");
        assert!(tun_err.requires_privileges());
    }

    #[test]
    fn test_io_error_conversion() {
        let denied: TransportError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(denied.requires_privileges());

        let back: io::Error = TransportError::Closed.into();
        assert_eq!(back.kind(), io::ErrorKind::NotConnected);
    }
}
