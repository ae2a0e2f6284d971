// ============================================
// File: crates/tunlink-server/src/error.rs
// ============================================
//! # Server Error Types
//!
//! ## Last Modified
//! v0.1.0 - Initial server errors

use thiserror::Error;

use tunlink_common::error::CommonError;
use tunlink_common::Destination;
use tunlink_core::error::CoreError;
use tunlink_transport::error::TransportError;

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Server error types.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Configuration file could not be read or parsed.
    #[error("Failed to load configuration from '{path}': {reason}")]
    ConfigLoad {
        /// File path
        path: String,
        /// Failure description
        reason: String,
    },

    /// Configuration value rejected.
    #[error("Invalid configuration: {field} - {reason}")]
    ConfigInvalid {
        /// Offending field
        field: String,
        /// Failure description
        reason: String,
    },

    /// The inbound could not be brought up.
    #[error("Inbound failed to start: {reason}")]
    StartupFailed {
        /// Failure description
        reason: String,
    },

    /// The dispatcher gave up on a link.
    #[error("Dispatch to {destination} failed: {reason}")]
    Dispatch {
        /// Flow destination
        destination: Destination,
        /// Failure description
        reason: String,
    },

    /// The inbound is closed.
    #[error("Inbound is shutting down")]
    ShuttingDown,

    /// Flow I/O error.
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Engine error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Device error.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Creates a `ConfigLoad` error.
    pub fn config_load(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `ConfigInvalid` error.
    pub fn config_invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `StartupFailed` error.
    pub fn startup_failed(reason: impl Into<String>) -> Self {
        Self::StartupFailed {
            reason: reason.into(),
        }
    }

    /// Creates a `Dispatch` error.
    pub fn dispatch(destination: Destination, reason: impl Into<String>) -> Self {
        Self::Dispatch {
            destination,
            reason: reason.into(),
        }
    }

    /// Returns `true` for configuration errors.
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigLoad { .. } | Self::ConfigInvalid { .. })
    }

    /// Returns `true` if the process cannot continue.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::ConfigLoad { .. } | Self::ConfigInvalid { .. } | Self::StartupFailed { .. } => {
                true
            }
            Self::Core(e) => e.is_setup_error(),
            Self::Transport(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// Returns `true` if the error only ended one flow.
    #[must_use]
    pub const fn is_per_flow(&self) -> bool {
        matches!(self, Self::Dispatch { .. } | Self::Common(_) | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ServerError::config_load("/etc/tunlink.toml", "file not found");
        assert!(err.to_string().contains("/etc/tunlink.toml"));

        let dest = Destination::tcp("192.0.2.1:443".parse().unwrap());
        let err = ServerError::dispatch(dest, "connection refused");
        assert_eq!(
            err.to_string(),
            "Dispatch to tcp:192.0.2.1:443 failed: connection refused"
        );
    }

    #[test]
    fn test_error_classification() {
        let config_err = ServerError::config_invalid("tun.mtu", "must be at least 576");
        assert!(config_err.is_config_error());
        assert!(config_err.is_fatal());

        let setup = ServerError::from(CoreError::setup("register nic", "boom"));
        assert!(setup.is_fatal());

        let flow = ServerError::from(CommonError::EndOfStream);
        assert!(flow.is_per_flow());
        assert!(!flow.is_fatal());
    }
}
