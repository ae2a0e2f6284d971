// ============================================
// File: crates/tunlink-common/src/types.rs
// ============================================
//! # Core Type Definitions
//!
//! ## Creation Reason
//! Centralizes the identifiers and addressing types that travel with an
//! intercepted flow from the protocol engine up to the dispatcher.
//!
//! ## Main Functionality
//! - `SessionId`: Unique identifier minted per accepted connection
//! - `Network`: Transport of a flow (TCP or UDP)
//! - `Destination`: A network-tagged socket address
//!
//! ## ⚠️ Important Note for Next Developer
//! - SessionId uses a cryptographically secure RNG; keep it that way,
//!   the id ends up in logs that may be shared
//! - Display of SessionId is base64 (base64 0.21 engine API); it is a
//!   log token only and is never parsed back
//!
//! ## Last Modified
//! v0.1.0 - Initial type definitions

use std::fmt;
use std::net::SocketAddr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;

// ============================================
// Constants
// ============================================

/// Size of SessionId in bytes
pub const SESSION_ID_SIZE: usize = 16;

// ============================================
// SessionId
// ============================================

/// Unique identifier for one accepted connection.
///
/// # Example
/// ```
/// use tunlink_common::types::SessionId;
///
/// let session_id = SessionId::generate();
/// let restored = SessionId::from_bytes(session_id.as_bytes()).unwrap();
/// assert_eq!(session_id, restored);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; SESSION_ID_SIZE]);

impl SessionId {
    /// Creates a new `SessionId` from raw bytes.
    ///
    /// Returns `None` if `bytes` is not exactly 16 bytes long.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let id: [u8; SESSION_ID_SIZE] = bytes.try_into().ok()?;
        Some(Self(id))
    }

    /// Generates a new random `SessionId`.
    #[must_use]
    pub fn generate() -> Self {
        let mut id = [0u8; SESSION_ID_SIZE];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    /// Returns the raw bytes of the session ID.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; SESSION_ID_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SessionId({:02x}{:02x}{:02x}{:02x}...)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BASE64.encode(self.0))
    }
}

// ============================================
// Network / Destination
// ============================================

/// Transport protocol of an intercepted flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    /// Stream flow
    Tcp,
    /// Datagram flow
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// A socket address tagged with its transport.
///
/// Used both as the dispatch key for a flow and as the out-of-band peer
/// address carried by datagram buffers.
///
/// # Example
/// ```
/// use tunlink_common::types::Destination;
///
/// let dest = Destination::udp("198.51.100.9:53".parse().unwrap());
/// assert_eq!(dest.to_string(), "udp:198.51.100.9:53");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Destination {
    /// Transport of the flow
    pub network: Network,
    /// Socket address
    pub address: SocketAddr,
}

impl Destination {
    /// Creates a TCP destination.
    #[must_use]
    pub const fn tcp(address: SocketAddr) -> Self {
        Self {
            network: Network::Tcp,
            address,
        }
    }

    /// Creates a UDP destination.
    #[must_use]
    pub const fn udp(address: SocketAddr) -> Self {
        Self {
            network: Network::Udp,
            address,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.address)
    }
}

// ============================================
// Tests
// ============================================
