// ============================================
// File: crates/tunlink-core/src/packet.rs
// ============================================
//! # Engine Packet Buffer
//!
//! ## Creation Reason
//! Packets cross between the link bridge and the protocol engine with
//! shared ownership: the bridge holds a reference for the duration of one
//! delivery and the engine keeps its own while the packet is queued.
//!
//! ## Main Functionality
//! - `NetworkProtocol`: IPv4 / IPv6 tag
//! - `ip_version`: classifies a raw packet by its leading version nibble
//! - `PacketBuffer`: reference-counted, possibly fragmented packet bytes
//!
//! ## ⚠️ Important Note for Next Developer
//! - A `PacketBuffer` reference is released exactly once, by drop.
//!   `clone()` is an acquisition; there is no manual inc/dec.
//!
//! ## Last Modified
//! v0.1.0 - Initial packet buffer

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

// ============================================
// NetworkProtocol
// ============================================

/// Network-layer protocol of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkProtocol {
    /// IPv4 (version nibble 4)
    Ipv4,
    /// IPv6 (version nibble 6)
    Ipv6,
}

impl NetworkProtocol {
    /// Numeric IP version.
    #[must_use]
    pub const fn version(self) -> u8 {
        match self {
            Self::Ipv4 => 4,
            Self::Ipv6 => 6,
        }
    }
}

impl fmt::Display for NetworkProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4 => write!(f, "ipv4"),
            Self::Ipv6 => write!(f, "ipv6"),
        }
    }
}

/// Classifies a raw packet by the top nibble of its first byte.
///
/// Returns `None` for anything that is not version 4 or 6.
#[must_use]
pub const fn ip_version(first_byte: u8) -> Option<NetworkProtocol> {
    match first_byte >> 4 {
        4 => Some(NetworkProtocol::Ipv4),
        6 => Some(NetworkProtocol::Ipv6),
        _ => None,
    }
}

// ============================================
// PacketBuffer
// ============================================

#[derive(Debug)]
struct PacketData {
    protocol: NetworkProtocol,
    segments: Vec<Bytes>,
}

/// Reference-counted packet shared between the bridge and the engine.
///
/// # Example
/// ```
/// use bytes::Bytes;
/// use tunlink_core::packet::{NetworkProtocol, PacketBuffer};
///
/// let pkt = PacketBuffer::from_bytes(NetworkProtocol::Ipv4, Bytes::from_static(&[0x45, 0]));
/// let queued = pkt.clone();
/// assert_eq!(pkt.ref_count(), 2);
/// drop(queued);
/// assert_eq!(pkt.ref_count(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct PacketBuffer {
    inner: Arc<PacketData>,
}

impl PacketBuffer {
    /// Wraps a single contiguous packet.
    #[must_use]
    pub fn from_bytes(protocol: NetworkProtocol, bytes: Bytes) -> Self {
        Self::from_segments(protocol, vec![bytes])
    }

    /// Wraps a packet made of several slices, in order.
    #[must_use]
    pub fn from_segments(protocol: NetworkProtocol, segments: Vec<Bytes>) -> Self {
        Self {
            inner: Arc::new(PacketData { protocol, segments }),
        }
    }

    /// Network protocol tag.
    #[must_use]
    pub fn protocol(&self) -> NetworkProtocol {
        self.inner.protocol
    }

    /// The packet's slices.
    #[must_use]
    pub fn segments(&self) -> &[Bytes] {
        &self.inner.segments
    }

    /// Total length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.segments.iter().map(Bytes::len).sum()
    }

    /// Returns true if the packet carries no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The packet as one contiguous slice. Borrows when there is a single
    /// segment, copies otherwise.
    #[must_use]
    pub fn to_contiguous(&self) -> Cow<'_, [u8]> {
        match self.inner.segments.as_slice() {
            [] => Cow::Borrowed(&[]),
            [single] => Cow::Borrowed(single.as_ref()),
            many => {
                let mut flat = Vec::with_capacity(self.len());
                for segment in many {
                    flat.extend_from_slice(segment);
                }
                Cow::Owned(flat)
            }
        }
    }

    /// Live references to this packet, including this one.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Releases this reference.
    pub fn release(self) {
        drop(self);
    }
}

// ============================================
// Tests
// ============================================
