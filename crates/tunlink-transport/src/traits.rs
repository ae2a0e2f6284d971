// ============================================
// File: crates/tunlink-transport/src/traits.rs
// ============================================
//! # Device Traits
//!
//! ## Creation Reason
//! Defines the capability set every platform TUN adapter provides, so
//! the link bridge and the protocol engine never depend on a concrete
//! platform.
//!
//! ## Main Functionality
//! - `TunDevice`: blocking packet read/write plus idempotent close
//! - `TunConfig`: device session creation parameters
//!
//! ## ⚠️ Important Note for Next Developer
//! - `read` blocks the calling thread; run it on a dedicated thread, not
//!   on an async worker
//! - `write` never blocks on a full send ring; it returns `Ok(0)`
//! - Implementations must be `Send + Sync`: one reader and many writers
//!   share a device
//!
//! ## Last Modified
//! v0.1.0 - Initial trait definitions

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::{Result, TransportError};

// ============================================
// Constants
// ============================================

/// MTU used when the configuration leaves it unset (0).
pub const DEFAULT_MTU: u32 = 9000;

/// Smallest MTU an IPv4 host must accept.
pub const MIN_MTU: u32 = 576;

/// Largest MTU representable in an IP total-length field.
pub const MAX_MTU: u32 = 65535;

/// Linux limit on interface names (IFNAMSIZ - 1).
pub const MAX_NAME_LEN: usize = 15;

/// Address assigned when the configuration names none.
pub const DEFAULT_INET4: Ipv4Net = Ipv4Net::new_assert(Ipv4Addr::new(10, 255, 0, 1), 24);

// ============================================
// TunDevice Trait
// ============================================

/// Raw IP packet I/O against a virtual interface.
///
/// # Data Format
/// Packets are raw IP (no Ethernet header, no packet-info prefix).
///
/// # Lifecycle
/// Once `close` has been called, every `read` and `write` returns
/// [`TransportError::Closed`], including calls that were already in
/// progress. `close` returns only after those calls have left the device.
pub trait TunDevice: Send + Sync {
    /// Reads one packet, blocking until one is available.
    ///
    /// # Errors
    /// - `Closed` once close has been requested or the device vanished
    /// - `RingCorrupt` / `Io` on unrecoverable device faults
    fn read(&self) -> Result<Vec<u8>>;

    /// Writes one packet.
    ///
    /// Returns the number of bytes written, or `0` if the device's send
    /// capacity is momentarily exhausted.
    ///
    /// # Errors
    /// - `Closed` once close has been requested or the device vanished
    /// - `Io` on any other device fault
    fn write(&self, packet: &[u8]) -> Result<usize>;

    /// Closes the device. Idempotent; blocks until in-flight I/O drains.
    ///
    /// # Errors
    /// Platform teardown failures. The device is unusable afterwards
    /// either way.
    fn close(&self) -> Result<()>;

    /// Interface name.
    fn name(&self) -> &str;

    /// Interface MTU.
    fn mtu(&self) -> u32;
}

// ============================================
// TunConfig
// ============================================

/// Parameters for creating a device session.
///
/// # Example
/// ```
/// use tunlink_transport::traits::TunConfig;
///
/// let config = TunConfig::new("tunlink0")
///     .with_inet4("10.255.0.1/24".parse().unwrap())
///     .with_mtu(0)
///     .with_auto_route(true);
///
/// assert_eq!(config.effective_mtu(), 9000);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunConfig {
    /// Interface name (e.g., "tunlink0").
    pub name: String,
    /// IPv4 address and prefix assigned to the interface.
    pub inet4: Ipv4Net,
    /// MTU; 0 selects [`DEFAULT_MTU`].
    pub mtu: u32,
    /// Install a default route through the interface.
    pub auto_route: bool,
}

impl TunConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inet4: DEFAULT_INET4,
            mtu: 0,
            auto_route: false,
        }
    }

    /// Sets the IPv4 address and prefix.
    #[must_use]
    pub const fn with_inet4(mut self, inet4: Ipv4Net) -> Self {
        self.inet4 = inet4;
        self
    }

    /// Sets the MTU (0 selects the default).
    #[must_use]
    pub const fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    /// Sets whether a default route is installed.
    #[must_use]
    pub const fn with_auto_route(mut self, auto_route: bool) -> Self {
        self.auto_route = auto_route;
        self
    }

    /// MTU with the unset value resolved.
    #[must_use]
    pub const fn effective_mtu(&self) -> u32 {
        if self.mtu == 0 {
            DEFAULT_MTU
        } else {
            self.mtu
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// `InvalidConfig` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(TransportError::invalid_config(
                "name",
                "device name cannot be empty",
            ));
        }

        if self.name.len() > MAX_NAME_LEN {
            return Err(TransportError::invalid_config(
                "name",
                format!("device name cannot exceed {MAX_NAME_LEN} characters"),
            ));
        }

        let mtu = self.effective_mtu();
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(TransportError::invalid_config(
                "mtu",
                format!("MTU must be within {MIN_MTU}..={MAX_MTU}, got {mtu}"),
            ));
        }

        Ok(())
    }
}

impl Default for TunConfig {
    fn default() -> Self {
        Self::new("tunlink0")
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tun_config_defaults() {
        let config = TunConfig::default();

        assert_eq!(config.name, "tunlink0");
        assert_eq!(config.inet4.to_string(), "10.255.0.1/24");
        assert_eq!(config.mtu, 0);
        assert_eq!(config.effective_mtu(), DEFAULT_MTU);
        assert!(!config.auto_route);
    }

    #[test]
    fn test_tun_config_builder() {
        let config = TunConfig::new("test0")
            .with_inet4("172.19.0.1/30".parse().unwrap())
            .with_mtu(1500)
            .with_auto_route(true);

        assert_eq!(config.inet4.addr(), Ipv4Addr::new(172, 19, 0, 1));
        assert_eq!(config.inet4.prefix_len(), 30);
        assert_eq!(config.effective_mtu(), 1500);
        assert!(config.auto_route);
    }

    #[test]
    fn test_tun_config_validation() {
        assert!(TunConfig::new("tun0").validate().is_ok());
        assert!(TunConfig::new("").validate().is_err());
        assert!(TunConfig::new("a".repeat(16)).validate().is_err());
        assert!(TunConfig::new("tun0").with_mtu(100).validate().is_err());
        assert!(TunConfig::new("tun0").with_mtu(70_000).validate().is_err());
        assert!(TunConfig::new("tun0").with_mtu(65535).validate().is_ok());
    }
}
