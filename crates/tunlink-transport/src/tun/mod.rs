// ============================================
// File: crates/tunlink-transport/src/tun/mod.rs
// ============================================
//! # TUN Device Module
//!
//! ## Creation Reason
//! Groups the generic ring adapter and its platform rings.
//!
//! ## Platform Implementations
//! - `ring`: platform-independent adaptive polling and close state machine
//! - `linux`: `/dev/net/tun` ring with `poll(2)` / `eventfd`
//! - `mock`: in-memory ring for testing
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  link bridge / engine        │
//! └──────────────┬───────────────┘
//!                │ TunDevice
//! ┌──────────────▼───────────────┐
//! │  RingDevice<R>               │  spin/park, rate, Open→Closing→Closed
//! └──────────────┬───────────────┘
//!                │ PacketRing
//!      ┌─────────┴─────────┐
//!  LinuxRing           MemoryRing
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - TUN operations require root or CAP_NET_ADMIN capability
//! - TUN packets are raw IP (no Ethernet header)
//! - A new platform only needs a `PacketRing`
//!
//! ## Last Modified
//! v0.1.0 - Initial TUN module structure

use std::sync::Arc;

use crate::error::Result;
use crate::traits::{TunConfig, TunDevice};

pub mod ring;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use ring::{DeviceState, PacketRing, RingDevice, RingRecv, RingSend};

#[cfg(target_os = "linux")]
pub use linux::LinuxTun;

#[cfg(any(test, feature = "mock"))]
pub use mock::{MemoryRing, MockTun, RingEvent};

/// Creates the platform device session for `config`.
///
/// # Errors
/// Creation or provisioning failure; `Unsupported` where no platform
/// adapter exists.
pub fn create(config: TunConfig) -> Result<Arc<dyn TunDevice>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(LinuxTun::create(config)?))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = config;
        Err(crate::error::TransportError::Unsupported)
    }
}
