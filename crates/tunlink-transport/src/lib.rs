// ============================================
// File: crates/tunlink-transport/src/lib.rs
// ============================================
//! # tunlink Transport - TUN Device Layer
//!
//! ## Creation Reason
//! Performs raw IP packet I/O against a virtual interface. Under load
//! the read path trades CPU spin for wake-up latency based on measured
//! throughput, and shutdown is safe under concurrent in-flight I/O.
//!
//! ## Main Functionality
//! - [`traits`]: `TunDevice` capability set and `TunConfig`
//! - [`rate`]: `RateEstimator` and `PollPolicy`
//! - [`tun`]: generic `RingDevice` and platform rings
//! - [`error`]: Transport-specific error types
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              tunlink-server                         │
//! │                    │                                │
//! │         ┌──────────┴──────────┐                    │
//! │         ▼                     ▼                    │
//! │   tunlink-core  ──────► tunlink-transport          │
//! │                         You are here ◄──           │
//! │         │                     │                    │
//! │         └──────────┬──────────┘                    │
//! │                    ▼                               │
//! │             tunlink-common                         │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Platform Support
//! | Platform | TUN |
//! |----------|-----|
//! | Linux | ✅ |
//! | other | ❌ (`Unsupported`) |
//!
//! ## ⚠️ Important Note for Next Developer
//! - TUN operations require elevated privileges
//! - Mock implementations available with `mock` feature
//!
//! ## Last Modified
//! v0.1.0 - Initial transport layer implementation

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod rate;
pub mod traits;
pub mod tun;

// Re-export primary types
pub use error::{Result, TransportError};
pub use rate::{PollPolicy, RateEstimator};
pub use traits::{TunConfig, TunDevice};
pub use tun::{DeviceState, PacketRing, RingDevice};

#[cfg(target_os = "linux")]
pub use tun::linux::LinuxTun;
