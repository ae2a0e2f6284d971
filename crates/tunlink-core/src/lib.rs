// ============================================
// File: crates/tunlink-core/src/lib.rs
// ============================================
//! # tunlink Core - Link Bridge and Protocol Engine
//!
//! ## Creation Reason
//! Sits between the TUN device and the dispatcher: feeds raw packets into
//! a user-space TCP/IP engine, accepts every TCP and UDP flow for any
//! destination, and hands each one upward as a buffered connection.
//!
//! ## Main Functionality
//! - [`packet`]: reference-counted engine packet buffer, IP version tag
//! - [`link`]: link-layer contract and the `LinkBridge` dispatch loop
//! - [`engine`]: smoltcp-backed engine, forwarders and endpoints
//! - [`conn`]: stream and datagram adapters to the buffered I/O contract
//! - [`netstack`]: ordered engine bring-up over one link
//! - [`handler`]: `ConnectionHandler`, the upward contract
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              tunlink-server                         │
//! │                    │                                │
//! │         ┌──────────┴──────────┐                    │
//! │         ▼                     ▼                    │
//! │   tunlink-core  ──────► tunlink-transport          │
//! │   You are here                │                    │
//! │         │                     │                    │
//! │         └──────────┬──────────┘                    │
//! │                    ▼                               │
//! │             tunlink-common                         │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use tunlink_common::Context;
//! use tunlink_core::handler::ConnectionHandler;
//! use tunlink_core::link::TunDeviceExt;
//! use tunlink_core::netstack::{NetStack, StackConfig};
//! use tunlink_transport::TunDevice;
//!
//! # fn demo(device: Arc<dyn TunDevice>, handler: Arc<dyn ConnectionHandler>) -> tunlink_core::Result<()> {
//! let link = device.new_endpoint();
//! let stack = NetStack::new(StackConfig::default(), link, handler, Context::new());
//! stack.start()?;
//! # Ok(()) }
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - The engine owns flow state; the link bridge only moves packets
//! - Packet buffers are released by drop, exactly once per clone
//!
//! ## Last Modified
//! v0.1.0 - Initial implementation

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod conn;
pub mod engine;
pub mod error;
pub mod handler;
pub mod link;
pub mod netstack;
pub mod packet;

// Re-export commonly used items
pub use conn::{Connection, DatagramConnection, StreamConnection};
pub use error::{CoreError, LinkWriteError, Result};
pub use handler::ConnectionHandler;
pub use link::{LinkBridge, LinkEndpoint, NetworkDispatcher, TunDeviceExt};
pub use netstack::{NetStack, StackConfig};
pub use packet::{NetworkProtocol, PacketBuffer};
