// ============================================
// File: crates/tunlink-server/src/lib.rs
// ============================================
//! # tunlink Server Library
//!
//! ## Creation Reason
//! Turns the core stack into a runnable program: a TUN inbound whose
//! accepted flows are relayed to the host network.
//!
//! ## Main Functionality
//!
//! ### Modules
//! - [`config`]: TOML configuration
//! - [`inbound`]: device plus network stack lifecycle
//! - [`handlers`]: `ConnectionHandler` feeding the dispatcher
//! - [`dispatcher`]: dispatcher trait and the direct (host socket) relay
//! - [`server`]: process orchestration
//! - [`error`]: server error types
//!
//! ## Data Flow
//! ```text
//! App → TUN → NetStack → TunHandler → Dispatcher → host socket → Internet
//! App ← TUN ← NetStack ← TunHandler ← Dispatcher ← host socket ← Internet
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Server requires root or CAP_NET_ADMIN for TUN
//! - Configuration changes require restart (no hot-reload)
//!
//! ## Last Modified
//! v0.1.0 - Initial server library

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod inbound;
pub mod server;

// Re-export primary types
pub use config::ServerConfig;
pub use dispatcher::{DirectDispatcher, Dispatcher, Link};
pub use error::{Result, ServerError};
pub use handlers::TunHandler;
pub use inbound::TunInbound;
pub use server::Server;
