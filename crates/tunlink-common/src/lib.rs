// ============================================
// File: crates/tunlink-common/src/lib.rs
// ============================================
//! # tunlink Common - Shared Foundations
//!
//! ## Creation Reason
//! Holds the types every other tunlink crate agrees on: the owned buffer
//! model used on the flow I/O path, flow addressing, session identifiers
//! and the per-connection context.
//!
//! ## Main Functionality
//! - [`buf`]: `Buffer` / `MultiBuffer` with explicit release, and the
//!   buffered reader/writer contracts
//! - [`types`]: `SessionId`, `Network`, `Destination`
//! - [`context`]: per-connection `Context` with cooperative cancellation
//! - [`time`]: monotonic clock helpers and `AtomicInstant`
//! - [`error`]: `CommonError` and `Result`
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              tunlink-server                         │
//! │                    │                                │
//! │         ┌──────────┴──────────┐                    │
//! │         ▼                     ▼                    │
//! │   tunlink-core  ──────► tunlink-transport          │
//! │         │                     │                    │
//! │         └──────────┬──────────┘                    │
//! │                    ▼                               │
//! │             tunlink-common  ◄── You are here       │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - This crate is the foundation - changes affect everything
//! - `Buffer` is intentionally not `Clone`; ownership moves, never copies
//!
//! ## Last Modified
//! v0.1.0 - Initial implementation

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod buf;
pub mod context;
pub mod error;
pub mod time;
pub mod types;

// Re-export commonly used items at crate root
pub use buf::{Buffer, BufferedReader, BufferedWriter, MultiBuffer};
pub use context::{Cancellation, Context, InboundInfo};
pub use error::{CommonError, Result};
pub use types::{Destination, Network, SessionId};
