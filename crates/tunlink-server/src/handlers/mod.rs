// ============================================
// File: crates/tunlink-server/src/handlers/mod.rs
// ============================================
//! # Handlers
//!
//! ## Creation Reason
//! Accepted connections leave the core through `ConnectionHandler`. This
//! module implements it for the server.
//!
//! ## Handler Architecture
//! ```text
//! NetStack forwarder ──spawn──► TunHandler::on_new_tcp / on_new_udp
//!                                  │ mint SessionId, attach InboundInfo
//!                                  ▼
//!                             Dispatcher::dispatch_link(ctx, destination, link)
//!                                  │ returns when the flow is over
//!                                  ▼
//!                             Connection::close
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Handlers run on their own task; blocking here never stalls packet
//!   ingestion, but a dispatcher that never returns leaks the flow
//!
//! ## Last Modified
//! v0.1.0 - Initial handlers structure

pub mod connection;

pub use connection::{ConnectionEvent, ConnectionEventSink, TracingEventSink, TunHandler};
