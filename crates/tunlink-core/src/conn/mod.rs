// ============================================
// File: crates/tunlink-core/src/conn/mod.rs
// ============================================
//! # Connection Adapters
//!
//! ## Creation Reason
//! Accepted flows leave the engine as a stream (`TcpEndpoint`) or a
//! datagram socket (`UdpEndpoint`). The dispatcher only speaks the
//! buffered reader/writer contract, so each flow is wrapped in an adapter
//! before it is handed upward.
//!
//! ## Main Functionality
//! - `Connection`: buffered read + buffered write + close
//! - `StreamConnection`: adapter over any `AsyncRead + AsyncWrite`
//! - `DatagramConnection`: adapter over a `DatagramSocket`, tagging every
//!   buffer with its peer address
//!
//! ## Last Modified
//! v0.1.0 - Initial connection adapters

mod datagram;
mod stream;

use async_trait::async_trait;
use tunlink_common::{BufferedReader, BufferedWriter};

pub use datagram::{DatagramConnection, DatagramSocket};
pub use stream::StreamConnection;

/// An accepted flow as seen by the handler.
#[async_trait]
pub trait Connection: BufferedReader + BufferedWriter {
    /// Closes the flow. Idempotent; pending reads observe end of stream.
    async fn close(&self);
}
