// ============================================
// File: crates/tunlink-core/src/handler.rs
// ============================================
//! Receiver of accepted connections.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tunlink_common::Context;

use crate::conn::Connection;

/// Consumer of every flow the stack accepts.
///
/// Each call runs on its own task; returning ends the stack's interest in
/// the connection. `source` is the peer that opened the flow and
/// `destination` is the address it was sent to.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// A TCP connection completed its handshake.
    async fn on_new_tcp(
        &self,
        ctx: Context,
        conn: Arc<dyn Connection>,
        source: SocketAddr,
        destination: SocketAddr,
    );

    /// A datagram opened a new UDP flow.
    async fn on_new_udp(
        &self,
        ctx: Context,
        conn: Arc<dyn Connection>,
        source: SocketAddr,
        destination: SocketAddr,
    );
}
