// ============================================
// File: crates/tunlink-core/src/engine/tcp.rs
// ============================================
//! # TCP Forwarder and Endpoint
//!
//! ## Creation Reason
//! Every SYN for an unknown 4-tuple is offered to a forwarder callback
//! before smoltcp sees it. The callback decides whether the connection
//! gets an endpoint, is reset, or is silently dropped.
//!
//! ## Main Functionality
//! - `TcpForwarder`: callback plus receive window and half-open limit
//! - `TcpForwarderRequest`: `create_endpoint` / `complete(send_reset)`
//! - `TcpEndpoint`: `AsyncRead` + `AsyncWrite` over a smoltcp socket
//!
//! ## ⚠️ Important Note for Next Developer
//! - A request dropped without `complete` is answered with RST
//! - Dropping a `TcpEndpoint` closes gracefully (FIN); the poll task
//!   reaps the socket once it reaches `Closed` or `TimeWait`
//!
//! ## Last Modified
//! v0.1.0 - Initial TCP forwarder

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use smoltcp::iface::SocketHandle;
use smoltcp::socket::tcp::State;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{wire, EngineInner, TransportEndpointId};
use crate::error::{CoreError, Result};
use crate::packet::PacketBuffer;

type TcpCallback = dyn Fn(TcpForwarderRequest) + Send + Sync;

/// Unanswered keep-alive intervals before a connection is dropped.
const KEEP_ALIVE_PROBES: u64 = 9;

// ============================================
// TcpForwarder
// ============================================

/// Accept callback for inbound TCP connections.
pub struct TcpForwarder {
    receive_window: usize,
    max_in_flight: usize,
    handler: Box<TcpCallback>,
}

impl TcpForwarder {
    /// Creates a forwarder.
    ///
    /// `receive_window` caps the socket receive buffer (0 keeps the engine
    /// setting); SYNs arriving while `max_in_flight` connections are still
    /// half-open are dropped.
    pub fn new(
        receive_window: usize,
        max_in_flight: usize,
        handler: impl Fn(TcpForwarderRequest) + Send + Sync + 'static,
    ) -> Self {
        Self {
            receive_window,
            max_in_flight,
            handler: Box::new(handler),
        }
    }

    /// Receive window cap, 0 for the engine default.
    #[must_use]
    pub const fn receive_window(&self) -> usize {
        self.receive_window
    }

    /// Half-open connection limit.
    #[must_use]
    pub const fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub(crate) fn dispatch(&self, request: TcpForwarderRequest) {
        (self.handler)(request);
    }
}

impl std::fmt::Debug for TcpForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpForwarder")
            .field("receive_window", &self.receive_window)
            .field("max_in_flight", &self.max_in_flight)
            .finish_non_exhaustive()
    }
}

// ============================================
// TcpForwarderRequest
// ============================================

/// One pending inbound connection.
pub struct TcpForwarderRequest {
    engine: Arc<EngineInner>,
    id: TransportEndpointId,
    syn: Option<PacketBuffer>,
    receive_window: usize,
}

impl TcpForwarderRequest {
    pub(crate) fn new(
        engine: Arc<EngineInner>,
        id: TransportEndpointId,
        syn: PacketBuffer,
        receive_window: usize,
    ) -> Self {
        Self {
            engine,
            id,
            syn: Some(syn),
            receive_window,
        }
    }

    /// Addresses of the connection.
    #[must_use]
    pub const fn id(&self) -> TransportEndpointId {
        self.id
    }

    /// Accepts the connection and returns its endpoint. The SYN-ACK has
    /// been queued by the time this returns.
    ///
    /// # Errors
    /// The request was already accepted, spoofing is disabled for a
    /// non-local address, or the engine is closed.
    pub fn create_endpoint(&mut self) -> Result<TcpEndpoint> {
        let syn = self
            .syn
            .clone()
            .ok_or_else(|| CoreError::endpoint("request already accepted"))?;
        let handle = self.engine.open_tcp(self.id, syn, self.receive_window)?;
        self.syn = None;

        Ok(TcpEndpoint {
            engine: Arc::clone(&self.engine),
            handle,
            id: self.id,
        })
    }

    /// Finishes the request. Without an endpoint, `send_reset` answers
    /// the SYN with RST; otherwise the SYN is dropped.
    pub fn complete(mut self, send_reset: bool) {
        if let Some(syn) = self.syn.take() {
            if send_reset {
                self.engine.enqueue(syn);
            }
        }
    }
}

impl Drop for TcpForwarderRequest {
    fn drop(&mut self) {
        if let Some(syn) = self.syn.take() {
            self.engine.enqueue(syn);
        }
    }
}

impl std::fmt::Debug for TcpForwarderRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpForwarderRequest")
            .field("id", &self.id)
            .field("accepted", &self.syn.is_none())
            .finish()
    }
}

// ============================================
// TcpEndpoint
// ============================================

/// An accepted TCP connection.
pub struct TcpEndpoint {
    engine: Arc<EngineInner>,
    handle: SocketHandle,
    id: TransportEndpointId,
}

const fn is_opening(state: State) -> bool {
    matches!(state, State::Listen | State::SynReceived | State::SynSent)
}

fn closed_error(reason: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, reason)
}

impl TcpEndpoint {
    /// Addresses the connection was accepted for.
    #[must_use]
    pub const fn id(&self) -> TransportEndpointId {
        self.id
    }

    /// Local address as seen by the socket (the original destination).
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.engine
            .with_tcp(self.handle, |s| s.local_endpoint())
            .flatten()
            .map(wire::to_socket_addr)
    }

    /// Remote address as seen by the socket (the original source).
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.engine
            .with_tcp(self.handle, |s| s.remote_endpoint())
            .flatten()
            .map(wire::to_socket_addr)
    }

    /// Enables or disables keep-alive probes at the engine's interval.
    ///
    /// While enabled, a peer silent for `KEEP_ALIVE_PROBES` intervals
    /// gets the connection reset.
    pub fn set_keep_alive(&self, enabled: bool) {
        let interval = self.engine.keep_alive_interval();
        let interval = enabled.then(|| to_smol_duration(interval));
        let timeout = interval.map(|i| {
            smoltcp::time::Duration::from_micros(i.total_micros().saturating_mul(KEEP_ALIVE_PROBES))
        });
        self.engine.with_tcp(self.handle, |s| {
            s.set_keep_alive(interval);
            s.set_timeout(timeout);
        });
    }

    /// Returns true if keep-alive probes are enabled.
    #[must_use]
    pub fn keep_alive(&self) -> bool {
        self.engine
            .with_tcp(self.handle, |s| s.keep_alive().is_some())
            .unwrap_or(false)
    }

    /// Resets the connection.
    pub fn abort(&self) {
        self.engine.with_tcp(self.handle, |s| s.abort());
        self.engine.wake_poller();
    }
}

fn to_smol_duration(d: Duration) -> smoltcp::time::Duration {
    smoltcp::time::Duration::from_millis(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

impl AsyncRead for TcpEndpoint {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let this = self.get_mut();
        let polled = this.engine.with_tcp(this.handle, |socket| {
            if socket.can_recv() {
                let n = socket.recv_slice(buf.initialize_unfilled()).unwrap_or(0);
                buf.advance(n);
                Poll::Ready(n)
            } else if socket.may_recv() || is_opening(socket.state()) {
                socket.register_recv_waker(cx.waker());
                Poll::Pending
            } else {
                Poll::Ready(0)
            }
        });

        match polled {
            Some(Poll::Pending) => Poll::Pending,
            Some(Poll::Ready(n)) => {
                if n > 0 {
                    // Window update.
                    this.engine.wake_poller();
                }
                Poll::Ready(Ok(()))
            }
            None => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for TcpEndpoint {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let this = self.get_mut();
        let polled = this.engine.with_tcp(this.handle, |socket| {
            if socket.can_send() {
                Poll::Ready(
                    socket
                        .send_slice(data)
                        .map_err(|_| closed_error("connection closed")),
                )
            } else if socket.may_send() || is_opening(socket.state()) {
                socket.register_send_waker(cx.waker());
                Poll::Pending
            } else {
                Poll::Ready(Err(closed_error("connection closed")))
            }
        });

        match polled {
            Some(Poll::Ready(Ok(n))) => {
                this.engine.wake_poller();
                Poll::Ready(Ok(n))
            }
            Some(other) => other,
            None => Poll::Ready(Err(closed_error("protocol engine closed"))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.engine.with_tcp(this.handle, |s| s.close());
        this.engine.wake_poller();
        Poll::Ready(Ok(()))
    }
}

impl Drop for TcpEndpoint {
    fn drop(&mut self) {
        self.engine.release_tcp(self.handle);
    }
}

impl std::fmt::Debug for TcpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpEndpoint")
            .field("local", &self.id.local)
            .field("remote", &self.id.remote)
            .finish()
    }
}

// ============================================
// Tests
// ============================================
