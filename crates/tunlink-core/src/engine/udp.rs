// ============================================
// File: crates/tunlink-core/src/engine/udp.rs
// ============================================
//! # UDP Forwarder and Endpoint
//!
//! ## Creation Reason
//! UDP has no handshake, so the first datagram of an unknown
//! (local, remote) pair is what announces a flow. The forwarder callback
//! turns it into an endpoint; later datagrams of the same pair are queued
//! to that endpoint until it closes.
//!
//! ## Main Functionality
//! - `UdpForwarder`: accept callback
//! - `UdpForwarderRequest`: the announcing datagram
//! - `UdpEndpoint`: `recv_from` / `send_to` bound to the original
//!   destination address
//!
//! ## ⚠️ Important Note for Next Developer
//! - The flow queue is bounded; datagrams arriving while it is full are
//!   dropped, as on any UDP path.
//! - Replies are built here and written straight to the link. They never
//!   pass through smoltcp.
//!
//! ## Last Modified
//! v0.1.0 - Initial UDP forwarder

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

use super::{wire, EngineInner, TransportEndpointId};
use crate::error::Result;

type UdpCallback = dyn Fn(UdpForwarderRequest) + Send + Sync;

/// Accept callback for new UDP flows.
pub struct UdpForwarder {
    handler: Box<UdpCallback>,
}

impl UdpForwarder {
    /// Creates a forwarder invoking `handler` once per new flow.
    pub fn new(handler: impl Fn(UdpForwarderRequest) + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
        }
    }

    pub(crate) fn dispatch(&self, request: UdpForwarderRequest) {
        (self.handler)(request);
    }
}

impl std::fmt::Debug for UdpForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpForwarder").finish_non_exhaustive()
    }
}

/// First datagram of a flow, awaiting a decision.
pub struct UdpForwarderRequest {
    engine: Arc<EngineInner>,
    id: TransportEndpointId,
    payload: Bytes,
}

impl UdpForwarderRequest {
    pub(crate) fn new(engine: Arc<EngineInner>, id: TransportEndpointId, payload: Bytes) -> Self {
        Self {
            engine,
            id,
            payload,
        }
    }

    /// Addresses of the flow.
    #[must_use]
    pub const fn id(&self) -> TransportEndpointId {
        self.id
    }

    /// The announcing datagram's payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Accepts the flow. The announcing datagram is the first one
    /// `recv_from` returns.
    ///
    /// # Errors
    /// Spoofing is disabled for a non-local address, the flow already has
    /// an endpoint, or the engine is closed.
    pub fn create_endpoint(self) -> Result<UdpEndpoint> {
        let (generation, rx) = self.engine.open_udp(self.id, self.payload)?;
        Ok(UdpEndpoint {
            engine: self.engine,
            id: self.id,
            generation,
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
        })
    }
}

impl std::fmt::Debug for UdpForwarderRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpForwarderRequest")
            .field("id", &self.id)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// An accepted UDP flow.
pub struct UdpEndpoint {
    engine: Arc<EngineInner>,
    id: TransportEndpointId,
    generation: u64,
    rx: Mutex<mpsc::Receiver<Bytes>>,
    closed: AtomicBool,
}

impl UdpEndpoint {
    /// Addresses of the flow.
    #[must_use]
    pub const fn id(&self) -> TransportEndpointId {
        self.id
    }

    /// The original destination, which replies are sent from.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.id.local
    }

    /// The peer that opened the flow.
    #[must_use]
    pub const fn remote_addr(&self) -> SocketAddr {
        self.id.remote
    }

    /// Receives the next datagram of the flow. A datagram longer than
    /// `buf` is truncated.
    ///
    /// # Errors
    /// `UnexpectedEof` once the endpoint or the engine is closed.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(eof());
        }
        let datagram = self.rx.lock().await.recv().await.ok_or_else(eof)?;
        let n = datagram.len().min(buf.len());
        if n < datagram.len() {
            trace!(remote = %self.id.remote, len = datagram.len(), "Truncating UDP datagram");
        }
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok((n, self.id.remote))
    }

    /// Sends `data` to `target` with the flow's local address as source.
    ///
    /// # Errors
    /// The endpoint is closed, the datagram exceeds the link MTU, the
    /// target family differs, or the link write fails.
    pub async fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "endpoint closed"));
        }
        let nic = self
            .engine
            .nic()
            .map_err(|e| io::Error::new(io::ErrorKind::NotConnected, e.to_string()))?;

        let packet = wire::build_udp(self.id.local, target, data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let mtu = nic.link.mtu() as usize;
        if packet.len() > mtu {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("datagram of {} bytes exceeds MTU {mtu}", packet.len()),
            ));
        }

        nic.link
            .write_packets(vec![packet])
            .map_err(|e| io::Error::from(e.source))?;
        Ok(data.len())
    }

    /// Closes the endpoint and removes the flow. Further datagrams of the
    /// same pair announce a new flow.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.engine.close_udp(&self.id, self.generation);
    }
}

fn eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "UDP flow closed")
}

impl Drop for UdpEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for UdpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpEndpoint")
            .field("local", &self.id.local)
            .field("remote", &self.id.remote)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::Fixture;
    use crate::packet::NetworkProtocol;
    use std::sync::atomic::AtomicUsize;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn datagram(from: SocketAddr, to: SocketAddr, payload: &[u8]) -> Vec<u8> {
        wire::build_udp(from, to, payload)
            .unwrap()
            .to_contiguous()
            .into_owned()
    }

    fn accept_into(
        fx: &Fixture,
    ) -> (mpsc::UnboundedReceiver<UdpEndpoint>, Arc<AtomicUsize>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        fx.engine.set_udp_forwarder(UdpForwarder::new(move |req| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Ok(endpoint) = req.create_endpoint() {
                let _ = tx.send(endpoint);
            }
        }));
        (rx, calls)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_first_datagram_reaches_endpoint() {
        let fx = Fixture::new();
        let (mut accepted, _) = accept_into(&fx);
        let client = addr("10.0.0.2:40000");
        let server = addr("198.51.100.9:53");

        fx.inject(datagram(client, server, b"query"));
        let endpoint = accepted.recv().await.unwrap();
        assert_eq!(endpoint.local_addr(), server);
        assert_eq!(endpoint.remote_addr(), client);

        let mut buf = [0u8; 64];
        let (n, peer) = endpoint.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"query");
        assert_eq!(peer, client);

        drop(endpoint);
        fx.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_follow_up_datagrams_queue_to_same_flow() {
        let fx = Fixture::new();
        let (mut accepted, calls) = accept_into(&fx);
        let client = addr("10.0.0.2:40001");
        let server = addr("198.51.100.9:53");

        fx.inject(datagram(client, server, b"one"));
        let endpoint = accepted.recv().await.unwrap();
        fx.inject(datagram(client, server, b"two"));

        let mut buf = [0u8; 64];
        let (n, _) = endpoint.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"one");
        let (n, _) = endpoint.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"two");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.engine.udp_flow_count(), 1);

        drop(endpoint);
        fx.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reply_leaves_from_original_destination() {
        let mut fx = Fixture::new();
        let (mut accepted, _) = accept_into(&fx);
        let client = addr("10.0.0.2:40002");
        let server = addr("198.51.100.9:53");

        fx.inject(datagram(client, server, b"ping"));
        let endpoint = accepted.recv().await.unwrap();
        let sent = endpoint.send_to(b"pong", client).await.unwrap();
        assert_eq!(sent, 4);

        let raw = fx.next_packet().await;
        match wire::inspect(NetworkProtocol::Ipv4, &raw) {
            Some(wire::Inspected::Udp(id, payload)) => {
                assert_eq!(id.remote, server);
                assert_eq!(id.local, client);
                assert_eq!(&payload[..], b"pong");
            }
            other => panic!("expected UDP reply, got {:?}", other.is_some()),
        }

        drop(endpoint);
        fx.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_closed_flow_is_announced_again() {
        let fx = Fixture::new();
        let (mut accepted, calls) = accept_into(&fx);
        let client = addr("10.0.0.2:40003");
        let server = addr("198.51.100.9:123");

        fx.inject(datagram(client, server, b"first"));
        let endpoint = accepted.recv().await.unwrap();
        endpoint.close();
        assert_eq!(fx.engine.udp_flow_count(), 0);
        let mut buf = [0u8; 8];
        assert_eq!(
            endpoint.recv_from(&mut buf).await.unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );

        fx.inject(datagram(client, server, b"again"));
        let second = accepted.recv().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // The stale endpoint must not remove the new flow.
        drop(endpoint);
        assert_eq!(fx.engine.udp_flow_count(), 1);

        drop(second);
        fx.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_oversize_reply_rejected() {
        let fx = Fixture::new();
        let (mut accepted, _) = accept_into(&fx);
        let client = addr("10.0.0.2:40004");

        fx.inject(datagram(client, addr("198.51.100.9:9"), b"x"));
        let endpoint = accepted.recv().await.unwrap();
        let err = endpoint.send_to(&[0u8; 2000], client).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        drop(endpoint);
        fx.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fragmented_datagram_opens_one_flow() {
        let fx = Fixture::new();
        let (mut accepted, calls) = accept_into(&fx);
        let client = addr("10.0.0.2:40005");
        let server = addr("198.51.100.9:4500");

        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 241) as u8).collect();
        let [first, second] =
            wire::testing::fragment_v4(&datagram(client, server, &payload), 1480, 0x4242);
        fx.inject(first);
        fx.inject(second);

        let endpoint = accepted.recv().await.unwrap();
        assert_eq!(endpoint.local_addr(), server);
        let mut buf = vec![0u8; 4096];
        let (n, peer) = endpoint.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &payload[..]);
        assert_eq!(peer, client);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.engine.udp_flow_count(), 1);

        drop(endpoint);
        fx.shutdown();
    }
}
