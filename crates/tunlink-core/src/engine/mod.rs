// ============================================
// File: crates/tunlink-core/src/engine/mod.rs
// ============================================
//! # User-space Protocol Engine
//!
//! ## Creation Reason
//! The stack needs a TCP/IP engine that accepts connections for *any*
//! destination arriving on the link and turns them into endpoints. This
//! module wraps smoltcp with the NIC / route / option / forwarder surface
//! the stack configures.
//!
//! ## Main Functionality
//! - `Engine`: NIC registration, route table, spoofing and promiscuous
//!   flags, TCP options, forwarder registration, close
//! - `TcpForwarder` / `UdpForwarder`: accept callbacks for new flows
//! - `TcpEndpoint` / `UdpEndpoint`: accepted flows
//!
//! ## Main Logical Flow
//! ```text
//! LinkBridge ──deliver──► NicDispatcher ──► EngineInner::deliver
//!                                              │
//!                                   fragments held until reassembled
//!                                              │
//!        ┌──────────────┬─────────────────────┼────────────────┐
//!        ▼              ▼                     ▼                ▼
//!   SYN (new)      TCP segment           UDP (checksummed)   ICMP/other
//!   forwarder ──►  rx queue ──► smoltcp   flow queue or       rx queue
//!   create_endpoint  poll task            UDP forwarder
//!        │
//!        └─► listener socket + immediate poll (addresses resolved)
//!
//! poll task: iface.poll ─► reap released sockets, abort expired ones
//!            ─► flush tx to link
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - smoltcp only accepts packets for non-local destinations through
//!   `any_ip` plus a default route whose gateway is a local address. The
//!   anchor addresses `0.0.0.1/0` and `::1/0` exist only for that.
//! - UDP never enters smoltcp. Flows are keyed by (local, remote) and
//!   replies are built in `wire`.
//! - Fragments are reassembled in `frag` before inspection, so neither
//!   `wire` nor smoltcp ever sees one.
//! - This backend drives a single NIC.
//! - smoltcp never times out a handshake or a close on its own. `reap`
//!   aborts half-open sockets after `HANDSHAKE_TIMEOUT` and released
//!   sockets after `LINGER_TIMEOUT`.
//!
//! ## Last Modified
//! v0.1.0 - Initial smoltcp engine

mod device;
mod frag;
mod tcp;
mod udp;
pub(crate) mod wire;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use parking_lot::{Mutex, RwLock};
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp as smol_tcp;
use smoltcp::time::{Duration as SmolDuration, Instant as SmolInstant};
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, Ipv4Address, Ipv6Address};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{CoreError, Result};
use crate::link::{LinkEndpoint, NetworkDispatcher};
use crate::packet::{NetworkProtocol, PacketBuffer};

pub use device::{PacketQueue, QueueDevice, MAX_RX_QUEUE_DEPTH};
pub use tcp::{TcpEndpoint, TcpForwarder, TcpForwarderRequest};
pub use udp::{UdpEndpoint, UdpForwarder, UdpForwarderRequest};

use frag::{Reassembler, Reassembly};

// ============================================
// Constants
// ============================================

/// Default depth of a UDP flow's datagram queue.
pub const DEFAULT_UDP_QUEUE_DEPTH: usize = 64;

/// Default TCP keep-alive probe interval.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(75);

/// Upper bound on how long the poll task sleeps without a wake-up.
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Half-open sockets whose handshake has not completed after this are aborted.
const HANDSHAKE_TIMEOUT: SmolDuration = SmolDuration::from_secs(30);

/// Released sockets still closing after this are aborted.
const LINGER_TIMEOUT: SmolDuration = SmolDuration::from_secs(60);

const ANCHOR_V4: Ipv4Address = Ipv4Address::new(0, 0, 0, 1);
const ANCHOR_V6: Ipv6Address = Ipv6Address::new(0, 0, 0, 0, 0, 0, 0, 1);

// ============================================
// Identifiers and Options
// ============================================

/// NIC identifier inside the engine.
pub type NicId = u32;

/// The two ends of a flow, named from the engine's side: `local` is the
/// address the peer sent to, `remote` is the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportEndpointId {
    /// Original destination
    pub local: SocketAddr,
    /// Original source
    pub remote: SocketAddr,
}

/// Transport protocols the engine can enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
    /// ICMP for IPv4
    Icmpv4,
    /// ICMP for IPv6
    Icmpv6,
}

/// Protocols and limits chosen at engine creation.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Network protocols accepted on ingress
    pub network_protocols: Vec<NetworkProtocol>,
    /// Transport protocols accepted on ingress
    pub transport_protocols: Vec<TransportProtocol>,
    /// Datagrams queued per UDP flow before new ones are dropped
    pub udp_queue_depth: usize,
}

impl EngineOptions {
    /// IPv4 + IPv6 with TCP, UDP and both ICMPs.
    #[must_use]
    pub fn full() -> Self {
        Self {
            network_protocols: vec![NetworkProtocol::Ipv4, NetworkProtocol::Ipv6],
            transport_protocols: vec![
                TransportProtocol::Tcp,
                TransportProtocol::Udp,
                TransportProtocol::Icmpv4,
                TransportProtocol::Icmpv6,
            ],
            udp_queue_depth: DEFAULT_UDP_QUEUE_DEPTH,
        }
    }

    /// Sets the per-flow UDP queue depth.
    #[must_use]
    pub const fn with_udp_queue_depth(mut self, depth: usize) -> Self {
        self.udp_queue_depth = depth;
        self
    }

    fn has_network(&self, protocol: NetworkProtocol) -> bool {
        self.network_protocols.contains(&protocol)
    }

    fn has_transport(&self, protocol: TransportProtocol) -> bool {
        self.transport_protocols.contains(&protocol)
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::full()
    }
}

/// A route table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Destination subnet
    pub destination: IpNet,
    /// Outgoing NIC
    pub nic: NicId,
}

impl Route {
    /// `0.0.0.0/0` via `nic`.
    #[must_use]
    pub fn default_ipv4(nic: NicId) -> Self {
        Self {
            destination: IpNet::V4(Ipv4Net::new_assert(Ipv4Addr::UNSPECIFIED, 0)),
            nic,
        }
    }

    /// `::/0` via `nic`.
    #[must_use]
    pub fn default_ipv6(nic: NicId) -> Self {
        Self {
            destination: IpNet::V6(Ipv6Net::new_assert(Ipv6Addr::UNSPECIFIED, 0)),
            nic,
        }
    }
}

/// Min / default / max socket buffer size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSizeRange {
    /// Smallest allowed size
    pub min: usize,
    /// Size used without moderation
    pub default: usize,
    /// Size used with moderation
    pub max: usize,
}

impl BufferSizeRange {
    /// Same `default` and `max`, `min` of 1.
    #[must_use]
    pub const fn fixed(size: usize) -> Self {
        Self {
            min: 1,
            default: size,
            max: size,
        }
    }

    fn validate(&self, option: &'static str) -> Result<()> {
        if self.min == 0 {
            return Err(CoreError::invalid_option(option, "min must be at least 1"));
        }
        if !(self.min <= self.default && self.default <= self.max) {
            return Err(CoreError::invalid_option(
                option,
                format!(
                    "expected min <= default <= max, got {}/{}/{}",
                    self.min, self.default, self.max
                ),
            ));
        }
        Ok(())
    }
}

/// TCP protocol options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpOption {
    /// Selective acknowledgement
    Sack(bool),
    /// Receive buffer auto-moderation
    ModerateReceiveBuffer(bool),
    /// Receive buffer sizes
    ReceiveBufferSizeRange(BufferSizeRange),
    /// Send buffer sizes
    SendBufferSizeRange(BufferSizeRange),
    /// Keep-alive probe interval
    KeepAliveInterval(Duration),
}

#[derive(Debug, Clone, Copy)]
struct TcpSettings {
    sack: bool,
    moderate_receive_buffer: bool,
    receive: BufferSizeRange,
    send: BufferSizeRange,
    keep_alive_interval: Duration,
}

impl TcpSettings {
    const fn receive_buffer(&self) -> usize {
        if self.moderate_receive_buffer {
            self.receive.max
        } else {
            self.receive.default
        }
    }

    const fn send_buffer(&self) -> usize {
        self.send.default
    }
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            sack: false,
            moderate_receive_buffer: false,
            receive: BufferSizeRange::fixed(64 * 1024),
            send: BufferSizeRange::fixed(64 * 1024),
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
        }
    }
}

// ============================================
// Engine State
// ============================================

pub(crate) struct Nic {
    id: NicId,
    link: Arc<dyn LinkEndpoint>,
    queue: Arc<PacketQueue>,
    spoofing: AtomicBool,
    promiscuous: AtomicBool,
}

impl Nic {
    fn spoofing(&self) -> bool {
        self.spoofing.load(Ordering::SeqCst)
    }

    fn promiscuous(&self) -> bool {
        self.promiscuous.load(Ordering::SeqCst)
    }
}

pub(crate) struct UdpFlow {
    generation: u64,
    tx: mpsc::Sender<Bytes>,
}

struct TcpSlot {
    id: TransportEndpointId,
    opened_at: SmolInstant,
    released_at: Option<SmolInstant>,
}

impl TcpSlot {
    /// Why the socket has outlived its state, if it has.
    fn expired(&self, state: smol_tcp::State, now: SmolInstant) -> Option<&'static str> {
        if state == smol_tcp::State::Closed {
            return None;
        }
        if let Some(released_at) = self.released_at {
            return (now >= released_at + LINGER_TIMEOUT).then_some("Close did not finish");
        }
        let half_open = matches!(state, smol_tcp::State::Listen | smol_tcp::State::SynReceived);
        (half_open && now >= self.opened_at + HANDSHAKE_TIMEOUT).then_some("Handshake timed out")
    }
}

struct StackState {
    iface: Interface,
    device: QueueDevice,
    sockets: SocketSet<'static>,
    tcp: HashMap<SocketHandle, TcpSlot>,
    flows: HashMap<TransportEndpointId, SocketHandle>,
}

impl StackState {
    fn half_open(&self) -> usize {
        self.tcp
            .keys()
            .filter(|handle| {
                matches!(
                    self.sockets.get::<smol_tcp::Socket>(**handle).state(),
                    smol_tcp::State::Listen | smol_tcp::State::SynReceived
                )
            })
            .count()
    }

    /// Live socket for `id`, ignoring ones that are finished.
    fn live_flow(&self, id: &TransportEndpointId) -> Option<SocketHandle> {
        let handle = *self.flows.get(id)?;
        let state = self.sockets.get::<smol_tcp::Socket>(handle).state();
        (!matches!(state, smol_tcp::State::Closed | smol_tcp::State::TimeWait)).then_some(handle)
    }

    /// Removes released sockets that finished and aborts the ones stuck
    /// past their deadline. An aborted socket sends its RST on the next
    /// poll and is removed once released.
    fn reap(&mut self, now: SmolInstant) {
        let Self {
            sockets,
            tcp,
            flows,
            ..
        } = &mut *self;

        tcp.retain(|handle, slot| {
            let state = sockets.get::<smol_tcp::Socket>(*handle).state();
            let finished = matches!(state, smol_tcp::State::Closed | smol_tcp::State::TimeWait);
            if slot.released_at.is_some() && finished {
                sockets.remove(*handle);
                if flows.get(&slot.id) == Some(handle) {
                    flows.remove(&slot.id);
                }
                trace!(local = %slot.id.local, remote = %slot.id.remote, "Reaped TCP socket");
                return false;
            }
            if let Some(reason) = slot.expired(state, now) {
                debug!(
                    local = %slot.id.local,
                    remote = %slot.id.remote,
                    %state,
                    "{}, aborting TCP socket",
                    reason
                );
                sockets.get_mut::<smol_tcp::Socket>(*handle).abort();
            }
            true
        });
    }
}

pub(crate) struct EngineInner {
    options: EngineOptions,
    nic: RwLock<Option<Arc<Nic>>>,
    stack: Mutex<Option<StackState>>,
    tcp_settings: Mutex<TcpSettings>,
    tcp_forwarder: RwLock<Option<Arc<TcpForwarder>>>,
    udp_forwarder: RwLock<Option<Arc<UdpForwarder>>>,
    udp_flows: DashMap<TransportEndpointId, UdpFlow>,
    fragments: Reassembler,
    next_flow: AtomicU64,
    notify: Arc<Notify>,
    closed: AtomicBool,
    runtime: Handle,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

fn is_anchor(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4 == Ipv4Addr::from(ANCHOR_V4),
        IpAddr::V6(v6) => v6 == Ipv6Addr::from(ANCHOR_V6),
    }
}

impl EngineInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn nic(&self) -> Result<Arc<Nic>> {
        if self.is_closed() {
            return Err(CoreError::EngineClosed);
        }
        self.nic.read().clone().ok_or(CoreError::EngineClosed)
    }

    fn nic_by_id(&self, id: NicId) -> Result<Arc<Nic>> {
        let nic = self.nic()?;
        if nic.id == id {
            Ok(nic)
        } else {
            Err(CoreError::UnknownNic { id })
        }
    }

    pub(crate) fn wake_poller(&self) {
        self.notify.notify_one();
    }

    fn enqueue(&self, packet: PacketBuffer) {
        if let Ok(nic) = self.nic() {
            nic.queue.push_rx(packet);
            self.wake_poller();
        }
    }

    /// Runs one smoltcp poll, reaps finished sockets and flushes the
    /// produced packets onto the link. Returns smoltcp's next deadline.
    pub(crate) fn poll_once(&self) -> Option<Duration> {
        self.poll_at(SmolInstant::now())
    }

    /// [`EngineInner::poll_once`] with an explicit clock reading.
    pub(crate) fn poll_at(&self, now: SmolInstant) -> Option<Duration> {
        let delay = {
            let mut guard = self.stack.lock();
            let state = guard.as_mut()?;
            let StackState {
                iface,
                device,
                sockets,
                ..
            } = &mut *state;
            let _ = iface.poll(now, device, sockets);
            state.reap(now);
            state
                .iface
                .poll_delay(now, &state.sockets)
                .map(|d| Duration::from_micros(d.total_micros()))
        };
        self.flush_tx();
        delay
    }

    fn flush_tx(&self) {
        let Some(nic) = self.nic.read().clone() else {
            return;
        };
        let batch = nic.queue.take_tx();
        if batch.is_empty() {
            return;
        }
        if let Err(e) = nic.link.write_packets(batch) {
            if e.source.is_closed() {
                debug!("Link closed, dropped outbound packets");
            } else {
                warn!("Outbound write failed after {} packets: {}", e.delivered, e.source);
            }
        }
    }

    /// Runs `f` on a TCP socket that is still registered.
    pub(crate) fn with_tcp<R>(
        &self,
        handle: SocketHandle,
        f: impl FnOnce(&mut smol_tcp::Socket<'static>) -> R,
    ) -> Option<R> {
        let mut guard = self.stack.lock();
        let state = guard.as_mut()?;
        if !state.tcp.contains_key(&handle) {
            return None;
        }
        Some(f(state.sockets.get_mut::<smol_tcp::Socket>(handle)))
    }

    /// Marks a socket as no longer referenced by an endpoint.
    pub(crate) fn release_tcp(&self, handle: SocketHandle) {
        let mut guard = self.stack.lock();
        if let Some(state) = guard.as_mut() {
            if let Some(slot) = state.tcp.get_mut(&handle) {
                slot.released_at = Some(SmolInstant::now());
                state.sockets.get_mut::<smol_tcp::Socket>(handle).close();
            }
        }
        drop(guard);
        self.wake_poller();
    }

    pub(crate) fn keep_alive_interval(&self) -> Duration {
        self.tcp_settings.lock().keep_alive_interval
    }

    // ========================================
    // Ingress
    // ========================================

    fn deliver(self: &Arc<Self>, protocol: NetworkProtocol, packet: &PacketBuffer) {
        if self.is_closed() {
            return;
        }
        if !self.options.has_network(protocol) {
            trace!(%protocol, "Network protocol disabled, dropping packet");
            return;
        }
        let Ok(nic) = self.nic() else {
            return;
        };

        let data = packet.to_contiguous();
        let reassembled = match self.fragments.accept(protocol, &data) {
            Reassembly::Whole => None,
            Reassembly::Held => return,
            Reassembly::Dropped => {
                trace!(%protocol, "Dropping unusable fragment");
                return;
            }
            Reassembly::Complete(whole) => {
                Some(PacketBuffer::from_bytes(protocol, Bytes::from(whole)))
            }
        };
        let packet = reassembled.as_ref().unwrap_or(packet);

        let inspected = match &reassembled {
            Some(whole) => wire::inspect(protocol, &whole.to_contiguous()),
            None => wire::inspect(protocol, &data),
        };
        match inspected {
            None => trace!(%protocol, "Dropping malformed packet"),
            Some(wire::Inspected::TcpSyn(id)) => {
                if self.options.has_transport(TransportProtocol::Tcp)
                    && self.accepts_destination(&nic, id.local.ip())
                {
                    self.handle_syn(packet, id);
                }
            }
            Some(wire::Inspected::Tcp) => {
                if self.options.has_transport(TransportProtocol::Tcp) {
                    self.enqueue(packet.clone());
                }
            }
            Some(wire::Inspected::Udp(id, payload)) => {
                if self.options.has_transport(TransportProtocol::Udp)
                    && self.accepts_destination(&nic, id.local.ip())
                {
                    self.handle_udp(id, payload);
                }
            }
            Some(wire::Inspected::Icmp) => {
                let icmp = match protocol {
                    NetworkProtocol::Ipv4 => TransportProtocol::Icmpv4,
                    NetworkProtocol::Ipv6 => TransportProtocol::Icmpv6,
                };
                if self.options.has_transport(icmp) {
                    self.enqueue(packet.clone());
                }
            }
            Some(wire::Inspected::Other) => self.enqueue(packet.clone()),
        }
    }

    fn accepts_destination(&self, nic: &Nic, destination: IpAddr) -> bool {
        nic.promiscuous() || is_anchor(destination)
    }

    fn handle_syn(self: &Arc<Self>, packet: &PacketBuffer, id: TransportEndpointId) {
        let forwarder = self.tcp_forwarder.read().clone();

        {
            let guard = self.stack.lock();
            let Some(state) = guard.as_ref() else {
                return;
            };
            if state.live_flow(&id).is_some() {
                drop(guard);
                self.enqueue(packet.clone());
                return;
            }
            if let Some(forwarder) = &forwarder {
                if state.half_open() >= forwarder.max_in_flight() {
                    debug!(remote = %id.remote, local = %id.local, "Too many half-open connections, dropping SYN");
                    return;
                }
            }
        }

        match forwarder {
            Some(forwarder) => {
                let request = TcpForwarderRequest::new(
                    Arc::clone(self),
                    id,
                    packet.clone(),
                    forwarder.receive_window(),
                );
                forwarder.dispatch(request);
            }
            // No listener: smoltcp answers with RST.
            None => self.enqueue(packet.clone()),
        }
    }

    fn handle_udp(self: &Arc<Self>, id: TransportEndpointId, payload: Bytes) {
        let queued = self
            .udp_flows
            .get(&id)
            .map(|flow| flow.tx.try_send(payload.clone()));

        match queued {
            Some(Ok(())) => return,
            Some(Err(mpsc::error::TrySendError::Full(_))) => {
                trace!(remote = %id.remote, local = %id.local, "UDP flow queue full, dropping datagram");
                return;
            }
            Some(Err(mpsc::error::TrySendError::Closed(_))) => {
                self.udp_flows.remove(&id);
            }
            None => {}
        }

        let forwarder = self.udp_forwarder.read().clone();
        match forwarder {
            Some(forwarder) => {
                forwarder.dispatch(UdpForwarderRequest::new(Arc::clone(self), id, payload));
            }
            None => trace!(remote = %id.remote, local = %id.local, "No UDP forwarder, dropping datagram"),
        }
    }

    // ========================================
    // Endpoint Creation
    // ========================================

    pub(crate) fn open_tcp(
        self: &Arc<Self>,
        id: TransportEndpointId,
        syn: PacketBuffer,
        receive_window: usize,
    ) -> Result<SocketHandle> {
        let nic = self.nic()?;
        if !nic.spoofing() && !is_anchor(id.local.ip()) {
            return Err(CoreError::endpoint(format!(
                "spoofing disabled, cannot bind {}",
                id.local
            )));
        }

        let settings = *self.tcp_settings.lock();
        let mut rx_size = settings.receive_buffer();
        if receive_window > 0 {
            rx_size = rx_size.min(receive_window);
        }
        let mut socket = smol_tcp::Socket::new(
            smol_tcp::SocketBuffer::new(vec![0; rx_size]),
            smol_tcp::SocketBuffer::new(vec![0; settings.send_buffer()]),
        );
        socket.set_nagle_enabled(false);
        socket
            .listen(smoltcp::wire::IpListenEndpoint {
                addr: Some(wire::to_ip_address(id.local.ip())),
                port: id.local.port(),
            })
            .map_err(|e| CoreError::endpoint(format!("listen on {}: {e:?}", id.local)))?;

        let handle = {
            let mut guard = self.stack.lock();
            let state = guard.as_mut().ok_or(CoreError::EngineClosed)?;
            let handle = state.sockets.add(socket);
            state.tcp.insert(
                handle,
                TcpSlot {
                    id,
                    opened_at: SmolInstant::now(),
                    released_at: None,
                },
            );
            state.flows.insert(id, handle);
            handle
        };

        // Consume the SYN now so the endpoint's addresses are resolved
        // before the forwarder callback reads them.
        nic.queue.push_rx(syn);
        self.poll_once();
        Ok(handle)
    }

    pub(crate) fn open_udp(
        self: &Arc<Self>,
        id: TransportEndpointId,
        first: Bytes,
    ) -> Result<(u64, mpsc::Receiver<Bytes>)> {
        let nic = self.nic()?;
        if !nic.spoofing() && !is_anchor(id.local.ip()) {
            return Err(CoreError::endpoint(format!(
                "spoofing disabled, cannot bind {}",
                id.local
            )));
        }

        let (tx, rx) = mpsc::channel(self.options.udp_queue_depth.max(1));
        let _ = tx.try_send(first);

        match self.udp_flows.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(CoreError::endpoint(format!(
                "UDP flow {} -> {} already exists",
                id.remote, id.local
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let generation = self.next_flow.fetch_add(1, Ordering::Relaxed);
                slot.insert(UdpFlow { generation, tx });
                Ok((generation, rx))
            }
        }
    }

    /// Removes the flow unless it has been replaced by a newer one.
    pub(crate) fn close_udp(&self, id: &TransportEndpointId, generation: u64) {
        self.udp_flows
            .remove_if(id, |_, flow| flow.generation == generation);
    }
}

struct NicDispatcher {
    engine: Weak<EngineInner>,
}

impl NetworkDispatcher for NicDispatcher {
    fn deliver_network_packet(&self, protocol: NetworkProtocol, packet: &PacketBuffer) {
        if let Some(engine) = self.engine.upgrade() {
            engine.deliver(protocol, packet);
        }
    }
}

async fn run_poll_loop(engine: Weak<EngineInner>, notify: Arc<Notify>) {
    loop {
        let delay = match engine.upgrade() {
            Some(inner) if !inner.is_closed() => inner.poll_once(),
            _ => break,
        };

        let wait = delay.map_or(MAX_POLL_INTERVAL, |d| d.min(MAX_POLL_INTERVAL));
        if wait.is_zero() {
            tokio::task::yield_now().await;
            continue;
        }
        tokio::select! {
            () = notify.notified() => {}
            () = tokio::time::sleep(wait) => {}
        }
    }
    trace!("Engine poll loop exited");
}

// ============================================
// Engine
// ============================================

/// Handle to one protocol engine instance.
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use tunlink_core::engine::{Engine, EngineOptions, Route};
/// # fn demo(link: Arc<dyn tunlink_core::link::LinkEndpoint>) -> tunlink_core::Result<()> {
/// let engine = Engine::new(EngineOptions::full())?;
/// engine.create_nic(1, link)?;
/// engine.set_route_table(vec![Route::default_ipv4(1), Route::default_ipv6(1)])?;
/// engine.set_spoofing(1, true)?;
/// engine.set_promiscuous_mode(1, true)?;
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Creates an engine bound to the current tokio runtime.
    ///
    /// # Errors
    /// Called outside a tokio runtime.
    pub fn new(options: EngineOptions) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| CoreError::setup("create engine", e))?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                options,
                nic: RwLock::new(None),
                stack: Mutex::new(None),
                tcp_settings: Mutex::new(TcpSettings::default()),
                tcp_forwarder: RwLock::new(None),
                udp_forwarder: RwLock::new(None),
                udp_flows: DashMap::new(),
                fragments: Reassembler::new(),
                next_flow: AtomicU64::new(0),
                notify: Arc::new(Notify::new()),
                closed: AtomicBool::new(false),
                runtime,
                poll_task: Mutex::new(None),
            }),
        })
    }

    /// Registers `link` as NIC `id`, attaches the engine to it and starts
    /// the poll task.
    ///
    /// # Errors
    /// `DuplicateNic` if `id` exists, `Setup` if a different NIC exists,
    /// `EngineClosed` after close.
    pub fn create_nic(&self, id: NicId, link: Arc<dyn LinkEndpoint>) -> Result<()> {
        if self.inner.is_closed() {
            return Err(CoreError::EngineClosed);
        }

        let mut slot = self.inner.nic.write();
        if let Some(existing) = slot.as_ref() {
            return Err(if existing.id == id {
                CoreError::DuplicateNic { id }
            } else {
                CoreError::setup("create nic", "engine drives a single NIC")
            });
        }

        let mtu = usize::try_from(link.mtu()).unwrap_or(usize::MAX);
        let queue = PacketQueue::new();
        let mut device = QueueDevice::new(Arc::clone(&queue), mtu);

        let mut config = Config::new(HardwareAddress::Ip);
        config.random_seed = rand::random();
        let mut iface = Interface::new(config, &mut device, SmolInstant::now());
        iface.update_ip_addrs(|addrs| {
            let _ = addrs.push(IpCidr::new(IpAddress::Ipv4(ANCHOR_V4), 0));
            let _ = addrs.push(IpCidr::new(IpAddress::Ipv6(ANCHOR_V6), 0));
        });

        *self.inner.stack.lock() = Some(StackState {
            iface,
            device,
            sockets: SocketSet::new(Vec::new()),
            tcp: HashMap::new(),
            flows: HashMap::new(),
        });
        *slot = Some(Arc::new(Nic {
            id,
            link: Arc::clone(&link),
            queue,
            spoofing: AtomicBool::new(false),
            promiscuous: AtomicBool::new(false),
        }));
        drop(slot);

        link.attach(Some(Arc::new(NicDispatcher {
            engine: Arc::downgrade(&self.inner),
        })));

        let task = self.inner.runtime.spawn(run_poll_loop(
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.notify),
        ));
        *self.inner.poll_task.lock() = Some(task);

        debug!(nic = id, mtu, "NIC created");
        Ok(())
    }

    /// Replaces the route table.
    ///
    /// # Errors
    /// `UnknownNic` for a route naming another NIC, `UnsupportedRoute` for
    /// anything other than a default route.
    pub fn set_route_table(&self, routes: Vec<Route>) -> Result<()> {
        let nic = self.inner.nic()?;
        for route in &routes {
            if route.nic != nic.id {
                return Err(CoreError::UnknownNic { id: route.nic });
            }
            if route.destination.prefix_len() != 0 {
                return Err(CoreError::UnsupportedRoute {
                    destination: route.destination.to_string(),
                });
            }
        }

        let mut guard = self.inner.stack.lock();
        let state = guard.as_mut().ok_or(CoreError::EngineClosed)?;
        let table = state.iface.routes_mut();
        let _ = table.remove_default_ipv4_route();
        let _ = table.remove_default_ipv6_route();
        for route in routes {
            let added = match route.destination {
                IpNet::V4(_) => table.add_default_ipv4_route(ANCHOR_V4),
                IpNet::V6(_) => table.add_default_ipv6_route(ANCHOR_V6),
            };
            added.map_err(|_| CoreError::setup("set route table", "route table full"))?;
        }
        Ok(())
    }

    /// Allows endpoints to bind and send from non-local addresses.
    ///
    /// # Errors
    /// `UnknownNic`.
    pub fn set_spoofing(&self, nic: NicId, enabled: bool) -> Result<()> {
        self.inner
            .nic_by_id(nic)?
            .spoofing
            .store(enabled, Ordering::SeqCst);
        Ok(())
    }

    /// Accepts packets for any destination address.
    ///
    /// # Errors
    /// `UnknownNic`.
    pub fn set_promiscuous_mode(&self, nic: NicId, enabled: bool) -> Result<()> {
        let nic = self.inner.nic_by_id(nic)?;
        nic.promiscuous.store(enabled, Ordering::SeqCst);
        if let Some(state) = self.inner.stack.lock().as_mut() {
            state.iface.set_any_ip(enabled);
        }
        Ok(())
    }

    /// Sets a TCP option for sockets created afterwards.
    ///
    /// # Errors
    /// `InvalidOption` for an inconsistent buffer range or zero interval.
    pub fn set_tcp_option(&self, option: TcpOption) -> Result<()> {
        let mut settings = self.inner.tcp_settings.lock();
        match option {
            TcpOption::Sack(enabled) => settings.sack = enabled,
            TcpOption::ModerateReceiveBuffer(enabled) => {
                settings.moderate_receive_buffer = enabled;
            }
            TcpOption::ReceiveBufferSizeRange(range) => {
                range.validate("receive buffer range")?;
                settings.receive = range;
            }
            TcpOption::SendBufferSizeRange(range) => {
                range.validate("send buffer range")?;
                settings.send = range;
            }
            TcpOption::KeepAliveInterval(interval) => {
                if interval.is_zero() {
                    return Err(CoreError::invalid_option(
                        "keep-alive interval",
                        "must be positive",
                    ));
                }
                settings.keep_alive_interval = interval;
            }
        }
        Ok(())
    }

    /// Returns true if SACK has been enabled.
    #[must_use]
    pub fn sack_enabled(&self) -> bool {
        self.inner.tcp_settings.lock().sack
    }

    /// Installs the TCP forwarder, replacing any previous one.
    pub fn set_tcp_forwarder(&self, forwarder: TcpForwarder) {
        *self.inner.tcp_forwarder.write() = Some(Arc::new(forwarder));
    }

    /// Installs the UDP forwarder, replacing any previous one.
    pub fn set_udp_forwarder(&self, forwarder: UdpForwarder) {
        *self.inner.udp_forwarder.write() = Some(Arc::new(forwarder));
    }

    /// TCP sockets currently registered, including ones awaiting reaping.
    #[must_use]
    pub fn tcp_socket_count(&self) -> usize {
        self.inner
            .stack
            .lock()
            .as_ref()
            .map_or(0, |state| state.tcp.len())
    }

    /// TCP sockets still waiting for the peer to complete the handshake.
    #[must_use]
    pub fn half_open_count(&self) -> usize {
        self.inner
            .stack
            .lock()
            .as_ref()
            .map_or(0, StackState::half_open)
    }

    /// Live UDP flows.
    #[must_use]
    pub fn udp_flow_count(&self) -> usize {
        self.inner.udp_flows.len()
    }

    /// Returns true once [`Engine::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Detaches from the link, resets every TCP connection, drops every
    /// UDP flow and stops the poll task. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let nic = self.inner.nic.read().clone();
        if let Some(nic) = &nic {
            nic.link.attach(None);
        }

        if let Some(task) = self.inner.poll_task.lock().take() {
            task.abort();
        }
        *self.inner.tcp_forwarder.write() = None;
        *self.inner.udp_forwarder.write() = None;
        self.inner.udp_flows.clear();

        let mut guard = self.inner.stack.lock();
        if let Some(state) = guard.as_mut() {
            let handles: Vec<SocketHandle> = state.tcp.keys().copied().collect();
            for handle in handles {
                state.sockets.get_mut::<smol_tcp::Socket>(handle).abort();
            }
            let now = SmolInstant::now();
            let StackState {
                iface,
                device,
                sockets,
                ..
            } = &mut *state;
            let _ = iface.poll(now, device, sockets);
        }
        *guard = None;
        drop(guard);

        self.inner.flush_tx();
        if let Some(nic) = &nic {
            nic.queue.clear();
        }
        info!("Protocol engine closed");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("closed", &self.is_closed())
            .field("tcp_sockets", &self.tcp_socket_count())
            .field("udp_flows", &self.udp_flow_count())
            .finish()
    }
}

// ============================================
// Tests
// ============================================
