// ============================================
// File: crates/tunlink-core/src/link.rs
// ============================================
//! # Link Bridge
//!
//! ## Creation Reason
//! The protocol engine talks to a link-layer endpoint; the device speaks
//! raw IP packets. The bridge sits between them: it classifies inbound
//! packets by IP version and hands them to the engine, and flattens the
//! engine's outbound packets onto the device.
//!
//! ## Main Functionality
//! - `LinkEndpoint`: link-layer contract consumed by the engine
//! - `NetworkDispatcher`: inbound delivery callback implemented by the engine
//! - `LinkBridge`: `LinkEndpoint` over any [`TunDevice`]
//! - `TunDeviceExt::new_endpoint`: the device's create-link-endpoint capability
//!
//! ## Main Logical Flow
//! ```text
//! device.read() ──► ip_version(pkt[0]) ──┬─ v4/v6 ──► dispatcher.deliver_network_packet
//!                                        └─ other ──► device.write(pkt)  (pass-through)
//!
//! engine ──► write_packets(batch) ──► flatten ──► device.write() per packet
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Exactly one dispatch loop runs per attachment. Attaching while a
//!   loop is still alive re-targets it instead of starting another.
//! - Detaching stops the loop at the next delivery; a loop blocked in
//!   `read()` only exits once a packet arrives or the device closes.
//!
//! ## Last Modified
//! v0.1.0 - Initial link bridge

use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use tunlink_transport::TunDevice;

use crate::error::LinkWriteError;
use crate::packet::{ip_version, NetworkProtocol, PacketBuffer};

// ============================================
// Link Contract
// ============================================

/// Offloads a link can perform for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkCapabilities {
    /// The link computes and verifies checksums itself.
    pub checksum_offload: bool,
    /// The link needs neighbour resolution before sending.
    pub resolution_required: bool,
}

impl LinkCapabilities {
    /// No special capabilities.
    pub const NONE: Self = Self {
        checksum_offload: false,
        resolution_required: false,
    };
}

/// Hardware type reported for address resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpHardwareType {
    /// No link-layer addressing (raw IP).
    None,
}

/// Receives packets from a link endpoint.
pub trait NetworkDispatcher: Send + Sync {
    /// Delivers one inbound packet. The caller keeps its own reference and
    /// releases it after this returns; implementations clone to retain.
    fn deliver_network_packet(&self, protocol: NetworkProtocol, packet: &PacketBuffer);
}

/// Link-layer endpoint as seen by the protocol engine.
pub trait LinkEndpoint: Send + Sync {
    /// Maximum packet size the link carries.
    fn mtu(&self) -> u32;

    /// Offload capabilities.
    fn capabilities(&self) -> LinkCapabilities {
        LinkCapabilities::NONE
    }

    /// Bytes the link prepends to every packet.
    fn max_header_length(&self) -> u16 {
        0
    }

    /// Link-layer address, if the medium has one.
    fn link_address(&self) -> Option<[u8; 6]> {
        None
    }

    /// Hardware type for address resolution.
    fn arp_hardware_type(&self) -> ArpHardwareType {
        ArpHardwareType::None
    }

    /// Strips a link header. Raw IP has none.
    fn parse_header(&self, _packet: &PacketBuffer) -> bool {
        true
    }

    /// Prepends a link header. Raw IP has none.
    fn add_header(&self, _packet: &mut PacketBuffer) {}

    /// Attaches (`Some`) or detaches (`None`) the inbound dispatcher.
    fn attach(&self, dispatcher: Option<Arc<dyn NetworkDispatcher>>);

    /// Returns true while a dispatcher is attached.
    fn is_attached(&self) -> bool;

    /// Blocks until the inbound loop has exited.
    fn wait(&self);

    /// Writes a batch of outbound packets in order.
    ///
    /// # Errors
    /// Stops at the first device failure; `delivered` counts the packets
    /// that were written before it.
    fn write_packets(&self, packets: Vec<PacketBuffer>) -> Result<usize, LinkWriteError>;
}

// ============================================
// LinkBridge
// ============================================

type DispatcherSlot = Arc<RwLock<Option<Arc<dyn NetworkDispatcher>>>>;

/// [`LinkEndpoint`] over a [`TunDevice`].
pub struct LinkBridge {
    device: Arc<dyn TunDevice>,
    dispatcher: DispatcherSlot,
    dispatch_loop: Mutex<Option<JoinHandle<()>>>,
}

impl LinkBridge {
    /// Creates a bridge over `device`. No loop runs until a dispatcher is
    /// attached.
    #[must_use]
    pub fn new(device: Arc<dyn TunDevice>) -> Arc<Self> {
        Arc::new(Self {
            device,
            dispatcher: Arc::new(RwLock::new(None)),
            dispatch_loop: Mutex::new(None),
        })
    }

    /// The bridged device.
    #[must_use]
    pub fn device(&self) -> &Arc<dyn TunDevice> {
        &self.device
    }

    fn spawn_loop(&self) {
        let mut slot = self.dispatch_loop.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!(device = %self.device.name(), "Dispatch loop still running, re-targeted");
            return;
        }

        let device = Arc::clone(&self.device);
        let dispatcher = Arc::clone(&self.dispatcher);
        let spawned = std::thread::Builder::new()
            .name(format!("{}-dispatch", self.device.name()))
            .spawn(move || dispatch_loop(&*device, &dispatcher));

        match spawned {
            Ok(handle) => *slot = Some(handle),
            Err(e) => error!(device = %self.device.name(), "Failed to spawn dispatch loop: {}", e),
        }
    }
}

impl LinkEndpoint for LinkBridge {
    fn mtu(&self) -> u32 {
        self.device.mtu()
    }

    fn attach(&self, dispatcher: Option<Arc<dyn NetworkDispatcher>>) {
        let start = dispatcher.is_some();
        let previous = std::mem::replace(&mut *self.dispatcher.write(), dispatcher);

        if start && previous.is_none() {
            self.spawn_loop();
        }
    }

    fn is_attached(&self) -> bool {
        self.dispatcher.read().is_some()
    }

    fn wait(&self) {
        let handle = self.dispatch_loop.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(device = %self.device.name(), "Dispatch loop panicked");
            }
        }
    }

    fn write_packets(&self, packets: Vec<PacketBuffer>) -> Result<usize, LinkWriteError> {
        let total = packets.len();
        for (delivered, packet) in packets.into_iter().enumerate() {
            let data = packet.to_contiguous();
            if let Err(source) = self.device.write(&data) {
                return Err(LinkWriteError { delivered, source });
            }
        }
        Ok(total)
    }
}

impl std::fmt::Debug for LinkBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkBridge")
            .field("device", &self.device.name())
            .field("mtu", &self.device.mtu())
            .field("attached", &self.is_attached())
            .finish()
    }
}

fn dispatch_loop(device: &dyn TunDevice, dispatcher: &RwLock<Option<Arc<dyn NetworkDispatcher>>>) {
    debug!(device = %device.name(), "Dispatch loop started");

    loop {
        let raw = match device.read() {
            Ok(raw) => raw,
            Err(e) if e.is_closed() => {
                debug!(device = %device.name(), "Device closed, dispatch loop exiting");
                break;
            }
            Err(e) => {
                warn!(device = %device.name(), "Device read failed: {}", e);
                break;
            }
        };

        let Some(&first) = raw.first() else {
            continue;
        };

        let Some(protocol) = ip_version(first) else {
            trace!(device = %device.name(), first_byte = first, "Passing through non-IP packet");
            if let Err(e) = device.write(&raw) {
                if e.is_closed() {
                    break;
                }
                warn!(device = %device.name(), "Pass-through write failed: {}", e);
            }
            continue;
        };

        let Some(target) = dispatcher.read().clone() else {
            debug!(device = %device.name(), "Dispatcher detached, dispatch loop exiting");
            break;
        };

        let packet = PacketBuffer::from_bytes(protocol, Bytes::from(raw));
        target.deliver_network_packet(protocol, &packet);
        packet.release();
    }
}

// ============================================
// Device Extension
// ============================================

/// Create-link-endpoint capability of a device.
pub trait TunDeviceExt {
    /// Wraps the device in a [`LinkBridge`].
    fn new_endpoint(&self) -> Arc<LinkBridge>;
}

impl TunDeviceExt for Arc<dyn TunDevice> {
    fn new_endpoint(&self) -> Arc<LinkBridge> {
        LinkBridge::new(Arc::clone(self))
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;
    use tunlink_transport::tun::{DeviceState, MockTun};

    struct ChannelDispatcher {
        tx: Mutex<mpsc::Sender<(NetworkProtocol, Vec<u8>, usize)>>,
    }

    impl NetworkDispatcher for ChannelDispatcher {
        fn deliver_network_packet(&self, protocol: NetworkProtocol, packet: &PacketBuffer) {
            let bytes = packet.to_contiguous().into_owned();
            let _ = self.tx.lock().send((protocol, bytes, packet.ref_count()));
        }
    }

    fn setup(mtu: u32) -> (Arc<MockTun>, Arc<LinkBridge>) {
        let tun = Arc::new(MockTun::with_mtu("mock0", mtu));
        let device: Arc<dyn TunDevice> = tun.clone();
        (tun, device.new_endpoint())
    }

    fn channel() -> (Arc<ChannelDispatcher>, mpsc::Receiver<(NetworkProtocol, Vec<u8>, usize)>) {
        let (tx, rx) = mpsc::channel();
        (
            Arc::new(ChannelDispatcher { tx: Mutex::new(tx) }),
            rx,
        )
    }

    #[test]
    fn test_link_contract_defaults() {
        let (_tun, bridge) = setup(9000);
        assert_eq!(bridge.mtu(), 9000);
        assert_eq!(bridge.capabilities(), LinkCapabilities::NONE);
        assert_eq!(bridge.max_header_length(), 0);
        assert!(bridge.link_address().is_none());
        assert_eq!(bridge.arp_hardware_type(), ArpHardwareType::None);
        assert!(!bridge.is_attached());
    }

    #[test]
    fn test_jumbo_packet_delivered_at_device_mtu() {
        let (tun, bridge) = setup(9000);
        let (dispatcher, rx) = channel();
        bridge.attach(Some(dispatcher));

        let mut packet = vec![0u8; 9000];
        packet[0] = 0x45;
        tun.ring().inject(packet.clone());

        let (protocol, bytes, refs) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(protocol, NetworkProtocol::Ipv4);
        assert_eq!(bytes.len(), 9000);
        assert_eq!(bytes, packet);
        // Only the bridge's own reference is live during delivery.
        assert_eq!(refs, 1);
        assert_eq!(bridge.mtu(), 9000);

        tun.close().unwrap();
        bridge.wait();
    }

    #[test]
    fn test_unrecognized_version_written_back_unchanged() {
        let (tun, bridge) = setup(1500);
        let (dispatcher, rx) = channel();
        bridge.attach(Some(dispatcher));

        tun.ring().inject(vec![0x12, 0x34, 0x56]);
        tun.ring().inject(vec![0x60, 0, 0, 0]);

        let (protocol, bytes, _) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(protocol, NetworkProtocol::Ipv6);
        assert_eq!(bytes, vec![0x60, 0, 0, 0]);
        assert_eq!(tun.ring().take_sent(), vec![vec![0x12, 0x34, 0x56]]);
        assert!(rx.try_recv().is_err());

        tun.close().unwrap();
        bridge.wait();
    }

    #[test]
    fn test_empty_packets_are_skipped() {
        let (tun, bridge) = setup(1500);
        let (dispatcher, rx) = channel();
        bridge.attach(Some(dispatcher));

        tun.ring().inject(Vec::new());
        tun.ring().inject(vec![0x45, 1]);

        let (_, bytes, _) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(bytes, vec![0x45, 1]);
        assert!(tun.ring().take_sent().is_empty());

        tun.close().unwrap();
        bridge.wait();
    }

    #[test]
    fn test_detach_stops_loop_at_next_delivery() {
        let (tun, bridge) = setup(1500);
        let (dispatcher, rx) = channel();
        bridge.attach(Some(dispatcher));
        assert!(bridge.is_attached());

        bridge.attach(None);
        assert!(!bridge.is_attached());
        tun.ring().inject(vec![0x45, 2]);
        bridge.wait();

        assert!(rx.try_recv().is_err());
        assert_eq!(tun.state(), DeviceState::Open);
    }

    #[test]
    fn test_write_packets_flattens_segments() {
        let (tun, bridge) = setup(1500);
        let batch = vec![
            PacketBuffer::from_segments(
                NetworkProtocol::Ipv4,
                vec![Bytes::from_static(&[0x45, 0]), Bytes::from_static(&[1, 2])],
            ),
            PacketBuffer::from_bytes(NetworkProtocol::Ipv6, Bytes::from_static(&[0x60])),
        ];

        assert_eq!(bridge.write_packets(batch).unwrap(), 2);
        assert_eq!(
            tun.ring().take_sent(),
            vec![vec![0x45, 0, 1, 2], vec![0x60]]
        );
    }

    #[test]
    fn test_write_failure_reports_delivered_prefix() {
        let (tun, bridge) = setup(1500);
        tun.close().unwrap();

        let batch = vec![
            PacketBuffer::from_bytes(NetworkProtocol::Ipv4, Bytes::from_static(&[0x45])),
            PacketBuffer::from_bytes(NetworkProtocol::Ipv4, Bytes::from_static(&[0x45])),
        ];
        let err = bridge.write_packets(batch).unwrap_err();
        assert_eq!(err.delivered, 0);
        assert!(err.source.is_closed());
    }
}
