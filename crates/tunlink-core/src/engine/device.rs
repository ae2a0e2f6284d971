// ============================================
// File: crates/tunlink-core/src/engine/device.rs
// ============================================
//! # smoltcp Device over Packet Queues
//!
//! ## Creation Reason
//! smoltcp pulls inbound packets from and pushes outbound packets to a
//! `phy::Device`. The engine feeds that device from the link bridge's
//! delivery callback and drains it onto the link after every poll.
//!
//! ## Main Functionality
//! - `PacketQueue`: bounded RX queue of [`PacketBuffer`]s, TX queue of
//!   finished packets
//! - `QueueDevice`: `phy::Device` in IP medium over a `PacketQueue`
//!
//! ## ⚠️ Important Note for Next Developer
//! - Checksums are verified on receive and computed on transmit by
//!   smoltcp; the link reports no offload
//! - RX overflow drops the newest packet, TCP recovers by retransmission
//!
//! ## Last Modified
//! v0.1.0 - Initial queue device

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use smoltcp::phy::{self, Device, DeviceCapabilities, Medium};
use smoltcp::time::Instant;
use tracing::trace;

use crate::packet::{ip_version, PacketBuffer};

/// Maximum queued inbound packets before new ones are dropped.
pub const MAX_RX_QUEUE_DEPTH: usize = 1024;

// ============================================
// PacketQueue
// ============================================

/// Packets waiting for, and produced by, the engine.
#[derive(Debug, Default)]
pub struct PacketQueue {
    rx: Mutex<VecDeque<PacketBuffer>>,
    tx: Mutex<Vec<PacketBuffer>>,
}

impl PacketQueue {
    /// Creates an empty queue pair.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues an inbound packet. Returns false if the queue is full.
    pub fn push_rx(&self, packet: PacketBuffer) -> bool {
        let mut rx = self.rx.lock();
        if rx.len() >= MAX_RX_QUEUE_DEPTH {
            trace!("RX queue full, dropping {} byte packet", packet.len());
            return false;
        }
        rx.push_back(packet);
        true
    }

    fn pop_rx(&self) -> Option<PacketBuffer> {
        self.rx.lock().pop_front()
    }

    fn push_tx(&self, packet: PacketBuffer) {
        self.tx.lock().push(packet);
    }

    /// Takes every packet produced since the last call.
    pub fn take_tx(&self) -> Vec<PacketBuffer> {
        std::mem::take(&mut *self.tx.lock())
    }

    /// Inbound packets not yet consumed.
    #[must_use]
    pub fn rx_len(&self) -> usize {
        self.rx.lock().len()
    }

    /// Drops everything queued in both directions.
    pub fn clear(&self) {
        self.rx.lock().clear();
        self.tx.lock().clear();
    }
}

// ============================================
// QueueDevice
// ============================================

/// `phy::Device` backed by a [`PacketQueue`].
#[derive(Debug)]
pub struct QueueDevice {
    queue: Arc<PacketQueue>,
    mtu: usize,
}

impl QueueDevice {
    /// Creates a device with the link's MTU.
    #[must_use]
    pub fn new(queue: Arc<PacketQueue>, mtu: usize) -> Self {
        Self { queue, mtu }
    }
}

impl Device for QueueDevice {
    type RxToken<'a> = RxToken where Self: 'a;
    type TxToken<'a> = TxToken<'a> where Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let packet = self.queue.pop_rx()?;
        Some((RxToken { packet }, TxToken { queue: &self.queue }))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(TxToken { queue: &self.queue })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}

/// Inbound packet handed to smoltcp.
pub struct RxToken {
    packet: PacketBuffer,
}

impl phy::RxToken for RxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.packet.to_contiguous())
    }
}

/// Slot for one outbound packet.
pub struct TxToken<'a> {
    queue: &'a PacketQueue,
}

impl phy::TxToken for TxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = vec![0u8; len];
        let result = f(&mut buffer);

        match buffer.first().copied().and_then(ip_version) {
            Some(protocol) => self
                .queue
                .push_tx(PacketBuffer::from_bytes(protocol, Bytes::from(buffer))),
            None => trace!("Engine produced a non-IP packet, dropped"),
        }
        result
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::NetworkProtocol;
    use smoltcp::phy::{RxToken as _, TxToken as _};

    fn packet(first: u8) -> PacketBuffer {
        let proto = ip_version(first).unwrap_or(NetworkProtocol::Ipv4);
        PacketBuffer::from_bytes(proto, Bytes::from(vec![first, 1, 2]))
    }

    #[test]
    fn test_receive_is_fifo() {
        let queue = PacketQueue::new();
        let mut device = QueueDevice::new(Arc::clone(&queue), 1500);
        assert!(queue.push_rx(packet(0x45)));
        assert!(queue.push_rx(packet(0x60)));

        let (rx, _) = device.receive(Instant::from_millis(0)).unwrap();
        assert_eq!(rx.consume(|b| b[0]), 0x45);
        let (rx, _) = device.receive(Instant::from_millis(0)).unwrap();
        assert_eq!(rx.consume(|b| b[0]), 0x60);
        assert!(device.receive(Instant::from_millis(0)).is_none());
    }

    #[test]
    fn test_rx_queue_is_bounded() {
        let queue = PacketQueue::new();
        for _ in 0..MAX_RX_QUEUE_DEPTH {
            assert!(queue.push_rx(packet(0x45)));
        }
        assert!(!queue.push_rx(packet(0x45)));
        assert_eq!(queue.rx_len(), MAX_RX_QUEUE_DEPTH);
    }

    #[test]
    fn test_transmit_tags_by_version() {
        let queue = PacketQueue::new();
        let mut device = QueueDevice::new(Arc::clone(&queue), 1500);

        let tx = device.transmit(Instant::from_millis(0)).unwrap();
        tx.consume(3, |b| b.copy_from_slice(&[0x60, 0, 0]));

        let sent = queue.take_tx();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].protocol(), NetworkProtocol::Ipv6);
        assert!(queue.take_tx().is_empty());
    }

    #[test]
    fn test_capabilities_report_ip_medium_and_mtu() {
        let device = QueueDevice::new(PacketQueue::new(), 9000);
        let caps = device.capabilities();
        assert_eq!(caps.medium, Medium::Ip);
        assert_eq!(caps.max_transmission_unit, 9000);
    }
}
