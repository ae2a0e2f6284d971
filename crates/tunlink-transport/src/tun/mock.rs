// ============================================
// File: crates/tunlink-transport/src/tun/mock.rs
// ============================================
//! # In-Memory Ring for Tests
//!
//! ## Creation Reason
//! Exercises the real [`RingDevice`] adapter (polling, close state
//! machine, rate accounting) without creating a kernel device or needing
//! root.
//!
//! ## Main Functionality
//! - `MemoryRing`: packet queues with injectable faults, a send capacity
//!   and an ordered log of lifecycle events
//! - `MockTun`: `RingDevice<MemoryRing>`
//!
//! ## Usage in Tests
//! ```
//! use tunlink_transport::tun::MockTun;
//! use tunlink_transport::traits::TunDevice;
//!
//! let tun = MockTun::with_mtu("mock0", 1500);
//! tun.ring().inject(vec![0x45, 0, 0, 20]);
//! assert_eq!(tun.read().unwrap(), vec![0x45, 0, 0, 20]);
//!
//! tun.write(&[0x45, 0, 0, 20]).unwrap();
//! assert_eq!(tun.ring().take_sent().len(), 1);
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - This is for testing only - do not use in production
//! - The mock never spins; it uses `PollPolicy::never_spin()`
//!
//! ## Last Modified
//! v0.1.0 - Initial mock ring

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::ring::{PacketRing, RingDevice, RingRecv, RingSend};
use crate::rate::PollPolicy;
use crate::traits::TunConfig;

// ============================================
// Types
// ============================================

/// Lifecycle events recorded by [`MemoryRing`], in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingEvent {
    /// `wait_readable` returned.
    WaitReturned,
    /// `try_send` returned.
    SendReturned,
    /// `end_session` ran.
    SessionEnded,
    /// `close_device` ran.
    DeviceClosed,
}

#[derive(Debug)]
enum Queued {
    Packet(Vec<u8>),
    EndOfStream,
    Corrupt(String),
}

/// A device as seen by tests.
pub type MockTun = RingDevice<MemoryRing>;

// ============================================
// MemoryRing
// ============================================

/// In-memory [`PacketRing`].
#[derive(Debug)]
pub struct MemoryRing {
    inbound: Mutex<VecDeque<Queued>>,
    readable: Condvar,
    woken: AtomicBool,
    sent: Mutex<Vec<Vec<u8>>>,
    send_capacity: AtomicUsize,
    send_delay: Mutex<Option<Duration>>,
    events: Mutex<Vec<RingEvent>>,
}

impl MemoryRing {
    /// Creates an empty ring with unlimited send capacity.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inbound: Mutex::new(VecDeque::new()),
            readable: Condvar::new(),
            woken: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            send_capacity: AtomicUsize::new(usize::MAX),
            send_delay: Mutex::new(None),
            events: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, item: Queued) {
        self.inbound.lock().push_back(item);
        self.readable.notify_all();
    }

    /// Queues a packet for the next read.
    pub fn inject(&self, packet: Vec<u8>) {
        self.push(Queued::Packet(packet));
    }

    /// Makes a later read observe the device vanishing.
    pub fn inject_end_of_stream(&self) {
        self.push(Queued::EndOfStream);
    }

    /// Makes a later read observe ring corruption.
    pub fn inject_corrupt(&self, reason: impl Into<String>) {
        self.push(Queued::Corrupt(reason.into()));
    }

    /// Number of queued inbound items not yet read.
    pub fn pending(&self) -> usize {
        self.inbound.lock().len()
    }

    /// Limits the bytes that may sit in the send queue.
    pub fn set_send_capacity(&self, bytes: usize) {
        self.send_capacity.store(bytes, Ordering::SeqCst);
    }

    /// Makes every send take `delay`.
    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock() = Some(delay);
    }

    /// Drains and returns the packets written so far.
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Snapshot of the lifecycle log.
    pub fn events(&self) -> Vec<RingEvent> {
        self.events.lock().clone()
    }

    fn record(&self, event: RingEvent) {
        self.events.lock().push(event);
    }
}

impl Default for MemoryRing {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketRing for MemoryRing {
    fn try_receive(&self) -> RingRecv {
        match self.inbound.lock().pop_front() {
            Some(Queued::Packet(p)) => RingRecv::Packet(p),
            Some(Queued::EndOfStream) => RingRecv::EndOfStream,
            Some(Queued::Corrupt(reason)) => RingRecv::Corrupt(reason),
            None => RingRecv::WouldBlock,
        }
    }

    fn wait_readable(&self) {
        let mut queue = self.inbound.lock();
        while queue.is_empty() && !self.woken.load(Ordering::SeqCst) {
            self.readable.wait(&mut queue);
        }
        drop(queue);
        self.record(RingEvent::WaitReturned);
    }

    fn wake(&self) {
        let _queue = self.inbound.lock();
        self.woken.store(true, Ordering::SeqCst);
        self.readable.notify_all();
    }

    fn try_send(&self, packet: &[u8]) -> RingSend {
        let delay = *self.send_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let mut sent = self.sent.lock();
        let used: usize = sent.iter().map(Vec::len).sum();
        let capacity = self.send_capacity.load(Ordering::SeqCst);
        let result = if used.saturating_add(packet.len()) > capacity {
            RingSend::Overflow
        } else {
            sent.push(packet.to_vec());
            RingSend::Sent
        };
        drop(sent);

        self.record(RingEvent::SendReturned);
        result
    }

    fn end_session(&self) {
        self.record(RingEvent::SessionEnded);
    }

    fn close_device(&self) {
        self.record(RingEvent::DeviceClosed);
    }
}

impl RingDevice<MemoryRing> {
    /// Creates a mock device with the given name and MTU.
    pub fn with_mtu(name: impl Into<String>, mtu: u32) -> Self {
        Self::with_policy(MemoryRing::new(), name, mtu, PollPolicy::never_spin())
    }

    /// Creates a mock device from a session configuration.
    pub fn from_config(config: &TunConfig) -> Self {
        Self::with_mtu(config.name.clone(), config.effective_mtu())
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::TunDevice;

    #[test]
    fn test_from_config_uses_default_mtu() {
        let tun = MockTun::from_config(&TunConfig::new("mock0"));
        assert_eq!(tun.mtu(), 9000);
        assert_eq!(tun.name(), "mock0");
    }

    #[test]
    fn test_reads_preserve_injection_order() {
        let tun = MockTun::with_mtu("mock0", 1500);
        tun.ring().inject(vec![0x45, 1]);
        tun.ring().inject(vec![0x45, 2]);
        assert_eq!(tun.read().unwrap()[1], 1);
        assert_eq!(tun.read().unwrap()[1], 2);
        assert_eq!(tun.ring().pending(), 0);
    }
}
