// ============================================
// File: crates/tunlink-transport/src/tun/ring.rs
// ============================================
//! # Ring-Driven Device Adapter
//!
//! ## Creation Reason
//! Every platform exposes a TUN device as some non-blocking packet queue
//! plus a way to park until it becomes readable. The adaptive polling,
//! rate accounting and close state machine are the same for all of them,
//! so they live here once, generic over a [`PacketRing`].
//!
//! ## Main Functionality
//! - `PacketRing`: the platform primitive (try-receive, park, wake,
//!   try-send, teardown)
//! - `RingDevice<R>`: implements [`TunDevice`] on top of any ring
//! - `DeviceState`: `Open -> Closing -> Closed`
//!
//! ## Main Logical Flow
//! ```text
//! read():  enter op ─► closing? ─► try_receive ─┬─ Packet ─► record rate ─► return
//!                ▲                              ├─ WouldBlock ─► spin or park ─┐
//!                └──────────────────────────────┼──────────────────────────────┘
//!                                               ├─ EndOfStream ─► Closed
//!                                               └─ Corrupt / Err ─► fatal
//!
//! close(): set Closing ─► wake ring ─► wait live ops == 0 ─► end_session
//!          ─► close_device ─► Closed          (exactly once)
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - The op counter is incremented BEFORE the closing flag is checked and
//!   both use SeqCst; weakening either lets close tear down the ring under
//!   a live read
//! - A parked reader is only released by data or by `wake()`; there is no
//!   timer. The drain loop re-issues `wake()` while it waits because a
//!   reader may park after the first wake
//! - The rate spin decision is re-evaluated on every empty poll
//!
//! ## Last Modified
//! v0.1.0 - Initial ring adapter

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Once;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};
use tunlink_common::time::monotonic_nanos;

use crate::error::{Result, TransportError};
use crate::rate::{PollPolicy, RateEstimator};
use crate::traits::TunDevice;

/// How long the drain loop sleeps between re-checks of the op counter.
const DRAIN_POLL: Duration = Duration::from_millis(10);

// ============================================
// PacketRing
// ============================================

/// Outcome of a non-blocking receive.
#[derive(Debug)]
pub enum RingRecv {
    /// A packet, copied out of the ring.
    Packet(Vec<u8>),
    /// Nothing pending right now.
    WouldBlock,
    /// The device or session ended underneath us.
    EndOfStream,
    /// The ring is in an inconsistent state.
    Corrupt(String),
    /// Any other OS failure.
    Err(io::Error),
}

/// Outcome of a non-blocking send.
#[derive(Debug)]
pub enum RingSend {
    /// The packet was queued.
    Sent,
    /// No send capacity right now.
    Overflow,
    /// The device or session ended underneath us.
    Closed,
    /// Any other OS failure.
    Err(io::Error),
}

/// Platform packet queue backing a [`RingDevice`].
pub trait PacketRing: Send + Sync {
    /// Receives one packet without blocking.
    fn try_receive(&self) -> RingRecv;

    /// Parks until the ring may be readable or [`wake`](Self::wake) is
    /// called. Spurious returns are allowed.
    fn wait_readable(&self);

    /// Releases every parked reader. Must stay signalled once called.
    fn wake(&self);

    /// Sends one packet without blocking.
    fn try_send(&self, packet: &[u8]) -> RingSend;

    /// Ends the packet session. Called once, after I/O has drained.
    fn end_session(&self);

    /// Releases the device handle. Called once, after `end_session`.
    fn close_device(&self);
}

// ============================================
// DeviceState
// ============================================

/// Close state machine of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceState {
    /// Accepting I/O.
    Open = 0,
    /// Close requested; waiting for in-flight I/O to leave.
    Closing = 1,
    /// Torn down.
    Closed = 2,
}

impl DeviceState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

// ============================================
// RingDevice
// ============================================

/// A [`TunDevice`] over a platform [`PacketRing`].
pub struct RingDevice<R> {
    ring: R,
    name: String,
    mtu: u32,
    state: AtomicU8,
    live_ops: AtomicUsize,
    drain_lock: Mutex<()>,
    drained: Condvar,
    close_once: Once,
    rate: RateEstimator,
    policy: PollPolicy,
}

/// Keeps an I/O call counted as in flight until dropped.
struct OpGuard<'a, R> {
    device: &'a RingDevice<R>,
}

impl<R> RingDevice<R> {
    fn is_closing(&self) -> bool {
        self.state.load(Ordering::SeqCst) != DeviceState::Open as u8
    }
}

impl<R> Drop for OpGuard<'_, R> {
    fn drop(&mut self) {
        let prev = self.device.live_ops.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 && self.device.is_closing() {
            let _guard = self.device.drain_lock.lock();
            self.device.drained.notify_all();
        }
    }
}

impl<R: PacketRing> RingDevice<R> {
    /// Wraps `ring` with the default poll policy.
    pub fn new(ring: R, name: impl Into<String>, mtu: u32) -> Self {
        Self::with_policy(ring, name, mtu, PollPolicy::default())
    }

    /// Wraps `ring` with an explicit poll policy.
    pub fn with_policy(ring: R, name: impl Into<String>, mtu: u32, policy: PollPolicy) -> Self {
        Self {
            ring,
            name: name.into(),
            mtu,
            state: AtomicU8::new(DeviceState::Open as u8),
            live_ops: AtomicUsize::new(0),
            drain_lock: Mutex::new(()),
            drained: Condvar::new(),
            close_once: Once::new(),
            rate: RateEstimator::new(policy.granularity),
            policy,
        }
    }

    /// The underlying ring.
    pub const fn ring(&self) -> &R {
        &self.ring
    }

    /// Current close state.
    pub fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Throughput estimator fed by reads and writes.
    pub const fn rate(&self) -> &RateEstimator {
        &self.rate
    }

    /// Number of reads and writes currently inside the device.
    pub fn in_flight(&self) -> usize {
        self.live_ops.load(Ordering::SeqCst)
    }

    fn enter(&self) -> OpGuard<'_, R> {
        self.live_ops.fetch_add(1, Ordering::SeqCst);
        OpGuard { device: self }
    }

    fn wait_drained(&self) {
        let mut guard = self.drain_lock.lock();
        while self.live_ops.load(Ordering::SeqCst) != 0 {
            self.ring.wake();
            self.drained.wait_for(&mut guard, DRAIN_POLL);
        }
    }

    fn teardown(&self) {
        self.state
            .store(DeviceState::Closing as u8, Ordering::SeqCst);
        self.ring.wake();
        self.wait_drained();
        self.ring.end_session();
        self.ring.close_device();
        self.state.store(DeviceState::Closed as u8, Ordering::SeqCst);
        debug!(device = %self.name, "TUN device closed");
    }
}

impl<R: PacketRing> TunDevice for RingDevice<R> {
    fn read(&self) -> Result<Vec<u8>> {
        let _op = self.enter();

        loop {
            if self.is_closing() {
                return Err(TransportError::Closed);
            }
            let start = monotonic_nanos();

            loop {
                if self.is_closing() {
                    return Err(TransportError::Closed);
                }
                match self.ring.try_receive() {
                    RingRecv::Packet(packet) => {
                        self.rate.record(packet.len() as u64);
                        return Ok(packet);
                    }
                    RingRecv::WouldBlock => {
                        let now = monotonic_nanos();
                        if self.policy.should_spin(&self.rate, now)
                            && self.policy.within_budget(now.saturating_sub(start))
                        {
                            std::hint::spin_loop();
                            std::thread::yield_now();
                            continue;
                        }
                        trace!(device = %self.name, "ring empty, parking");
                        self.ring.wait_readable();
                        break;
                    }
                    RingRecv::EndOfStream => return Err(TransportError::Closed),
                    RingRecv::Corrupt(reason) => {
                        return Err(TransportError::ring_corrupt(reason))
                    }
                    RingRecv::Err(e) => {
                        return Err(TransportError::io("receiving packet", e))
                    }
                }
            }
        }
    }

    fn write(&self, packet: &[u8]) -> Result<usize> {
        let _op = self.enter();
        if self.is_closing() {
            return Err(TransportError::Closed);
        }

        self.rate.record(packet.len() as u64);

        match self.ring.try_send(packet) {
            RingSend::Sent => Ok(packet.len()),
            RingSend::Overflow => {
                trace!(device = %self.name, len = packet.len(), "send ring full");
                Ok(0)
            }
            RingSend::Closed => Err(TransportError::Closed),
            RingSend::Err(e) => Err(TransportError::io("sending packet", e)),
        }
    }

    fn close(&self) -> Result<()> {
        self.close_once.call_once(|| self.teardown());
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u32 {
        self.mtu
    }
}

impl<R> fmt::Debug for RingDevice<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingDevice")
            .field("name", &self.name)
            .field("mtu", &self.mtu)
            .field("state", &DeviceState::from_u8(self.state.load(Ordering::SeqCst)))
            .field("live_ops", &self.live_ops.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tun::mock::{MockTun, RingEvent};
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn ipv4_packet(len: usize) -> Vec<u8> {
        let mut p = vec![0u8; len];
        p[0] = 0x45;
        p
    }

    #[test]
    fn test_read_returns_injected_packet() {
        let tun = MockTun::with_mtu("mock0", 1500);
        tun.ring().inject(ipv4_packet(60));

        let packet = tun.read().unwrap();
        assert_eq!(packet.len(), 60);
        assert_eq!(packet[0] >> 4, 4);
        assert_eq!(tun.in_flight(), 0);
    }

    #[test]
    fn test_read_parks_until_data_arrives() {
        let tun = Arc::new(MockTun::with_mtu("mock0", 1500));
        let reader = {
            let tun = Arc::clone(&tun);
            thread::spawn(move || tun.read())
        };

        thread::sleep(Duration::from_millis(20));
        tun.ring().inject(ipv4_packet(40));

        let packet = reader.join().unwrap().unwrap();
        assert_eq!(packet.len(), 40);
        assert!(tun.ring().events().contains(&RingEvent::WaitReturned));
    }

    #[test]
    fn test_end_of_stream_maps_to_closed() {
        let tun = MockTun::with_mtu("mock0", 1500);
        tun.ring().inject_end_of_stream();
        assert!(tun.read().unwrap_err().is_closed());
    }

    #[test]
    fn test_corrupt_ring_is_fatal() {
        let tun = MockTun::with_mtu("mock0", 1500);
        tun.ring().inject_corrupt("tail out of range");

        let err = tun.read().unwrap_err();
        assert!(matches!(err, TransportError::RingCorrupt { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_write_overflow_is_zero_not_error() {
        let tun = MockTun::with_mtu("mock0", 1500);
        tun.ring().set_send_capacity(1000);

        assert_eq!(tun.write(&ipv4_packet(600)).unwrap(), 600);
        assert_eq!(tun.write(&ipv4_packet(600)).unwrap(), 0);
        assert_eq!(tun.ring().take_sent().len(), 1);
        assert_eq!(tun.write(&ipv4_packet(600)).unwrap(), 600);
    }

    #[test]
    fn test_write_accounts_rate_before_send() {
        let tun = MockTun::with_mtu("mock0", 1500);
        tun.ring().set_send_capacity(0);
        assert_eq!(tun.write(&ipv4_packet(100)).unwrap(), 0);

        // the rejected 100 bytes were still counted: 100 B over 500ms
        let window_end = tun.rate().window_start() + 500_000_000;
        tun.rate().record_at(window_end, 0);
        assert_eq!(tun.rate().current(), 200);
    }

    #[test]
    fn test_io_after_close_is_closed() {
        let tun = MockTun::with_mtu("mock0", 1500);
        tun.ring().inject(ipv4_packet(60));
        tun.close().unwrap();

        assert_eq!(tun.state(), DeviceState::Closed);
        assert!(tun.read().unwrap_err().is_closed());
        assert!(tun.write(&ipv4_packet(60)).unwrap_err().is_closed());
        assert!(tun.ring().take_sent().is_empty());
        // queued packet was never consumed
        assert_eq!(tun.ring().pending(), 1);
    }

    #[test]
    fn test_concurrent_close_tears_down_once() {
        let tun = Arc::new(MockTun::with_mtu("mock0", 1500));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tun = Arc::clone(&tun);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    tun.close().unwrap();
                    tun.state()
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), DeviceState::Closed);
        }
        let events = tun.ring().events();
        let ends = events.iter().filter(|e| **e == RingEvent::SessionEnded).count();
        let closes = events.iter().filter(|e| **e == RingEvent::DeviceClosed).count();
        assert_eq!((ends, closes), (1, 1));
    }

    #[test]
    fn test_close_wakes_parked_reader_and_drains_first() {
        let tun = Arc::new(MockTun::with_mtu("mock0", 1500));
        let reader = {
            let tun = Arc::clone(&tun);
            thread::spawn(move || tun.read())
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(tun.in_flight(), 1);

        tun.close().unwrap();
        assert_eq!(tun.in_flight(), 0);
        assert!(reader.join().unwrap().unwrap_err().is_closed());

        let events = tun.ring().events();
        let wait = events.iter().position(|e| *e == RingEvent::WaitReturned);
        let end = events.iter().position(|e| *e == RingEvent::SessionEnded);
        let close = events.iter().position(|e| *e == RingEvent::DeviceClosed);
        assert!(wait < end && end < close, "order: {events:?}");
    }

    #[test]
    fn test_close_waits_for_in_flight_write() {
        let tun = Arc::new(MockTun::with_mtu("mock0", 1500));
        tun.ring().set_send_delay(Duration::from_millis(50));

        let writer = {
            let tun = Arc::clone(&tun);
            thread::spawn(move || tun.write(&ipv4_packet(80)))
        };
        thread::sleep(Duration::from_millis(10));
        tun.close().unwrap();

        assert_eq!(writer.join().unwrap().unwrap(), 80);
        let events = tun.ring().events();
        let sent = events.iter().position(|e| *e == RingEvent::SendReturned);
        let end = events.iter().position(|e| *e == RingEvent::SessionEnded);
        assert!(sent.is_some() && sent < end, "order: {events:?}");
    }
}
