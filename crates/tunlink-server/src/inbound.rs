// ============================================
// File: crates/tunlink-server/src/inbound.rs
// ============================================
//! # TUN Inbound
//!
//! ## Creation Reason
//! Owns the device and the network stack for one interface and orders
//! their lifecycle: create the device, build the stack over it, start,
//! and on close tear the stack down before the device.
//!
//! ## Main Logical Flow
//! 1. `new`: device session from `[tun]`, stack over its link endpoint
//! 2. `start`: engine bring-up; the device is closed if it fails
//! 3. `close`: cancel flows, stop the stack, close the device
//!
//! ## Last Modified
//! v0.1.0 - Initial inbound

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use tunlink_common::Context;
use tunlink_core::link::{LinkBridge, LinkEndpoint, TunDeviceExt};
use tunlink_core::NetStack;
use tunlink_transport::TunDevice;

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{Result, ServerError};
use crate::handlers::TunHandler;

/// Inbound tag recorded on every flow.
pub const INBOUND_TAG: &str = "tun";

/// A TUN interface feeding the dispatcher.
pub struct TunInbound {
    device: Arc<dyn TunDevice>,
    link: Arc<LinkBridge>,
    stack: NetStack,
    ctx: Context,
    closed: AtomicBool,
}

impl TunInbound {
    /// Creates the platform device and the stack over it.
    ///
    /// # Errors
    /// Invalid `[tun]` section, or device creation failure.
    pub fn new(config: &ServerConfig, dispatcher: Arc<dyn Dispatcher>) -> Result<Self> {
        let tun_config = config.tun_config()?;
        let device = tunlink_transport::tun::create(tun_config)?;
        info!("tun created at {}", device.name());
        Ok(Self::with_device(config, device, dispatcher))
    }

    /// Builds the inbound over an existing device.
    pub fn with_device(
        config: &ServerConfig,
        device: Arc<dyn TunDevice>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let link = device.new_endpoint();
        let ctx = Context::new();
        let handler = Arc::new(TunHandler::new(INBOUND_TAG, dispatcher));
        let stack = NetStack::new(config.stack_config(), link.clone(), handler, ctx.clone());
        Self {
            device,
            link,
            stack,
            ctx,
            closed: AtomicBool::new(false),
        }
    }

    /// Interface name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.device.name()
    }

    /// Starts accepting flows.
    ///
    /// # Errors
    /// Stack bring-up failure. The device is closed before returning.
    pub fn start(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ServerError::ShuttingDown);
        }
        if let Err(e) = self.stack.start() {
            self.close();
            return Err(ServerError::startup_failed(format!(
                "network stack on {}: {e}",
                self.device.name()
            )));
        }
        info!("tun started at {}", self.device.name());
        Ok(())
    }

    /// Stops the stack, then closes the device. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ctx.cancellation().cancel();
        self.stack.close();
        if let Err(e) = self.device.close() {
            warn!("Closing {} failed: {}", self.device.name(), e);
        }
        self.link.wait();
        info!("tun closed at {}", self.device.name());
    }
}

impl Drop for TunInbound {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TunInbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunInbound")
            .field("name", &self.device.name())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Link;
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tunlink_common::Destination;
    use tunlink_transport::tun::MockTun;
    use tunlink_transport::DeviceState;

    struct Announcer(mpsc::UnboundedSender<(Option<String>, Destination)>);

    #[async_trait]
    impl Dispatcher for Announcer {
        async fn dispatch_link(
            &self,
            ctx: Context,
            destination: Destination,
            _link: Link,
        ) -> Result<()> {
            let _ = self
                .0
                .send((ctx.inbound().map(|i| i.tag.clone()), destination));
            Ok(())
        }
    }

    /// IPv4/UDP datagram with a zero (unset) UDP checksum.
    fn udp_v4(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, payload: &[u8]) -> Vec<u8> {
        let total = 28 + payload.len();
        let mut p = vec![0u8; total];
        p[0] = 0x45;
        p[2..4].copy_from_slice(&u16::try_from(total).unwrap().to_be_bytes());
        p[8] = 64;
        p[9] = 17;
        p[12..16].copy_from_slice(&src);
        p[16..20].copy_from_slice(&dst);
        let mut sum: u32 = 0;
        for chunk in p[..20].chunks(2) {
            sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
        }
        while sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        p[10..12].copy_from_slice(&(!(sum as u16)).to_be_bytes());
        p[20..22].copy_from_slice(&sport.to_be_bytes());
        p[22..24].copy_from_slice(&dport.to_be_bytes());
        p[24..26].copy_from_slice(&u16::try_from(8 + payload.len()).unwrap().to_be_bytes());
        p[28..].copy_from_slice(payload);
        p
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_udp_flow_reaches_dispatcher() {
        let tun = Arc::new(MockTun::with_mtu("mock0", 1500));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let inbound = TunInbound::with_device(
            &ServerConfig::default(),
            tun.clone(),
            Arc::new(Announcer(tx)),
        );
        inbound.start().unwrap();

        tun.ring()
            .inject(udp_v4([10, 0, 0, 2], 5353, [198, 51, 100, 9], 53, b"query"));
        let (tag, destination) = rx.recv().await.unwrap();
        assert_eq!(tag.as_deref(), Some(INBOUND_TAG));
        assert_eq!(destination, Destination::udp("198.51.100.9:53".parse().unwrap()));

        inbound.close();
        assert_eq!(tun.state(), DeviceState::Closed);
    }

    #[tokio::test]
    async fn test_failed_start_closes_device() {
        let tun = Arc::new(MockTun::with_mtu("mock0", 1500));
        let mut config = ServerConfig::default();
        config.stack.tcp_buffer_size = 0;
        let (tx, _rx) = mpsc::unbounded_channel();
        let inbound = TunInbound::with_device(&config, tun.clone(), Arc::new(Announcer(tx)));

        let err = inbound.start().unwrap_err();
        assert!(matches!(err, ServerError::StartupFailed { .. }));
        assert!(err.is_fatal());
        assert_eq!(tun.state(), DeviceState::Closed);

        inbound.close();
        assert!(matches!(inbound.start(), Err(ServerError::ShuttingDown)));
    }
}
