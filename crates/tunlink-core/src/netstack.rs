// ============================================
// File: crates/tunlink-core/src/netstack.rs
// ============================================
//! # Network Stack
//!
//! ## Creation Reason
//! Brings up one protocol engine over a link endpoint, configured as a
//! transparent relay, and turns every accepted flow into a handler call.
//!
//! ## Main Functionality
//! - `StackConfig`: TCP buffer policy, forwarder limits, UDP queue depth
//! - `NetStack::start`: ordered engine bring-up, forwarder registration
//! - `NetStack::close`: engine teardown
//!
//! ## Main Logical Flow
//! 1. Create engine (IPv4/IPv6, TCP/UDP/ICMP)
//! 2. Register the link as NIC 1
//! 3. Default IPv4 and IPv6 routes via NIC 1
//! 4. Spoofing and promiscuous mode on NIC 1
//! 5. TCP tuning: SACK, receive moderation, fixed buffer ranges
//! 6. TCP and UDP forwarders
//!
//! ## ⚠️ Important Note for Next Developer
//! - Any failing step closes the engine and returns `CoreError::Setup`
//!   naming the step. The link is detached again by the close.
//! - Forwarder callbacks run on the link dispatch thread. They must only
//!   spawn; never await the handler there.
//!
//! ## Last Modified
//! v0.1.0 - Initial network stack

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info, trace};
use tunlink_common::Context;

use crate::conn::{Connection, DatagramConnection, StreamConnection};
use crate::engine::{
    BufferSizeRange, Engine, EngineOptions, Route, TcpForwarder, TcpForwarderRequest, TcpOption,
    UdpForwarder, UdpForwarderRequest, DEFAULT_KEEP_ALIVE_INTERVAL, DEFAULT_UDP_QUEUE_DEPTH,
};
use crate::error::{CoreError, Result};
use crate::handler::ConnectionHandler;
use crate::link::LinkEndpoint;

// ============================================
// Constants
// ============================================

/// NIC id the link is registered under.
pub const NIC_ID: u32 = 1;

/// Default TCP send and receive buffer size.
pub const DEFAULT_TCP_BUFFER_SIZE: usize = 20 * 1024;

/// Default half-open connection limit.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 1024;

// ============================================
// StackConfig
// ============================================

/// Tuning of the protocol engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackConfig {
    /// Min, default and max of both TCP buffer ranges
    pub tcp_buffer_size: usize,
    /// Half-open TCP connections before SYNs are dropped
    pub tcp_max_in_flight: usize,
    /// Selective acknowledgment
    pub sack: bool,
    /// Receive buffer auto-moderation
    pub moderate_receive_buffer: bool,
    /// Keep-alive probe interval for accepted connections
    pub keep_alive_interval: Duration,
    /// Datagrams queued per UDP flow
    pub udp_queue_depth: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            tcp_buffer_size: DEFAULT_TCP_BUFFER_SIZE,
            tcp_max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            sack: true,
            moderate_receive_buffer: true,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            udp_queue_depth: DEFAULT_UDP_QUEUE_DEPTH,
        }
    }
}

// ============================================
// NetStack
// ============================================

/// Protocol engine bound to one link, forwarding flows to a handler.
pub struct NetStack {
    config: StackConfig,
    link: Arc<dyn LinkEndpoint>,
    handler: Arc<dyn ConnectionHandler>,
    ctx: Context,
    engine: Mutex<Option<Engine>>,
}

fn step<T>(name: &'static str, result: Result<T>) -> Result<T> {
    result.map_err(|e| match e {
        CoreError::Setup { .. } => e,
        other => CoreError::setup(name, other),
    })
}

impl NetStack {
    /// Creates a stack that is not yet running.
    pub fn new(
        config: StackConfig,
        link: Arc<dyn LinkEndpoint>,
        handler: Arc<dyn ConnectionHandler>,
        ctx: Context,
    ) -> Self {
        Self {
            config,
            link,
            handler,
            ctx,
            engine: Mutex::new(None),
        }
    }

    /// Brings the engine up. Must be called inside a Tokio runtime.
    ///
    /// # Errors
    /// `CoreError::Setup` naming the failed step; nothing stays
    /// configured.
    pub fn start(&self) -> Result<()> {
        let mut slot = self.engine.lock();
        if slot.is_some() {
            return Err(CoreError::setup("create engine", "stack already started"));
        }

        let runtime =
            Handle::try_current().map_err(|e| CoreError::setup("create engine", e))?;
        let engine = step(
            "create engine",
            Engine::new(EngineOptions::full().with_udp_queue_depth(self.config.udp_queue_depth)),
        )?;

        if let Err(e) = self.configure(&engine, runtime) {
            engine.close();
            return Err(e);
        }

        *slot = Some(engine);
        info!(
            mtu = self.link.mtu(),
            tcp_buffer = self.config.tcp_buffer_size,
            "Network stack started"
        );
        Ok(())
    }

    fn configure(&self, engine: &Engine, runtime: Handle) -> Result<()> {
        step("register nic", engine.create_nic(NIC_ID, Arc::clone(&self.link)))?;
        step(
            "install routes",
            engine.set_route_table(vec![Route::default_ipv4(NIC_ID), Route::default_ipv6(NIC_ID)]),
        )?;
        step("enable spoofing", engine.set_spoofing(NIC_ID, true))?;
        step("enable promiscuous mode", engine.set_promiscuous_mode(NIC_ID, true))?;

        let range = BufferSizeRange::fixed(self.config.tcp_buffer_size);
        for option in [
            TcpOption::Sack(self.config.sack),
            TcpOption::ModerateReceiveBuffer(self.config.moderate_receive_buffer),
            TcpOption::ReceiveBufferSizeRange(range),
            TcpOption::SendBufferSizeRange(range),
            TcpOption::KeepAliveInterval(self.config.keep_alive_interval),
        ] {
            step("tune tcp", engine.set_tcp_option(option))?;
        }

        engine.set_tcp_forwarder(self.tcp_forwarder(runtime.clone()));
        engine.set_udp_forwarder(self.udp_forwarder(runtime));
        Ok(())
    }

    fn tcp_forwarder(&self, runtime: Handle) -> TcpForwarder {
        let handler = Arc::clone(&self.handler);
        let ctx = self.ctx.clone();

        let accept = move |mut request: TcpForwarderRequest| {
            let id = request.id();
            let endpoint = match request.create_endpoint() {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    debug!(source = %id.remote, destination = %id.local, "TCP endpoint refused: {}", e);
                    request.complete(true);
                    return;
                }
            };
            request.complete(false);
            endpoint.set_keep_alive(true);

            let (Some(destination), Some(source)) =
                (endpoint.local_addr(), endpoint.remote_addr())
            else {
                debug!(source = %id.remote, "TCP endpoint without addresses, aborting");
                endpoint.abort();
                return;
            };

            let conn: Arc<dyn Connection> = Arc::new(StreamConnection::new(endpoint));
            let handler = Arc::clone(&handler);
            let ctx = ctx.child();
            runtime.spawn(async move {
                handler.on_new_tcp(ctx, conn, source, destination).await;
            });
        };
        TcpForwarder::new(0, self.config.tcp_max_in_flight, accept)
    }

    fn udp_forwarder(&self, runtime: Handle) -> UdpForwarder {
        let handler = Arc::clone(&self.handler);
        let ctx = self.ctx.clone();

        UdpForwarder::new(move |request: UdpForwarderRequest| {
            let id = request.id();
            let endpoint = match request.create_endpoint() {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    trace!(source = %id.remote, "UDP endpoint refused: {}", e);
                    return;
                }
            };

            let (source, destination): (SocketAddr, SocketAddr) =
                (endpoint.remote_addr(), endpoint.local_addr());
            let conn: Arc<dyn Connection> = Arc::new(DatagramConnection::new(endpoint));
            let handler = Arc::clone(&handler);
            let ctx = ctx.child();
            runtime.spawn(async move {
                handler.on_new_udp(ctx, conn, source, destination).await;
            });
        })
    }

    /// Returns true between a successful `start` and `close`.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.engine.lock().is_some()
    }

    /// The running engine, for inspection.
    #[must_use]
    pub fn engine(&self) -> Option<Engine> {
        self.engine.lock().clone()
    }

    /// Stops the engine. Idempotent.
    pub fn close(&self) {
        if let Some(engine) = self.engine.lock().take() {
            engine.close();
            info!("Network stack closed");
        }
    }
}

impl Drop for NetStack {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for NetStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetStack")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

// ============================================
// Tests
// ============================================
