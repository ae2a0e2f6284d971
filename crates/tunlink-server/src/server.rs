// ============================================
// File: crates/tunlink-server/src/server.rs
// ============================================
//! # Server Orchestrator
//!
//! ## Creation Reason
//! Wires configuration, the outbound dispatcher and the TUN inbound
//! together and owns the process lifecycle.
//!
//! ## Server Architecture
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                   Server                     │
//! │                                              │
//! │  TunInbound ──► NetStack ──► TunHandler      │
//! │      │                           │           │
//! │      ▼                           ▼           │
//! │  TUN device               DirectDispatcher   │
//! │                                  │           │
//! │                                  ▼           │
//! │                           host sockets       │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Server requires root or CAP_NET_ADMIN for TUN
//! - `run` returns only after the inbound is fully closed
//!
//! ## Last Modified
//! v0.1.0 - Initial server implementation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::dispatcher::{DirectDispatcher, Dispatcher};
use crate::error::{Result, ServerError};
use crate::inbound::TunInbound;

/// Main server.
///
/// # Lifecycle
/// 1. Create with `Server::new(config)`
/// 2. Run with `server.run().await`
/// 3. Shutdown via `shutdown()` or Ctrl+C
pub struct Server {
    config: ServerConfig,
    shutdown: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Creates a new server.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    /// Runs the server until shutdown.
    ///
    /// # Errors
    /// Invalid configuration, device creation or stack bring-up failure.
    pub async fn run(&self) -> Result<()> {
        self.config.validate()?;

        let dispatcher: Arc<dyn Dispatcher> =
            Arc::new(DirectDispatcher::new(&self.config.outbound));
        self.run_with(TunInbound::new(&self.config, dispatcher)?).await
    }

    /// Runs an already constructed inbound until shutdown.
    ///
    /// # Errors
    /// Stack bring-up failure.
    pub async fn run_with(&self, inbound: TunInbound) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(ServerError::ShuttingDown);
        }

        inbound.start()?;
        info!("Server running on {}", inbound.name());

        tokio::select! {
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
            },
            _ = shutdown_rx.recv() => info!("Shutdown requested"),
        }

        self.shutdown.store(true, Ordering::SeqCst);
        let closing = tokio::task::spawn_blocking(move || inbound.close());
        if let Err(e) = closing.await {
            warn!("Inbound close panicked: {}", e);
        }

        info!("Server shutdown complete");
        Ok(())
    }

    /// Triggers server shutdown programmatically.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    /// Returns `true` once shutdown has been requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("tun_device", &self.config.tun.name)
            .field("shutdown", &self.is_shutting_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Link;
    use async_trait::async_trait;
    use std::time::Duration;
    use tunlink_common::{Context, Destination};
    use tunlink_transport::tun::MockTun;
    use tunlink_transport::DeviceState;

    struct Refuse;

    #[async_trait]
    impl Dispatcher for Refuse {
        async fn dispatch_link(
            &self,
            _ctx: Context,
            destination: Destination,
            _link: Link,
        ) -> Result<()> {
            Err(ServerError::dispatch(destination, "refused"))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_closes_inbound() {
        let server = Arc::new(Server::new(ServerConfig::default()));
        let tun = Arc::new(MockTun::with_mtu("mock0", 1500));
        let inbound =
            TunInbound::with_device(&ServerConfig::default(), tun.clone(), Arc::new(Refuse));

        let runner = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run_with(inbound).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(tun.state(), DeviceState::Open);

        server.shutdown();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(server.is_shutting_down());
        assert_eq!(tun.state(), DeviceState::Closed);
    }

    #[tokio::test]
    async fn test_run_after_shutdown_rejected() {
        let server = Server::new(ServerConfig::default());
        server.shutdown();

        let tun = Arc::new(MockTun::with_mtu("mock0", 1500));
        let inbound = TunInbound::with_device(&ServerConfig::default(), tun, Arc::new(Refuse));
        assert!(matches!(
            server.run_with(inbound).await,
            Err(ServerError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_run_rejects_invalid_config() {
        let mut config = ServerConfig::default();
        config.tun.inet4_address = "not-a-network".into();
        let err = Server::new(config).run().await.unwrap_err();
        assert!(err.is_config_error());
    }
}
