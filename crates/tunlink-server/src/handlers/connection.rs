// ============================================
// File: crates/tunlink-server/src/handlers/connection.rs
// ============================================
//! # Connection Handler
//!
//! ## Creation Reason
//! Bridges accepted connections to the dispatcher. Every connection gets
//! a fresh session id and its source recorded as inbound metadata, then
//! runs to completion in the dispatcher and is closed.
//!
//! ## Main Functionality
//! - `TunHandler`: `ConnectionHandler` feeding a `Dispatcher`
//! - `ConnectionEventSink`: accept/finish notifications
//! - `TracingEventSink`: default sink, structured `tracing` events
//!
//! ## Last Modified
//! v0.1.0 - Initial connection handler

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use tunlink_common::{Context, Destination, InboundInfo, Network, SessionId};
use tunlink_core::{Connection, ConnectionHandler};

use crate::dispatcher::{Dispatcher, Link};
use crate::error::ServerError;

// ============================================
// Events
// ============================================

/// One accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// Session id minted for the connection
    pub session_id: SessionId,
    /// Transport of the flow
    pub network: Network,
    /// Peer that opened the flow
    pub source: SocketAddr,
    /// Address the flow was sent to
    pub destination: SocketAddr,
}

/// Observer of connection lifecycles.
pub trait ConnectionEventSink: Send + Sync {
    /// The connection is about to be dispatched.
    fn on_accepted(&self, event: &ConnectionEvent);

    /// Dispatch finished; `error` is set if it ended abnormally.
    fn on_finished(&self, event: &ConnectionEvent, error: Option<&ServerError>);
}

/// Sink that logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl ConnectionEventSink for TracingEventSink {
    fn on_accepted(&self, event: &ConnectionEvent) {
        info!(
            session_id = %event.session_id,
            network = %event.network,
            source = %event.source,
            destination = %event.destination,
            "Inbound connection"
        );
    }

    fn on_finished(&self, event: &ConnectionEvent, error: Option<&ServerError>) {
        match error {
            None => debug!(session_id = %event.session_id, "Connection finished"),
            Some(e) => debug!(session_id = %event.session_id, "Connection ended: {}", e),
        }
    }
}

// ============================================
// TunHandler
// ============================================

/// Hands every accepted connection to a dispatcher.
pub struct TunHandler {
    tag: String,
    dispatcher: Arc<dyn Dispatcher>,
    events: Arc<dyn ConnectionEventSink>,
}

impl TunHandler {
    /// Creates a handler logging through `tracing`.
    pub fn new(tag: impl Into<String>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self::with_events(tag, dispatcher, Arc::new(TracingEventSink))
    }

    /// Creates a handler reporting to `events`.
    pub fn with_events(
        tag: impl Into<String>,
        dispatcher: Arc<dyn Dispatcher>,
        events: Arc<dyn ConnectionEventSink>,
    ) -> Self {
        Self {
            tag: tag.into(),
            dispatcher,
            events,
        }
    }

    async fn handle(
        &self,
        network: Network,
        ctx: Context,
        conn: Arc<dyn Connection>,
        source: SocketAddr,
        destination: SocketAddr,
    ) {
        let event = ConnectionEvent {
            session_id: SessionId::generate(),
            network,
            source,
            destination,
        };
        let ctx = ctx.with_session_id(event.session_id).with_inbound(InboundInfo {
            source: Destination {
                network,
                address: source,
            },
            tag: self.tag.clone(),
        });

        self.events.on_accepted(&event);
        let result = self
            .dispatcher
            .dispatch_link(
                ctx,
                Destination {
                    network,
                    address: destination,
                },
                Link::from_connection(Arc::clone(&conn)),
            )
            .await;
        self.events.on_finished(&event, result.as_ref().err());

        conn.close().await;
    }
}

#[async_trait]
impl ConnectionHandler for TunHandler {
    async fn on_new_tcp(
        &self,
        ctx: Context,
        conn: Arc<dyn Connection>,
        source: SocketAddr,
        destination: SocketAddr,
    ) {
        self.handle(Network::Tcp, ctx, conn, source, destination).await;
    }

    async fn on_new_udp(
        &self,
        ctx: Context,
        conn: Arc<dyn Connection>,
        source: SocketAddr,
        destination: SocketAddr,
    ) {
        self.handle(Network::Udp, ctx, conn, source, destination).await;
    }
}

impl std::fmt::Debug for TunHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunHandler")
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tunlink_common::{BufferedReader, BufferedWriter, CommonError, MultiBuffer};
    use tunlink_core::StreamConnection;

    #[derive(Default)]
    struct Recorded {
        dispatched: Vec<(Option<SessionId>, Option<InboundInfo>, Destination)>,
        accepted: Vec<ConnectionEvent>,
        finished: Vec<bool>,
    }

    #[derive(Default)]
    struct Recorder(Mutex<Recorded>);

    #[async_trait]
    impl Dispatcher for Recorder {
        async fn dispatch_link(
            &self,
            ctx: Context,
            destination: Destination,
            link: Link,
        ) -> crate::error::Result<()> {
            self.0.lock().dispatched.push((
                ctx.session_id().copied(),
                ctx.inbound().cloned(),
                destination,
            ));
            let mb = link.reader.read_multi_buffer().await?;
            link.writer.write_multi_buffer(mb).await?;
            Ok(())
        }
    }

    impl ConnectionEventSink for Recorder {
        fn on_accepted(&self, event: &ConnectionEvent) {
            self.0.lock().accepted.push(*event);
        }

        fn on_finished(&self, _event: &ConnectionEvent, error: Option<&ServerError>) {
            self.0.lock().finished.push(error.is_none());
        }
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_connection_dispatched_with_session_and_closed() {
        let recorder = Arc::new(Recorder::default());
        let handler = TunHandler::with_events("tun", recorder.clone(), recorder.clone());

        let (near, far) = tokio::io::duplex(1024);
        let app = StreamConnection::new(far);
        app.write_multi_buffer(MultiBuffer::from_slice(b"echo")).await.unwrap();

        let source = addr("10.0.0.2:51820");
        let destination = addr("203.0.113.5:443");
        let conn: Arc<dyn Connection> = Arc::new(StreamConnection::new(near));
        handler
            .on_new_tcp(Context::new(), conn, source, destination)
            .await;

        assert_eq!(app.read_multi_buffer().await.unwrap().to_vec(), b"echo");
        // Closed after dispatch.
        assert!(matches!(
            app.read_multi_buffer().await,
            Err(CommonError::EndOfStream)
        ));

        let recorded = recorder.0.lock();
        let (session, inbound, dest) = recorded.dispatched[0].clone();
        assert_eq!(session, Some(recorded.accepted[0].session_id));
        assert_eq!(dest, Destination::tcp(destination));
        let inbound = inbound.unwrap();
        assert_eq!(inbound.source, Destination::tcp(source));
        assert_eq!(inbound.tag, "tun");
        assert_eq!(recorded.finished, vec![true]);
    }

    #[tokio::test]
    async fn test_each_connection_gets_fresh_session() {
        let recorder = Arc::new(Recorder::default());
        let handler = TunHandler::with_events("tun", recorder.clone(), recorder.clone());

        for _ in 0..2 {
            let (near, far) = tokio::io::duplex(64);
            drop(far);
            handler
                .on_new_udp(
                    Context::new(),
                    Arc::new(StreamConnection::new(near)),
                    addr("10.0.0.2:5000"),
                    addr("198.51.100.9:53"),
                )
                .await;
        }

        let recorded = recorder.0.lock();
        assert_eq!(recorded.accepted.len(), 2);
        assert_ne!(recorded.accepted[0].session_id, recorded.accepted[1].session_id);
        assert_eq!(recorded.accepted[0].network, Network::Udp);
        assert_eq!(recorded.finished, vec![false, false]);
    }
}
