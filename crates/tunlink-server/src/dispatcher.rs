// ============================================
// File: crates/tunlink-server/src/dispatcher.rs
// ============================================
//! # Dispatcher
//!
//! ## Creation Reason
//! The inbound decides nothing about where a flow goes. It hands each
//! connection to a `Dispatcher` as a `Link` keyed by the original
//! destination and waits until the dispatcher is done with it.
//!
//! ## Main Functionality
//! - `Link`: reader and writer halves of one flow
//! - `Dispatcher`: the routing contract
//! - `DirectDispatcher`: connects straight to the destination, optionally
//!   from a fixed interface
//!
//! ## Main Logical Flow
//! ```text
//! TCP: connect (timeout) ─► uplink: link.reader ─► socket
//!                           downlink: socket ─► link.writer
//!      destination EOF ─► link.writer.shutdown_write ─► uplink drains
//!                         (bounded by the half-close timeout)
//! UDP: bind ─► uplink: each buffer ─► send_to(destination)
//!              downlink: recv_from ─► buffer tagged with the flow source
//!              idle timer touched by both directions
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - With an auto-routed interface, an unbound direct socket routes
//!   straight back into the interface; set `bind_interface`
//! - Dispatch returns when either the flow ends, the context is
//!   cancelled, or (UDP) the idle timeout expires
//! - A TCP flow only ends once both directions finished; a source that
//!   never closes after the destination did is cut off after
//!   `half_close_timeout`
//!
//! ## Last Modified
//! v0.1.0 - Initial dispatcher

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tracing::{debug, trace};

use tunlink_common::time::AtomicInstant;
use tunlink_common::{
    Buffer, BufferedReader, BufferedWriter, Context, Destination, MultiBuffer, Network,
    Result as CommonResult,
};
use tunlink_core::Connection;

use crate::config::OutboundSection;
use crate::error::{Result, ServerError};

// ============================================
// Link
// ============================================

/// The two directions of one flow.
#[derive(Clone)]
pub struct Link {
    /// Bytes or datagrams coming from the flow's source
    pub reader: Arc<dyn BufferedReader>,
    /// Bytes or datagrams going back to the flow's source
    pub writer: Arc<dyn BufferedWriter>,
}

struct ConnectionHalf(Arc<dyn Connection>);

#[async_trait]
impl BufferedReader for ConnectionHalf {
    async fn read_multi_buffer(&self) -> CommonResult<MultiBuffer> {
        self.0.read_multi_buffer().await
    }
}

#[async_trait]
impl BufferedWriter for ConnectionHalf {
    async fn write_multi_buffer(&self, mb: MultiBuffer) -> CommonResult<()> {
        self.0.write_multi_buffer(mb).await
    }

    async fn shutdown_write(&self) -> CommonResult<()> {
        self.0.shutdown_write().await
    }
}

impl Link {
    /// Builds a link whose halves both use `conn`.
    #[must_use]
    pub fn from_connection(conn: Arc<dyn Connection>) -> Self {
        let half = Arc::new(ConnectionHalf(conn));
        Self {
            reader: half.clone(),
            writer: half,
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

// ============================================
// Dispatcher
// ============================================

/// Routes a flow to its next hop.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Carries `link` to `destination`, returning once the flow is over.
    ///
    /// # Errors
    /// The flow could not be carried or ended abnormally.
    async fn dispatch_link(&self, ctx: Context, destination: Destination, link: Link)
        -> Result<()>;
}

// ============================================
// DirectDispatcher
// ============================================

/// Dispatcher that connects to every destination directly.
#[derive(Debug, Clone)]
pub struct DirectDispatcher {
    bind_interface: Option<String>,
    connect_timeout: Duration,
    udp_idle_timeout: Duration,
    half_close_timeout: Duration,
}

/// How long the source may keep its side open after the destination closed.
const DEFAULT_HALF_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

impl DirectDispatcher {
    /// Creates a dispatcher from the outbound section.
    #[must_use]
    pub fn new(config: &OutboundSection) -> Self {
        Self {
            bind_interface: config.bind_interface.clone(),
            connect_timeout: config.connect_timeout(),
            udp_idle_timeout: config.udp_idle_timeout(),
            half_close_timeout: DEFAULT_HALF_CLOSE_TIMEOUT,
        }
    }

    /// Overrides how long a TCP flow lingers once only the source is open.
    #[must_use]
    pub const fn with_half_close_timeout(mut self, timeout: Duration) -> Self {
        self.half_close_timeout = timeout;
        self
    }

    fn socket(&self, address: SocketAddr, ty: Type, protocol: Protocol) -> std::io::Result<Socket> {
        let socket = Socket::new(Domain::for_address(address), ty, Some(protocol))?;
        if let Some(name) = &self.bind_interface {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            socket.bind_device(Some(name.as_bytes()))?;
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            debug!(interface = %name, "Interface binding unsupported on this platform");
        }
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    async fn connect_tcp(&self, address: SocketAddr) -> std::io::Result<TcpStream> {
        let socket = self.socket(address, Type::STREAM, Protocol::TCP)?;
        socket.set_nodelay(true)?;
        let socket = TcpSocket::from_std_stream(socket.into());
        tokio::time::timeout(self.connect_timeout, socket.connect(address))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))?
    }

    async fn relay_tcp(&self, destination: Destination, link: Link) -> Result<()> {
        let stream = self
            .connect_tcp(destination.address)
            .await
            .map_err(|e| ServerError::dispatch(destination, e.to_string()))?;
        debug!(%destination, "Direct TCP connected");
        let (mut rd, mut wr) = stream.into_split();

        let uplink = async {
            loop {
                match link.reader.read_multi_buffer().await {
                    Ok(mb) => {
                        for b in mb {
                            wr.write_all(b.bytes()).await?;
                        }
                    }
                    Err(e) if e.is_end_of_flow() => {
                        let _ = wr.shutdown().await;
                        return Ok::<(), ServerError>(());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let downlink = async {
            loop {
                let mut b = Buffer::new();
                let n = rd.read(b.spare_mut()).await?;
                if n == 0 {
                    return Ok::<(), ServerError>(());
                }
                b.commit(n);
                link.writer.write_multi_buffer(MultiBuffer::single(b)).await?;
            }
        };

        tokio::pin!(uplink);
        tokio::pin!(downlink);

        tokio::select! {
            result = &mut uplink => {
                result?;
                downlink.await
            }
            result = &mut downlink => {
                result?;
                if let Err(e) = link.writer.shutdown_write().await {
                    trace!(%destination, "Half-close toward source failed: {}", e);
                }
                match tokio::time::timeout(self.half_close_timeout, uplink).await {
                    Ok(result) => result,
                    Err(_) => {
                        trace!(%destination, "Source still open after remote close, dropping flow");
                        Ok(())
                    }
                }
            }
        }
    }

    async fn relay_udp(&self, ctx: &Context, destination: Destination, link: Link) -> Result<()> {
        let Some(source) = ctx.inbound().map(|inbound| inbound.source.address) else {
            return Err(ServerError::dispatch(destination, "flow source unknown"));
        };

        let bind: SocketAddr = if destination.address.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = self.socket(destination.address, Type::DGRAM, Protocol::UDP)?;
        socket.bind(&bind.into())?;
        let socket = UdpSocket::from_std(socket.into())?;
        let last_active = AtomicInstant::now();

        let uplink = async {
            loop {
                let mb = match link.reader.read_multi_buffer().await {
                    Ok(mb) => mb,
                    Err(e) if e.is_end_of_flow() => return Ok::<(), ServerError>(()),
                    Err(e) => return Err(e.into()),
                };
                last_active.touch();
                for b in mb {
                    socket.send_to(b.bytes(), destination.address).await?;
                }
            }
        };

        let downlink = async {
            loop {
                let mut b = Buffer::new();
                let (n, from) = match socket.recv_from(b.spare_mut()).await {
                    Ok(received) => received,
                    Err(e) => return Err::<(), ServerError>(e.into()),
                };
                if from != destination.address {
                    trace!(%from, %destination, "Dropping datagram from unexpected peer");
                    continue;
                }
                last_active.touch();
                b.commit(n);
                b.set_udp(Some(Destination::udp(source)));
                link.writer.write_multi_buffer(MultiBuffer::single(b)).await?;
            }
        };

        let idle = async {
            loop {
                let remaining = self.udp_idle_timeout.saturating_sub(last_active.elapsed());
                if remaining.is_zero() {
                    trace!(%destination, "UDP flow idle, closing");
                    return;
                }
                tokio::time::sleep(remaining).await;
            }
        };

        tokio::select! {
            result = uplink => result,
            result = downlink => result,
            () = idle => Ok(()),
        }
    }
}

#[async_trait]
impl Dispatcher for DirectDispatcher {
    async fn dispatch_link(
        &self,
        ctx: Context,
        destination: Destination,
        link: Link,
    ) -> Result<()> {
        let relay = async {
            match destination.network {
                Network::Tcp => self.relay_tcp(destination, link).await,
                Network::Udp => self.relay_udp(&ctx, destination, link).await,
            }
        };

        tokio::select! {
            result = relay => result,
            () = ctx.cancellation().cancelled() => Err(ServerError::ShuttingDown),
        }
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tunlink_common::InboundInfo;
    use tunlink_core::conn::{DatagramConnection, DatagramSocket, StreamConnection};

    fn dispatcher() -> DirectDispatcher {
        DirectDispatcher::new(&OutboundSection::default())
    }

    #[tokio::test]
    async fn test_tcp_relay_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong").await.unwrap();
        });

        let (near, far) = tokio::io::duplex(4096);
        let conn: Arc<dyn Connection> = Arc::new(StreamConnection::new(near));
        let app = StreamConnection::new(far);

        let link = Link::from_connection(conn);
        let relay = tokio::spawn(async move {
            dispatcher()
                .dispatch_link(Context::new(), Destination::tcp(target), link)
                .await
        });

        app.write_multi_buffer(MultiBuffer::from_slice(b"ping")).await.unwrap();
        let reply = app.read_multi_buffer().await.unwrap();
        assert_eq!(reply.to_vec(), b"pong");

        app.close().await;
        server.await.unwrap();
        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_remote_close_reaches_source() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(b"pong").await.unwrap();
        });

        let (near, far) = tokio::io::duplex(4096);
        let conn: Arc<dyn Connection> = Arc::new(StreamConnection::new(near));
        let app = StreamConnection::new(far);
        let link = Link::from_connection(conn);
        let relay = tokio::spawn(async move {
            dispatcher()
                .dispatch_link(Context::new(), Destination::tcp(target), link)
                .await
        });

        app.write_multi_buffer(MultiBuffer::from_slice(b"ping")).await.unwrap();
        assert_eq!(app.read_multi_buffer().await.unwrap().to_vec(), b"pong");

        let eof = tokio::time::timeout(Duration::from_secs(3), app.read_multi_buffer())
            .await
            .expect("source never saw the destination close");
        assert!(matches!(eof, Err(tunlink_common::CommonError::EndOfStream)));

        app.close().await;
        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_source_left_open_is_cut_off() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let (near, far) = tokio::io::duplex(4096);
        let conn: Arc<dyn Connection> = Arc::new(StreamConnection::new(near));
        let _app = StreamConnection::new(far);
        let direct = dispatcher().with_half_close_timeout(Duration::from_millis(100));
        let relay = direct.dispatch_link(
            Context::new(),
            Destination::tcp(target),
            Link::from_connection(conn),
        );

        tokio::time::timeout(Duration::from_secs(3), relay)
            .await
            .expect("relay outlived the half-close timeout")
            .unwrap();
    }

    #[tokio::test]
    async fn test_tcp_connect_failure_is_dispatch_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        drop(listener);

        let (near, _far) = tokio::io::duplex(64);
        let conn: Arc<dyn Connection> = Arc::new(StreamConnection::new(near));
        let link = Link::from_connection(conn);
        let err = dispatcher()
            .dispatch_link(Context::new(), Destination::tcp(target), link)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Dispatch { .. }));
        assert!(err.is_per_flow());
    }

    /// Datagram socket fed from a channel, recording what is sent back.
    struct ChannelSocket {
        inbound: tokio::sync::Mutex<tokio::sync::mpsc::Receiver<(Vec<u8>, SocketAddr)>>,
        replies: tokio::sync::mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    }

    #[async_trait]
    impl DatagramSocket for ChannelSocket {
        async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
            let (data, from) = self
                .inbound
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
            buf[..data.len()].copy_from_slice(&data);
            Ok((data.len(), from))
        }

        async fn send_to(&self, data: &[u8], target: SocketAddr) -> std::io::Result<usize> {
            let _ = self.replies.send((data.to_vec(), target));
            Ok(data.len())
        }

        fn close(&self) {}
    }

    #[tokio::test]
    async fn test_udp_relay_tags_replies_with_source() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], from).await.unwrap();
        });

        let client: SocketAddr = "10.0.0.2:40000".parse().unwrap();
        let (in_tx, in_rx) = tokio::sync::mpsc::channel(4);
        let (reply_tx, mut reply_rx) = tokio::sync::mpsc::unbounded_channel();
        let conn: Arc<dyn Connection> = Arc::new(DatagramConnection::new(ChannelSocket {
            inbound: tokio::sync::Mutex::new(in_rx),
            replies: reply_tx,
        }));
        in_tx.send((b"echo me".to_vec(), client)).await.unwrap();

        let ctx = Context::new().with_inbound(InboundInfo {
            source: Destination::udp(client),
            tag: "tun".into(),
        });
        let cancel = ctx.clone();
        let relay = tokio::spawn(async move {
            dispatcher()
                .dispatch_link(ctx, Destination::udp(target), Link::from_connection(conn))
                .await
        });

        let (data, to) = reply_rx.recv().await.unwrap();
        assert_eq!(data, b"echo me");
        assert_eq!(to, client);

        cancel.cancellation().cancel();
        assert!(matches!(relay.await.unwrap(), Err(ServerError::ShuttingDown)));
    }
}
