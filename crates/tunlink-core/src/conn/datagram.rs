// ============================================
// File: crates/tunlink-core/src/conn/datagram.rs
// ============================================
//! Datagram adapter. Each read yields one datagram in one buffer tagged
//! with the sender; each written buffer must carry its destination.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tunlink_common::{
    Buffer, BufferedReader, BufferedWriter, CommonError, Destination, MultiBuffer, Network, Result,
};

use super::Connection;
use crate::engine::UdpEndpoint;

/// Datagram socket contract the adapter is written against.
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    /// Receives one datagram into `buf`.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Sends one datagram to `target`.
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Closes the socket.
    fn close(&self);
}

#[async_trait]
impl DatagramSocket for UdpEndpoint {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpEndpoint::recv_from(self, buf).await
    }

    async fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpEndpoint::send_to(self, data, target).await
    }

    fn close(&self) {
        UdpEndpoint::close(self);
    }
}

/// Buffered adapter over a datagram socket.
pub struct DatagramConnection<D> {
    socket: D,
}

impl<D: DatagramSocket> DatagramConnection<D> {
    /// Wraps `socket`.
    pub const fn new(socket: D) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl<D: DatagramSocket> BufferedReader for DatagramConnection<D> {
    async fn read_multi_buffer(&self) -> Result<MultiBuffer> {
        let mut b = Buffer::new();
        let (n, from) = self
            .socket
            .recv_from(b.spare_mut())
            .await
            .map_err(CommonError::from)?;
        b.resize(0, n)?;
        b.set_udp(Some(Destination::udp(from)));
        Ok(MultiBuffer::single(b))
    }
}

#[async_trait]
impl<D: DatagramSocket> BufferedWriter for DatagramConnection<D> {
    async fn write_multi_buffer(&self, mb: MultiBuffer) -> Result<()> {
        for b in mb {
            let target = match b.udp() {
                Some(dest) if dest.network == Network::Udp => dest.address,
                _ => return Err(CommonError::MissingDestination),
            };
            self.socket
                .send_to(b.bytes(), target)
                .await
                .map_err(|e| CommonError::io(format!("send to {target}"), e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl<D: DatagramSocket> Connection for DatagramConnection<D> {
    async fn close(&self) {
        self.socket.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct ScriptedSocket {
        inbound: Mutex<VecDeque<(Vec<u8>, SocketAddr)>>,
        sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    }

    #[async_trait]
    impl DatagramSocket for ScriptedSocket {
        async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            let (data, from) = self
                .inbound
                .lock()
                .pop_front()
                .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            Ok((n, from))
        }

        async fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
            self.sent.lock().push((data.to_vec(), target));
            Ok(data.len())
        }

        fn close(&self) {}
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_read_tags_buffer_with_sender() {
        let socket = ScriptedSocket::default();
        socket
            .inbound
            .lock()
            .push_back((b"answer".to_vec(), addr("198.51.100.9:53")));
        let conn = DatagramConnection::new(socket);

        let mb = conn.read_multi_buffer().await.unwrap();
        let first = mb.first().unwrap();
        assert_eq!(first.bytes(), b"answer");
        assert_eq!(first.udp(), Some(&Destination::udp(addr("198.51.100.9:53"))));

        assert!(matches!(
            conn.read_multi_buffer().await,
            Err(CommonError::EndOfStream)
        ));
    }

    #[tokio::test]
    async fn test_write_sends_each_buffer_to_its_tag() {
        let conn = DatagramConnection::new(ScriptedSocket::default());
        let mut mb = MultiBuffer::new();
        for (data, to) in [(&b"a"[..], "10.0.0.2:1000"), (&b"bc"[..], "10.0.0.3:2000")] {
            let mut b = Buffer::from_slice(data);
            b.set_udp(Some(Destination::udp(addr(to))));
            mb.push(b);
        }
        conn.write_multi_buffer(mb).await.unwrap();

        let sent = conn.socket.sent.lock().clone();
        assert_eq!(
            sent,
            vec![
                (b"a".to_vec(), addr("10.0.0.2:1000")),
                (b"bc".to_vec(), addr("10.0.0.3:2000")),
            ]
        );
    }

    #[tokio::test]
    async fn test_untagged_buffer_aborts_write() {
        let conn = DatagramConnection::new(ScriptedSocket::default());
        let mut mb = MultiBuffer::new();
        mb.push(Buffer::from_slice(b"lost"));
        mb.push(Buffer::from_slice(b"never"));

        assert!(matches!(
            conn.write_multi_buffer(mb).await,
            Err(CommonError::MissingDestination)
        ));
        assert!(conn.socket.sent.lock().is_empty());
    }
}
