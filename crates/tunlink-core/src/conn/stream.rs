// ============================================
// File: crates/tunlink-core/src/conn/stream.rs
// ============================================
//! Stream adapter.
//!
//! A failed write reports how many whole buffers were written before the
//! failure as `CommonError::PartialWrite`. The adapter never retries; a
//! caller that does resumes from buffer index `written`. Bytes of the
//! failing buffer itself may have been partly sent.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::trace;
use tunlink_common::{Buffer, BufferedReader, BufferedWriter, CommonError, MultiBuffer, Result};

use super::Connection;

/// Buffered adapter over a byte stream.
pub struct StreamConnection<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    closed: AtomicBool,
}

impl<S> StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Wraps `stream`.
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<S> BufferedReader for StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn read_multi_buffer(&self) -> Result<MultiBuffer> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CommonError::Closed);
        }
        let mut b = Buffer::new();
        let n = self
            .reader
            .lock()
            .await
            .read(b.spare_mut())
            .await
            .map_err(|e| CommonError::io("stream read", e))?;
        if n == 0 {
            return Err(CommonError::EndOfStream);
        }
        b.commit(n);
        Ok(MultiBuffer::single(b))
    }
}

#[async_trait]
impl<S> BufferedWriter for StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn write_multi_buffer(&self, mb: MultiBuffer) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CommonError::Closed);
        }
        let total = mb.len();
        let mut writer = self.writer.lock().await;
        for (written, b) in mb.into_iter().enumerate() {
            if let Err(source) = writer.write_all(b.bytes()).await {
                return Err(CommonError::PartialWrite {
                    written,
                    total,
                    source,
                });
            }
        }
        Ok(())
    }

    async fn shutdown_write(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.writer
            .lock()
            .await
            .shutdown()
            .await
            .map_err(|e| CommonError::io("stream shutdown", e))
    }
}

#[async_trait]
impl<S> Connection for StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.writer.lock().await.shutdown().await {
            trace!("Stream shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    #[tokio::test]
    async fn test_multi_buffer_survives_stream_round_trip() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let left = StreamConnection::new(a);
        let right = StreamConnection::new(b);

        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        left.write_multi_buffer(MultiBuffer::from_slice(&payload))
            .await
            .unwrap();
        left.close().await;

        let mut received = Vec::new();
        loop {
            match right.read_multi_buffer().await {
                Ok(mb) => received.extend(mb.to_vec()),
                Err(CommonError::EndOfStream) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(received, payload);
    }

    /// Accepts `budget` bytes, then fails every write.
    struct FailingStream {
        budget: usize,
    }

    impl AsyncRead for FailingStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for FailingStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            data: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.budget == 0 {
                return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
            }
            let n = data.len().min(self.budget);
            self.budget -= n;
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_partial_write_reports_buffers_written() {
        let conn = StreamConnection::new(FailingStream { budget: 6 });
        let mut mb = MultiBuffer::new();
        for chunk in [b"abc", b"def", b"ghi", b"jkl"] {
            mb.push(Buffer::from_slice(chunk));
        }

        match conn.write_multi_buffer(mb).await.unwrap_err() {
            CommonError::PartialWrite { written, total, .. } => {
                assert_eq!(written, 2);
                assert_eq!(total, 4);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_eof_and_closed() {
        let (a, b) = tokio::io::duplex(1024);
        let left = StreamConnection::new(a);
        drop(b);
        assert!(matches!(
            left.read_multi_buffer().await,
            Err(CommonError::EndOfStream)
        ));

        left.close().await;
        left.close().await;
        assert!(matches!(
            left.write_multi_buffer(MultiBuffer::from_slice(b"x")).await,
            Err(CommonError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_write_keeps_read_direction_open() {
        let (a, b) = tokio::io::duplex(1024);
        let left = StreamConnection::new(a);
        let right = StreamConnection::new(b);

        left.shutdown_write().await.unwrap();
        assert!(matches!(
            right.read_multi_buffer().await,
            Err(CommonError::EndOfStream)
        ));

        right
            .write_multi_buffer(MultiBuffer::from_slice(b"late"))
            .await
            .unwrap();
        assert_eq!(left.read_multi_buffer().await.unwrap().to_vec(), b"late");
    }
}
