// ============================================
// File: crates/tunlink-common/src/buf.rs
// ============================================
//! # Buffer Model
//!
//! ## Creation Reason
//! Flow adapters move payload between the protocol engine and the
//! dispatcher without copying more than once. Buffers are owned values
//! drawn from a shared pool and handed off by move.
//!
//! ## Main Functionality
//! - `Buffer`: fixed-capacity byte region with a `[start, end)` view and
//!   an optional UDP peer address tag
//! - `MultiBuffer`: ordered group of buffers forming one I/O unit
//! - `BufferedReader` / `BufferedWriter`: the flow I/O contract
//!
//! ## Main Logical Flow
//! 1. A reader takes a `Buffer` from the pool and fills its spare region
//! 2. The buffer travels inside a `MultiBuffer` to a writer
//! 3. The writer consumes the `MultiBuffer`; every buffer returns to the
//!    pool exactly once when it is dropped or released
//!
//! ## ⚠️ Important Note for Next Developer
//! - `Buffer` is not `Clone`. Releasing after a hand-off cannot compile,
//!   which is the whole point; don't add `Clone`
//! - Buffers larger than [`BUFFER_SIZE`] are allocated on demand and not
//!   pooled
//! - A datagram read into a pooled buffer is truncated to its capacity
//!
//! ## Last Modified
//! v0.1.0 - Initial buffer model

use std::fmt;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{CommonError, Result};
use crate::types::Destination;

// ============================================
// Constants
// ============================================

/// Capacity of a pooled buffer.
pub const BUFFER_SIZE: usize = 8192;

/// Maximum number of idle storages kept in the pool.
const POOL_LIMIT: usize = 1024;

static POOL: Mutex<Vec<Box<[u8]>>> = parking_lot::const_mutex(Vec::new());

fn acquire() -> Box<[u8]> {
    POOL.lock()
        .pop()
        .unwrap_or_else(|| vec![0u8; BUFFER_SIZE].into_boxed_slice())
}

fn recycle(storage: Box<[u8]>) {
    if storage.len() != BUFFER_SIZE {
        return;
    }
    let mut pool = POOL.lock();
    if pool.len() < POOL_LIMIT {
        pool.push(storage);
    }
}

// ============================================
// Buffer
// ============================================

/// An exclusively owned byte region with a logical `[start, end)` view.
///
/// # Example
/// ```
/// use tunlink_common::buf::Buffer;
///
/// let mut b = Buffer::new();
/// b.write(b"hello");
/// assert_eq!(b.bytes(), b"hello");
/// b.advance(1);
/// assert_eq!(b.bytes(), b"ello");
/// b.release();
/// ```
pub struct Buffer {
    storage: Box<[u8]>,
    start: usize,
    end: usize,
    udp: Option<Destination>,
}

impl Buffer {
    /// Takes an empty buffer from the pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            storage: acquire(),
            start: 0,
            end: 0,
            udp: None,
        }
    }

    /// Creates an empty buffer of at least `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        if capacity <= BUFFER_SIZE {
            return Self::new();
        }
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            end: 0,
            udp: None,
        }
    }

    /// Creates a buffer holding a copy of `data`.
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Self {
        let mut b = Self::with_capacity(data.len());
        b.write(data);
        b
    }

    /// Total capacity of the underlying storage.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Length of the logical view.
    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Returns `true` if the logical view is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The logical view.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.storage[self.start..self.end]
    }

    /// The logical view, mutably.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.start..self.end]
    }

    /// Unused space after the view. Fill it, then call [`commit`](Self::commit).
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.end..]
    }

    /// Extends the view over `n` bytes of the spare region.
    ///
    /// `n` is clamped to the spare capacity.
    pub fn commit(&mut self, n: usize) {
        self.end = (self.end + n).min(self.storage.len());
    }

    /// Copies as much of `data` as fits after the view; returns the count.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let spare = self.spare_mut();
        let n = data.len().min(spare.len());
        spare[..n].copy_from_slice(&data[..n]);
        self.end += n;
        n
    }

    /// Sets the view to `[start, end)` of the storage.
    ///
    /// # Errors
    /// `OutOfRange` if `start > end` or `end` exceeds the capacity.
    pub fn resize(&mut self, start: usize, end: usize) -> Result<()> {
        if start > end || end > self.storage.len() {
            return Err(CommonError::out_of_range(
                format!("[{start}, {end})"),
                0,
                self.storage.len(),
            ));
        }
        self.start = start;
        self.end = end;
        Ok(())
    }

    /// Drops `n` bytes from the front of the view.
    pub fn advance(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
    }

    /// Empties the view and clears the peer tag.
    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
        self.udp = None;
    }

    /// Peer address carried by a datagram buffer.
    #[must_use]
    pub const fn udp(&self) -> Option<&Destination> {
        self.udp.as_ref()
    }

    /// Attaches (or clears) the peer address.
    pub fn set_udp(&mut self, dest: Option<Destination>) {
        self.udp = dest;
    }

    /// Returns the buffer to the pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        recycle(std::mem::take(&mut self.storage));
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("udp", &self.udp)
            .finish()
    }
}

// ============================================
// MultiBuffer
// ============================================

/// An ordered sequence of buffers forming one logical read or write.
#[derive(Debug, Default)]
pub struct MultiBuffer(Vec<Buffer>);

impl MultiBuffer {
    /// Creates an empty multi-buffer.
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Wraps a single buffer.
    #[must_use]
    pub fn single(b: Buffer) -> Self {
        Self(vec![b])
    }

    /// Splits `data` into pooled buffers.
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Self {
        Self(data.chunks(BUFFER_SIZE).map(Buffer::from_slice).collect())
    }

    /// Appends a buffer.
    pub fn push(&mut self, b: Buffer) {
        self.0.push(b);
    }

    /// Number of buffers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no buffers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total bytes across all buffers.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.0.iter().map(Buffer::len).sum()
    }

    /// The first buffer, if any.
    #[must_use]
    pub fn first(&self) -> Option<&Buffer> {
        self.0.first()
    }

    /// Iterates the buffers in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Buffer> {
        self.0.iter()
    }

    /// Concatenates the content of all buffers.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_len());
        for b in &self.0 {
            out.extend_from_slice(b.bytes());
        }
        out
    }

    /// Releases every buffer exactly once.
    pub fn release(self) {
        for b in self.0 {
            b.release();
        }
    }
}

impl From<Vec<Buffer>> for MultiBuffer {
    fn from(buffers: Vec<Buffer>) -> Self {
        Self(buffers)
    }
}

impl IntoIterator for MultiBuffer {
    type Item = Buffer;
    type IntoIter = std::vec::IntoIter<Buffer>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a MultiBuffer {
    type Item = &'a Buffer;
    type IntoIter = std::slice::Iter<'a, Buffer>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// ============================================
// Buffered I/O Contract
// ============================================

/// Reads one logical unit at a time.
#[async_trait]
pub trait BufferedReader: Send + Sync {
    /// Reads the next multi-buffer.
    ///
    /// # Errors
    /// `EndOfStream` once the peer has finished, or the underlying failure.
    async fn read_multi_buffer(&self) -> Result<MultiBuffer>;
}

/// Writes one logical unit at a time, taking ownership of it.
#[async_trait]
pub trait BufferedWriter: Send + Sync {
    /// Writes `mb`. The multi-buffer is released whether or not the write
    /// succeeds.
    ///
    /// # Errors
    /// The first failure; remaining buffers are not written.
    async fn write_multi_buffer(&self, mb: MultiBuffer) -> Result<()>;

    /// Signals that nothing more will be written while leaving the read
    /// direction open. Writers without a half-close do nothing.
    ///
    /// # Errors
    /// The underlying transport failed to send the end of stream.
    async fn shutdown_write(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_view_operations() {
        let mut b = Buffer::new();
        assert_eq!(b.capacity(), BUFFER_SIZE);
        assert!(b.is_empty());

        assert_eq!(b.write(b"abcdef"), 6);
        b.advance(2);
        assert_eq!(b.bytes(), b"cdef");

        b.resize(0, 3).unwrap();
        assert_eq!(b.bytes(), b"abc");
        assert!(b.resize(4, 2).is_err());
        assert!(b.resize(0, BUFFER_SIZE + 1).is_err());

        b.clear();
        assert_eq!(b.len(), 0);
    }

    #[test]
    fn test_buffer_write_is_bounded_by_capacity() {
        let mut b = Buffer::new();
        let big = vec![7u8; BUFFER_SIZE + 100];
        assert_eq!(b.write(&big), BUFFER_SIZE);
        assert_eq!(b.write(b"x"), 0);
    }

    #[test]
    fn test_spare_and_commit() {
        let mut b = Buffer::new();
        b.spare_mut()[..3].copy_from_slice(b"xyz");
        b.commit(3);
        assert_eq!(b.bytes(), b"xyz");
    }

    #[test]
    fn test_oversized_buffer_not_pooled() {
        let b = Buffer::from_slice(&vec![1u8; BUFFER_SIZE * 2]);
        assert_eq!(b.len(), BUFFER_SIZE * 2);
        b.release();
    }

    #[test]
    fn test_udp_tag_survives_resize() {
        let mut b = Buffer::new();
        let peer = Destination::udp("198.51.100.9:53".parse().unwrap());
        b.set_udp(Some(peer));
        b.resize(0, 10).unwrap();
        assert_eq!(b.udp(), Some(&peer));
    }

    #[test]
    fn test_multi_buffer_split_and_concat() {
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let mb = MultiBuffer::from_slice(&data);
        assert_eq!(mb.len(), 3);
        assert_eq!(mb.byte_len(), data.len());
        assert_eq!(mb.to_vec(), data);
        mb.release();
    }
}
