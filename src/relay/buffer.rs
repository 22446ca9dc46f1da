//! Relay Buffer

use bytes::{Buf, BytesMut};

/// Unbounded FIFO byte queue carrying one direction of a relay pair.
///
/// Bytes are only dropped from the front, and only as many as the transport
/// actually accepted. There is no upper bound: a fast producer feeding a slow
/// consumer grows the queue.
#[derive(Debug, Default)]
pub struct RelayBuffer {
    bytes: BytesMut,
}

impl RelayBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes at the back of the queue
    pub fn append(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// Everything currently queued, front first
    pub fn peek_all(&self) -> &[u8] {
        &self.bytes
    }

    /// Drop the first `count` bytes (or everything, if fewer are queued)
    pub fn remove_prefix(&mut self, count: usize) {
        let count = count.min(self.bytes.len());
        self.bytes.advance(count);
    }

    pub fn is_nonempty(&self) -> bool {
        !self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_is_empty() {
        let buffer = RelayBuffer::new();
        assert!(!buffer.is_nonempty());
        assert_eq!(buffer.len(), 0);
        assert!(buffer.peek_all().is_empty());
    }

    #[test]
    fn test_append_preserves_order() {
        let mut buffer = RelayBuffer::new();
        buffer.append(b"GET / ");
        buffer.append(b"HTTP/1.0\r\n");
        assert_eq!(buffer.peek_all(), b"GET / HTTP/1.0\r\n");
        assert!(buffer.is_nonempty());
    }

    #[test]
    fn test_partial_remove_keeps_unsent_suffix() {
        let mut buffer = RelayBuffer::new();
        buffer.append(b"abcdef");

        // Transport accepted only three bytes
        buffer.remove_prefix(3);
        assert_eq!(buffer.peek_all(), b"def");

        buffer.append(b"gh");
        assert_eq!(buffer.peek_all(), b"defgh");
    }

    #[test]
    fn test_remove_more_than_queued_drains() {
        let mut buffer = RelayBuffer::new();
        buffer.append(b"xyz");
        buffer.remove_prefix(10);
        assert!(!buffer.is_nonempty());

        buffer.remove_prefix(1);
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn test_grows_without_bound() {
        let mut buffer = RelayBuffer::new();
        let chunk = vec![7u8; 4096];
        for _ in 0..256 {
            buffer.append(&chunk);
        }
        assert_eq!(buffer.len(), 4096 * 256);
    }
}
