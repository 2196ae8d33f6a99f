//! Bounded receive ring for one serial line

use std::collections::VecDeque;

/// Byte ring with a hard capacity.
///
/// Reads are non-destructive (`peek`); bytes only leave the ring through
/// `rotate`.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    data: VecDeque<u8>,
    capacity: usize,
}

impl RingBuffer {
    /// Empty ring holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Bytes buffered
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Space left before the ring is full
    pub fn free(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Append as much of `bytes` as fits; returns the count taken
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let taken = bytes.len().min(self.free());
        self.data.extend(&bytes[..taken]);
        taken
    }

    /// Byte at `offset` from the head
    pub fn peek(&self, offset: usize) -> Option<u8> {
        self.data.get(offset).copied()
    }

    /// Offset of the first occurrence of `byte`
    pub fn position(&self, byte: u8) -> Option<usize> {
        self.data.iter().position(|&b| b == byte)
    }

    /// Drop up to `count` bytes from the head
    pub fn rotate(&mut self, count: usize) {
        let count = count.min(self.data.len());
        self.data.drain(..count);
    }

    /// Buffered bytes as one slice
    pub fn as_contiguous(&mut self) -> &[u8] {
        self.data.make_contiguous()
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_respects_capacity() {
        let mut ring = RingBuffer::new(4);
        assert_eq!(ring.push(&[1, 2, 3]), 3);
        assert_eq!(ring.push(&[4, 5]), 1);
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.free(), 0);
        assert_eq!(ring.push(&[6]), 0);
        assert_eq!(ring.as_contiguous(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_rotate_and_peek() {
        let mut ring = RingBuffer::new(8);
        ring.push(b"ab$X");
        assert_eq!(ring.position(b'$'), Some(2));
        ring.rotate(2);
        assert_eq!(ring.peek(0), Some(b'$'));
        assert_eq!(ring.peek(2), None);
        ring.rotate(100);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_contiguous_after_wrap() {
        let mut ring = RingBuffer::new(4);
        ring.push(&[1, 2, 3, 4]);
        ring.rotate(3);
        ring.push(&[5, 6, 7]);
        assert_eq!(ring.as_contiguous(), &[4, 5, 6, 7]);
    }
}
