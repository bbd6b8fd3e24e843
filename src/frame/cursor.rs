//! Bounded working window over an unbounded serial byte stream.

use bytes::{Buf, Bytes, BytesMut};

/// Fixed-capacity window of not-yet-deframed bytes
///
/// The stream position (`stream_offset`) grows without bound while the
/// buffered bytes never exceed `capacity`.
#[derive(Debug)]
pub struct ByteCursor {
    window: BytesMut,
    capacity: usize,
    /// Stream offset of `window[0]`
    stream_offset: u64,
}

impl ByteCursor {
    /// Create an empty cursor with a reserved window of `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            window: BytesMut::with_capacity(capacity),
            capacity,
            stream_offset: 0,
        }
    }

    /// Window capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffered bytes
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Whether the window is empty
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Free space left in the window
    pub fn remaining(&self) -> usize {
        self.capacity - self.window.len()
    }

    /// Stream offset of the first buffered byte
    pub fn stream_offset(&self) -> u64 {
        self.stream_offset
    }

    /// Buffered bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.window
    }

    /// Append as many bytes as fit, returning how many were taken
    pub fn extend(&mut self, input: &[u8]) -> usize {
        let take = input.len().min(self.remaining());
        self.window.extend_from_slice(&input[..take]);
        take
    }

    /// Drop `count` bytes from the front of the window
    pub fn discard(&mut self, count: usize) {
        let count = count.min(self.window.len());
        self.window.advance(count);
        self.stream_offset += count as u64;
    }

    /// Drop everything except the last byte
    ///
    /// Returns the number of bytes dropped.
    pub fn discard_all_but_last(&mut self) -> usize {
        let drop = self.window.len().saturating_sub(1);
        self.discard(drop);
        drop
    }

    /// Detach the first `count` bytes as an immutable buffer
    pub fn take(&mut self, count: usize) -> Bytes {
        let count = count.min(self.window.len());
        self.stream_offset += count as u64;
        let taken = self.window.split_to(count).freeze();
        // Keep the reserved window available for the next frame
        self.window.reserve(self.capacity.saturating_sub(self.window.len()));
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_respects_capacity() {
        let mut cursor = ByteCursor::with_capacity(8);
        assert_eq!(cursor.extend(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]), 8);
        assert_eq!(cursor.len(), 8);
        assert_eq!(cursor.remaining(), 0);
        assert_eq!(cursor.extend(&[11]), 0);
    }

    #[test]
    fn test_discard_tracks_stream_offset() {
        let mut cursor = ByteCursor::with_capacity(16);
        cursor.extend(&[1, 2, 3, 4, 5]);
        cursor.discard(2);
        assert_eq!(cursor.as_slice(), &[3, 4, 5]);
        assert_eq!(cursor.stream_offset(), 2);

        cursor.discard(100);
        assert!(cursor.is_empty());
        assert_eq!(cursor.stream_offset(), 5);
    }

    #[test]
    fn test_discard_all_but_last() {
        let mut cursor = ByteCursor::with_capacity(16);
        cursor.extend(&[9, 9, 9, 0x5A]);
        assert_eq!(cursor.discard_all_but_last(), 3);
        assert_eq!(cursor.as_slice(), &[0x5A]);

        let mut empty = ByteCursor::with_capacity(4);
        assert_eq!(empty.discard_all_but_last(), 0);
    }

    #[test]
    fn test_take_splits_front() {
        let mut cursor = ByteCursor::with_capacity(16);
        cursor.extend(&[1, 2, 3, 4, 5, 6]);
        let front = cursor.take(4);
        assert_eq!(&front[..], &[1, 2, 3, 4]);
        assert_eq!(cursor.as_slice(), &[5, 6]);
        assert_eq!(cursor.stream_offset(), 4);
        assert_eq!(cursor.remaining(), 14);
    }
}
