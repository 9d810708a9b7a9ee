//! Sent-but-unacknowledged bytes, kept for replay after a reconnect.

use bytes::Bytes;
use std::collections::VecDeque;

/// Retained outbound bytes starting at stream offset `base`.
///
/// Offsets count bytes written since the session started. Everything below
/// `base` has been acknowledged by the relay and is gone.
#[derive(Debug, Default)]
pub(crate) struct RetransmitBuffer {
    base: u64,
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl RetransmitBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain a chunk that is about to be sent.
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Offset of the first retained byte; equals the acknowledged count.
    pub fn base_offset(&self) -> u64 {
        self.base
    }

    /// Offset one past the last retained byte; equals the sent count.
    pub fn end_offset(&self) -> u64 {
        self.base + self.len as u64
    }

    /// Retained byte count.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drop everything below `offset`.
    ///
    /// Offsets at or below the current base are ignored; callers reject
    /// offsets beyond `end_offset`.
    pub fn discard_until(&mut self, offset: u64) {
        debug_assert!(offset <= self.end_offset());
        let offset = offset.min(self.end_offset());

        while self.base < offset {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            let excess = (offset - self.base) as usize;
            if excess >= front.len() {
                self.base += front.len() as u64;
                self.len -= front.len();
                self.chunks.pop_front();
            } else {
                let _ = front.split_to(excess);
                self.base += excess as u64;
                self.len -= excess;
            }
        }
    }

    /// Retained chunks, oldest first.
    pub fn chunks(&self) -> impl Iterator<Item = &Bytes> {
        self.chunks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(chunks: &[&'static [u8]]) -> RetransmitBuffer {
        let mut buffer = RetransmitBuffer::new();
        for chunk in chunks {
            buffer.push(Bytes::from_static(chunk));
        }
        buffer
    }

    fn contents(buffer: &RetransmitBuffer) -> Vec<u8> {
        buffer.chunks().flat_map(|c| c.iter().copied()).collect()
    }

    #[test]
    fn test_offsets_track_pushes() {
        let buffer = buffer_with(&[b"abc", b"", b"defg"]);
        assert_eq!(buffer.base_offset(), 0);
        assert_eq!(buffer.end_offset(), 7);
        assert_eq!(buffer.len(), 7);
        assert_eq!(buffer.chunks().count(), 2);
    }

    #[test]
    fn test_discard_whole_and_partial_chunks() {
        let mut buffer = buffer_with(&[b"abc", b"defg", b"hi"]);

        buffer.discard_until(5);
        assert_eq!(buffer.base_offset(), 5);
        assert_eq!(contents(&buffer), b"fghi");

        buffer.discard_until(9);
        assert!(buffer.is_empty());
        assert_eq!(buffer.base_offset(), 9);
        assert_eq!(buffer.end_offset(), 9);
    }

    #[test]
    fn test_stale_ack_is_ignored() {
        let mut buffer = buffer_with(&[b"abcdef"]);
        buffer.discard_until(4);
        buffer.discard_until(2);
        assert_eq!(buffer.base_offset(), 4);
        assert_eq!(contents(&buffer), b"ef");
    }

    #[test]
    fn test_no_retained_byte_below_ack() {
        let mut buffer = RetransmitBuffer::new();
        let mut written = 0u64;
        for size in [1usize, 7, 16, 3, 40, 2] {
            buffer.push(Bytes::from(vec![0u8; size]));
            written += size as u64;
        }

        let mut ack = 0;
        while ack < written {
            ack = (ack + 5).min(written);
            buffer.discard_until(ack);
            assert_eq!(buffer.base_offset(), ack);
            assert_eq!(buffer.end_offset(), written);
            assert_eq!(buffer.len() as u64, written - ack);
        }
    }
}
