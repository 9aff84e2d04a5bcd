//! Compacting byte window over a pooled buffer.
//!
//! Bytes are appended at the write cursor and consumed from the read cursor.
//! Instead of wrapping, the unread region is shifted back to the front when
//! the free tail becomes too small, so readers always see one contiguous
//! slice.

use crate::audio::buffer::{BufferPool, PooledBuffer};

pub struct ByteRing {
    buf: PooledBuffer<u8>,
    read_offset: usize,
    write_offset: usize,
}

impl ByteRing {
    /// Create a ring holding at least `size` bytes.
    pub fn new(pool: &BufferPool<u8>, size: usize) -> Self {
        let mut buf = pool.rent(size);
        let capacity = buf.capacity();
        buf.set_len(capacity);
        Self {
            buf,
            read_offset: 0,
            write_offset: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// How many unread bytes are buffered.
    pub fn len(&self) -> usize {
        self.write_offset - self.read_offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free bytes after the write cursor.
    pub fn tail_room(&self) -> usize {
        self.capacity() - self.write_offset
    }

    /// The unread bytes.
    pub fn readable(&self) -> &[u8] {
        &self.buf[self.read_offset..self.write_offset]
    }

    /// Space after the write cursor; follow with [`commit`](Self::commit).
    pub fn writable(&mut self) -> &mut [u8] {
        let write_offset = self.write_offset;
        &mut self.buf[write_offset..]
    }

    /// Marks `n` bytes of [`writable`](Self::writable) as filled.
    pub fn commit(&mut self, n: usize) {
        assert!(n <= self.tail_room(), "commit past end of ring");
        self.write_offset += n;
    }

    /// Drops `n` bytes from the front of the unread region.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len(), "consume past end of ring");
        self.read_offset += n;
        if self.read_offset == self.write_offset {
            self.clear();
        }
    }

    /// Shifts unread bytes to the front when fewer than `reserve` bytes
    /// remain after the write cursor. Returns whether a shift happened.
    pub fn compact_if_needed(&mut self, reserve: usize) -> bool {
        if self.tail_room() >= reserve || self.read_offset == 0 {
            return false;
        }
        let len = self.len();
        self.buf.copy_within(self.read_offset..self.write_offset, 0);
        self.read_offset = 0;
        self.write_offset = len;
        true
    }

    /// Reset the ring to empty.
    pub fn clear(&mut self) {
        self.read_offset = 0;
        self.write_offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_consume() {
        let pool = BufferPool::default();
        let mut ring = ByteRing::new(&pool, 64);
        ring.writable()[..3].copy_from_slice(&[1, 2, 3]);
        ring.commit(3);
        assert_eq!(ring.readable(), &[1, 2, 3]);

        ring.consume(2);
        assert_eq!(ring.readable(), &[3]);
        ring.consume(1);
        assert!(ring.is_empty());
        assert_eq!(ring.tail_room(), 64);
    }

    #[test]
    fn compaction_moves_unread_bytes_to_front() {
        let pool = BufferPool::default();
        let mut ring = ByteRing::new(&pool, 64);
        ring.writable()[..60].fill(7);
        ring.commit(60);
        ring.consume(58);
        assert_eq!(ring.tail_room(), 4);

        assert!(ring.compact_if_needed(10));
        assert_eq!(ring.readable(), &[7, 7]);
        assert_eq!(ring.tail_room(), 62);
        assert!(!ring.compact_if_needed(10));
    }
}
