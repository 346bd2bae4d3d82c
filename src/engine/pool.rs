//! Fixed I/O buffers.

use bytes::BytesMut;

/// Pool of equally sized I/O buffers owned by one device pair.
///
/// A buffer is moved out of the pool into an operation and moved back on
/// completion, so no buffer can be referenced by two operations at once.
#[derive(Debug)]
pub struct BufferPool {
    buf_len: usize,
    capacity: usize,
    free: Vec<BytesMut>,
}

impl BufferPool {
    /// Allocates `capacity` zeroed buffers of `buf_len` bytes each.
    pub fn new(buf_len: usize, capacity: usize) -> Self {
        let free = (0..capacity).map(|_| BytesMut::zeroed(buf_len)).collect();
        Self { buf_len, capacity, free }
    }

    /// Length of each buffer.
    pub fn buf_len(&self) -> usize {
        self.buf_len
    }

    /// Number of buffers owned by the pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffers currently available.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Takes a buffer out of the pool.
    ///
    /// The buffer has the full length and is zeroed.
    pub fn checkout(&mut self) -> Option<BytesMut> {
        self.free.pop()
    }

    /// Returns a buffer to the pool.
    pub fn checkin(&mut self, mut buf: BytesMut) {
        debug_assert!(self.free.len() < self.capacity, "buffer returned to full pool");
        buf.clear();
        buf.resize(self.buf_len, 0);
        self.free.push(buf);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn checkout_and_checkin() {
        let mut pool = BufferPool::new(8, 2);
        let mut a = pool.checkout().unwrap();
        let b = pool.checkout().unwrap();
        assert!(pool.checkout().is_none());
        assert_eq!(a.len(), 8);
        assert_eq!(b.len(), 8);

        a[..3].copy_from_slice(&[1, 2, 3]);
        a.truncate(3);
        pool.checkin(a);
        assert_eq!(pool.available(), 1);

        let a = pool.checkout().unwrap();
        assert_eq!(&a[..], &[0; 8]);
    }
}
