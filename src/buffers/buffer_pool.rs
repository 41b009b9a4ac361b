use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, trace};

/// Thread safe free list of fixed-size read buffers, shared by all sockets of a server or client.
pub struct BufferManager {
    buf_size: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl BufferManager {
    pub fn new(buf_size: usize, max_pool_size: usize) -> Self {
        BufferManager {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Returns a buffer with a length of exactly `buf_size`, ready to be read into
    pub fn get_from_pool(&self) -> BytesMut {
        if let Some(buffer) = self.buffers.lock().pop() {
            trace!("returning buffer from pool");
            return buffer;
        }

        debug!("no buffer in pool: creating new buffer");
        BytesMut::zeroed(self.buf_size)
    }

    pub fn return_to_pool(&self, buffer: BytesMut) {
        if buffer.len() != self.buf_size {
            debug!("discarding buffer of irregular length {} (expected {})", buffer.len(), self.buf_size);
            return;
        }

        let mut buffers = self.buffers.lock();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }

    #[cfg(test)]
    fn num_pooled(&self) -> usize {
        self.buffers.lock().len()
    }
}

/// A single read loop's view of the shared [BufferManager].
///
/// Read loops hand back bytes in arbitrary fragments (the unread tail of a buffer, a consumed
///  prefix of the accumulator). These are collected here and only sliced off and returned to the
///  shared pool in chunks of exactly one buffer's size, so the shared pool only ever holds
///  full-size buffers.
///
/// Not thread safe; each read loop owns its own instance.
pub struct BufferPool {
    manager: Arc<BufferManager>,
    leftover: BytesMut,
}

impl BufferPool {
    pub fn new(manager: Arc<BufferManager>) -> BufferPool {
        BufferPool {
            manager,
            leftover: BytesMut::new(),
        }
    }

    pub fn get(&mut self) -> BytesMut {
        self.manager.get_from_pool()
    }

    pub fn put(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }

        let buf_size = self.manager.buf_size();
        self.leftover.extend_from_slice(bytes);
        while self.leftover.len() >= buf_size {
            let chunk = self.leftover.split_to(buf_size);
            self.manager.return_to_pool(chunk);
        }
    }

    #[cfg(test)]
    fn leftover_len(&self) -> usize {
        self.leftover.len()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_get_has_full_length() {
        let manager = BufferManager::new(10, 10);
        assert_eq!(manager.get_from_pool().len(), 10);
    }

    #[test]
    fn test_return_irregular_is_discarded() {
        let manager = BufferManager::new(10, 10);
        manager.return_to_pool(BytesMut::zeroed(7));
        assert_eq!(manager.num_pooled(), 0);
        manager.return_to_pool(BytesMut::zeroed(10));
        assert_eq!(manager.num_pooled(), 1);
    }

    #[test]
    fn test_pool_limit() {
        let manager = BufferManager::new(4, 2);
        for _ in 0..5 {
            manager.return_to_pool(BytesMut::zeroed(4));
        }
        assert_eq!(manager.num_pooled(), 2);
    }

    #[rstest]
    #[case::exact(vec![10], 1, 0)]
    #[case::small_fragments(vec![3, 3, 3], 0, 9)]
    #[case::fragments_crossing(vec![3, 3, 3, 3], 1, 2)]
    #[case::big(vec![25], 2, 5)]
    #[case::mixed(vec![1, 9, 15, 5, 0, 2], 3, 2)]
    fn test_put_returns_full_size_only(#[case] fragments: Vec<usize>, #[case] expected_pooled: usize, #[case] expected_leftover: usize) {
        let manager = Arc::new(BufferManager::new(10, 100));
        let mut pool = BufferPool::new(manager.clone());

        for len in fragments {
            pool.put(&vec![7u8; len]);
        }

        assert_eq!(manager.num_pooled(), expected_pooled);
        assert_eq!(pool.leftover_len(), expected_leftover);

        for _ in 0..expected_pooled {
            assert_eq!(pool.get().len(), 10);
        }
    }
}
