use std::sync::{Arc, Mutex};

/// Reusable byte buffers for response-head assembly. Buffers come back
/// cleared but keep their capacity, so steady-state traffic stops
/// allocating.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Mutex<BufferPoolInner>>,
}

struct BufferPoolInner {
    buffers: Vec<Vec<u8>>,
    size: usize,
}

impl BufferPool {
    pub fn new(size: usize) -> Self {
        BufferPool {
            inner: Arc::new(Mutex::new(BufferPoolInner {
                buffers: Vec::new(),
                size,
            })),
        }
    }

    pub fn get(&self) -> Vec<u8> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .buffers
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(inner.size))
    }

    pub fn put(&self, mut buffer: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        buffer.clear();
        inner.buffers.push(buffer);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(8192) // Default buffer size of 8KB
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_cleared_and_reused() {
        let pool = BufferPool::new(16);
        let mut buffer = pool.get();
        buffer.extend_from_slice(b"HTTP/1.1 200 OK\r\n");
        let capacity = buffer.capacity();
        pool.put(buffer);

        let reused = pool.get();
        assert!(reused.is_empty());
        assert_eq!(reused.capacity(), capacity);
    }
}
