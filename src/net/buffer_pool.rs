use bytes::BytesMut;
use parking_lot::Mutex;

/// Reusable receive buffers, shared by every connection of one engine.
///
/// A released buffer is cleared before it re-enters the pool, so the next
/// acquirer can never observe a previous connection's bytes. Buffers whose
/// capacity was consumed by frozen slices are discarded instead of pooled.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<BytesMut>>,
    buffer_capacity: usize,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(buffer_capacity: usize, max_pooled: usize) -> BufferPool {
        BufferPool {
            buffers: Mutex::new(Vec::with_capacity(max_pooled)),
            buffer_capacity,
            max_pooled,
        }
    }

    pub fn acquire(&self) -> BytesMut {
        let pooled = self.buffers.lock().pop();
        match pooled {
            Some(buffer) => buffer,
            None => BytesMut::with_capacity(self.buffer_capacity),
        }
    }

    pub fn release(&self, mut buffer: BytesMut) {
        buffer.clear();
        if buffer.capacity() < self.buffer_capacity {
            return;
        }
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_pooled {
            buffers.push(buffer);
        }
    }

    pub fn pooled(&self) -> usize {
        self.buffers.lock().len()
    }
}
