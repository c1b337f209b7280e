//! Slice buffer allocation
//!
//! All buffers in a pool share one size, fixed when the pool is built. The
//! shard derives its slice capacity from that size, so handing out a
//! different size would corrupt the descriptor geometry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{BitGridError, Result};
use crate::fatal_assert;
use crate::index::buffer::SliceBuffer;

/// Source of uniformly-sized slice buffers
pub trait SliceBufferAllocator: Send + Sync {
    /// Hand out a zero-filled buffer of exactly `size` bytes
    fn allocate(&self, size: usize) -> Result<Arc<SliceBuffer>>;

    /// Return a buffer to the allocator
    fn release(&self, buffer: Arc<SliceBuffer>);

    /// The uniform buffer size this allocator serves
    fn slice_buffer_size(&self) -> usize;
}

/// Freelist-backed pool of slice buffers
pub struct PoolBufferAllocator {
    buffer_size: usize,
    max_buffers: Option<usize>,
    in_use: AtomicUsize,
    free: Mutex<Vec<Arc<SliceBuffer>>>,
}

impl PoolBufferAllocator {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            max_buffers: None,
            in_use: AtomicUsize::new(0),
            free: Mutex::new(Vec::new()),
        }
    }

    /// Pool that refuses to hand out more than `max_buffers` at once
    pub fn with_max_buffers(buffer_size: usize, max_buffers: usize) -> Self {
        Self {
            buffer_size,
            max_buffers: Some(max_buffers),
            in_use: AtomicUsize::new(0),
            free: Mutex::new(Vec::new()),
        }
    }
}

impl SliceBufferAllocator for PoolBufferAllocator {
    fn allocate(&self, size: usize) -> Result<Arc<SliceBuffer>> {
        if size != self.buffer_size {
            return Err(BitGridError::BufferSizeMismatch {
                requested: size,
                pooled: self.buffer_size,
            });
        }
        if let Some(max) = self.max_buffers {
            if self.in_use.load(Ordering::Relaxed) >= max {
                return Err(BitGridError::PoolExhausted { max });
            }
        }
        self.in_use.fetch_add(1, Ordering::Relaxed);
        let recycled = self.free.lock().pop();
        match recycled {
            Some(buffer) => Ok(buffer),
            None => Ok(Arc::new(SliceBuffer::new(self.buffer_size))),
        }
    }

    fn release(&self, buffer: Arc<SliceBuffer>) {
        let prior = self.in_use.fetch_sub(1, Ordering::Relaxed);
        fatal_assert!(prior > 0, "buffer released to an empty pool");
        // Only uniquely-held buffers can be handed out again; a buffer still
        // visible through an old reader snapshot is dropped when that
        // snapshot goes away.
        if Arc::strong_count(&buffer) == 1 {
            self.free.lock().push(buffer);
        }
    }

    fn slice_buffer_size(&self) -> usize {
        self.buffer_size
    }
}

/// Allocator that counts outstanding buffers, for lifecycle tests
pub struct TrackingBufferAllocator {
    buffer_size: usize,
    in_use: AtomicUsize,
}

impl TrackingBufferAllocator {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            in_use: AtomicUsize::new(0),
        }
    }

    /// Number of buffers currently allocated and not yet released
    pub fn in_use_buffer_count(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }
}

impl SliceBufferAllocator for TrackingBufferAllocator {
    fn allocate(&self, size: usize) -> Result<Arc<SliceBuffer>> {
        if size != self.buffer_size {
            return Err(BitGridError::BufferSizeMismatch {
                requested: size,
                pooled: self.buffer_size,
            });
        }
        self.in_use.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(SliceBuffer::new(self.buffer_size)))
    }

    fn release(&self, _buffer: Arc<SliceBuffer>) {
        let prior = self.in_use.fetch_sub(1, Ordering::SeqCst);
        fatal_assert!(prior > 0, "buffer released to an empty tracking allocator");
    }

    fn slice_buffer_size(&self) -> usize {
        self.buffer_size
    }
}
