//! Buffer pool implementation for efficient buffer reuse
//!
//! This module provides a thread-safe pool that bounds the number of
//! bridge buffers in flight at once. Each bridged tunnel stream holds
//! two buffers for its lifetime, so the pool caps aggregate memory
//! across all live streams.

use bytes::BytesMut;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A pool of reusable byte buffers
///
/// The pool is cheap to clone and can be shared between tasks.
#[derive(Clone)]
pub struct BufferPool {
    /// Limits the number of buffers that can be borrowed at once
    semaphore: Arc<Semaphore>,
    /// Capacity of each buffer handed out
    buffer_capacity: usize,
}

/// A buffer borrowed from the pool
///
/// When dropped, the buffer's slot is returned to the pool.
pub struct PooledBuffer {
    /// The actual buffer
    pub buffer: BytesMut,
    /// Permit released when this buffer is dropped
    _permit: OwnedSemaphorePermit,
}

impl BufferPool {
    /// Create a new buffer pool
    ///
    /// # Parameters
    ///
    /// * `max_buffers` - Maximum number of buffers that can be borrowed at once
    /// * `buffer_capacity` - Capacity of each buffer
    pub fn new(max_buffers: usize, buffer_capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_buffers)),
            buffer_capacity,
        }
    }

    /// Borrow a buffer from the pool
    ///
    /// If the pool is at capacity, this waits until a buffer is returned.
    pub async fn get_buffer(&self) -> PooledBuffer {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("buffer pool semaphore closed");

        PooledBuffer {
            buffer: BytesMut::with_capacity(self.buffer_capacity),
            _permit: permit,
        }
    }

    /// Try to borrow a buffer from the pool without waiting
    ///
    /// # Returns
    ///
    /// Some(PooledBuffer) if a buffer is available, None otherwise
    pub fn try_get_buffer(&self) -> Option<PooledBuffer> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;

        Some(PooledBuffer {
            buffer: BytesMut::with_capacity(self.buffer_capacity),
            _permit: permit,
        })
    }

    /// Capacity of buffers handed out by this pool
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_buffer_pool() {
        // Create a pool with 2 buffers
        let pool = BufferPool::new(2, 1024);

        // Borrow two buffers
        let mut buffer1 = pool.get_buffer().await;
        let mut buffer2 = pool.get_buffer().await;

        // Write to the buffers
        buffer1.buffer.extend_from_slice(b"hello");
        buffer2.buffer.extend_from_slice(b"world");

        assert_eq!(&buffer1.buffer[..], b"hello");
        assert_eq!(&buffer2.buffer[..], b"world");

        // Try to borrow a third buffer (should fail)
        assert!(pool.try_get_buffer().is_none());

        // Drop one buffer
        drop(buffer1);

        // Now we should be able to borrow another buffer
        let buffer3 = pool.try_get_buffer();
        assert!(buffer3.is_some());

        // Fresh buffers start empty
        assert_eq!(buffer3.unwrap().buffer.len(), 0);
    }
}
