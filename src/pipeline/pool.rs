//! Pixel buffer pool
//!
//! A bounded set of equally sized frame buffers. Capture borrows one per
//! frame and the buffer finds its way back when the encode worker drops the
//! frame, so memory stays flat no matter how far the writer falls behind.

use super::types::PixelFormat;
use crate::capture::bitmap::BitmapContext;
use crate::utils::error::{RecorderError, RecorderResult};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct PoolSlots {
    /// Storage ready for reuse
    free: Vec<Vec<u8>>,
    /// Buffers currently handed out
    in_flight: usize,
}

struct PoolInner {
    width: u32,
    height: u32,
    format: PixelFormat,
    frame_size: usize,
    capacity: usize,
    slots: Mutex<PoolSlots>,
    available: Condvar,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl PoolInner {
    fn give_back(&self, data: Vec<u8>) {
        let mut slots = self.slots.lock();
        slots.in_flight -= 1;
        if data.len() == self.frame_size {
            slots.free.push(data);
        }
        drop(slots);

        self.released.fetch_add(1, Ordering::Relaxed);
        self.available.notify_one();
    }
}

/// Pool of fixed-format pixel buffers sized to the output resolution
#[derive(Clone)]
pub struct PixelBufferPool {
    inner: Arc<PoolInner>,
}

impl PixelBufferPool {
    pub fn new(width: u32, height: u32, format: PixelFormat, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                width,
                height,
                format,
                frame_size: format.frame_size(width, height),
                capacity,
                slots: Mutex::new(PoolSlots {
                    free: Vec::with_capacity(capacity),
                    in_flight: 0,
                }),
                available: Condvar::new(),
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
        }
    }

    /// Take a buffer, waiting at most `timeout` for one to be returned.
    ///
    /// Fails with [`RecorderError::Backpressure`] when every buffer is still
    /// in flight after the wait.
    pub fn acquire(&self, timeout: Duration) -> RecorderResult<PixelBuffer> {
        let inner = &self.inner;
        // None when the timeout is too large to represent; wait without a deadline
        let deadline = Instant::now().checked_add(timeout);

        let mut slots = inner.slots.lock();
        while slots.in_flight >= inner.capacity {
            let timed_out = match deadline {
                Some(deadline) => inner.available.wait_until(&mut slots, deadline).timed_out(),
                None => {
                    inner.available.wait(&mut slots);
                    false
                }
            };
            if timed_out && slots.in_flight >= inner.capacity {
                return Err(RecorderError::Backpressure);
            }
        }
        slots.in_flight += 1;
        let data = slots.free.pop().unwrap_or_else(|| vec![0u8; inner.frame_size]);
        drop(slots);

        inner.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(PixelBuffer {
            data,
            pool: Arc::clone(inner),
        })
    }

    /// Take a buffer only if one is free right now
    pub fn try_acquire(&self) -> RecorderResult<PixelBuffer> {
        self.acquire(Duration::ZERO)
    }

    /// Return a buffer for reuse. Dropping the buffer does the same.
    pub fn release(&self, buffer: PixelBuffer) {
        drop(buffer);
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.inner.slots.lock().in_flight
    }

    pub fn acquired(&self) -> u64 {
        self.inner.acquired.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> u64 {
        self.inner.released.load(Ordering::Relaxed)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.inner.width, self.inner.height)
    }

    pub fn format(&self) -> PixelFormat {
        self.inner.format
    }
}

impl fmt::Debug for PixelBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBufferPool")
            .field("width", &self.inner.width)
            .field("height", &self.inner.height)
            .field("capacity", &self.inner.capacity)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// A frame buffer on loan from a [`PixelBufferPool`]
pub struct PixelBuffer {
    data: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl PixelBuffer {
    pub fn width(&self) -> u32 {
        self.pool.width
    }

    pub fn height(&self) -> u32 {
        self.pool.height
    }

    pub fn format(&self) -> PixelFormat {
        self.pool.format
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Drawing context over this buffer's pixels
    pub fn context(&mut self) -> BitmapContext<'_> {
        let (width, height) = (self.pool.width, self.pool.height);
        BitmapContext::new(&mut self.data, width, height)
    }
}

impl Drop for PixelBuffer {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.data));
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.pool.width)
            .field("height", &self.pool.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}
