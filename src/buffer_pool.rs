//! Pre-allocated message buffer pool.
//!
//! Wire messages are small and fixed in shape (a packed header plus at most 4 KiB of payload), so
//! buffers come from two power-of-two slabs. Each slab keeps a stash of recycled `Vec<u8>`
//! instances; callers lease a buffer sized for the upcoming message, fill it, and either freeze it
//! into a shared [`BufferHandle`] or let the lease drop back into the pool. Pools are never shared
//! across endpoints, and the outstanding-lease counter must read zero after shutdown; the
//! shutdown tests assert an exact alloc/free match.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Headers and control messages fit here.
pub const SMALL_BUFFER_SIZE: usize = 256;
/// Header plus the 4096-byte maximum payload.
pub const LARGE_BUFFER_SIZE: usize = 4_352;
const BUFFERS_PER_SIZE: usize = 64;

/// Two-slab pool with live-lease accounting.
pub struct BufferPool {
    slabs: [Mutex<Vec<Vec<u8>>>; 2],
    outstanding: AtomicU64,
}

impl BufferPool {
    pub fn new() -> Arc<BufferPool> {
        let fill = |size: usize| {
            let mut buffers = Vec::with_capacity(BUFFERS_PER_SIZE);
            for _ in 0..BUFFERS_PER_SIZE {
                buffers.push(vec![0u8; size]);
            }
            Mutex::new(buffers)
        };
        Arc::new(BufferPool {
            slabs: [fill(SMALL_BUFFER_SIZE), fill(LARGE_BUFFER_SIZE)],
            outstanding: AtomicU64::new(0),
        })
    }

    fn slab_for(len: usize) -> (usize, usize) {
        if len <= SMALL_BUFFER_SIZE {
            (0, SMALL_BUFFER_SIZE)
        } else {
            (1, LARGE_BUFFER_SIZE)
        }
    }

    /// Lease a zero-filled buffer able to hold `size_hint` bytes.
    pub fn lease(self: &Arc<Self>, size_hint: usize) -> BufferLease {
        let (idx, size) = Self::slab_for(size_hint);
        let data = self.slabs[idx].lock().pop().unwrap_or_else(|| vec![0u8; size]);
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        BufferLease {
            pool: Arc::clone(self),
            slab: idx,
            data: Some(data),
        }
    }

    /// Number of leases (and frozen handles) currently alive.
    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Relaxed)
    }

    fn release(&self, slab: usize, mut data: Vec<u8>) {
        let size = if slab == 0 {
            SMALL_BUFFER_SIZE
        } else {
            LARGE_BUFFER_SIZE
        };
        data.clear();
        data.resize(size, 0);
        self.slabs[slab].lock().push(data);
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Exclusive write access to a pooled buffer prior to sending.
pub struct BufferLease {
    pool: Arc<BufferPool>,
    slab: usize,
    data: Option<Vec<u8>>,
}

impl BufferLease {
    /// Borrow a mutable slice to fill with outgoing bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.data
            .as_mut()
            .expect("buffer lease already consumed")
            .as_mut_slice()
    }

    /// Convert the lease into a shared handle containing `len` valid bytes.
    pub fn freeze(mut self, len: usize) -> BufferHandle {
        let mut data = self.data.take().expect("buffer lease already consumed");
        let valid = len.min(data.len());
        data.truncate(valid);
        BufferHandle {
            inner: Arc::new(BufferInner {
                pool: Arc::clone(&self.pool),
                slab: self.slab,
                data: Some(data),
            }),
        }
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.release(self.slab, data);
        }
    }
}

struct BufferInner {
    pool: Arc<BufferPool>,
    slab: usize,
    data: Option<Vec<u8>>,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.release(self.slab, data);
        }
    }
}

/// Shared, cloneable handle to a frozen pooled buffer.
#[derive(Clone)]
pub struct BufferHandle {
    inner: Arc<BufferInner>,
}

impl BufferHandle {
    /// Read-only view of the valid bytes.
    pub fn as_slice(&self) -> &[u8] {
        self.inner
            .data
            .as_ref()
            .map(|d| d.as_slice())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.data.as_ref().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
