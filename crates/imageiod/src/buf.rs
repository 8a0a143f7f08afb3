//! Aligned buffer pool for direct I/O.
//!
//! Direct I/O requires the buffer address, the file offset, and the request
//! length to all be multiples of the device logical block size. Buffers are
//! allocated with an explicit layout and cached in a pool so hot transfer
//! paths do not hit the allocator per request.

use std::alloc::{self, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

/// Heap buffer with guaranteed alignment.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The buffer is uniquely owned plain memory.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    /// Allocate a zeroed buffer of `len` bytes aligned to `align`.
    pub fn new(len: usize, align: usize) -> Self {
        assert!(len > 0 && align.is_power_of_two());
        let layout = Layout::from_size_align(len, align).expect("invalid buffer layout");
        // Zeroed allocation keeps the content defined even before the first
        // read fills it.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            alloc::handle_alloc_error(layout);
        };
        AlignedBuf { ptr, layout }
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn align(&self) -> usize {
        self.layout.align()
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Pool of equally sized aligned buffers.
pub struct BufPool {
    buf_size: usize,
    align: usize,
    bufs: Mutex<Vec<AlignedBuf>>,
}

impl BufPool {
    pub fn new(buf_size: usize, align: usize) -> Arc<Self> {
        Arc::new(BufPool {
            buf_size,
            align,
            bufs: Mutex::new(Vec::new()),
        })
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Take a buffer from the pool, allocating when empty. The buffer
    /// returns to the pool when the guard drops.
    pub fn take(self: &Arc<Self>) -> PoolBuf {
        let buf = self
            .bufs
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| AlignedBuf::new(self.buf_size, self.align));
        PoolBuf {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    fn give(&self, buf: AlignedBuf) {
        // Drop buffers from an older pool configuration.
        if buf.len() == self.buf_size && buf.align() == self.align {
            self.bufs.lock().unwrap().push(buf);
        }
    }
}

/// Guard returning its buffer to the pool on drop.
pub struct PoolBuf {
    buf: Option<AlignedBuf>,
    pool: Arc<BufPool>,
}

impl Deref for PoolBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_ref().unwrap()
    }
}

impl DerefMut for PoolBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut().unwrap()
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment() {
        for align in [512, 4096] {
            let buf = AlignedBuf::new(8192, align);
            assert_eq!(buf.as_ptr() as usize % align, 0);
            assert_eq!(buf.len(), 8192);
        }
    }

    #[test]
    fn test_zeroed() {
        let buf = AlignedBuf::new(4096, 512);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_pool_reuse() {
        let pool = BufPool::new(4096, 512);
        let ptr = {
            let mut buf = pool.take();
            buf[0] = 0xab;
            buf.as_ptr()
        };
        // The same buffer comes back.
        let buf = pool.take();
        assert_eq!(buf.as_ptr(), ptr);
        assert!(pool.bufs.lock().unwrap().is_empty());
    }

    #[test]
    fn test_pool_grows() {
        let pool = BufPool::new(4096, 512);
        let a = pool.take();
        let b = pool.take();
        assert_ne!(a.as_ptr(), b.as_ptr());
        drop(a);
        drop(b);
        assert_eq!(pool.bufs.lock().unwrap().len(), 2);
    }
}
