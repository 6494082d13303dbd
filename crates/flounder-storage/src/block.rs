use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Default block capacity in bytes (2 MiB).
pub const DEFAULT_BLOCK_CAPACITY: usize = 2 << 20;

/// Cache-line alignment for block buffers, to avoid coincidental sharing
/// between cores.
const BLOCK_ALIGN: usize = 64;

static BLOCK_CAPACITY: AtomicUsize = AtomicUsize::new(DEFAULT_BLOCK_CAPACITY);

/// The process-wide block capacity.
pub fn block_capacity() -> usize {
    BLOCK_CAPACITY.load(Ordering::Relaxed)
}

/// Override the block capacity. Intended for process start, before any
/// relation is created; existing blocks keep the capacity they were
/// allocated with.
pub fn set_block_capacity(capacity: usize) {
    BLOCK_CAPACITY.store(capacity, Ordering::Relaxed);
}

/// A contiguous buffer of fixed capacity with a current content size.
///
/// Invariants: `content_size <= capacity`; appends only extend the content.
/// Blocks are heap-pinned (boxed) because generated code holds raw pointers
/// to them across the whole query.
#[derive(Debug)]
pub struct DataBlock {
    data: *mut u8,
    content_size: usize,
    capacity: usize,
}

// The buffer is plain bytes; synchronization is the owner's responsibility
// (per-relation mutexes in the iterators).
unsafe impl Send for DataBlock {}
unsafe impl Sync for DataBlock {}

impl DataBlock {
    pub fn new() -> Self {
        let capacity = block_capacity();
        let layout = Layout::from_size_align(capacity, BLOCK_ALIGN).expect("block layout");
        let data = unsafe { alloc_zeroed(layout) };
        assert!(!data.is_null(), "block allocation failed");
        Self {
            data,
            content_size: 0,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn content_size(&self) -> usize {
        self.content_size
    }

    pub fn begin(&self) -> *mut u8 {
        self.data
    }

    pub fn end(&self) -> *mut u8 {
        unsafe { self.data.add(self.content_size) }
    }

    pub fn capacity_end(&self) -> *mut u8 {
        unsafe { self.data.add(self.capacity) }
    }

    /// Commit a new content end. Aborts on overrun: this is called from
    /// generated code, where there is no unwinding path.
    pub fn update_content_size_ptr(&mut self, end_write: *const u8) {
        let len = (end_write as usize).wrapping_sub(self.data as usize);
        if len > self.capacity {
            eprintln!("fatal: write beyond block end");
            std::process::abort();
        }
        self.content_size = len;
    }

    pub fn set_content_size(&mut self, len: usize) {
        assert!(len <= self.capacity, "content larger than block");
        self.content_size = len;
    }
}

impl Default for DataBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DataBlock {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.capacity, BLOCK_ALIGN).expect("block layout");
        unsafe { dealloc(self.data, layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_block_is_empty() {
        let b = DataBlock::new();
        assert_eq!(b.content_size(), 0);
        assert_eq!(b.begin(), b.end());
        assert_eq!(b.capacity(), block_capacity());
    }

    #[test]
    fn buffer_is_cache_aligned() {
        let b = DataBlock::new();
        assert_eq!(b.begin() as usize % 64, 0);
    }

    #[test]
    fn content_size_from_pointer() {
        let mut b = DataBlock::new();
        let end = unsafe { b.begin().add(24) };
        b.update_content_size_ptr(end);
        assert_eq!(b.content_size(), 24);
        assert_eq!(b.end(), end);
    }
}
