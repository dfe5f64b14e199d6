use std::{
    alloc::{GlobalAlloc, Layout},
    mem,
    ptr::{self, NonNull},
};

use spin::Mutex;

use crate::{header::SEGMENT_HEADER_SIZE, Pool};

/// Size of the back pointer we stash right before an over-aligned
/// allocation. See [`LockedPool::alloc_aligned`].
const BACK_POINTER_SIZE: usize = mem::size_of::<*mut u8>();

/// Thin ambient wrapper that turns any single threaded [`Pool`] into a
/// process-wide allocator: a spinlock for exclusion plus an
/// implementation of [`GlobalAlloc`]. The lock is `const`-constructible,
/// so a `LockedPool` can be a `static`:
///
/// ```no_run
/// use pooloc::{LockedPool, SlabPool};
///
/// #[global_allocator]
/// static ALLOCATOR: LockedPool<SlabPool<12>> = LockedPool::new(SlabPool::new());
///
/// fn main() {
///     let boxed = Box::new(5);
///     assert_eq!(*boxed, 5);
/// }
/// ```
///
/// # Alignment
///
/// The pools guarantee 8-byte alignment and nothing more, while
/// [`GlobalAlloc`] must honor any power of two. Stronger alignments are
/// served by over-allocating `align` extra bytes and returning the first
/// aligned address that leaves room for one pointer right before it; that
/// pointer stores the pool's original address so `dealloc` can find its
/// way back:
///
/// ```text
/// +-----------------+-- ... --+--------------+------------------+
/// | SegmentHeader   |  waste  | back pointer | caller's data    |
/// +-----------------+-- ... --+------|-------+------------------+
/// ^                                  |       ^
/// |                                  |       |
/// +--- pool address  <---------------+       +--- aligned address
/// ```
pub struct LockedPool<P: Pool> {
    pool: Mutex<P>,
}

impl<P: Pool> LockedPool<P> {
    /// Wraps a pool. Usually used in `static` position, see the type
    /// docs.
    pub const fn new(pool: P) -> Self {
        Self {
            pool: Mutex::new(pool),
        }
    }

    /// Direct access to the wrapped pool, for GC sweeps and page counts.
    pub fn lock(&self) -> spin::MutexGuard<'_, P> {
        self.pool.lock()
    }

    unsafe fn alloc_aligned(&self, layout: Layout) -> *mut u8 {
        let Some(base) = self.pool.lock().allocate(layout.size() + layout.align()) else {
            return ptr::null_mut();
        };

        let aligned = (base.as_ptr() as usize + BACK_POINTER_SIZE).next_multiple_of(layout.align());

        let back_pointer = (aligned - BACK_POINTER_SIZE) as *mut *mut u8;
        back_pointer.write(base.as_ptr());

        aligned as *mut u8
    }
}

unsafe impl<P: Pool + Send> GlobalAlloc for LockedPool<P> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Zero sized allocations don't exist as far as the pools are
        // concerned; any well aligned dangling pointer will do.
        if layout.size() == 0 {
            return layout.align() as *mut u8;
        }

        if layout.align() <= SEGMENT_HEADER_SIZE {
            return match self.pool.lock().allocate(layout.size()) {
                Some(address) => address.as_ptr(),
                None => ptr::null_mut(),
            };
        }

        self.alloc_aligned(layout)
    }

    unsafe fn dealloc(&self, address: *mut u8, layout: Layout) {
        if address.is_null() || layout.size() == 0 {
            return;
        }

        let address = if layout.align() <= SEGMENT_HEADER_SIZE {
            address
        } else {
            ((address as usize - BACK_POINTER_SIZE) as *mut *mut u8).read()
        };

        self.pool.lock().deallocate(NonNull::new(address));
    }

    unsafe fn realloc(&self, address: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= SEGMENT_HEADER_SIZE {
            return match self
                .pool
                .lock()
                .reallocate(NonNull::new(address), new_size)
            {
                Some(new_address) => new_address.as_ptr(),
                None => ptr::null_mut(),
            };
        }

        // Over-aligned addresses can't reuse the pool's realloc because
        // the aligned offset would change under the caller's feet, so do
        // it the pedestrian way: allocate, copy, free.
        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
        let new_address = self.alloc(new_layout);
        if new_address.is_null() {
            return ptr::null_mut();
        }

        ptr::copy_nonoverlapping(address, new_address, layout.size().min(new_size));
        self.dealloc(address, layout);

        new_address
    }
}
