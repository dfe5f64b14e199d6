//! Pooled memory allocator with two interchangeable cores.
//!
//! Every allocation is a *segment*: a fixed 8 byte header followed by the
//! caller's data. The header stores the segment's size class and its
//! position inside the owning *page*, so freeing needs nothing but the
//! address itself; the metadata is always one pointer subtraction away
//! and the page one multiplication further. Pages are big blocks obtained
//! from the platform allocator and carved on demand; requests too large
//! for any page bypass them entirely and the header remembers that too.
//!
//! ```text
//!                        caller's pointer
//!                               |
//!                               v
//!            +--------+--------------------------+
//!            | header |          data            |    one segment
//!            +--------+--------------------------+
//!            ^
//!            +-- level | index | used (one u32)
//! ```
//!
//! Two pool flavors share this contract and the same facade:
//!
//! - [`BuddyPool`]: pages host a binary buddy tree; size classes are
//!   powers of two of a 16 byte unit. Pages live in a max-heap keyed by
//!   their free capacity, so allocations concentrate in the fullest pages
//!   and empty ones surface at the root where
//!   [`BuddyPool::collect_garbage`] picks them off.
//! - [`SlabPool`]: pages are carved into equal segments for a single
//!   class and each class threads its free segments through an intrusive
//!   list. Everything is O(1); drained pages are cached for reuse and
//!   [`SlabPool::purge`] returns them to the platform.
//!
//! Both are plain single threaded values; [`LockedPool`] wraps either in
//! a spinlock and implements [`std::alloc::GlobalAlloc`] on top.
//!
//! ```rust
//! use pooloc::SlabPool;
//!
//! let mut pool = SlabPool::<10>::new();
//!
//! let address = pool.allocate(100).unwrap();
//! unsafe {
//!     address.as_ptr().write_bytes(0xAB, 100);
//!     pool.deallocate(Some(address));
//! }
//!
//! pool.collect_garbage();
//! assert_eq!(pool.page_count(), 0);
//! ```

use std::ptr::NonNull;

mod bitmap;
mod buddy;
mod buddy_pool;
mod global;
mod header;
mod heap;
mod list;
mod platform;
mod slab;
mod slab_pool;

#[cfg(feature = "leak-detect")]
mod leak;

pub use buddy_pool::BuddyPool;
pub use global::LockedPool;
pub use header::SEGMENT_HEADER_SIZE;
pub use platform::{BackingMemory, Platform};
pub use slab_pool::SlabPool;

/// Smallest supported `LEVELS` parameter.
pub const MIN_LEVELS: u32 = 8;

/// Largest supported `LEVELS` parameter. Bounded by the 26 index bits of
/// the segment header.
pub const MAX_LEVELS: u32 = 26;

/// Non-null pointer to `T`. We use this in most cases instead of
/// `*mut T` because the compiler will yell at us if we don't write code
/// for the `None` case, which doubles as the null address of the facade.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

/// The facade shared by both pool flavors. `None` plays the role of the
/// null address throughout: allocating zero bytes returns `None` without
/// touching anything, deallocating `None` is a no-op and reallocating
/// `None` allocates. Exhaustion of the backing memory also surfaces as
/// `None`, never as a panic, and leaves the pool consistent.
pub trait Pool {
    /// Allocates at least `size` writable bytes at an 8-byte aligned
    /// address, or `None` when `size` is zero or memory is exhausted.
    #[track_caller]
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// Returns an allocation to the pool. `None` is a no-op.
    ///
    /// # Safety
    ///
    /// `address` must come from this pool and must not be used afterwards.
    unsafe fn deallocate(&mut self, address: Option<NonNull<u8>>);

    /// Grows or shrinks an allocation, preserving the first
    /// `min(old, new)` bytes. Returns `None` when the request cannot be
    /// served, in which case the original address is still valid and
    /// untouched. Shrinking is in place: the segment keeps the class it
    /// was allocated at.
    ///
    /// # Safety
    ///
    /// `address` must come from this pool. On success the old address
    /// must not be used again.
    #[track_caller]
    unsafe fn reallocate(
        &mut self,
        address: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Option<NonNull<u8>>;

    /// Reclaims pages that hold no live allocation.
    fn collect_garbage(&mut self);

    /// Number of pages currently in use.
    fn page_count(&self) -> usize;

    /// Size in bytes of one page.
    fn page_size(&self) -> usize;

    /// Largest request served from a page; anything above goes straight
    /// to the backing memory.
    fn max_allocation_size(&self) -> usize;
}
