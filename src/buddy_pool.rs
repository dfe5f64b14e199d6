use std::ptr::{self, NonNull};

use crate::{
    buddy::{level_capacity, BuddyPage, UNIT_SIZE},
    header::{SegmentHeader, DIRECT_LEVEL, SEGMENT_HEADER_SIZE},
    heap::PageHeap,
    platform::{BackingMemory, Platform},
    Pointer, Pool, MAX_LEVELS, MIN_LEVELS,
};

#[cfg(feature = "leak-detect")]
use crate::leak::LeakTracker;

/// Buddy-tree memory pool. Pages of `2^LEVELS` sixteen-byte units are
/// recursively halved to fit each request, and kept in a max-heap so every
/// allocation goes to the page with the most room, concentrating live
/// segments in few pages and letting the rest drain empty for
/// [`BuddyPool::collect_garbage`]:
///
/// ```text
///               +-------- PageHeap --------+
///               | [0]       [1]       [2]  |
///               +--|---------|---------|---+
///                  v         v         v
///               +------+  +------+  +------+
///               | Page |  | Page |  | Page |      <- most free page first
///               +------+  +------+  +------+
///                  |
///                  |  node 1 (level LEVELS, whole page)
///                  |  +-- node 2 ---+  +-- node 3 ---+
///                  |  | 4 | 5 |  ...                         (buddy tree)
///                  v
///               units:  [hdr|data] [hdr|data] [hdr|data] ...
/// ```
///
/// A request of `size` bytes is rounded up to the smallest level `l` with
/// `16 * 2^l >= size + 8`; anything larger than a whole page bypasses the
/// pages entirely and goes straight to the backing memory (the header's
/// level sentinel remembers that). Costs are O(LEVELS) per claim or
/// release plus an O(log pages) heap sift.
///
/// The pool is single threaded by construction; wrap it in
/// [`crate::LockedPool`] to share it.
pub struct BuddyPool<const LEVELS: u32, M: BackingMemory = Platform> {
    heap: PageHeap<LEVELS>,
    backing: M,
    #[cfg(feature = "leak-detect")]
    leaks: LeakTracker,
}

unsafe impl<const LEVELS: u32, M: BackingMemory + Send> Send for BuddyPool<LEVELS, M> {}

impl<const LEVELS: u32> BuddyPool<LEVELS, Platform> {
    /// Builds an empty pool backed by the platform allocator. No memory is
    /// requested until the first allocation.
    pub const fn new() -> Self {
        Self::with_backing(Platform)
    }
}

impl<const LEVELS: u32> Default for BuddyPool<LEVELS, Platform> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const LEVELS: u32, M: BackingMemory> BuddyPool<LEVELS, M> {
    /// Builds an empty pool on top of the given backing memory.
    pub const fn with_backing(backing: M) -> Self {
        const {
            assert!(
                LEVELS >= MIN_LEVELS && LEVELS <= MAX_LEVELS,
                "unsupported LEVELS value"
            )
        }

        Self {
            heap: PageHeap::new(),
            backing,
            #[cfg(feature = "leak-detect")]
            leaks: LeakTracker::new(),
        }
    }

    /// Smallest level whose segment can hold `size` bytes plus the header.
    fn level_for(size: usize) -> u32 {
        let units = (size + SEGMENT_HEADER_SIZE + UNIT_SIZE - 1) / UNIT_SIZE;
        let mut level = 0;
        while (1usize << level) < units {
            level += 1;
        }
        level
    }

    /// Allocates at least `size` writable bytes, or `None` when `size` is
    /// zero or the backing memory is exhausted. The returned address is
    /// 8-byte aligned.
    #[track_caller]
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let address = unsafe { self.alloc_impl(size) };

        #[cfg(feature = "leak-detect")]
        if let Some(address) = address {
            self.leaks
                .record(address, size, std::panic::Location::caller());
        }

        address
    }

    /// Returns an allocation to the pool. `None` is a no-op.
    ///
    /// # Safety
    ///
    /// `address` must come from this pool and must not be used afterwards.
    pub unsafe fn deallocate(&mut self, address: Option<NonNull<u8>>) {
        #[cfg(feature = "leak-detect")]
        if let Some(address) = address {
            self.leaks.forget(address);
        }

        self.dealloc_impl(address);
    }

    /// Grows or shrinks an allocation, preserving the first
    /// `min(old, new)` bytes. `None` as input behaves like
    /// [`BuddyPool::allocate`]; `None` as output means the request failed
    /// and the original address is still valid and untouched. Shrinking
    /// never moves: a segment keeps the class it was allocated at.
    ///
    /// # Safety
    ///
    /// `address` must come from this pool. On success the old address must
    /// not be used again.
    #[track_caller]
    pub unsafe fn reallocate(
        &mut self,
        address: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        let result = self.realloc_impl(address, new_size);

        #[cfg(feature = "leak-detect")]
        {
            let location = std::panic::Location::caller();
            match (address, result) {
                (Some(old), Some(new)) => self.leaks.rekey(old, new, new_size, location),
                (None, Some(new)) => self.leaks.record(new, new_size, location),
                _ => {}
            }
        }

        result
    }

    /// Releases every page that currently holds no live segment back to
    /// the backing memory. Empty pages bubble to the heap root by
    /// construction, so this only ever inspects the root.
    pub fn collect_garbage(&mut self) {
        unsafe {
            loop {
                let Some(page) = self.heap.root() else { break };
                if !page.is_empty() {
                    break;
                }
                self.heap.remove_root();
                self.backing.release(page.base());
            }
        }
    }

    /// Number of pages currently held, empty or not.
    pub fn page_count(&self) -> usize {
        self.heap.len()
    }

    /// Size in bytes of one page block, metadata included.
    pub fn page_size(&self) -> usize {
        BuddyPage::<LEVELS>::BYTES
    }

    /// Largest request that is still served from a page; anything above
    /// takes the direct path.
    pub fn max_allocation_size(&self) -> usize {
        BuddyPage::<LEVELS>::MAX_ALLOCATION
    }

    unsafe fn alloc_impl(&mut self, size: usize) -> Pointer<u8> {
        if size == 0 {
            return None;
        }

        if size > BuddyPage::<LEVELS>::MAX_ALLOCATION {
            return self.alloc_direct(size);
        }

        let level = Self::level_for(size);

        // Probe the page with the most room. If even that one can't host
        // the level, fragmentation won, and we start a new page.
        if let Some(root) = self.heap.root() {
            if let Some(node) = root.claim(level) {
                self.heap.sift_down(0);
                return Some(Self::stamp(root, node, level));
            }
        }

        let base = self.backing.request(BuddyPage::<LEVELS>::BYTES)?;
        let page = BuddyPage::<LEVELS>::init(base);

        // A claim on a fresh page cannot fail for a valid level, but if it
        // ever did we must not keep the orphan page around.
        let Some(node) = page.claim(level) else {
            self.backing.release(base);
            return None;
        };

        let address = Self::stamp(page, node, level);
        self.heap.push(page);
        Some(address)
    }

    unsafe fn dealloc_impl(&mut self, address: Option<NonNull<u8>>) {
        let Some(address) = address else { return };

        let header = SegmentHeader::from_data_address(address);
        let meta = header.as_ptr().read();
        debug_assert!(meta.is_used(), "double free or foreign address");

        if meta.is_direct() {
            self.backing.release(header.cast());
            return;
        }

        (*header.as_ptr()).set_used(false);

        let page = BuddyPage::<LEVELS>::containing(header, meta.index());
        let node = BuddyPage::<LEVELS>::index_to_node(meta.index(), meta.level());
        let slot = page.heap_slot();
        page.release(node, meta.level());
        self.heap.sift_up(slot);
    }

    unsafe fn realloc_impl(&mut self, address: Option<NonNull<u8>>, new_size: usize) -> Pointer<u8> {
        let Some(address) = address else {
            return self.alloc_impl(new_size);
        };

        let header = SegmentHeader::from_data_address(address);
        let meta = header.as_ptr().read();
        debug_assert!(meta.is_used(), "realloc of a freed address");

        if meta.is_direct() {
            let length = new_size.checked_add(SEGMENT_HEADER_SIZE)?;
            let moved = self.backing.resize(header.cast(), length)?;
            return Some(SegmentHeader::data_address_of(moved.cast()));
        }

        // Shrink (or lateral move) is free: the segment keeps its class.
        if new_size <= BuddyPage::<LEVELS>::MAX_ALLOCATION
            && Self::level_for(new_size) <= meta.level()
        {
            return Some(address);
        }

        let new_address = self.alloc_impl(new_size)?;

        // We don't know the caller's original length, only the segment
        // capacity, which bounds it from above and always fits in the
        // bigger destination.
        ptr::copy_nonoverlapping(
            address.as_ptr(),
            new_address.as_ptr(),
            level_capacity(meta.level()),
        );
        self.dealloc_impl(Some(address));

        Some(new_address)
    }

    unsafe fn alloc_direct(&mut self, size: usize) -> Pointer<u8> {
        let block = self.backing.request(size.checked_add(SEGMENT_HEADER_SIZE)?)?;
        let header = block.cast::<SegmentHeader>();

        let mut meta = SegmentHeader::new(DIRECT_LEVEL, 0);
        meta.set_used(true);
        header.as_ptr().write(meta);

        Some(SegmentHeader::data_address_of(header))
    }

    /// Writes the segment header for a freshly claimed node and returns
    /// the data address for the caller.
    unsafe fn stamp(page: BuddyPage<LEVELS>, node: u32, level: u32) -> NonNull<u8> {
        let index = BuddyPage::<LEVELS>::node_to_index(node, level);
        let header = page.unit_at(index);

        let mut meta = SegmentHeader::new(level, index);
        meta.set_used(true);
        header.as_ptr().write(meta);

        SegmentHeader::data_address_of(header)
    }
}

impl<const LEVELS: u32, M: BackingMemory> Pool for BuddyPool<LEVELS, M> {
    #[track_caller]
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        BuddyPool::allocate(self, size)
    }

    unsafe fn deallocate(&mut self, address: Option<NonNull<u8>>) {
        BuddyPool::deallocate(self, address)
    }

    #[track_caller]
    unsafe fn reallocate(
        &mut self,
        address: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        BuddyPool::reallocate(self, address, new_size)
    }

    fn collect_garbage(&mut self) {
        BuddyPool::collect_garbage(self)
    }

    fn page_count(&self) -> usize {
        BuddyPool::page_count(self)
    }

    fn page_size(&self) -> usize {
        BuddyPool::page_size(self)
    }

    fn max_allocation_size(&self) -> usize {
        BuddyPool::max_allocation_size(self)
    }
}

impl<const LEVELS: u32, M: BackingMemory> Drop for BuddyPool<LEVELS, M> {
    /// Returns every page to the backing memory, live segments included:
    /// dropping the pool invalidates all its allocations. Direct segments
    /// are the caller's to free before this point.
    fn drop(&mut self) {
        #[cfg(feature = "leak-detect")]
        self.leaks.report();

        unsafe {
            for page in self.heap.pages() {
                self.backing.release(page.base());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::FlakyMemory;

    const LEVELS: u32 = 8;
    type Pool8 = BuddyPool<LEVELS>;

    #[test]
    fn level_mapping() {
        // 16 byte units, 8 of which the header eats.
        assert_eq!(Pool8::level_for(1), 0);
        assert_eq!(Pool8::level_for(8), 0);
        assert_eq!(Pool8::level_for(9), 1);
        assert_eq!(Pool8::level_for(24), 1);
        assert_eq!(Pool8::level_for(25), 2);
        assert_eq!(Pool8::level_for(100), 3);
    }

    #[test]
    fn zero_size_is_none() {
        let mut pool = Pool8::new();
        assert_eq!(pool.allocate(0), None);
        assert_eq!(pool.page_count(), 0);
    }

    #[test]
    fn deallocate_none_is_noop() {
        let mut pool = Pool8::new();
        unsafe { pool.deallocate(None) };
        assert_eq!(pool.page_count(), 0);
    }

    #[test]
    fn alloc_free_gc_roundtrip() {
        let mut pool = Pool8::new();
        let address = pool.allocate(1).unwrap();
        assert_eq!(pool.page_count(), 1);

        unsafe { pool.deallocate(Some(address)) };
        pool.collect_garbage();
        assert_eq!(pool.page_count(), 0);
    }

    #[test]
    fn no_aliasing_between_allocations() {
        let mut pool = Pool8::new();
        let a = pool.allocate(24).unwrap();
        let b = pool.allocate(24).unwrap();
        assert_ne!(a, b);

        unsafe {
            a.as_ptr().write_bytes(0xAB, 24);
            b.as_ptr().write_bytes(0xCD, 24);

            for i in 0..24 {
                assert_eq!(a.as_ptr().add(i).read(), 0xAB);
                assert_eq!(b.as_ptr().add(i).read(), 0xCD);
            }

            pool.deallocate(Some(a));
            pool.deallocate(Some(b));
        }

        pool.collect_garbage();
        assert_eq!(pool.page_count(), 0);
    }

    #[test]
    fn shrink_keeps_address() {
        let mut pool = Pool8::new();
        let a = pool.allocate(100).unwrap();
        let b = unsafe { pool.reallocate(Some(a), 50) }.unwrap();
        assert_eq!(a, b);

        // Same class is also in place.
        let c = unsafe { pool.reallocate(Some(b), 100) }.unwrap();
        assert_eq!(b, c);

        unsafe { pool.deallocate(Some(c)) };
    }

    #[test]
    fn grow_copies_contents() {
        let mut pool = Pool8::new();
        let a = pool.allocate(64).unwrap();
        unsafe {
            a.as_ptr().write_bytes(0x5A, 64);

            let b = pool.reallocate(Some(a), 4096).unwrap();
            assert_ne!(a, b);
            for i in 0..64 {
                assert_eq!(b.as_ptr().add(i).read(), 0x5A);
            }

            pool.deallocate(Some(b));
        }
        pool.collect_garbage();
        assert_eq!(pool.page_count(), 0);
    }

    #[test]
    fn failed_grow_leaves_original_valid() {
        let mut pool = BuddyPool::<LEVELS, FlakyMemory>::with_backing(FlakyMemory::grants(1));
        let a = pool.allocate(16).unwrap();
        unsafe {
            a.as_ptr().write_bytes(0x77, 16);

            // Growing to a size that needs a direct block, with the
            // backing refusing, must fail and leave `a` alone.
            let big = pool.max_allocation_size() + 1;
            assert_eq!(pool.reallocate(Some(a), big), None);
            for i in 0..16 {
                assert_eq!(a.as_ptr().add(i).read(), 0x77);
            }

            pool.deallocate(Some(a));
        }
    }

    #[test]
    fn page_fill_spills_to_second_page() {
        let mut pool = Pool8::new();
        let units = 1usize << LEVELS;

        let mut addresses = Vec::new();
        for _ in 0..units {
            addresses.push(pool.allocate(8).unwrap());
        }
        assert_eq!(pool.page_count(), 1);

        let spill = pool.allocate(8).unwrap();
        assert_eq!(pool.page_count(), 2);

        unsafe {
            pool.deallocate(Some(spill));
            for address in addresses {
                pool.deallocate(Some(address));
            }
        }
        pool.collect_garbage();
        assert_eq!(pool.page_count(), 0);
    }

    #[test]
    fn oversize_takes_direct_path() {
        let mut pool = Pool8::new();
        let size = pool.max_allocation_size() + 1;

        let address = pool.allocate(size).unwrap();
        assert_eq!(pool.page_count(), 0);

        unsafe {
            let header = SegmentHeader::from_data_address(address);
            assert!((*header.as_ptr()).is_direct());

            address.as_ptr().write_bytes(0x3C, size);
            assert_eq!(address.as_ptr().add(size - 1).read(), 0x3C);

            pool.deallocate(Some(address));
        }
        assert_eq!(pool.page_count(), 0);
    }

    #[test]
    fn direct_realloc_resizes_in_place_or_moves() {
        let mut pool = Pool8::new();
        let size = pool.max_allocation_size() + 1;

        let a = pool.allocate(size).unwrap();
        unsafe {
            a.as_ptr().write_bytes(0x42, size);

            let b = pool.reallocate(Some(a), size * 2).unwrap();
            for i in 0..size {
                assert_eq!(b.as_ptr().add(i).read(), 0x42);
            }
            let header = SegmentHeader::from_data_address(b);
            assert!((*header.as_ptr()).is_direct());

            pool.deallocate(Some(b));
        }
    }

    #[test]
    fn realloc_of_none_allocates() {
        let mut pool = Pool8::new();
        let address = unsafe { pool.reallocate(None, 32) }.unwrap();
        unsafe { pool.deallocate(Some(address)) };
        pool.collect_garbage();
        assert_eq!(pool.page_count(), 0);
    }

    #[test]
    fn gc_keeps_pages_with_live_segments() {
        let mut pool = Pool8::new();

        // Fill two pages with units, then free the whole second page and
        // half of the first.
        let units = 1usize << LEVELS;
        let mut first_page = Vec::new();
        let mut second_page = Vec::new();
        for _ in 0..units {
            first_page.push(pool.allocate(8).unwrap());
        }
        for _ in 0..units {
            second_page.push(pool.allocate(8).unwrap());
        }
        assert_eq!(pool.page_count(), 2);

        unsafe {
            for address in second_page {
                pool.deallocate(Some(address));
            }
            for address in first_page.drain(..units / 2) {
                pool.deallocate(Some(address));
            }
        }

        pool.collect_garbage();
        assert_eq!(pool.page_count(), 1);

        unsafe {
            for address in first_page {
                pool.deallocate(Some(address));
            }
        }
        pool.collect_garbage();
        assert_eq!(pool.page_count(), 0);
    }

    #[test]
    fn platform_oom_surfaces_as_none() {
        let mut pool = BuddyPool::<LEVELS, FlakyMemory>::with_backing(FlakyMemory::grants(0));
        assert_eq!(pool.allocate(8), None);
        assert_eq!(pool.page_count(), 0);
    }

    #[test]
    fn oom_mid_sequence_does_not_corrupt_live_allocations() {
        let mut pool = BuddyPool::<LEVELS, FlakyMemory>::with_backing(FlakyMemory::grants(1));

        let a = pool.allocate(8).unwrap();
        unsafe { a.as_ptr().write_bytes(0x11, 8) };

        // Exhaust the page so the next request needs a second one, which
        // the backing refuses.
        let units = 1usize << LEVELS;
        let mut rest = Vec::new();
        for _ in 1..units {
            rest.push(pool.allocate(8).unwrap());
        }
        assert_eq!(pool.allocate(8), None);
        assert_eq!(pool.page_count(), 1);

        unsafe {
            for i in 0..8 {
                assert_eq!(a.as_ptr().add(i).read(), 0x11);
            }

            // Freeing still works and frees really get reused.
            pool.deallocate(Some(a));
            let again = pool.allocate(8).unwrap();
            pool.deallocate(Some(again));

            for address in rest {
                pool.deallocate(Some(address));
            }
        }

        pool.collect_garbage();
        assert_eq!(pool.page_count(), 0);
    }

    #[test]
    fn drop_returns_all_backing_memory() {
        let flaky = FlakyMemory::grants(8);
        {
            let mut pool = BuddyPool::<LEVELS, &FlakyMemory>::with_backing(&flaky);
            // A few live allocations across two pages are intentionally
            // never freed; drop must still return the pages.
            let units = 1usize << LEVELS;
            for _ in 0..units + 3 {
                pool.allocate(8).unwrap();
            }
            assert_eq!(pool.page_count(), 2);
            assert_eq!(flaky.outstanding(), 2);
        }
        assert_eq!(flaky.outstanding(), 0);
    }
}
