use std::ptr::{self, NonNull};

use crate::{
    header::{SegmentHeader, DIRECT_LEVEL, SEGMENT_HEADER_SIZE},
    list::LinkedList,
    platform::{BackingMemory, Platform},
    slab::{segment_size, Layer, SlabPage},
    Pointer, Pool, MAX_LEVELS, MIN_LEVELS,
};

#[cfg(feature = "leak-detect")]
use crate::leak::LeakTracker;

/// Segregated slab pool. Each size class (layer) owns an intrusive free
/// list of equally sized segments, fed by pages that are carved for one
/// class the moment they are installed:
///
/// ```text
/// layers[0] -> seg -> seg -> seg          (24 byte segments)
/// layers[1] -> seg -> seg                 (48 byte segments)
/// layers[2]                               (96 bytes, currently exhausted)
///   ...
///
/// using_pages: page <-> page <-> page     (pages hosting some class)
/// free_pages:  page <-> page              (drained pages kept for reuse)
/// ```
///
/// Allocation and deallocation are O(1): a pop or push on the layer's
/// list plus a counter bump on the owning page, which is found from the
/// segment header by pure arithmetic. The price is that fragmentation
/// lingers: a page stays pinned to its class until a
/// [`SlabPool::collect_garbage`] sweep finds it completely idle, moves it
/// to the free page cache, and a later [`SlabPool::purge`] hands the cache
/// back to the platform.
///
/// The pool is single threaded by construction; wrap it in
/// [`crate::LockedPool`] to share it.
pub struct SlabPool<const LEVELS: u32, M: BackingMemory = Platform> {
    /// Sized for the largest supported pool; only the first `LEVELS`
    /// entries are addressable classes. Keeps the struct independent of
    /// the const parameter and makes `new` a plain `const fn`.
    layers: [Layer<LEVELS>; MAX_LEVELS as usize],
    using_pages: LinkedList,
    free_pages: LinkedList,
    backing: M,
    #[cfg(feature = "leak-detect")]
    leaks: LeakTracker,
}

unsafe impl<const LEVELS: u32, M: BackingMemory + Send> Send for SlabPool<LEVELS, M> {}

impl<const LEVELS: u32> SlabPool<LEVELS, Platform> {
    /// Builds an empty pool backed by the platform allocator. No memory is
    /// requested until the first allocation.
    pub const fn new() -> Self {
        Self::with_backing(Platform)
    }
}

impl<const LEVELS: u32> Default for SlabPool<LEVELS, Platform> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const LEVELS: u32, M: BackingMemory> SlabPool<LEVELS, M> {
    /// Top layer that still fits in a page: one segment of the next layer
    /// up would be the whole payload, leaving the page header nowhere.
    const MAX_LAYER: u32 = LEVELS - 1;

    /// Builds an empty pool on top of the given backing memory.
    pub const fn with_backing(backing: M) -> Self {
        const {
            assert!(
                LEVELS >= MIN_LEVELS && LEVELS <= MAX_LEVELS,
                "unsupported LEVELS value"
            )
        }

        let mut layers = [Layer::new(0); MAX_LEVELS as usize];
        let mut layer = 1;
        while layer < MAX_LEVELS as usize {
            layers[layer] = Layer::new(layer as u8);
            layer += 1;
        }

        Self {
            layers,
            using_pages: LinkedList::new(),
            free_pages: LinkedList::new(),
            backing,
            #[cfg(feature = "leak-detect")]
            leaks: LeakTracker::new(),
        }
    }

    /// Smallest layer whose segment fits `size` bytes plus the header.
    /// Linear scan, the layer table is tiny and this is cache friendly.
    fn layer_for(size: usize) -> Option<u32> {
        let needed = size + SEGMENT_HEADER_SIZE;
        (0..=Self::MAX_LAYER).find(|&layer| segment_size(layer) >= needed)
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

    /// Returns an allocation to its layer. `None` is a no-op.
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
    /// [`SlabPool::allocate`]; `None` as output means the request failed
    /// and the original address is still valid and untouched. A segment
    /// already large enough is returned unchanged.
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

    /// Sweeps the `using` list and moves every page without a live
    /// segment into the free page cache, unthreading its segments from
    /// their layer. Cached pages are reused before the platform is asked
    /// for new ones; [`SlabPool::purge`] actually returns them.
    pub fn collect_garbage(&mut self) {
        unsafe {
            let mut cursor = self.using_pages.first();
            while let Some(node) = cursor {
                // Grab the successor before the node gets unlinked.
                cursor = (*node.as_ptr()).next;

                let page = SlabPage::<LEVELS>::from_node(node);
                if page.alloc_count() == 0 {
                    self.using_pages.remove(node);
                    self.layers[page.layer() as usize].remove_page(page);
                    self.free_pages.append(page.base());
                }
            }
        }
    }

    /// Complete collection: a normal sweep plus releasing every cached
    /// free page back to the backing memory.
    pub fn purge(&mut self) {
        self.collect_garbage();
        unsafe {
            while let Some(node) = self.free_pages.pop_front() {
                self.backing.release(node.cast());
            }
        }
    }

    /// Number of pages currently hosting a size class. Cached free pages
    /// are not counted; see [`SlabPool::cached_page_count`].
    pub fn page_count(&self) -> usize {
        self.using_pages.len()
    }

    /// Number of drained pages parked in the free page cache.
    pub fn cached_page_count(&self) -> usize {
        self.free_pages.len()
    }

    /// Carvable bytes per page.
    pub fn page_size(&self) -> usize {
        SlabPage::<LEVELS>::PAYLOAD
    }

    /// Largest request that is still served from a page; anything above
    /// takes the direct path.
    pub fn max_allocation_size(&self) -> usize {
        segment_size(Self::MAX_LAYER) - SEGMENT_HEADER_SIZE
    }

    unsafe fn alloc_impl(&mut self, size: usize) -> Pointer<u8> {
        if size == 0 {
            return None;
        }

        if size > self.max_allocation_size() {
            return self.alloc_direct(size);
        }

        let layer = Self::layer_for(size)? as usize;

        if !self.layers[layer].has_free_segments() {
            let page = self.take_page()?;
            self.using_pages.append(page.base());
            self.layers[layer].install_page(page);
        }

        self.layers[layer].claim_segment()
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

        debug_assert!(meta.level() <= Self::MAX_LAYER, "corrupt segment header");
        self.layers[meta.level() as usize].release_segment(address);
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

        // The segment keeps its class as long as the new size fits it.
        if new_size <= self.layers[meta.level() as usize].data_size() {
            return Some(address);
        }

        let new_address = self.alloc_impl(new_size)?;

        // We don't know the caller's original length, only the segment
        // capacity, which bounds it from above and always fits in the
        // bigger destination.
        ptr::copy_nonoverlapping(
            address.as_ptr(),
            new_address.as_ptr(),
            self.layers[meta.level() as usize].data_size(),
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

    /// Pulls a page from the free cache, or a fresh block from the
    /// backing memory if the cache is dry.
    unsafe fn take_page(&mut self) -> Option<SlabPage<LEVELS>> {
        if let Some(node) = self.free_pages.pop_front() {
            return Some(SlabPage::from_node(node));
        }

        let base = self.backing.request(SlabPage::<LEVELS>::BYTES)?;
        Some(SlabPage::init(base))
    }
}

impl<const LEVELS: u32, M: BackingMemory> Pool for SlabPool<LEVELS, M> {
    #[track_caller]
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        SlabPool::allocate(self, size)
    }

    unsafe fn deallocate(&mut self, address: Option<NonNull<u8>>) {
        SlabPool::deallocate(self, address)
    }

    #[track_caller]
    unsafe fn reallocate(
        &mut self,
        address: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        SlabPool::reallocate(self, address, new_size)
    }

    fn collect_garbage(&mut self) {
        SlabPool::collect_garbage(self)
    }

    fn page_count(&self) -> usize {
        SlabPool::page_count(self)
    }

    fn page_size(&self) -> usize {
        SlabPool::page_size(self)
    }

    fn max_allocation_size(&self) -> usize {
        SlabPool::max_allocation_size(self)
    }
}

impl<const LEVELS: u32, M: BackingMemory> Drop for SlabPool<LEVELS, M> {
    /// Returns every page to the backing memory, live segments included:
    /// dropping the pool invalidates all its allocations. Direct segments
    /// are the caller's to free before this point.
    fn drop(&mut self) {
        #[cfg(feature = "leak-detect")]
        self.leaks.report();

        self.purge();
        unsafe {
            while let Some(node) = self.using_pages.pop_front() {
                self.backing.release(node.cast());
            }
        }
    }
}
