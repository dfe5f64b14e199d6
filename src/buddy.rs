use std::{mem, ptr::NonNull};

use crate::{
    bitmap::Bitmap,
    header::{SegmentHeader, SEGMENT_HEADER_SIZE},
    MAX_LEVELS,
};

/// Size in bytes of the minimal allocation unit of a buddy page: one
/// segment header followed by a pointer-sized data cell. A level `l`
/// segment spans `2^l` of these, so the data capacity of a level `l`
/// segment is `UNIT_SIZE * 2^l - SEGMENT_HEADER_SIZE`.
pub(crate) const UNIT_SIZE: usize = SEGMENT_HEADER_SIZE + mem::size_of::<*mut u8>();

/// Largest number of user bytes a level `level` segment can hold.
#[inline]
pub(crate) const fn level_capacity(level: u32) -> usize {
    UNIT_SIZE * (1 << level) - SEGMENT_HEADER_SIZE
}

/// Fixed size metadata at the front of every buddy page block.
///
/// `level_count[i]` is the number of level `i` sub-trees that are still
/// whole and claimable. It drives two things: the fast-fail of
/// [`BuddyPage::claim`] and the ordering of pages inside
/// [`crate::heap::PageHeap`], which compares the count vectors
/// lexicographically from the highest level down so that the "most free"
/// page is always probed first. The array is sized for the largest
/// supported tree; a page instantiated with fewer levels simply leaves the
/// top entries at zero, which keeps the struct layout independent of the
/// const parameter.
#[repr(C)]
pub(crate) struct BuddyPageHead {
    /// Position of this page inside the page heap. Kept in sync by the
    /// heap on every swap so that a free can start sifting from the right
    /// slot without searching.
    pub heap_slot: usize,
    pub level_count: [u32; (MAX_LEVELS + 1) as usize],
}

/// One buddy page: a perfect binary tree of `2 * 2^LEVELS - 1` nodes
/// carved over `2^LEVELS` minimal units, all packed in a single block
/// obtained from the backing memory:
///
/// ```text
/// +---------------+------------+------------+----------------------------+
/// | BuddyPageHead | and bitmap | or  bitmap | units[0] units[1] ...      |
/// +---------------+------------+------------+----------------------------+
/// ```
///
/// Nodes are numbered from 1 in breadth-first order, exactly like a binary
/// heap, so node `p` has children `2p` and `2p + 1`. A node at tree level
/// `l` (leaves are level 0) spans `2^l` units. The two bitmaps encode the
/// state of every node:
///
/// - `or[p] == 1` iff the sub-tree of `p` contains at least one allocated
///   segment.
/// - `and[p] == 1` iff the sub-tree of `p` is fully unavailable, either
///   because `p` itself was handed out or because both children are fully
///   unavailable themselves.
///
/// This type is just a tagged pointer to the block; it's `Copy` and all
/// methods take `self` by value. Aliasing is a non-issue because we only
/// ever go through raw pointers here.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct BuddyPage<const LEVELS: u32> {
    base: NonNull<u8>,
}

impl<const LEVELS: u32> BuddyPage<LEVELS> {
    /// Number of minimal units in the page.
    pub const UNITS: usize = 1 << LEVELS;

    /// Bytes of one bitmap: one bit per node, node indexes go up to
    /// `2 * UNITS - 1` (index 0 is unused padding, like in any 1-indexed
    /// binary heap).
    const BITMAP_BYTES: usize = 2 * Self::UNITS / 8;

    const AND_OFFSET: usize = mem::size_of::<BuddyPageHead>();
    const OR_OFFSET: usize = Self::AND_OFFSET + Self::BITMAP_BYTES;
    const UNITS_OFFSET: usize = Self::OR_OFFSET + Self::BITMAP_BYTES;

    /// Total size of the backing block: metadata plus unit storage. This
    /// is what one page costs and what `page_size` reports.
    pub const BYTES: usize = Self::UNITS_OFFSET + UNIT_SIZE * Self::UNITS;

    /// Largest allocation that fits in a page: all units minus the header.
    pub const MAX_ALLOCATION: usize = UNIT_SIZE * Self::UNITS - SEGMENT_HEADER_SIZE;

    /// Stamps a fresh page over `base`. The whole tree starts free.
    ///
    /// # Safety
    ///
    /// `base` must point to at least [`Self::BYTES`] writable bytes,
    /// aligned to a pointer boundary.
    pub unsafe fn init(base: NonNull<u8>) -> Self {
        let page = Self { base };

        let mut level_count = [0u32; (MAX_LEVELS + 1) as usize];
        let mut level = 0;
        while level <= LEVELS {
            level_count[level as usize] = 1 << (LEVELS - level);
            level += 1;
        }

        page.head_ptr().write(BuddyPageHead {
            heap_slot: 0,
            level_count,
        });
        page.and_bits().zero(2 * Self::UNITS);
        page.or_bits().zero(2 * Self::UNITS);

        page
    }

    /// Recovers the page that owns a unit, given the unit's header address
    /// and its stored index. This is the page-level counterpart of
    /// [`SegmentHeader::from_data_address`]: the unit area sits at a fixed
    /// offset inside the block and unit `index` sits `index * UNIT_SIZE`
    /// bytes into that area, so one subtraction gets us home.
    ///
    /// # Safety
    ///
    /// `header` must point at unit `index` of a live buddy page with the
    /// same `LEVELS` parameter.
    pub unsafe fn containing(header: NonNull<SegmentHeader>, index: u32) -> Self {
        let units_base = header.as_ptr().cast::<u8>().sub(index as usize * UNIT_SIZE);
        Self {
            base: NonNull::new_unchecked(units_base.sub(Self::UNITS_OFFSET)),
        }
    }

    #[inline]
    pub fn base(self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    fn head_ptr(self) -> *mut BuddyPageHead {
        self.base.as_ptr().cast()
    }

    #[inline]
    unsafe fn and_bits(self) -> Bitmap {
        Bitmap::new(NonNull::new_unchecked(
            self.base.as_ptr().add(Self::AND_OFFSET),
        ))
    }

    #[inline]
    unsafe fn or_bits(self) -> Bitmap {
        Bitmap::new(NonNull::new_unchecked(
            self.base.as_ptr().add(Self::OR_OFFSET),
        ))
    }

    /// Header address of unit `index`.
    ///
    /// # Safety
    ///
    /// `index < Self::UNITS`, and the page must be live.
    #[inline]
    pub unsafe fn unit_at(self, index: u32) -> NonNull<SegmentHeader> {
        debug_assert!((index as usize) < Self::UNITS);
        NonNull::new_unchecked(
            self.base
                .as_ptr()
                .add(Self::UNITS_OFFSET + index as usize * UNIT_SIZE)
                .cast(),
        )
    }

    /// Unit index covered by tree node `node` at level `level`.
    #[inline]
    pub fn node_to_index(node: u32, level: u32) -> u32 {
        (node << level) - Self::UNITS as u32
    }

    /// Tree node at level `level` that covers unit `index`.
    #[inline]
    pub fn index_to_node(index: u32, level: u32) -> u32 {
        (index + Self::UNITS as u32) >> level
    }

    #[inline]
    pub unsafe fn heap_slot(self) -> usize {
        (*self.head_ptr()).heap_slot
    }

    #[inline]
    pub unsafe fn set_heap_slot(self, slot: usize) {
        (*self.head_ptr()).heap_slot = slot;
    }

    #[cfg(test)]
    pub unsafe fn level_count(self, level: u32) -> u32 {
        (*self.head_ptr()).level_count[level as usize]
    }

    /// A page is empty when its whole tree is one claimable piece again.
    #[inline]
    pub unsafe fn is_empty(self) -> bool {
        (*self.head_ptr()).level_count[LEVELS as usize] == 1
    }

    /// Lexicographic "has more room" comparison over the free counters,
    /// highest level first. Drives the max-heap of pages: the winner is
    /// the page with the largest whole sub-trees, which concentrates
    /// allocations and lets entire pages drain empty for the GC.
    pub unsafe fn outranks(self, other: Self) -> bool {
        let mine = &(*self.head_ptr()).level_count;
        let theirs = &(*other.head_ptr()).level_count;

        let mut level = LEVELS as usize;
        loop {
            if mine[level] != theirs[level] {
                return mine[level] > theirs[level];
            }
            if level == 0 {
                return false;
            }
            level -= 1;
        }
    }

    /// Claims a level `level` sub-tree, returning its node number, or
    /// `None` if no whole level `level` sub-tree is left anywhere under the
    /// root. Descends left first, so allocations cluster towards the start
    /// of the page.
    ///
    /// # Safety
    ///
    /// The page must be live and `level <= LEVELS`.
    pub unsafe fn claim(self, level: u32) -> Option<u32> {
        debug_assert!(level <= LEVELS);
        self.claim_node(1, LEVELS, level)
    }

    unsafe fn claim_node(self, node: u32, node_level: u32, level: u32) -> Option<u32> {
        if self.and_bits().get(node) {
            return None;
        }

        if node_level == level {
            // Only a completely untouched sub-tree can be handed out
            // whole. A partially used one has live segments below.
            if self.or_bits().get(node) {
                return None;
            }

            let mut i = 0;
            while i <= level {
                (*self.head_ptr()).level_count[i as usize] -= 1 << (level - i);
                i += 1;
            }
            self.or_bits().set(node);
            self.and_bits().set(node);
            return Some(node);
        }

        let left = node * 2;
        let right = left + 1;

        if let Some(found) = self.claim_node(left, node_level - 1, level) {
            // This node just went from whole to partially used, so it no
            // longer counts as a free level `node_level` sub-tree. The
            // right-hand path below never needs this: if the left child
            // of an untouched node can't satisfy the request, nothing
            // will, so reaching the right child implies `or` was set.
            if !self.or_bits().get(node) {
                (*self.head_ptr()).level_count[node_level as usize] -= 1;
            }
            self.or_bits().set(node);
            if self.and_bits().get(left) && self.and_bits().get(right) {
                self.and_bits().set(node);
            }
            return Some(found);
        }

        if let Some(found) = self.claim_node(right, node_level - 1, level) {
            self.or_bits().set(node);
            if self.and_bits().get(left) && self.and_bits().get(right) {
                self.and_bits().set(node);
            }
            return Some(found);
        }

        None
    }

    /// Releases the level `level` sub-tree rooted at `node`, walking back
    /// up to the root to merge freed buddies and repair the counters.
    ///
    /// # Safety
    ///
    /// `(node, level)` must identify a sub-tree previously returned by
    /// [`BuddyPage::claim`] on this same page and not released since.
    pub unsafe fn release(self, node: u32, level: u32) {
        let mut i = 0;
        while i <= level {
            (*self.head_ptr()).level_count[i as usize] += 1 << (level - i);
            i += 1;
        }
        self.or_bits().clear(node);
        self.and_bits().clear(node);

        let mut parent = node / 2;
        let mut parent_level = level + 1;
        while parent >= 1 && parent_level <= LEVELS {
            let left = parent * 2;
            let right = left + 1;

            if !self.or_bits().get(left) && !self.or_bits().get(right) {
                // Both halves are untouched again: the parent sub-tree
                // becomes one claimable whole.
                if self.or_bits().get(parent) {
                    (*self.head_ptr()).level_count[parent_level as usize] += 1;
                }
                self.or_bits().clear(parent);
            }
            self.and_bits().clear(parent);

            parent /= 2;
            parent_level += 1;
        }
    }
}
