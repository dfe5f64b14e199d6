use std::{mem, ptr::NonNull};

use crate::{
    header::{SegmentHeader, SEGMENT_HEADER_SIZE},
    list::{LinkedList, Node},
};

/// Size of the smallest slab segment: the header plus just enough payload
/// for the intrusive free list node that occupies the data area while the
/// segment is free. Layer `l` segments are this shifted left `l` times.
pub(crate) const BASE_SEGMENT_SIZE: usize = SEGMENT_HEADER_SIZE + mem::size_of::<Node>();

/// Segment size of layer `layer`.
#[inline]
pub(crate) const fn segment_size(layer: u32) -> usize {
    BASE_SEGMENT_SIZE << layer
}

/// Fixed metadata at the front of every slab page block. The list node
/// comes first so that a page and its node in the `using`/`free` page
/// lists are the same address, one cast apart.
#[repr(C)]
pub(crate) struct SlabPageHead {
    pub node: Node,
    /// Live segments rooted in this page. Zero means the page can be
    /// reclaimed.
    pub alloc_count: u32,
    /// The layer this page is currently carved for. Meaningless while the
    /// page sits in the free page cache.
    pub layer: u8,
}

/// One slab page: a header followed by a payload area that gets carved
/// into equally sized segments the moment the page is installed into a
/// [`Layer`]. Unlike a buddy page there is no tree here, a page serves a
/// single size class for as long as it stays installed:
///
/// ```text
/// +--------------+-----------+-----------+-----------+---------
/// | SlabPageHead | seg 0     | seg 1     | seg 2     | ...
/// |  node,count  | [hdr|data]| [hdr|data]| [hdr|data]|
/// +--------------+-----------+-----------+-----------+---------
/// ```
///
/// Free segments keep their position in the layer's free list inside
/// their own data area, so a page's segments cost zero external memory.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct SlabPage<const LEVELS: u32> {
    head: NonNull<SlabPageHead>,
}

impl<const LEVELS: u32> SlabPage<LEVELS> {
    /// Bytes of carvable payload per page.
    pub const PAYLOAD: usize = BASE_SEGMENT_SIZE << LEVELS;

    const HEAD_SIZE: usize = mem::size_of::<SlabPageHead>();

    /// Total size of the backing block.
    pub const BYTES: usize = Self::HEAD_SIZE + Self::PAYLOAD;

    /// Stamps a fresh page head over `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to at least [`Self::BYTES`] writable bytes,
    /// aligned to a pointer boundary.
    pub unsafe fn init(base: NonNull<u8>) -> Self {
        let head = base.cast::<SlabPageHead>();
        head.as_ptr().write(SlabPageHead {
            node: Node {
                next: None,
                prev: None,
            },
            alloc_count: 0,
            layer: 0,
        });
        Self { head }
    }

    /// The page whose list node this is. Works because the node is the
    /// first field of the head.
    ///
    /// # Safety
    ///
    /// `node` must be the `node` field of a live [`SlabPageHead`].
    #[inline]
    pub unsafe fn from_node(node: NonNull<Node>) -> Self {
        Self { head: node.cast() }
    }

    /// The page owning a payload area.
    ///
    /// # Safety
    ///
    /// `payload` must be the first payload byte of a live slab page.
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        Self {
            head: NonNull::new_unchecked(payload.as_ptr().sub(Self::HEAD_SIZE)).cast(),
        }
    }

    /// Base of the backing block, which doubles as the address of the
    /// page's list node.
    #[inline]
    pub fn base(self) -> NonNull<u8> {
        self.head.cast()
    }

    /// First byte of the carvable payload.
    ///
    /// # Safety
    ///
    /// The page must be live.
    #[inline]
    pub unsafe fn payload(self) -> NonNull<u8> {
        NonNull::new_unchecked(self.head.as_ptr().cast::<u8>().add(Self::HEAD_SIZE))
    }

    #[inline]
    pub unsafe fn alloc_count(self) -> u32 {
        (*self.head.as_ptr()).alloc_count
    }

    #[inline]
    pub unsafe fn set_alloc_count(self, count: u32) {
        (*self.head.as_ptr()).alloc_count = count;
    }

    #[inline]
    pub unsafe fn layer(self) -> u8 {
        (*self.head.as_ptr()).layer
    }

    #[inline]
    pub unsafe fn set_layer(self, layer: u8) {
        (*self.head.as_ptr()).layer = layer;
    }
}

/// One size class of the segregated pool: a free list of equally sized
/// segments drawn from every page currently installed for this class.
/// Segment allocation and deallocation are a list pop and push, both O(1);
/// the only loops are page installation and removal, which touch every
/// segment of the page once.
#[derive(Clone, Copy)]
pub(crate) struct Layer<const LEVELS: u32> {
    layer: u8,
    free_segments: LinkedList,
}

impl<const LEVELS: u32> Layer<LEVELS> {
    pub const fn new(layer: u8) -> Self {
        Self {
            layer,
            free_segments: LinkedList::new(),
        }
    }

    /// Segment size of this layer, header included.
    #[inline]
    pub fn segment_size(&self) -> usize {
        segment_size(self.layer as u32)
    }

    /// User bytes a segment of this layer can hold.
    #[inline]
    pub fn data_size(&self) -> usize {
        self.segment_size() - SEGMENT_HEADER_SIZE
    }

    /// Whether an allocation can be served without installing a page.
    #[inline]
    pub fn has_free_segments(&self) -> bool {
        !self.free_segments.is_empty()
    }

    #[cfg(test)]
    pub fn free_segment_count(&self) -> usize {
        self.free_segments.len()
    }

    /// Carves `page` into segments of this layer and threads them all on
    /// the free list. The page serves this class until
    /// [`Layer::remove_page`].
    ///
    /// # Safety
    ///
    /// `page` must be live, not installed in any layer, and stay put until
    /// removed.
    pub unsafe fn install_page(&mut self, page: SlabPage<LEVELS>) {
        page.set_alloc_count(0);
        page.set_layer(self.layer);

        let segment_size = self.segment_size();
        let segment_count = SlabPage::<LEVELS>::PAYLOAD / segment_size;
        debug_assert!(SlabPage::<LEVELS>::PAYLOAD % segment_size == 0);

        let payload = page.payload().as_ptr();
        for index in 0..segment_count {
            let header = payload.add(index * segment_size).cast::<SegmentHeader>();
            header.write(SegmentHeader::new(self.layer as u32, index as u32));

            let data = SegmentHeader::data_address_of(NonNull::new_unchecked(header));
            self.free_segments.append(data);
        }
    }

    /// Unthreads every segment of `page` from the free list, leaving the
    /// page ready to be cached or released. The inverse of
    /// [`Layer::install_page`].
    ///
    /// # Safety
    ///
    /// `page` must be installed in this layer and hold no live segment.
    pub unsafe fn remove_page(&mut self, page: SlabPage<LEVELS>) {
        debug_assert_eq!(page.alloc_count(), 0);
        debug_assert_eq!(page.layer(), self.layer);

        let segment_size = self.segment_size();
        let segment_count = SlabPage::<LEVELS>::PAYLOAD / segment_size;

        let payload = page.payload().as_ptr();
        for index in 0..segment_count {
            let header = payload.add(index * segment_size).cast::<SegmentHeader>();
            debug_assert!(!(*header).is_used());

            let node = SegmentHeader::data_address_of(NonNull::new_unchecked(header));
            self.free_segments.remove(node.cast());
        }
    }

    /// Pops a free segment, marks it live and returns its data address.
    /// `None` means no page currently installed has room.
    ///
    /// # Safety
    ///
    /// Every page installed in this layer must be live.
    pub unsafe fn claim_segment(&mut self) -> Option<NonNull<u8>> {
        let node = self.free_segments.pop_front()?;
        let address = node.cast::<u8>();

        let header = SegmentHeader::from_data_address(address);
        (*header.as_ptr()).set_used(true);

        let index = (*header.as_ptr()).index();
        let page = self.page_of(header, index);
        page.set_alloc_count(page.alloc_count() + 1);

        Some(address)
    }

    /// Marks a segment free again and threads it back on the free list.
    ///
    /// # Safety
    ///
    /// `address` must be a data address previously returned by
    /// [`Layer::claim_segment`] of this same layer, not freed since.
    pub unsafe fn release_segment(&mut self, address: NonNull<u8>) {
        let header = SegmentHeader::from_data_address(address);
        let meta = header.as_ptr().read();
        debug_assert_eq!(meta.level(), self.layer as u32, "segment freed to wrong layer");
        debug_assert!(meta.is_used(), "double free");

        (*header.as_ptr()).set_used(false);

        let page = self.page_of(header, meta.index());
        debug_assert!(page.alloc_count() > 0);
        page.set_alloc_count(page.alloc_count() - 1);

        self.free_segments.append(address);
    }

    /// Walks from a segment header back to the page that hosts it: the
    /// header of segment `index` sits `index * segment_size` bytes into
    /// the payload, and the payload starts right after the page head.
    unsafe fn page_of(&self, header: NonNull<SegmentHeader>, index: u32) -> SlabPage<LEVELS> {
        let payload = header
            .as_ptr()
            .cast::<u8>()
            .sub(index as usize * self.segment_size());
        SlabPage::from_payload(NonNull::new_unchecked(payload))
    }
}
