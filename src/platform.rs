use std::ptr::NonNull;

/// Abstraction for the platform allocator that backs the pools. The pools
/// only ever ask for whole page blocks and for oversized direct segments,
/// and hand both back when they are done; they don't care where the bytes
/// come from. Production code uses [`Platform`], tests substitute
/// implementations that count calls or refuse to hand out memory so that
/// out-of-memory paths can be exercised deterministically.
pub trait BackingMemory {
    /// Requests `length` bytes of writable memory, aligned to at least a
    /// pointer boundary. Returns `None` when the platform refuses, which
    /// the pools surface to their caller as a failed allocation.
    ///
    /// # Safety
    ///
    /// `length` must be greater than zero.
    unsafe fn request(&self, length: usize) -> Option<NonNull<u8>>;

    /// Resizes a block previously obtained from [`BackingMemory::request`]
    /// or [`BackingMemory::resize`], possibly relocating it. The first
    /// `min(old, new)` bytes are preserved. Returns `None` on failure, in
    /// which case the original block is untouched and still owned by the
    /// caller.
    ///
    /// # Safety
    ///
    /// `address` must come from this backing and must not have been
    /// released. `new_length` must be greater than zero.
    unsafe fn resize(&self, address: NonNull<u8>, new_length: usize) -> Option<NonNull<u8>>;

    /// Returns a block to the platform.
    ///
    /// # Safety
    ///
    /// `address` must come from this backing and must not be used again.
    unsafe fn release(&self, address: NonNull<u8>);
}

/// Borrowed backings work too, which is how tests keep inspecting their
/// instrumented backing after handing it to a pool.
impl<M: BackingMemory> BackingMemory for &M {
    unsafe fn request(&self, length: usize) -> Option<NonNull<u8>> {
        (**self).request(length)
    }

    unsafe fn resize(&self, address: NonNull<u8>, new_length: usize) -> Option<NonNull<u8>> {
        (**self).resize(address, new_length)
    }

    unsafe fn release(&self, address: NonNull<u8>) {
        (**self).release(address)
    }
}

/// The real deal: `malloc`, `realloc` and `free`. This is the same
/// contract as the C allocation functions on purpose, since a `malloc`
/// block never needs its length at release time there is no bookkeeping to
/// do on our side.
#[derive(Clone, Copy, Debug, Default)]
pub struct Platform;

impl BackingMemory for Platform {
    unsafe fn request(&self, length: usize) -> Option<NonNull<u8>> {
        NonNull::new(libc::malloc(length).cast())
    }

    unsafe fn resize(&self, address: NonNull<u8>, new_length: usize) -> Option<NonNull<u8>> {
        NonNull::new(libc::realloc(address.as_ptr().cast(), new_length).cast())
    }

    unsafe fn release(&self, address: NonNull<u8>) {
        libc::free(address.as_ptr().cast());
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_write_release() {
        unsafe {
            let address = Platform.request(512).unwrap();
            for i in 0..512 {
                address.as_ptr().add(i).write((i % 251) as u8);
            }
            for i in 0..512 {
                assert_eq!(address.as_ptr().add(i).read(), (i % 251) as u8);
            }
            Platform.release(address);
        }
    }

    #[test]
    fn resize_preserves_contents() {
        unsafe {
            let address = Platform.request(64).unwrap();
            for i in 0..64 {
                address.as_ptr().add(i).write(i as u8);
            }

            let bigger = Platform.resize(address, 4096).unwrap();
            for i in 0..64 {
                assert_eq!(bigger.as_ptr().add(i).read(), i as u8);
            }
            Platform.release(bigger);
        }
    }

    #[test]
    fn flaky_memory_refuses_after_grants() {
        use super::testing::FlakyMemory;

        let flaky = FlakyMemory::grants(1);
        unsafe {
            let address = flaky.request(64).unwrap();
            assert!(flaky.request(64).is_none());
            assert_eq!(flaky.outstanding(), 1);
            flaky.release(address);
            assert_eq!(flaky.outstanding(), 0);
        }
    }
}
