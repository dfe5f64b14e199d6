//! Leak detection sidecar, compiled in with the `leak-detect` feature.
//!
//! Strictly observational: the pools record every address they hand out
//! together with the requested size and the caller's source location
//! (courtesy of `#[track_caller]`), drop the entry on free, and whatever
//! survives until the pool itself is dropped gets reported to stderr.
//!
//! The map lives on the global allocator, which is fine for instance
//! pools but means this feature is not meant for a pool that *is* the
//! global allocator; recording an allocation would allocate again.

use std::collections::HashMap;
use std::panic::Location;
use std::ptr::NonNull;

struct Allocation {
    size: usize,
    location: &'static Location<'static>,
}

/// Live-allocation map of one pool.
pub(crate) struct LeakTracker {
    /// Lazy so that pool construction stays `const`.
    live: Option<HashMap<usize, Allocation>>,
}

impl LeakTracker {
    pub const fn new() -> Self {
        Self { live: None }
    }

    fn map(&mut self) -> &mut HashMap<usize, Allocation> {
        self.live.get_or_insert_with(HashMap::new)
    }

    pub fn record(&mut self, address: NonNull<u8>, size: usize, location: &'static Location<'static>) {
        self.map()
            .insert(address.as_ptr() as usize, Allocation { size, location });
    }

    pub fn forget(&mut self, address: NonNull<u8>) {
        if let Some(live) = &mut self.live {
            live.remove(&(address.as_ptr() as usize));
        }
    }

    /// Moves the entry of a reallocated address, keeping the original
    /// allocation site since that's the one worth reporting.
    pub fn rekey(
        &mut self,
        old: NonNull<u8>,
        new: NonNull<u8>,
        size: usize,
        location: &'static Location<'static>,
    ) {
        let location = match self.map().remove(&(old.as_ptr() as usize)) {
            Some(previous) => previous.location,
            None => location,
        };
        self.map()
            .insert(new.as_ptr() as usize, Allocation { size, location });
    }

    /// Writes one line per surviving allocation to stderr.
    pub fn report(&self) {
        let Some(live) = &self.live else { return };

        for (address, allocation) in live {
            eprintln!(
                "detected memory leak! address: {:#x}, length: {}, allocated at {}:{}",
                address,
                allocation.size,
                allocation.location.file(),
                allocation.location.line(),
            );
        }
    }

    #[cfg(test)]
    pub fn live_count(&self) -> usize {
        self.live.as_ref().map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(raw: usize) -> NonNull<u8> {
        NonNull::new(raw as *mut u8).unwrap()
    }

    #[track_caller]
    fn here() -> &'static Location<'static> {
        Location::caller()
    }

    #[test]
    fn record_and_forget() {
        let mut tracker = LeakTracker::new();
        assert_eq!(tracker.live_count(), 0);

        tracker.record(address(0x1000), 64, here());
        tracker.record(address(0x2000), 32, here());
        assert_eq!(tracker.live_count(), 2);

        tracker.forget(address(0x1000));
        assert_eq!(tracker.live_count(), 1);

        // Forgetting something unknown is harmless.
        tracker.forget(address(0x9999));
        assert_eq!(tracker.live_count(), 1);
    }

    #[test]
    fn rekey_preserves_original_site() {
        let mut tracker = LeakTracker::new();

        let first = here();
        tracker.record(address(0x1000), 64, first);
        tracker.rekey(address(0x1000), address(0x3000), 128, here());

        assert_eq!(tracker.live_count(), 1);
        let allocation = &tracker.live.as_ref().unwrap()[&0x3000];
        assert_eq!(allocation.size, 128);
        assert_eq!(allocation.location.line(), first.line());
    }
}
