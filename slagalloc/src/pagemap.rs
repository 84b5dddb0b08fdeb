//! Flat pagemap: address → metadata, one entry per chunk-sized granule.
//!
//! Chosen over a two-level (tree-of-blocks) pagemap because every target
//! this crate runs on has lazy commit (mmap with `PROT_NONE` costs no
//! physical memory until touched), so a flat table across the full
//! addressable range can simply be reserved once and have pages committed
//! on demand as [`FlatPagemap::register_range`] is called.

use core::marker::PhantomData;
use core::ptr::NonNull;
use slagalloc_pal::Pal;
use spin::RwLock;

#[cfg(target_pointer_width = "64")]
const ADDRESS_BITS: usize = 48;
#[cfg(target_pointer_width = "32")]
const ADDRESS_BITS: usize = 32;

/// Maps `address >> GRANULARITY_BITS` to a `T`.
///
/// The full table is reserved as address space up front; only the slice of
/// it actually covering heap addresses the allocator has touched is ever
/// committed, tracked here as a sorted set of disjoint `[lo, hi)` table
/// *index* ranges (not byte offsets) rather than dereferenced speculatively.
/// Two non-adjacent `register_range` calls leave a gap of never-committed
/// indices between them, so the ranges are kept precise rather than
/// collapsed into a single `[min, max)` span.
pub struct FlatPagemap<T, P: Pal, const GRANULARITY_BITS: usize> {
    body: NonNull<T>,
    committed: RwLock<Vec<(usize, usize)>>,
    _pal: PhantomData<P>,
}

unsafe impl<T: Send, P: Pal, const G: usize> Send for FlatPagemap<T, P, G> {}
unsafe impl<T: Sync, P: Pal, const G: usize> Sync for FlatPagemap<T, P, G> {}

impl<T: Copy + Default, P: Pal, const GRANULARITY_BITS: usize> FlatPagemap<T, P, GRANULARITY_BITS> {
    const COVERED_BITS: usize = ADDRESS_BITS - GRANULARITY_BITS;
    const ENTRIES: usize = 1usize << Self::COVERED_BITS;

    /// Reserve (but do not commit) the full table.
    pub fn new() -> Self {
        let bytes = Self::ENTRIES * core::mem::size_of::<T>();
        let reserve_size = bytes.next_power_of_two().max(P::page_size());
        let base = P::reserve(reserve_size).unwrap_or_else(|| {
            crate::error::fatal_error("failed to reserve address space for pagemap")
        });
        FlatPagemap {
            body: base.cast(),
            committed: RwLock::new(Vec::new()),
            _pal: PhantomData,
        }
    }

    fn index_of(addr: usize) -> usize {
        addr >> GRANULARITY_BITS
    }

    /// Ensure pagemap pages backing `[base, base+length)` of the *heap*
    /// (not the pagemap itself) are committed and zero-initialised.
    pub fn register_range(&self, base: usize, length: usize) {
        let first = Self::index_of(base);
        let last = Self::index_of(base + length + (1 << GRANULARITY_BITS) - 1);

        let page = P::page_size();
        let elem = core::mem::size_of::<T>();
        let byte_start = first * elem;
        let byte_end = last * elem;
        let page_start = byte_start & !(page - 1);
        let page_end = (byte_end + page - 1) & !(page - 1);

        unsafe {
            let ptr = (self.body.as_ptr() as *mut u8).add(page_start);
            let len = page_end - page_start;
            let nn = NonNull::new(ptr).expect("pagemap body pointer is never null");
            P::notify_using(nn, len);
            core::ptr::write_bytes(ptr, 0, len);
        }

        // Record the entry-index range actually backed by the pages just
        // committed. Page-alignment can only widen `[first, last)`, never
        // shrink it, so this stays a safe (possibly slightly generous)
        // description of what's live.
        let committed_first = page_start / elem;
        let committed_last = page_end / elem;
        self.mark_committed(committed_first, committed_last);
    }

    /// Merge `[lo, hi)` into the sorted, disjoint set of committed ranges.
    fn mark_committed(&self, lo: usize, hi: usize) {
        let mut ranges = self.committed.write();
        let mut merged_lo = lo;
        let mut merged_hi = hi;
        ranges.retain(|&(l, h)| {
            if h < merged_lo || l > merged_hi {
                true
            } else {
                merged_lo = merged_lo.min(l);
                merged_hi = merged_hi.max(h);
                false
            }
        });
        let pos = ranges.partition_point(|&(l, _)| l < merged_lo);
        ranges.insert(pos, (merged_lo, merged_hi));
    }

    fn in_committed_range(&self, idx: usize) -> bool {
        let ranges = self.committed.read();
        ranges
            .binary_search_by(|&(lo, hi)| {
                if idx < lo {
                    core::cmp::Ordering::Greater
                } else if idx >= hi {
                    core::cmp::Ordering::Less
                } else {
                    core::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    /// Load the entry for `addr`. Returns `T::default()` for addresses
    /// whose backing pagemap page has never been registered, without
    /// touching that (possibly PROT_NONE) memory.
    pub fn get(&self, addr: usize) -> T {
        let idx = Self::index_of(addr);
        if !self.in_committed_range(idx) {
            return T::default();
        }
        unsafe { *self.body.as_ptr().add(idx) }
    }

    /// Store `entry` for `addr`. `addr` must already have been covered by
    /// a prior [`Self::register_range`] call; writing outside the
    /// committed range is a fatal, unrecoverable error since it indicates
    /// the back end lost track of a chunk's bookkeeping.
    pub fn set(&self, addr: usize, entry: T) {
        let idx = Self::index_of(addr);
        if !self.in_committed_range(idx) {
            crate::error::fatal_error("pagemap set() on an address outside any registered range");
        }
        unsafe { *self.body.as_ptr().add(idx) = entry };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slagalloc_pal::SystemPal;

    #[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
    struct Entry(u64);

    #[test]
    fn unregistered_address_reads_as_default() {
        let pm: FlatPagemap<Entry, SystemPal, 14> = FlatPagemap::new();
        assert_eq!(pm.get(0), Entry::default());
        assert_eq!(pm.get(0xdead_beef_0000), Entry::default());
    }

    #[test]
    fn registered_range_roundtrips_set_get() {
        let pm: FlatPagemap<Entry, SystemPal, 14> = FlatPagemap::new();
        let base = 0x1_0000_0000usize;
        let len = 1usize << 20;
        pm.register_range(base, len);
        pm.set(base, Entry(42));
        assert_eq!(pm.get(base), Entry(42));
        // an address outside the registered span still reads as default
        assert_eq!(pm.get(base + len + (1 << 20)), Entry::default());
    }

    #[test]
    fn gap_between_two_registered_ranges_stays_unregistered() {
        let pm: FlatPagemap<Entry, SystemPal, 14> = FlatPagemap::new();
        let low = 0x1_0000_0000usize;
        let high = 0x10_0000_0000usize;
        let len = 1usize << 20;
        pm.register_range(low, len);
        pm.register_range(high, len);
        pm.set(low, Entry(1));
        pm.set(high, Entry(2));
        assert_eq!(pm.get(low), Entry(1));
        assert_eq!(pm.get(high), Entry(2));
        // an address strictly between the two registered ranges must never
        // read as committed just because it falls within their span.
        let midpoint = low + (high - low) / 2;
        assert_eq!(pm.get(midpoint), Entry::default());
    }
}
