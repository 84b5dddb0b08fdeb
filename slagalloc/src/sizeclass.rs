//! Size classes: the table that maps a requested allocation size to one of
//! a small, fixed number of slab object sizes, and back.
//!
//! Rounding every request up to one of these sizes is what lets the front
//! end keep one slab per size class instead of one slab per distinct size,
//! and is what the back end's chunk sizing builds on.

use crate::bits::{from_exp_mant, next_pow2, to_exp_mant};
use crate::config::{
    INTERMEDIATE_BITS, MAX_SIZECLASS_SIZE, MIN_ALLOC_BITS, MIN_ALLOC_SIZE, MIN_CHUNK_SIZE,
    MIN_OBJECT_COUNT,
};

/// An index into the small-sizeclass table. Never constructed from a raw
/// `usize` implicitly — call [`size_to_sizeclass`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizeClass(u8);

impl SizeClass {
    pub const fn raw(self) -> usize {
        self.0 as usize
    }
}

// `to_exp_mant`/`from_exp_mant` take MANTISSA_BITS as a u32 const param;
// the rest of the crate uses `usize` for uniformity with the config table.
const INTERMEDIATE_BITS_U32: u32 = INTERMEDIATE_BITS as u32;
const LOW_BITS_U32: u32 = MIN_ALLOC_BITS as u32;

/// Skip the bottom `MIN_ALLOC_BITS` of precision before handing `value` to
/// `to_exp_mant` so that every sizeclass threshold comes out as a multiple
/// of `MIN_ALLOC_SIZE`; unshift symmetrically in [`from_exp_mant_sc`].
const fn to_exp_mant_sc(value: usize) -> usize {
    let shifted = (value + (1 << LOW_BITS_U32) - 1) >> LOW_BITS_U32;
    let shifted = if shifted < 1 { 1 } else { shifted };
    to_exp_mant::<INTERMEDIATE_BITS_U32>(shifted)
}

const fn from_exp_mant_sc(m_e: usize) -> usize {
    from_exp_mant::<INTERMEDIATE_BITS_U32>(m_e) << LOW_BITS_U32
}

const fn compute_num_small_sizeclasses() -> usize {
    to_exp_mant_sc(MAX_SIZECLASS_SIZE) + 1
}

/// Total number of distinct small size classes.
pub const NUM_SMALL_SIZECLASSES: usize = compute_num_small_sizeclasses();

/// Round `size` up to the nearest size class and return its index.
///
/// `size` must be `>= 1` and `<= MAX_SIZECLASS_SIZE`; callers above that
/// threshold should take the large-object path instead (see
/// [`crate::backend`]).
pub fn size_to_sizeclass(size: usize) -> SizeClass {
    debug_assert!(size >= 1 && size <= MAX_SIZECLASS_SIZE);
    let size = size.max(MIN_ALLOC_SIZE);
    let encoded = to_exp_mant_sc(size);
    debug_assert!(encoded <= u8::MAX as usize);
    SizeClass(encoded as u8)
}

/// The object size served by `sc`; always `>= MIN_ALLOC_SIZE` and a
/// multiple of `MIN_ALLOC_SIZE`.
pub fn sizeclass_to_size(sc: SizeClass) -> usize {
    from_exp_mant_sc(sc.raw())
}

/// `true` for any request this crate serves out of a small-sizeclass slab
/// rather than a dedicated large-object chunk.
pub const fn is_small_sizeclass(n: usize) -> bool {
    n <= MAX_SIZECLASS_SIZE
}

/// Per-size-class slab geometry, computed once per class at first use and
/// cached in [`SLAB_GEOMETRY`]. A slab for size class `sc` occupies exactly
/// one chunk of [`slab_size`](Self::slab_size) bytes (this crate does not
/// pack more than one slab into a chunk, nor split a chunk across slabs —
/// see `DESIGN.md` for why).
#[derive(Clone, Copy)]
pub struct SlabGeometry {
    /// Exact object size for this class.
    pub size: usize,
    /// Power-of-two byte size of one slab/chunk for this class.
    pub slab_size: usize,
    /// Number of objects a slab of this class holds.
    pub objects_per_slab: usize,
    /// Batch size used both for the initial eager drain of a freshly
    /// carved slab and for each subsequent refill-slow-path drain.
    pub wake_threshold: usize,
    /// `ceil(2^32 / size)`, used by [`index_in_slab`] to avoid a division
    /// on the `external_pointer` fast path.
    reciprocal_multiplier: u64,
}

const RECIPROCAL_SHIFT: u32 = 32;

const fn compute_geometry(sc: usize) -> SlabGeometry {
    let size = from_exp_mant_sc(sc);
    let slab_size = {
        let raw = next_pow2(size * MIN_OBJECT_COUNT);
        if raw < MIN_CHUNK_SIZE {
            MIN_CHUNK_SIZE
        } else {
            raw
        }
    };
    let objects_per_slab = slab_size / size;
    let wake_threshold = if objects_per_slab / 8 < 1 {
        1
    } else {
        objects_per_slab / 8
    };
    let reciprocal_multiplier = (((1u128 << RECIPROCAL_SHIFT) + size as u128 - 1) / size as u128) as u64;
    SlabGeometry {
        size,
        slab_size,
        objects_per_slab,
        wake_threshold,
        reciprocal_multiplier,
    }
}

/// Geometry for every small size class, indexed by [`SizeClass::raw`].
pub static SLAB_GEOMETRY: [SlabGeometry; NUM_SMALL_SIZECLASSES] = {
    let mut table = [compute_geometry(0); NUM_SMALL_SIZECLASSES];
    let mut i = 0;
    while i < NUM_SMALL_SIZECLASSES {
        table[i] = compute_geometry(i);
        i += 1;
    }
    table
};

impl SlabGeometry {
    pub fn of(sc: SizeClass) -> &'static SlabGeometry {
        &SLAB_GEOMETRY[sc.raw()]
    }

    /// Index of the object containing byte offset `offset` within a slab
    /// of this geometry, computed via the reciprocal multiplier instead of
    /// a division.
    pub fn index_in_slab(&self, offset: usize) -> usize {
        (((offset as u64) * self.reciprocal_multiplier) >> RECIPROCAL_SHIFT) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizeclasses_are_monotonic() {
        let mut prev_size = 0;
        for sc in 0..NUM_SMALL_SIZECLASSES {
            let size = sizeclass_to_size(SizeClass(sc as u8));
            assert!(size > prev_size, "sizeclass {sc} did not grow: {size} <= {prev_size}");
            prev_size = size;
        }
    }

    #[test]
    fn size_to_sizeclass_never_undershoots() {
        for size in [1usize, 2, 15, 16, 17, 31, 32, 33, 1000, 65536] {
            let sc = size_to_sizeclass(size);
            let served = sizeclass_to_size(sc);
            assert!(served >= size, "size {size} got sizeclass serving {served}");
        }
    }

    #[test]
    fn sizeclass_sizes_are_multiples_of_min_alloc() {
        for sc in 0..NUM_SMALL_SIZECLASSES {
            let size = sizeclass_to_size(SizeClass(sc as u8));
            assert_eq!(size % MIN_ALLOC_SIZE, 0);
        }
    }

    #[test]
    fn max_sizeclass_covers_max_size() {
        let sc = size_to_sizeclass(MAX_SIZECLASS_SIZE);
        assert!(sizeclass_to_size(sc) >= MAX_SIZECLASS_SIZE);
    }

    #[test]
    fn geometry_slabs_are_power_of_two_and_hold_every_object() {
        for sc in 0..NUM_SMALL_SIZECLASSES {
            let geo = SlabGeometry::of(SizeClass(sc as u8));
            assert!(geo.slab_size.is_power_of_two());
            assert!(geo.slab_size >= MIN_CHUNK_SIZE);
            assert!(geo.objects_per_slab * geo.size <= geo.slab_size);
            assert!(geo.objects_per_slab >= MIN_OBJECT_COUNT);
            assert!(geo.wake_threshold >= 1 && geo.wake_threshold <= geo.objects_per_slab);
        }
    }

    #[test]
    fn index_in_slab_matches_division() {
        let geo = SlabGeometry::of(size_to_sizeclass(48));
        for obj in 0..geo.objects_per_slab {
            let offset = obj * geo.size + (geo.size / 2);
            assert_eq!(geo.index_in_slab(offset), obj);
        }
    }
}
