//! Compile-time tunables shared by every module in the crate.
//!
//! These mirror the constants a C++ allocator would fix with `#define`s or
//! `static constexpr` members; here they are plain `const`s so that changing
//! one recompiles every dependent computation with no risk of the pieces
//! drifting out of sync.

/// `0` gives power-of-two size classes only. `1` inserts one additional
/// size class at the midpoint of every power of two, `2` inserts three,
/// and so on.
pub const INTERMEDIATE_BITS: usize = 2;

/// Local per-thread caches flush remote (cross-thread) frees once the
/// estimated cost of holding them reaches this many bytes.
pub const REMOTE_CACHE: isize = 1 << 20;

/// At most this many objects are drained from a remote queue in one pass,
/// bounding the pause any single deallocation call can cause.
pub const REMOTE_BATCH: usize = 4096;

/// log2 of the smallest chunk size managed by the back end.
pub const MIN_CHUNK_BITS: usize = 14;
pub const MIN_CHUNK_SIZE: usize = 1 << MIN_CHUNK_BITS;

/// Smallest allocation size: large enough to host two free-list pointers
/// once an object has been freed.
pub const MIN_ALLOC_SIZE: usize = 2 * core::mem::size_of::<usize>();
pub const MIN_ALLOC_BITS: usize = MIN_ALLOC_SIZE.trailing_zeros() as usize;

/// log2 of the largest size serviced by a size class; requests above this
/// go straight to the large-object path.
pub const MAX_SIZECLASS_BITS: usize = 16;
pub const MAX_SIZECLASS_SIZE: usize = 1 << MAX_SIZECLASS_BITS;

/// A slab must host at least this many objects, bounding how much of a
/// slab a single corrupted free-list entry can affect.
#[cfg(debug_assertions)]
pub const MIN_OBJECT_COUNT: usize = 13;
#[cfg(not(debug_assertions))]
pub const MIN_OBJECT_COUNT: usize = 4;

/// Number of slots in a thread's remote-deallocation dispatch table,
/// indexed by the low bits of the destination allocator's identity.
pub const REMOTE_SLOT_BITS: usize = 6;
pub const REMOTE_SLOTS: usize = 1 << REMOTE_SLOT_BITS;
pub const REMOTE_MASK: usize = REMOTE_SLOTS - 1;

/// Cache line size, used to pad hot shared counters apart.
pub const CACHELINE_SIZE: usize = 64;

/// Number of historical epochs the decay range remembers; a cached range
/// must survive this many consecutive ticks unused before it is returned
/// to the OS.
pub const NUM_EPOCHS: usize = 4;

/// Wall-clock period between epoch advances driving `DecayRange`.
pub const DECAY_TICK: core::time::Duration = core::time::Duration::from_millis(500);

/// Deallocations of this size or larger bypass the decay cache entirely
/// and go straight to the parent range (they're rare enough that a short
/// temporal cache buys nothing and the slack would be wasteful to hold).
pub const DECAY_CACHE_CAP: usize = 4 << 20;

/// log2 of the largest single block the large buddy allocator will track.
/// Requests for chunks at or above this size go straight to the PAL.
pub const MAX_SIZE_BITS: usize = 32;

/// log2 of the refill granularity `LargeBuddyRange` requests from its
/// parent when its own cache misses on a request below this threshold;
/// requests at or above it bypass the cache and go straight to the parent.
pub const REFILL_SIZE_BITS: usize = 21;

/// log2 of the smallest block the small (sub-chunk) buddy allocator will
/// track: two free-list pointers' worth of bytes.
pub const MIN_SMALL_SIZE_BITS: usize = 4;

/// `SubRange` over-reserves by this many bits to build a field of guard
/// slots around a hardened metadata allocation (spec §4.5 "guard pages").
pub const GUARD_OVERSIZE_BITS: usize = 6;

const _: () = assert!(INTERMEDIATE_BITS < MIN_ALLOC_BITS);
const _: () = assert!(MIN_ALLOC_SIZE >= 2 * core::mem::size_of::<usize>());
