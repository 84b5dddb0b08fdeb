//! The back-end address-space pipeline: a fixed chain of composable
//! "range" stages, each offering `alloc_range`/`dealloc_range` over
//! naturally-aligned power-of-two blocks.
//!
//! Stages nest by type parameter rather than by trait object: static
//! dispatch via generics keeps every stage monomorphized and inlinable,
//! and the concrete per-thread and global pipelines are plain type
//! aliases composing the stages below.

use crate::bits::next_pow2_bits;
use crate::buddy::Buddy;
use crate::config::{
    DECAY_CACHE_CAP, DECAY_TICK, MIN_CHUNK_BITS, MIN_CHUNK_SIZE, NUM_EPOCHS,
};
use crate::entropy::LocalEntropy;
use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use slagalloc_pal::Pal;
use spin::Mutex;
use std::sync::atomic::AtomicBool;

/// A stage in the back-end pipeline. `size` is always a power of two no
/// smaller than the stage's own minimum; a successful result is aligned
/// to `size`.
pub trait Range {
    /// Whether this stage's results are guaranteed aligned to the
    /// requested size (true for every stage here; the flag exists so a
    /// future stage that can't guarantee it can say so).
    const ALIGNED: bool;
    /// Whether concurrent calls from multiple threads are safe without an
    /// external lock.
    const CONCURRENCY_SAFE: bool;

    fn alloc_range(&self, size: usize) -> Option<NonNull<u8>>;
    fn dealloc_range(&self, base: NonNull<u8>, size: usize);
}

/// A shared reference to a range is itself a range. This is what lets a
/// per-thread stage (the small decay/commit/buddy cache described in spec
/// §4.5's "per-thread configuration") sit on top of a `'static` reference
/// to the process-wide global pipeline instead of owning a copy of it.
impl<'a, R: Range> Range for &'a R {
    const ALIGNED: bool = R::ALIGNED;
    const CONCURRENCY_SAFE: bool = R::CONCURRENCY_SAFE;

    fn alloc_range(&self, size: usize) -> Option<NonNull<u8>> {
        (**self).alloc_range(size)
    }

    fn dealloc_range(&self, base: NonNull<u8>, size: usize) {
        (**self).dealloc_range(base, size)
    }
}

/// Split `[base, base+length)` into maximal naturally-aligned power-of-two
/// blocks, largest-first. Used whenever a non-power-of-two remainder (a
/// refill's leftover, say) needs to be handed to a buddy allocator one
/// well-formed block at a time.
fn pow2_blocks(mut base: usize, mut length: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    while length > 0 {
        let align_bits = if base == 0 {
            usize::BITS as usize
        } else {
            base.trailing_zeros() as usize
        };
        let len_bits = (usize::BITS - length.leading_zeros()) as usize - 1;
        let bits = align_bits.min(len_bits);
        let size = 1usize << bits;
        out.push((base, size));
        base += size;
        length -= size;
    }
    out
}

// ---------------------------------------------------------------------
// 1. PalRange
// ---------------------------------------------------------------------

/// Bottom of every pipeline: talks directly to the platform.
pub struct PalRange<P> {
    _pal: PhantomData<P>,
}

impl<P> Default for PalRange<P> {
    fn default() -> Self {
        PalRange { _pal: PhantomData }
    }
}

impl<P: Pal> Range for PalRange<P> {
    const ALIGNED: bool = true;
    const CONCURRENCY_SAFE: bool = true;

    fn alloc_range(&self, size: usize) -> Option<NonNull<u8>> {
        P::reserve(size)
    }

    fn dealloc_range(&self, _base: NonNull<u8>, _size: usize) {
        // Reservations are kept for the life of the process; see
        // `Pal::release`'s own docs for why this crate never calls it in
        // ordinary operation.
    }
}

// ---------------------------------------------------------------------
// 2. PagemapRegisterRange
// ---------------------------------------------------------------------

/// After a successful alloc from `Parent`, ensures the pagemap's own
/// backing pages cover the returned heap range before anything is carved
/// out of it.
pub struct PagemapRegisterRange<P, T, Parent> {
    pagemap: &'static crate::pagemap::FlatPagemap<T, P, MIN_CHUNK_BITS>,
    parent: Parent,
}

impl<P, T: Copy + Default, Parent> PagemapRegisterRange<P, T, Parent> {
    pub fn new(
        pagemap: &'static crate::pagemap::FlatPagemap<T, P, MIN_CHUNK_BITS>,
        parent: Parent,
    ) -> Self {
        PagemapRegisterRange { pagemap, parent }
    }
}

impl<P: Pal, T: Copy + Default, Parent: Range> Range for PagemapRegisterRange<P, T, Parent> {
    const ALIGNED: bool = Parent::ALIGNED;
    const CONCURRENCY_SAFE: bool = Parent::CONCURRENCY_SAFE;

    fn alloc_range(&self, size: usize) -> Option<NonNull<u8>> {
        let base = self.parent.alloc_range(size)?;
        self.pagemap.register_range(base.as_ptr() as usize, size);
        Some(base)
    }

    fn dealloc_range(&self, base: NonNull<u8>, size: usize) {
        self.parent.dealloc_range(base, size)
    }
}

// ---------------------------------------------------------------------
// 3. BuddyRange (generic over large/small variants)
// ---------------------------------------------------------------------

/// One buddy-backed caching stage. `LargeBuddyRange`/`SmallBuddyRange`
/// (below) are both instances of this one generic type, differing only in
/// their bit-range constants — the two variants share an algorithm.
pub struct BuddyRange<
    Parent,
    const MIN_BITS: usize,
    const MAX_BITS: usize,
    const REFILL_SIZE_BITS: usize,
> {
    buddy: Mutex<Buddy<MIN_BITS, MAX_BITS>>,
    parent: Parent,
}

impl<Parent, const MIN_BITS: usize, const MAX_BITS: usize, const REFILL_SIZE_BITS: usize>
    BuddyRange<Parent, MIN_BITS, MAX_BITS, REFILL_SIZE_BITS>
{
    pub fn new(parent: Parent) -> Self {
        BuddyRange {
            buddy: Mutex::new(Buddy::new()),
            parent,
        }
    }

    fn add_range(&self, base: usize, length: usize, mark_first_boundary: bool) {
        let mut first = true;
        for (b, s) in pow2_blocks(base, length) {
            let mut buddy = self.buddy.lock();
            if first && mark_first_boundary {
                buddy.mark_boundary(b);
            }
            first = false;
            if let Some((overflow_base, overflow_size)) = buddy.add_block(b, s) {
                drop(buddy);
                if let Some(ptr) = NonNull::new(overflow_base as *mut u8) {
                    self.parent.dealloc_range(ptr, overflow_size);
                }
            }
        }
    }
}

impl<
        Parent: Range,
        const MIN_BITS: usize,
        const MAX_BITS: usize,
        const REFILL_SIZE_BITS: usize,
    > Range for BuddyRange<Parent, MIN_BITS, MAX_BITS, REFILL_SIZE_BITS>
{
    const ALIGNED: bool = true;
    const CONCURRENCY_SAFE: bool = false;

    fn alloc_range(&self, size: usize) -> Option<NonNull<u8>> {
        if next_pow2_bits(size) as usize >= REFILL_SIZE_BITS {
            return self.parent.alloc_range(size);
        }
        if let Some(addr) = self.buddy.lock().remove_block(size) {
            return NonNull::new(addr as *mut u8);
        }
        let refill_size = 1usize << REFILL_SIZE_BITS;
        let base = self.parent.alloc_range(refill_size)?;
        let base_addr = base.as_ptr() as usize;
        if refill_size > size {
            self.add_range(base_addr + size, refill_size - size, true);
        }
        NonNull::new(base_addr as *mut u8)
    }

    fn dealloc_range(&self, base: NonNull<u8>, size: usize) {
        if next_pow2_bits(size) as usize >= REFILL_SIZE_BITS {
            self.parent.dealloc_range(base, size);
            return;
        }
        if let Some((overflow_base, overflow_size)) =
            self.buddy.lock().add_block(base.as_ptr() as usize, size)
        {
            if let Some(ptr) = NonNull::new(overflow_base as *mut u8) {
                self.parent.dealloc_range(ptr, overflow_size);
            }
        }
    }
}

/// Chunk-granularity buddy cache: `[MIN_CHUNK_BITS, MAX_SIZE_BITS]`.
pub type LargeBuddyRange<Parent, const MAX_SIZE_BITS: usize, const REFILL_SIZE_BITS: usize> =
    BuddyRange<Parent, MIN_CHUNK_BITS, MAX_SIZE_BITS, REFILL_SIZE_BITS>;

/// Sub-chunk buddy cache: `[MIN_SMALL_SIZE_BITS, MIN_CHUNK_BITS]`, refilling
/// a whole chunk at a time from its parent.
pub type SmallBuddyRange<Parent, const MIN_SMALL_SIZE_BITS: usize> =
    BuddyRange<Parent, MIN_SMALL_SIZE_BITS, MIN_CHUNK_BITS, MIN_CHUNK_BITS>;

// ---------------------------------------------------------------------
// 4. CommitRange
// ---------------------------------------------------------------------

/// Commits/decommits pages around every alloc/dealloc that passes through.
pub struct CommitRange<P, Parent> {
    parent: Parent,
    _pal: PhantomData<P>,
}

impl<P, Parent> CommitRange<P, Parent> {
    pub fn new(parent: Parent) -> Self {
        CommitRange {
            parent,
            _pal: PhantomData,
        }
    }
}

impl<P: Pal, Parent: Range> Range for CommitRange<P, Parent> {
    const ALIGNED: bool = Parent::ALIGNED;
    const CONCURRENCY_SAFE: bool = Parent::CONCURRENCY_SAFE;

    fn alloc_range(&self, size: usize) -> Option<NonNull<u8>> {
        let base = self.parent.alloc_range(size)?;
        unsafe { P::notify_using(base, size) };
        Some(base)
    }

    fn dealloc_range(&self, base: NonNull<u8>, size: usize) {
        unsafe { P::notify_not_using(base, size) };
        self.parent.dealloc_range(base, size)
    }
}

// ---------------------------------------------------------------------
// 5. DecayRange
// ---------------------------------------------------------------------

/// A stage that caches freed ranges for a few epochs before returning them
/// to its parent, so a thread that frees and soon re-allocates memory of
/// the same size doesn't round-trip through `notify_not_using`/
/// `notify_using`. Epoch advance is driven by a PAL timer tick (§4.5.1);
/// ranges at or above [`DECAY_CACHE_CAP`] bypass the cache entirely.
pub struct DecayRange<P, Parent> {
    parent: Parent,
    epochs: [Mutex<Vec<(usize, usize)>>; NUM_EPOCHS],
    current_epoch: AtomicUsize,
    timer_registered: AtomicBool,
    _pal: PhantomData<P>,
}

impl<P: Pal, Parent: Range> DecayRange<P, Parent> {
    pub fn new(parent: Parent) -> Self {
        DecayRange {
            parent,
            epochs: [
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
            ],
            current_epoch: AtomicUsize::new(0),
            timer_registered: AtomicBool::new(false),
            _pal: PhantomData,
        }
    }
}

impl<P: Pal, Parent: Range + Send + Sync + 'static> DecayRange<P, Parent> {
    /// Leak `self` to `'static` and register its tick handler with the
    /// PAL's single global timer callback. The pool's allocators (and the
    /// back-end ranges they share) are never individually freed, only
    /// reused, so leaking here costs nothing over the process's life.
    pub fn leak_and_start_timer(self) -> &'static Self {
        let this: &'static Self = Box::leak(Box::new(self));
        this.start_timer();
        this
    }

    fn start_timer(self: &'static Self) {
        if P::SUPPORTS_TIMERS && !self.timer_registered.swap(true, Ordering::AcqRel) {
            // `register_timer` takes a bare `fn()`, so we close over no
            // state here; instead the global decay registry (below)
            // dispatches the tick to every live `DecayRange`.
            register_decay_tick(self);
            ensure_timer_started::<P>();
        }
    }

    fn advance_epoch_and_flush(&self) {
        let flushed_epoch = (self.current_epoch.load(Ordering::Acquire) + 1) % NUM_EPOCHS;
        self.current_epoch.store(flushed_epoch, Ordering::Release);
        let mut stack = self.epochs[flushed_epoch].lock();
        for (base, size) in stack.drain(..) {
            if let Some(ptr) = NonNull::new(base as *mut u8) {
                self.parent.dealloc_range(ptr, size);
            }
        }
    }

    /// Drain every epoch synchronously, for teardown/flush.
    pub fn flush_all(&self) {
        for stack in &self.epochs {
            let mut stack = stack.lock();
            for (base, size) in stack.drain(..) {
                if let Some(ptr) = NonNull::new(base as *mut u8) {
                    self.parent.dealloc_range(ptr, size);
                }
            }
        }
    }

    pub fn cached_bytes(&self) -> usize {
        self.epochs.iter().map(|e| e.lock().iter().map(|(_, s)| *s).sum::<usize>()).sum()
    }
}

impl<P: Pal, Parent: Range> Range for DecayRange<P, Parent> {
    const ALIGNED: bool = Parent::ALIGNED;
    const CONCURRENCY_SAFE: bool = false;

    fn alloc_range(&self, size: usize) -> Option<NonNull<u8>> {
        match self.parent.alloc_range(size) {
            Some(p) => Some(p),
            None => {
                // OOM from the parent: flush every epoch and retry once.
                for stack in &self.epochs {
                    let mut stack = stack.lock();
                    for (base, s) in stack.drain(..) {
                        if let Some(ptr) = NonNull::new(base as *mut u8) {
                            self.parent.dealloc_range(ptr, s);
                        }
                    }
                }
                self.parent.alloc_range(size)
            }
        }
    }

    fn dealloc_range(&self, base: NonNull<u8>, size: usize) {
        if size >= DECAY_CACHE_CAP {
            self.parent.dealloc_range(base, size);
            return;
        }
        let epoch = self.current_epoch.load(Ordering::Acquire);
        self.epochs[epoch].lock().push((base.as_ptr() as usize, size));
    }
}

static DECAY_REGISTRY: Mutex<Vec<&'static (dyn DecayTick + Send + Sync)>> = Mutex::new(Vec::new());
static TIMER_STARTED: spin::Once<()> = spin::Once::new();

trait DecayTick {
    fn tick(&self);
}

impl<P: Pal, Parent: Range> DecayTick for DecayRange<P, Parent> {
    fn tick(&self) {
        self.advance_epoch_and_flush();
    }
}

fn register_decay_tick(range: &'static (dyn DecayTick + Send + Sync)) {
    DECAY_REGISTRY.lock().push(range);
}

fn ensure_timer_started<P: Pal>() {
    TIMER_STARTED.call_once(|| {
        if P::SUPPORTS_TIMERS {
            P::register_timer(DECAY_TICK, on_decay_tick);
        }
    });
}

fn on_decay_tick() {
    for r in DECAY_REGISTRY.lock().iter() {
        r.tick();
    }
}

// ---------------------------------------------------------------------
// 6. GlobalRange
// ---------------------------------------------------------------------

/// Serialises access to a sub-pipeline across all threads with a spin
/// lock, per spec §5's "suspension points": chunk reservation from the OS
/// is one of the few places this crate blocks.
pub struct GlobalRange<Parent> {
    inner: Mutex<Parent>,
}

impl<Parent> GlobalRange<Parent> {
    pub fn new(parent: Parent) -> Self {
        GlobalRange {
            inner: Mutex::new(parent),
        }
    }
}

impl<Parent: Range> Range for GlobalRange<Parent> {
    const ALIGNED: bool = Parent::ALIGNED;
    const CONCURRENCY_SAFE: bool = true;

    fn alloc_range(&self, size: usize) -> Option<NonNull<u8>> {
        self.inner.lock().alloc_range(size)
    }

    fn dealloc_range(&self, base: NonNull<u8>, size: usize) {
        self.inner.lock().dealloc_range(base, size)
    }
}

// ---------------------------------------------------------------------
// 7. StatsRange
// ---------------------------------------------------------------------

/// Tracks current/peak bytes in flight through a pipeline, per spec §5
/// ("statistics counters use relaxed atomics with a CAS loop for peak
/// updates").
pub struct StatsRange<Parent> {
    parent: Parent,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl<Parent> StatsRange<Parent> {
    pub fn new(parent: Parent) -> Self {
        StatsRange {
            parent,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn current_bytes(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    fn bump(&self, delta: isize) {
        let new = if delta >= 0 {
            self.current.fetch_add(delta as usize, Ordering::Relaxed) + delta as usize
        } else {
            // Saturate rather than wrap: buddy coalescing can route more
            // bytes through a single dealloc_range call here than were ever
            // individually attributed by matching alloc_range calls at this
            // stage, so a bare fetch_sub could underflow.
            let amount = (-delta) as usize;
            let mut cur = self.current.load(Ordering::Relaxed);
            loop {
                let next = cur.saturating_sub(amount);
                match self.current.compare_exchange_weak(
                    cur,
                    next,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break next,
                    Err(observed) => cur = observed,
                }
            }
        };
        let mut peak = self.peak.load(Ordering::Relaxed);
        while new > peak {
            match self.peak.compare_exchange_weak(
                peak,
                new,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => peak = observed,
            }
        }
    }
}

impl<Parent: Range> Range for StatsRange<Parent> {
    const ALIGNED: bool = Parent::ALIGNED;
    const CONCURRENCY_SAFE: bool = Parent::CONCURRENCY_SAFE;

    fn alloc_range(&self, size: usize) -> Option<NonNull<u8>> {
        let p = self.parent.alloc_range(size)?;
        self.bump(size as isize);
        Some(p)
    }

    fn dealloc_range(&self, base: NonNull<u8>, size: usize) {
        self.bump(-(size as isize));
        self.parent.dealloc_range(base, size)
    }
}

// ---------------------------------------------------------------------
// SubRange: guard-paged metadata allocation (hardened meta range)
// ---------------------------------------------------------------------

/// Over-allocates by `2^GUARD_OVERSIZE_BITS` and returns a random
/// strict-interior slot, never the first or last, so an out-of-bounds
/// write from an adjacent metadata allocation is likely to land on an
/// unmapped guard slot instead. Individual slots are never reclaimed
/// (see `DESIGN.md`): this path is for comparatively rare, long-lived
/// metadata allocations, not a hot path.
pub struct SubRange<Parent> {
    parent: Parent,
    entropy: Mutex<LocalEntropy>,
}

impl<Parent> SubRange<Parent> {
    pub fn new<P: Pal>(parent: Parent) -> Self {
        SubRange {
            parent,
            entropy: Mutex::new(LocalEntropy::new::<P>()),
        }
    }
}

impl<Parent: Range> Range for SubRange<Parent> {
    const ALIGNED: bool = true;
    const CONCURRENCY_SAFE: bool = Parent::CONCURRENCY_SAFE;

    fn alloc_range(&self, size: usize) -> Option<NonNull<u8>> {
        use crate::config::GUARD_OVERSIZE_BITS;
        let guard_size = size << GUARD_OVERSIZE_BITS;
        let base = self.parent.alloc_range(guard_size)?;
        let num_slots = guard_size / size;
        let slot = 1 + (self.entropy.lock().get_next() as usize % (num_slots - 2));
        let offset = slot * size;
        NonNull::new((base.as_ptr() as usize + offset) as *mut u8)
    }

    fn dealloc_range(&self, _base: NonNull<u8>, _size: usize) {
        // intentionally leaked; see struct docs.
    }
}

// A lightweight default wiring for MIN_CHUNK_SIZE sanity in tests below.
#[allow(dead_code)]
const _: usize = MIN_CHUNK_SIZE;

#[cfg(test)]
mod tests {
    use super::*;
    use slagalloc_pal::SystemPal;

    #[test]
    fn pow2_blocks_covers_exact_length() {
        let blocks = pow2_blocks(0x1000, 0x3000);
        let total: usize = blocks.iter().map(|(_, s)| s).sum();
        assert_eq!(total, 0x3000);
        for (b, s) in &blocks {
            assert_eq!(b % s, 0, "block {b:#x} not aligned to its own size {s:#x}");
        }
    }

    #[test]
    fn pal_range_round_trips_through_commit_range() {
        type P = CommitRange<SystemPal, PalRange<SystemPal>>;
        let range = P::new(PalRange::default());
        let size = MIN_CHUNK_SIZE;
        let base = range.alloc_range(size).expect("alloc_range failed");
        unsafe {
            core::ptr::write_bytes(base.as_ptr(), 0xAB, size);
            assert_eq!(*base.as_ptr(), 0xAB);
        }
        range.dealloc_range(base, size);
    }

    #[test]
    fn buddy_range_caches_and_reuses_freed_blocks() {
        type P = BuddyRange<PalRange<SystemPal>, 14, 24, 21>;
        let range = P::new(PalRange::default());
        let size = MIN_CHUNK_SIZE;
        let a = range.alloc_range(size).unwrap();
        range.dealloc_range(a, size);
        let b = range.alloc_range(size).unwrap();
        assert_eq!(a, b, "freed block should be reused before asking the parent again");
    }

    #[test]
    fn stats_range_tracks_current_and_peak() {
        type P = StatsRange<PalRange<SystemPal>>;
        let range = P::new(PalRange::default());
        let size = MIN_CHUNK_SIZE;
        let a = range.alloc_range(size).unwrap();
        assert_eq!(range.current_bytes(), size);
        let b = range.alloc_range(size).unwrap();
        assert_eq!(range.current_bytes(), size * 2);
        assert_eq!(range.peak_bytes(), size * 2);
        range.dealloc_range(a, size);
        assert_eq!(range.current_bytes(), size);
        assert_eq!(range.peak_bytes(), size * 2);
        range.dealloc_range(b, size);
    }
}
