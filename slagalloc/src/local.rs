//! The front end: one `Alloc<P>` per thread, in front of the shared
//! [`crate::backend::Backend`].
//!
//! Every small allocation is served from a two-tier free list: a
//! per-size-class "ready" list (already decoded, just-pop-and-go) refilled
//! in `wake_threshold`-sized batches from whichever slab on that class's
//! [`SeqSet`] has room to spare. A local `dealloc` always lands back on the
//! *slab's own* free queue, never the ready list directly — that keeps the
//! slab's `used` counter (and therefore the available-list membership
//! decision) a function of one thing, not two. A cross-thread `dealloc`
//! batches into [`OutboundBatch`] and is reclaimed by the owning thread via
//! [`Alloc::drain_remote`], which performs exactly the same bookkeeping a
//! local dealloc would have.

use crate::backend::{Backend, ObjectLocalPipeline};
use crate::bits::{align_down, next_pow2};
use crate::config::{MAX_SIZECLASS_SIZE, MIN_ALLOC_SIZE, REMOTE_BATCH};
use crate::entropy::LocalEntropy;
use crate::error::fatal_error;
use crate::freelist::{FreeListBuilder, FreeListKey};
use crate::remote::{OutboundBatch, RemoteAllocatorId, RemoteQueue};
use crate::sizeclass::{is_small_sizeclass, size_to_sizeclass, sizeclass_to_size, NUM_SMALL_SIZECLASSES, SizeClass, SlabGeometry};
use crate::slab::{SeqSet, SlabMetadata};
use core::alloc::Layout;
use core::ptr::NonNull;
use slagalloc_pal::Pal;

/// Where within its object an `external_pointer` query is anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    Start,
    End,
    OnePastEnd,
}

/// One size class's thread-local state: the ready-to-hand-out free list
/// (and the key it is encoded under) plus the set of slabs of this class
/// that still have objects to give.
struct ClassState {
    ready: FreeListBuilder,
    ready_key: FreeListKey,
    available: SeqSet<SlabMetadata>,
}

/// The effective size and alignment the back end will actually reserve for
/// a `Layout` request: any alignment the allocator cannot fold
/// into its normal size-class rounding is satisfied by rounding the size up
/// to a power of two at least that alignment and serving it as a
/// self-aligned large allocation — see [`Backend::alloc_large`]'s PAL-level
/// guarantee that a power-of-two-sized chunk request comes back aligned to
/// its own size.
pub fn aligned_size(layout: Layout) -> usize {
    let size = layout.size().max(1);
    let align = layout.align();
    if align <= MIN_ALLOC_SIZE {
        size
    } else {
        next_pow2(size.max(align))
    }
}

/// A thread's allocator state. Acquire one from [`crate::pool::Pool`]
/// rather than constructing directly outside of tests — a stray `Alloc`
/// that never returns to the pool leaks its backing chunks at thread exit.
pub struct Alloc<P: Pal> {
    backend: &'static Backend<P>,
    object_local: &'static ObjectLocalPipeline<P>,
    classes: Vec<ClassState>,
    remote_queue: RemoteQueue,
    remote_key: FreeListKey,
    outbound: OutboundBatch,
    entropy: LocalEntropy,
    foreign_dealloc: Option<Box<dyn Fn(NonNull<u8>) + Send>>,
}

impl<P: Pal> Alloc<P> {
    pub fn new(backend: &'static Backend<P>) -> Self {
        let object_local = backend.new_object_local();
        let mut entropy = LocalEntropy::new::<P>();
        let remote_key = FreeListKey::new(entropy.get_next(), entropy.get_next());
        let classes = (0..NUM_SMALL_SIZECLASSES)
            .map(|_| ClassState {
                ready: FreeListBuilder::new(),
                ready_key: FreeListKey::new(entropy.get_next(), entropy.get_next()),
                available: SeqSet::new(),
            })
            .collect();

        Alloc {
            backend,
            object_local,
            classes,
            remote_queue: RemoteQueue::new(),
            remote_key,
            outbound: OutboundBatch::new(),
            entropy,
            foreign_dealloc: None,
        }
    }

    /// Install a hook invoked for `dealloc` calls on pointers this
    /// allocator never handed out at all — a foreign-pointer escape hatch,
    /// e.g. handing a non-`slagalloc` pointer off to the system `free`.
    /// Without one, such a call is a fatal error.
    pub fn with_foreign_dealloc(mut self, hook: impl Fn(NonNull<u8>) + Send + 'static) -> Self {
        self.foreign_dealloc = Some(Box::new(hook));
        self
    }

    /// This allocator's identity as a cross-thread-free destination.
    pub fn id(&self) -> RemoteAllocatorId {
        RemoteAllocatorId::of(&self.remote_queue)
    }

    // ---- allocation --------------------------------------------------

    pub fn alloc(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        self.alloc_inner(layout, false)
    }

    pub fn alloc_zeroed(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        self.alloc_inner(layout, true)
    }

    /// Spec §6.1's `alloc_aligned(align, size)` convenience entry point.
    pub fn alloc_aligned(&mut self, align: usize, size: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, align).ok()?;
        self.alloc_inner(layout, false)
    }

    fn alloc_inner(&mut self, layout: Layout, zero: bool) -> Option<NonNull<u8>> {
        let needed = aligned_size(layout);
        if layout.align() <= MIN_ALLOC_SIZE && is_small_sizeclass(needed) {
            let sc = size_to_sizeclass(needed);
            let p = self.alloc_small(sc)?;
            if zero {
                unsafe { core::ptr::write_bytes(p.as_ptr(), 0, sizeclass_to_size(sc)) };
            }
            Some(p)
        } else {
            let owner = self.id();
            let remote_key = self.remote_key;
            let p = self.backend.alloc_large(self.object_local, needed, owner, remote_key)?;
            if zero {
                let chunk_size = next_pow2(needed).max(crate::config::MIN_CHUNK_SIZE);
                unsafe { core::ptr::write_bytes(p.as_ptr(), 0, chunk_size) };
            }
            Some(p)
        }
    }

    fn alloc_small(&mut self, sc: SizeClass) -> Option<NonNull<u8>> {
        loop {
            let key = self.classes[sc.raw()].ready_key;
            if let Some(p) = self.classes[sc.raw()].ready.pop(&key) {
                return Some(p);
            }
            if !self.refill(sc) {
                return None;
            }
        }
    }

    /// Slow path: pull a batch of objects into `sc`'s ready list, either
    /// from an already-available slab or by carving a fresh one from the
    /// back end. Returns `false` only on genuine out-of-memory.
    fn refill(&mut self, sc: SizeClass) -> bool {
        self.drain_remote();

        let slab_ptr = match self.classes[sc.raw()].available.pop_front() {
            Some(p) => p,
            None => match self.build_new_slab(sc) {
                Some(p) => p,
                None => return false,
            },
        };
        self.drain_slab_into_ready(sc, slab_ptr);
        true
    }

    fn build_new_slab(&mut self, sc: SizeClass) -> Option<NonNull<SlabMetadata>> {
        let geo = SlabGeometry::of(sc);
        let owner = self.id();
        let remote_key = self.remote_key;
        let slab_key = FreeListKey::new(self.entropy.get_next(), self.entropy.get_next());

        let (chunk, meta) = self
            .backend
            .alloc_chunk(self.object_local, sc, geo.slab_size, owner, remote_key, slab_key)?;

        let builder = unsafe { (*meta.as_ptr()).free_builder_mut() };
        let base = chunk.as_ptr() as usize;
        for i in 0..geo.objects_per_slab {
            let obj = NonNull::new((base + i * geo.size) as *mut u8).expect("slab chunk base is never null");
            unsafe { builder.push(obj, &slab_key) };
        }
        Some(meta)
    }

    /// Drain up to `wake_threshold` objects out of `slab_ptr`'s own free
    /// queue, re-encode them under `sc`'s ready-list key, and leave the
    /// slab linked into the available list iff it still has something
    /// left to give.
    fn drain_slab_into_ready(&mut self, sc: SizeClass, slab_ptr: NonNull<SlabMetadata>) {
        let geo = SlabGeometry::of(sc);
        let slab_key = unsafe { slab_ptr.as_ref().key() };
        let wake = geo.wake_threshold;

        let (first, last, count) = unsafe { (*slab_ptr.as_ptr()).free_builder_mut().take_up_to(wake, &slab_key) }
            .unwrap_or_else(|| fatal_error("refill: slab on the available list had an empty free queue"));
        unsafe { slab_ptr.as_ref().note_checked_out(count) };

        let (lo, hi) = unsafe { slab_ptr.as_ref().range() };
        let taken = FreeListBuilder::from_segment(first, last, count);
        let ready_key = self.classes[sc.raw()].ready_key;
        for p in taken.into_iter(slab_key, (lo, hi)) {
            unsafe { self.classes[sc.raw()].ready.push(p, &ready_key) };
        }

        let still_has_free = !unsafe { (*slab_ptr.as_ptr()).free_builder_mut() }.is_empty();
        if still_has_free {
            unsafe { self.classes[sc.raw()].available.insert(slab_ptr) };
        }
    }

    // ---- deallocation --------------------------------------------------

    pub fn dealloc(&mut self, p: NonNull<u8>) {
        self.dealloc_impl(p, None);
    }

    /// Sized variant of `dealloc`; in `sanity_checks` builds this
    /// additionally checks `layout` against the pointer's recorded size
    /// class.
    pub fn dealloc_sized(&mut self, p: NonNull<u8>, layout: Layout) {
        self.dealloc_impl(p, Some(layout));
    }

    fn dealloc_impl(&mut self, p: NonNull<u8>, layout_hint: Option<Layout>) {
        let entry = self.backend.pagemap().get(p.as_ptr() as usize);

        if entry.is_backend_owned() {
            if let Some(hook) = &self.foreign_dealloc {
                hook(p);
                return;
            }
            fatal_error(format_args!(
                "dealloc: {:p} is not an allocation this allocator knows about and no foreign_dealloc hook is installed",
                p.as_ptr()
            ));
        }

        if cfg!(feature = "sanity_checks") {
            if let Some(layout) = layout_hint {
                if layout.size() > entry.object_size() {
                    fatal_error("dealloc: supplied layout is larger than the allocation's recorded size");
                }
            }
        }

        match entry.sizeclass() {
            Some(sc) => {
                if entry.owner() == self.id() {
                    self.dealloc_small_local(p, entry.slab_meta(), sc);
                } else {
                    self.queue_remote(entry.owner(), entry.remote_key(), p, sizeclass_to_size(sc));
                }
            }
            None => {
                // Large allocations have no thread-private bookkeeping to
                // protect (no slab, no free queue), so any thread can free
                // one directly through its own object-local cache.
                self.backend.dealloc_large(self.object_local, p, entry.object_size());
            }
        }
    }

    fn dealloc_small_local(&mut self, p: NonNull<u8>, slab: Option<NonNull<SlabMetadata>>, sc: SizeClass) {
        let slab_ptr = slab.unwrap_or_else(|| fatal_error("dealloc: small pagemap entry missing its slab metadata"));
        let geo = SlabGeometry::of(sc);

        let slab_key = unsafe { slab_ptr.as_ref().key() };
        let was_full = unsafe { slab_ptr.as_ref().is_fully_checked_out(geo.objects_per_slab) };
        unsafe { (*slab_ptr.as_ptr()).free_builder_mut().push(p, &slab_key) };
        let fully_free = unsafe { slab_ptr.as_ref().note_returned() };

        if fully_free {
            if !was_full {
                unsafe { self.classes[sc.raw()].available.remove(slab_ptr) };
            }
            let (start, end) = unsafe { slab_ptr.as_ref().range() };
            let chunk = NonNull::new(start as *mut u8).expect("slab start is never null");
            self.backend.dealloc_chunk(self.object_local, slab_ptr, chunk, end - start);
        } else if was_full {
            unsafe { self.classes[sc.raw()].available.insert(slab_ptr) };
        }
    }

    fn queue_remote(&mut self, dest: RemoteAllocatorId, key: FreeListKey, p: NonNull<u8>, object_size: usize) {
        let evicted = unsafe { self.outbound.push(dest, p, &key, object_size) };
        for (dest, first, count) in evicted {
            unsafe { dest.queue().enqueue(first, count) };
        }
    }

    /// Reclaim everything queued in this allocator's own inbox: walk each
    /// drained segment under this allocator's fixed `remote_key`
    /// and, object by object, apply exactly the bookkeeping a local dealloc
    /// would have — a segment can freely mix objects from several different
    /// slabs bound for this same destination.
    fn drain_remote(&mut self) {
        let remote_key = self.remote_key;
        let mut segments: Vec<(NonNull<u8>, usize)> = Vec::new();
        self.remote_queue.drain(REMOTE_BATCH, |first, count| segments.push((first, count)));

        for (first, count) in segments {
            let mut cur = Some(first);
            for _ in 0..count {
                let p = cur.unwrap_or_else(|| fatal_error("remote free segment shorter than its declared count"));
                let encoded = unsafe { (p.as_ptr() as *const usize).read() };
                let next_addr = remote_key.decode(p.as_ptr() as usize, encoded);
                cur = NonNull::new(next_addr as *mut u8);
                self.reclaim_remote_object(p);
            }
        }
    }

    fn reclaim_remote_object(&mut self, p: NonNull<u8>) {
        let entry = self.backend.pagemap().get(p.as_ptr() as usize);
        let sc = entry
            .sizeclass()
            .unwrap_or_else(|| fatal_error("remote free segment referenced a non-small pagemap entry"));
        self.dealloc_small_local(p, entry.slab_meta(), sc);
    }

    // ---- introspection --------------------------------------------------

    /// Spec §4.8 `alloc_size`: the usable size of the allocation at `p`, or
    /// `0` for a null/unrecognised pointer.
    pub fn alloc_size(&self, p: Option<NonNull<u8>>) -> usize {
        match p {
            None => 0,
            Some(p) => self.backend.pagemap().get(p.as_ptr() as usize).object_size(),
        }
    }

    /// Spec §4.8 `external_pointer`: locate `p`'s containing object and
    /// return the requested boundary of it, or `None` if `p` is not an
    /// allocation this allocator knows about.
    pub fn external_pointer(&self, p: NonNull<u8>, boundary: Boundary) -> Option<NonNull<u8>> {
        let entry = self.backend.pagemap().get(p.as_ptr() as usize);
        if entry.is_backend_owned() {
            return None;
        }
        let size = entry.object_size();

        let obj_start = match entry.sizeclass() {
            Some(sc) => {
                let slab = entry.slab_meta()?;
                let (slab_start, _slab_end) = unsafe { slab.as_ref().range() };
                let index = SlabGeometry::of(sc).index_in_slab(p.as_ptr() as usize - slab_start);
                slab_start + index * size
            }
            None => align_down(p.as_ptr() as usize, size),
        };

        let offset = match boundary {
            Boundary::Start => 0,
            Boundary::End => size - 1,
            Boundary::OnePastEnd => size,
        };
        NonNull::new((obj_start + offset) as *mut u8)
    }

    /// Spec §4.8.2 support: `true` iff `[p, p+len)` lies entirely within
    /// one allocation this allocator knows about.
    pub fn check_bounds(&self, p: NonNull<u8>, len: usize) -> bool {
        match self.external_pointer(p, Boundary::OnePastEnd) {
            Some(end) => (p.as_ptr() as usize).saturating_add(len) <= end.as_ptr() as usize,
            None => false,
        }
    }

    /// Flush every outstanding local-to-remote batch and drain this
    /// allocator's own inbox. Called by [`crate::pool::Pool::release`]
    /// before an `Alloc` goes back on the idle stack, so a long-idle
    /// allocator doesn't sit on unflushed cross-thread frees.
    pub fn flush(&mut self) {
        self.drain_remote();
        let flushed = self.outbound.flush_all();
        for (dest, first, count) in flushed {
            unsafe { dest.queue().enqueue(first, count) };
        }
    }

    /// Spec §4.10.1: every slab this allocator still has linked into an
    /// available list must have spare capacity — a fully checked-out slab
    /// has no business sitting on that list. A lighter check than the
    /// original's full cross-reference against back-end-tracked totals (see
    /// `DESIGN.md`), but it still catches the bookkeeping bug that check is
    /// meant to guard against (a slab going missing from, or lingering on,
    /// the available list past its `used` transition).
    #[cfg(any(test, feature = "debug-check-empty"))]
    pub fn debug_check_empty(&self) -> bool {
        self.classes.iter().all(|class| {
            class.available.iterate().all(|slab_ptr| {
                let slab_ref = unsafe { slab_ptr.as_ref() };
                let geo = SlabGeometry::of(slab_ref.sizeclass());
                !slab_ref.is_fully_checked_out(geo.objects_per_slab)
            })
        })
    }
}

/// A `memcpy` that validates both ends of the copy lie inside allocations
/// this `alloc` knows about before touching memory, rather than trusting
/// the caller's length. Bounds violations are fatal, not a `Result`, since
/// there is no well-defined value to return once the caller has proven it
/// doesn't know its own buffer sizes.
pub fn checked_memcpy<P: Pal>(alloc: &Alloc<P>, dst: NonNull<u8>, src: NonNull<u8>, len: usize) {
    if len == 0 {
        return;
    }
    if !alloc.check_bounds(dst, len) {
        fatal_error(format_args!(
            "checked_memcpy: {len}-byte write at {:p} overflows its allocation",
            dst.as_ptr()
        ));
    }
    if cfg!(debug_assertions) && !alloc.check_bounds(src, len) {
        fatal_error(format_args!(
            "checked_memcpy: {len}-byte read at {:p} overflows its allocation",
            src.as_ptr()
        ));
    }
    unsafe { core::ptr::copy(src.as_ptr(), dst.as_ptr(), len) };
}

/// A `realloc` built as a pure composition of `alloc`+`dealloc`, with no
/// state of its own, matching `override/rust.cc`'s `rust_realloc` rather
/// than being a method on [`Alloc`]. Copies `min(old_layout.size(),
/// new_size)` bytes from `p` into the fresh allocation and frees `p`;
/// returns `None` (leaving `p` intact and still valid) on OOM.
pub fn realloc<P: Pal>(
    alloc: &mut Alloc<P>,
    p: NonNull<u8>,
    old_layout: Layout,
    new_size: usize,
) -> Option<NonNull<u8>> {
    let new_layout = Layout::from_size_align(new_size, old_layout.align()).ok()?;
    let new_p = alloc.alloc(new_layout)?;
    let copy_len = old_layout.size().min(new_size);
    if copy_len > 0 {
        unsafe { core::ptr::copy_nonoverlapping(p.as_ptr(), new_p.as_ptr(), copy_len) };
    }
    alloc.dealloc_sized(p, old_layout);
    Some(new_p)
}
