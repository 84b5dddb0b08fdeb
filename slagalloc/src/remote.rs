//! Cross-thread deallocation: each allocator's MPSC inbox, and the
//! per-sender outbound batch cache that groups frees by destination before
//! enqueuing them.
//!
//! The inbox itself is the classic intrusive, lock-free, multi-producer
//! single-consumer queue (Vyukov's design: a dummy "stub" node so producers
//! never need to read a possibly-null head, an atomic `tail` producers
//! swap, and a consumer-only cursor). Spec §4.9 describes splicing whole
//! *free-list segments* onto the inbox in one atomic step rather than one
//! object at a time; here each link in the MPSC chain is a small
//! heap-allocated [`SegmentNode`] carrying `(first, count)` for one
//! sender's batch, not the raw client objects themselves — see
//! `DESIGN.md` for why (briefly: it keeps the MPSC's own linkage and the
//! per-slab encoded free-list linkage from having to share the same first
//! machine word of client memory, at the cost of one small allocation per
//! flushed batch rather than zero).

use crate::config::{REMOTE_BATCH, REMOTE_CACHE, REMOTE_MASK, REMOTE_SLOTS};
use crate::freelist::{FreeListBuilder, FreeListKey};
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Identity of a destination allocator for cross-thread frees: the address
/// of its [`RemoteQueue`]. `none()` marks "no remote owner" (e.g. a chunk
/// that is still back-end-owned).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteAllocatorId(usize);

impl Default for RemoteAllocatorId {
    fn default() -> Self {
        Self::none()
    }
}

impl RemoteAllocatorId {
    pub const fn none() -> Self {
        RemoteAllocatorId(0)
    }

    pub fn of(queue: &RemoteQueue) -> Self {
        RemoteAllocatorId(queue as *const RemoteQueue as usize)
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    fn slot(self) -> usize {
        (self.0 >> 6) & REMOTE_MASK
    }

    /// Resolve this identity back to the queue it names.
    ///
    /// # Safety
    /// The identified `RemoteQueue` must still be alive. Every allocator
    /// this crate hands out is pool-managed and leaked for the life of the
    /// process (see `crate::pool`), so this holds for any `RemoteAllocatorId`
    /// obtained from [`Self::of`] on such an allocator's queue.
    pub unsafe fn queue(self) -> &'static RemoteQueue {
        &*(self.0 as *const RemoteQueue)
    }
}

struct SegmentNode {
    first: NonNull<u8>,
    count: usize,
    next: AtomicPtr<SegmentNode>,
}

/// One allocator's cross-thread-free inbox. Producers (any other thread's
/// `Alloc`) call [`Self::enqueue`]; only the owning thread calls
/// [`Self::drain`].
pub struct RemoteQueue {
    tail: AtomicPtr<SegmentNode>,
    head: UnsafeCell<*mut SegmentNode>,
    stub: Box<SegmentNode>,
}

// SAFETY: `head` is only ever read or written by the single consumer
// thread that owns this queue (see module docs and spec §5 "per-allocator
// inbox: producers lock-free append, consumer lock-free drain").
unsafe impl Sync for RemoteQueue {}
unsafe impl Send for RemoteQueue {}

impl Default for RemoteQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteQueue {
    pub fn new() -> Self {
        let mut stub = Box::new(SegmentNode {
            first: NonNull::dangling(),
            count: 0,
            next: AtomicPtr::new(core::ptr::null_mut()),
        });
        let stub_ptr: *mut SegmentNode = &mut *stub;
        RemoteQueue {
            tail: AtomicPtr::new(stub_ptr),
            head: UnsafeCell::new(stub_ptr),
            stub,
        }
    }

    /// Splice a `(first, count)` free-list segment onto the inbox as a
    /// single atomic append. Safe to call from any thread.
    pub fn enqueue(&self, first: NonNull<u8>, count: usize) {
        let node = Box::into_raw(Box::new(SegmentNode {
            first,
            count,
            next: AtomicPtr::new(core::ptr::null_mut()),
        }));
        let prev = self.tail.swap(node, Ordering::AcqRel);
        unsafe { (*prev).next.store(node, Ordering::Release) };
    }

    /// Drain up to `max_objects` worth of queued segments, calling `sink`
    /// with each segment's `(first, count)`. Returns the number of
    /// objects handed to `sink`. Must only be called by the owning thread.
    pub fn drain(&self, max_objects: usize, mut sink: impl FnMut(NonNull<u8>, usize)) -> usize {
        let mut drained = 0;
        loop {
            if drained >= max_objects {
                return drained;
            }
            let head = unsafe { *self.head.get() };
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            if next.is_null() {
                return drained;
            }
            // `head` is either the permanent stub (never freed) or a
            // previously-consumed SegmentNode we own and must free now.
            let stub_ptr: *const SegmentNode = &*self.stub;
            if !core::ptr::eq(head, stub_ptr) {
                unsafe { drop(Box::from_raw(head)) };
            }
            unsafe { *self.head.get() = next };
            let seg = unsafe { &*next };
            sink(seg.first, seg.count);
            drained += seg.count;
        }
    }

    pub fn is_empty(&self) -> bool {
        let head = unsafe { *self.head.get() };
        unsafe { (*head).next.load(Ordering::Acquire).is_null() }
    }
}

impl Drop for RemoteQueue {
    fn drop(&mut self) {
        // Drain whatever is left so we don't leak SegmentNode allocations;
        // any objects inside are leaked from this queue's point of view
        // (there is nowhere left to deliver them), matching the "in-flight
        // remote frees may arrive later" shutdown note in spec §4.9 — in
        // this crate a dropped queue means the owning allocator was torn
        // down without returning to the pool, which is only expected at
        // process exit or in tests.
        self.drain(usize::MAX, |_, _| {});
    }
}

/// One sender's accumulated, not-yet-flushed free-list segment bound for
/// a single destination.
struct BatchSlot {
    dest: RemoteAllocatorId,
    builder: FreeListBuilder,
    bytes: usize,
}

/// Groups outgoing cross-thread frees by destination allocator before
/// flushing them onto that allocator's [`RemoteQueue`]. Direct-mapped by
/// the low bits of the destination's identity (spec §3 "Allocator
/// state"/§4.9): a collision evicts (flushes) whatever was previously in
/// that slot rather than growing unboundedly.
pub struct OutboundBatch {
    slots: Vec<Option<BatchSlot>>,
}

impl Default for OutboundBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundBatch {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(REMOTE_SLOTS);
        slots.resize_with(REMOTE_SLOTS, || None);
        OutboundBatch { slots }
    }

    /// Push `p` (belonging to `key`'s slab) into the batch for `dest`.
    /// `object_size` is used only to track the byte budget. Returns a
    /// ready-to-flush segment if this push crossed `REMOTE_BATCH` objects
    /// or `REMOTE_CACHE` bytes for its slot, or if it evicted a different
    /// destination's pending batch.
    ///
    /// # Safety
    /// `p` must be a live, exclusively-owned free object of at least one
    /// machine word, as required by [`FreeListBuilder::push`].
    pub unsafe fn push(
        &mut self,
        dest: RemoteAllocatorId,
        p: NonNull<u8>,
        key: &FreeListKey,
        object_size: usize,
    ) -> Vec<(RemoteAllocatorId, NonNull<u8>, usize)> {
        let slot = dest.slot();
        let mut evicted = Vec::new();

        match &self.slots[slot] {
            Some(existing) if existing.dest != dest => {
                if let Some(seg) = self.flush_slot(slot) {
                    evicted.push(seg);
                }
            }
            _ => {}
        }

        if self.slots[slot].is_none() {
            self.slots[slot] = Some(BatchSlot {
                dest,
                builder: FreeListBuilder::new(),
                bytes: 0,
            });
        }

        let full = {
            let entry = self.slots[slot].as_mut().unwrap();
            entry.builder.push(p, key);
            entry.bytes += object_size;
            entry.builder.len() >= REMOTE_BATCH || entry.bytes >= REMOTE_CACHE as usize
        };

        if full {
            if let Some(seg) = self.flush_slot(slot) {
                evicted.push(seg);
            }
        }

        evicted
    }

    fn flush_slot(&mut self, slot: usize) -> Option<(RemoteAllocatorId, NonNull<u8>, usize)> {
        let mut entry = self.slots[slot].take()?;
        let (first, _last, count) = entry.builder.take_segment()?;
        Some((entry.dest, first, count))
    }

    /// Flush every occupied slot, for allocator teardown.
    pub fn flush_all(&mut self) -> Vec<(RemoteAllocatorId, NonNull<u8>, usize)> {
        (0..self.slots.len())
            .filter_map(|i| self.flush_slot(i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_and_drain_preserves_segment_counts() {
        let q = RemoteQueue::new();
        let mut objs = [[0u8; 16]; 8];
        let ptrs: Vec<NonNull<u8>> = objs
            .iter_mut()
            .map(|o| NonNull::new(o.as_mut_ptr()).unwrap())
            .collect();

        q.enqueue(ptrs[0], 3);
        q.enqueue(ptrs[3], 5);

        let mut seen = 0usize;
        let drained = q.drain(usize::MAX, |_first, count| seen += count);
        assert_eq!(drained, 8);
        assert_eq!(seen, 8);
        assert!(q.is_empty());
    }

    #[test]
    fn drain_respects_max_objects_bound() {
        let q = RemoteQueue::new();
        let mut objs = [[0u8; 16]; 4];
        let ptrs: Vec<NonNull<u8>> = objs
            .iter_mut()
            .map(|o| NonNull::new(o.as_mut_ptr()).unwrap())
            .collect();
        q.enqueue(ptrs[0], 4);
        let drained = q.drain(1, |_, _| {});
        // one segment is the minimum unit drained even with a bound of 1
        assert_eq!(drained, 4);
    }

    #[test]
    fn outbound_batch_flushes_on_remote_batch_threshold() {
        let key = FreeListKey::new(1, 2);
        let mut batch = OutboundBatch::new();
        let mut objs = vec![[0u8; 16]; REMOTE_BATCH + 1];
        let dest = RemoteAllocatorId(0x1000);
        let mut total_flushed = 0;
        for o in objs.iter_mut() {
            let p = NonNull::new(o.as_mut_ptr()).unwrap();
            let flushed = unsafe { batch.push(dest, p, &key, 16) };
            total_flushed += flushed.len();
        }
        assert!(total_flushed >= 1, "expected at least one auto-flush at the batch threshold");
    }

    #[test]
    fn outbound_batch_evicts_colliding_destination() {
        let key = FreeListKey::new(1, 2);
        let mut batch = OutboundBatch::new();
        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        let dest_a = RemoteAllocatorId(0x1000);
        let dest_b = RemoteAllocatorId(0x2000); // same slot as dest_a under the mask
        assert_eq!(dest_a.slot(), dest_b.slot());

        let pa = NonNull::new(a.as_mut_ptr()).unwrap();
        let pb = NonNull::new(b.as_mut_ptr()).unwrap();
        unsafe { batch.push(dest_a, pa, &key, 16) };
        let evicted = unsafe { batch.push(dest_b, pb, &key, 16) };
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, dest_a);
    }
}
