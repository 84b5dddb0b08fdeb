//! Per-slab bookkeeping and the available-slab list it lives on.
//!
//! Every chunk carved for a small size class gets exactly one
//! [`SlabMetadata`] record (see `DESIGN.md` for why this crate keeps one
//! slab per chunk rather than packing several slabs into a chunk). The
//! record tracks the slab's own free queue plus the doubly-linked-list
//! node that lets an allocator find it again via its per-size-class
//! [`SeqSet`] of "slabs with at least one object to spare".

use crate::error::fatal_error;
use crate::freelist::{FreeListBuilder, FreeListKey};
use crate::remote::RemoteAllocatorId;
use crate::sizeclass::SizeClass;
use core::cell::Cell;
use core::ptr::NonNull;

/// The intrusive doubly-linked-list node embedded in every [`SlabMetadata`].
/// Must be the first field of any type used with [`SeqSet`] so that a
/// `NonNull<T>` and a `NonNull<SeqSetLinks>` are interconvertible by a
/// plain pointer cast (no `offset_of!` bookkeeping needed).
#[repr(C)]
pub struct SeqSetLinks {
    next: Cell<*mut SeqSetLinks>,
    prev: Cell<*mut SeqSetLinks>,
}

impl SeqSetLinks {
    const fn new() -> Self {
        SeqSetLinks {
            next: Cell::new(core::ptr::null_mut()),
            prev: Cell::new(core::ptr::null_mut()),
        }
    }

    fn is_linked(&self) -> bool {
        !self.next.get().is_null()
    }

    fn unlink(&self) {
        self.next.set(core::ptr::null_mut());
        self.prev.set(core::ptr::null_mut());
    }
}

/// Marker for types embeddable in a [`SeqSet`]. `links()` must always
/// return a reference to the same field, and that field must be `Self`'s
/// first (see the `#[repr(C)]` requirement on [`SeqSetLinks`]).
///
/// # Safety
/// Implementors must not move once a value has been inserted into a
/// `SeqSet` — the set links neighbouring nodes together via raw pointers
/// into the node itself, not via indices, so moving a linked node
/// invalidates its neighbours' pointers. In this crate every `SlabMetadata`
/// is heap-allocated once (from the meta range) and never relocated, which
/// satisfies this.
pub unsafe trait SeqSetNode {
    fn links(&self) -> &SeqSetLinks;
}

/// A small intrusive doubly-linked ring used as an allocator's per-size-class
/// "slabs with room to spare" list. Iteration asserts `curr.next.prev ==
/// curr` at every step, turning a double-insert (e.g.
/// from a double free re-linking an already-linked slab) into an immediate
/// fatal error instead of an infinite loop or silent corruption.
pub struct SeqSet<T> {
    head: SeqSetLinks,
    _marker: core::marker::PhantomData<*mut T>,
}

impl<T: SeqSetNode> Default for SeqSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: SeqSetNode> SeqSet<T> {
    pub fn new() -> Self {
        SeqSet {
            head: SeqSetLinks::new(),
            _marker: core::marker::PhantomData,
        }
    }

    fn head_ptr(&self) -> *mut SeqSetLinks {
        &self.head as *const SeqSetLinks as *mut SeqSetLinks
    }

    pub fn is_empty(&self) -> bool {
        !self.head.is_linked()
    }

    /// Insert `node` immediately after the head (most-recently-inserted
    /// slab first), matching the original's insertion order.
    ///
    /// # Safety
    /// `node` must not already be linked into this or any other `SeqSet`.
    pub unsafe fn insert(&mut self, node: NonNull<T>) {
        let links = node.as_ptr() as *mut SeqSetLinks;
        if (*links).is_linked() {
            fatal_error("SeqSet::insert on an already-linked node (double free?)");
        }
        let head = self.head_ptr();
        if !(*head).is_linked() {
            (*head).next.set(head);
            (*head).prev.set(head);
        }
        let old_first = (*head).next.get();
        (*links).next.set(old_first);
        (*links).prev.set(head);
        (*old_first).prev.set(links);
        (*head).next.set(links);
    }

    /// Remove `node` from wherever it sits in the ring.
    ///
    /// # Safety
    /// `node` must currently be linked into this `SeqSet`.
    pub unsafe fn remove(&mut self, node: NonNull<T>) {
        let links = node.as_ptr() as *mut SeqSetLinks;
        let next = (*links).next.get();
        let prev = (*links).prev.get();
        if next.is_null() || (*next).prev.get() != links {
            fatal_error("SeqSet::remove on a corrupted ring (double free?)");
        }
        (*prev).next.set(next);
        (*next).prev.set(prev);
        (*links).unlink();
        let head = self.head_ptr();
        if next == head && prev == head {
            // ring is now empty; leave head unlinked so is_empty() is cheap
            (*head).unlink();
        }
    }

    /// Pop and return the first slab in the ring, if any.
    pub fn pop_front(&mut self) -> Option<NonNull<T>> {
        let head = self.head_ptr();
        if unsafe { !(*head).is_linked() } {
            return None;
        }
        let first = unsafe { (*head).next.get() };
        if first == head {
            return None;
        }
        let node = unsafe { NonNull::new_unchecked(first as *mut T) };
        unsafe { self.remove(node) };
        Some(node)
    }

    /// Walk the ring from the head, yielding every linked node and
    /// checking the cycle invariant at each step.
    pub fn iterate(&self) -> SeqSetIter<'_, T> {
        SeqSetIter {
            head: self.head_ptr(),
            cur: if self.is_empty() {
                core::ptr::null_mut()
            } else {
                unsafe { (*self.head_ptr()).next.get() }
            },
            _marker: core::marker::PhantomData,
        }
    }
}

pub struct SeqSetIter<'a, T> {
    head: *mut SeqSetLinks,
    cur: *mut SeqSetLinks,
    _marker: core::marker::PhantomData<&'a SeqSet<T>>,
}

impl<'a, T> Iterator for SeqSetIter<'a, T> {
    type Item = NonNull<T>;

    fn next(&mut self) -> Option<NonNull<T>> {
        if self.cur.is_null() || self.cur == self.head {
            return None;
        }
        let cur = self.cur;
        unsafe {
            let next = (*cur).next.get();
            if (*next).prev.get() != cur {
                fatal_error("SeqSet: cycle invariant violated (curr.next.prev != curr)");
            }
            self.cur = next;
            Some(NonNull::new_unchecked(cur as *mut T))
        }
    }
}

/// Per-slab record: free queue, outstanding-object accounting, and the
/// available-list link node.
///
/// `used` counts objects currently checked out of the slab (taken by a
/// local alloc fast path or a refill drain, not yet freed back). It starts
/// at `0` on a freshly carved slab (nothing has been handed out yet) and
/// is bumped by the refill path as it drains objects into a thread's local
/// free list, and dropped by one on every local dealloc that lands on
/// this slab. `used == objects_per_slab` means the slab has nothing left
/// to give (removed from the available list); `used == 0` after having
/// been nonzero means every object is back, and the slab is returned to
/// the back end. See `DESIGN.md` for the rationale behind this accounting
/// scheme.
#[repr(C)]
pub struct SlabMetadata {
    links: SeqSetLinks,
    free: FreeListBuilder,
    key: FreeListKey,
    used: Cell<isize>,
    sizeclass: SizeClass,
    owner: RemoteAllocatorId,
    slab_start: usize,
    slab_end: usize,
}

unsafe impl SeqSetNode for SlabMetadata {
    fn links(&self) -> &SeqSetLinks {
        &self.links
    }
}

impl SlabMetadata {
    pub fn new(sizeclass: SizeClass, owner: RemoteAllocatorId, slab_start: usize, slab_end: usize, key: FreeListKey) -> Self {
        SlabMetadata {
            links: SeqSetLinks::new(),
            free: FreeListBuilder::new(),
            key,
            used: Cell::new(0),
            sizeclass,
            owner,
            slab_start,
            slab_end,
        }
    }

    pub fn sizeclass(&self) -> SizeClass {
        self.sizeclass
    }

    pub fn owner(&self) -> RemoteAllocatorId {
        self.owner
    }

    pub fn range(&self) -> (usize, usize) {
        (self.slab_start, self.slab_end)
    }

    pub fn key(&self) -> FreeListKey {
        self.key
    }

    pub fn free_builder_mut(&mut self) -> &mut FreeListBuilder {
        &mut self.free
    }

    pub fn used(&self) -> isize {
        self.used.get()
    }

    /// Called by the refill slow path as it takes `n` objects out of this
    /// slab's free queue into a thread-local cache.
    pub fn note_checked_out(&self, n: usize) {
        self.used.set(self.used.get() + n as isize);
    }

    /// Called on a local dealloc landing on this slab. Returns `true` if
    /// the slab is now fully free (every object has been returned) and
    /// should be extracted from the available list and handed back to the
    /// back end.
    pub fn note_returned(&self) -> bool {
        let new = self.used.get() - 1;
        self.used.set(new);
        new == 0
    }

    /// `true` once the slab has handed out every object it has (it should
    /// not be drained from further, and should be off the available list).
    pub fn is_fully_checked_out(&self, objects_per_slab: usize) -> bool {
        self.used.get() as usize >= objects_per_slab
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sizeclass::size_to_sizeclass;

    fn meta(start: usize, end: usize) -> Box<SlabMetadata> {
        Box::new(SlabMetadata::new(
            size_to_sizeclass(48),
            RemoteAllocatorId::none(),
            start,
            end,
            FreeListKey::new(1, 2),
        ))
    }

    #[test]
    fn seqset_insert_pop_front_is_lifo() {
        let a = meta(0, 16);
        let b = meta(16, 32);
        let c = meta(32, 48);
        let pa = NonNull::from(Box::leak(a));
        let pb = NonNull::from(Box::leak(b));
        let pc = NonNull::from(Box::leak(c));

        let mut set: SeqSet<SlabMetadata> = SeqSet::new();
        unsafe {
            set.insert(pa);
            set.insert(pb);
            set.insert(pc);
        }
        assert_eq!(set.pop_front(), Some(pc));
        assert_eq!(set.pop_front(), Some(pb));
        assert_eq!(set.pop_front(), Some(pa));
        assert!(set.is_empty());

        unsafe {
            drop(Box::from_raw(pa.as_ptr()));
            drop(Box::from_raw(pb.as_ptr()));
            drop(Box::from_raw(pc.as_ptr()));
        }
    }

    #[test]
    fn seqset_remove_from_middle() {
        let a = meta(0, 16);
        let b = meta(16, 32);
        let pa = NonNull::from(Box::leak(a));
        let pb = NonNull::from(Box::leak(b));
        let mut set: SeqSet<SlabMetadata> = SeqSet::new();
        unsafe {
            set.insert(pa);
            set.insert(pb);
            set.remove(pa);
        }
        assert_eq!(set.pop_front(), Some(pb));
        assert!(set.is_empty());
        unsafe {
            drop(Box::from_raw(pa.as_ptr()));
            drop(Box::from_raw(pb.as_ptr()));
        }
    }

    #[test]
    fn used_counter_signals_fully_checked_out_and_fully_free() {
        let m = meta(0, 16);
        m.note_checked_out(3);
        assert!(!m.is_fully_checked_out(4));
        m.note_checked_out(1);
        assert!(m.is_fully_checked_out(4));
        assert!(!m.note_returned());
        assert!(!m.note_returned());
        assert!(!m.note_returned());
        assert!(m.note_returned());
    }
}
