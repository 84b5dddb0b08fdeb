//! Encoded intrusive free lists.
//!
//! Every free object's first machine word is overwritten with an encoded
//! pointer to the next free object in the same list. The encoding is not
//! for confidentiality — it is a cheap corruption detector and a defence
//! against "free-list pivoting" (an attacker who can write one heap value
//! overwriting a next-pointer to redirect a future allocation). Decoding
//! the raw value requires a key that is never stored in a predictable
//! location relative to the data the attacker controls.

use crate::error::fatal_error;
use core::ptr::NonNull;

/// The key used to encode/decode one slab's free list. `k1` masks the
/// stored value; `k2` ties the encoding to the encoded object's own
/// address so that copying a next-pointer to a different slot changes its
/// expected decode, rather than merely to a different slab so a pointer
/// can't be replayed elsewhere.
#[derive(Clone, Copy)]
pub struct FreeListKey {
    k1: u64,
    k2: u64,
}

impl Default for FreeListKey {
    /// Never used to encode a live object — only as the `MetaEntry`
    /// filler for backend-owned (unmapped) pagemap granules, which carry
    /// no free-list chain to decode.
    fn default() -> Self {
        FreeListKey { k1: 0, k2: 0 }
    }
}

impl FreeListKey {
    pub fn new(k1: u64, k2: u64) -> Self {
        FreeListKey { k1, k2 }
    }

    pub(crate) fn encode(&self, self_addr: usize, next_addr: usize) -> usize {
        let next = next_addr as u64;
        let self_a = self_addr as u64;
        (next ^ self.k1 ^ self_a.wrapping_mul(self.k2)) as usize
    }

    pub(crate) fn decode(&self, self_addr: usize, encoded: usize) -> usize {
        // XOR-based encoding with a self-address-dependent term is its own
        // inverse under the same self_addr.
        self.encode(self_addr, encoded)
    }
}

/// Appends to the head of a free list as objects are locally deallocated.
/// Each push overwrites the freed object's first word with an encoded
/// pointer to the previous head.
pub struct FreeListBuilder {
    head: Option<NonNull<u8>>,
    tail: Option<NonNull<u8>>,
    len: usize,
}

impl Default for FreeListBuilder {
    fn default() -> Self {
        FreeListBuilder {
            head: None,
            tail: None,
            len: 0,
        }
    }
}

impl FreeListBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Push `p` onto the head of the list.
    ///
    /// # Safety
    /// `p` must point to a live allocation of at least one machine word
    /// that the caller has exclusive access to (it is about to be freed).
    pub unsafe fn push(&mut self, p: NonNull<u8>, key: &FreeListKey) {
        let next_addr = self.head.map_or(0, |h| h.as_ptr() as usize);
        let encoded = key.encode(p.as_ptr() as usize, next_addr);
        (p.as_ptr() as *mut usize).write(encoded);
        if self.tail.is_none() {
            self.tail = Some(p);
        }
        self.head = Some(p);
        self.len += 1;
    }

    /// Take the list's contents as a (first, last, count) segment, for
    /// splicing onto an MPSC queue in one step, leaving this builder empty.
    pub fn take_segment(&mut self) -> Option<(NonNull<u8>, NonNull<u8>, usize)> {
        let first = self.head.take()?;
        let last = self.tail.take().unwrap();
        let len = self.len;
        self.len = 0;
        Some((first, last, len))
    }

    /// Pop and decode a single object off the head, leaving the rest of
    /// the list intact. This is the allocator fast path's single-object
    /// pop, as distinct from [`Self::take_segment`]/[`Self::take_up_to`]
    /// which hand back whole still-encoded segments for bulk transfer.
    pub fn pop(&mut self, key: &FreeListKey) -> Option<NonNull<u8>> {
        let head = self.head?;
        let encoded = unsafe { (head.as_ptr() as *const usize).read() };
        let next_addr = key.decode(head.as_ptr() as usize, encoded);
        self.head = NonNull::new(next_addr as *mut u8);
        if self.head.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        Some(head)
    }

    /// Reconstruct a builder from a previously-taken `(first, last, count)`
    /// segment (the shape [`Self::take_segment`]/[`Self::take_up_to`] hand
    /// back), so it can be iterated or drained again by a different owner —
    /// e.g. the refill slow path re-homing a slab's drained segment into a
    /// thread's local ready list under a different key.
    pub fn from_segment(first: NonNull<u8>, last: NonNull<u8>, len: usize) -> Self {
        FreeListBuilder {
            head: Some(first),
            tail: Some(last),
            len,
        }
    }

    /// Turn this builder into an iterator that consumes the list, checking
    /// each decoded link against `slab_range` and aborting on mismatch.
    pub fn into_iter(self, key: FreeListKey, slab_range: (usize, usize)) -> FreeListIter {
        FreeListIter {
            next: self.head,
            key,
            slab_range,
        }
    }

    /// Split off the first `n` objects (from the head) as their own
    /// segment, leaving the remainder (if any) in `self`. Unlike
    /// [`Self::take_segment`] this can leave the builder non-empty, which
    /// is what the refill slow path needs: spec §4.1/§4.8 size `n` to a
    /// sizeclass's `wake_threshold` so one slab can satisfy several
    /// refills instead of handing its whole free queue to one thread.
    ///
    /// Returns `None` if the builder is empty. If `n >= self.len()` this
    /// behaves exactly like [`Self::take_segment`].
    pub fn take_up_to(&mut self, n: usize, key: &FreeListKey) -> Option<(NonNull<u8>, NonNull<u8>, usize)> {
        if n == 0 || self.head.is_none() {
            return None;
        }
        if n >= self.len {
            return self.take_segment();
        }

        let head = self.head.unwrap();
        let mut cur = head;
        for _ in 0..n - 1 {
            let encoded = unsafe { (cur.as_ptr() as *const usize).read() };
            let next_addr = key.decode(cur.as_ptr() as usize, encoded);
            cur = NonNull::new(next_addr as *mut u8)
                .unwrap_or_else(|| fatal_error("take_up_to: free list shorter than its own length"));
        }

        // `cur` is the nth node; splice it off by re-terminating its word
        // as if it were the tail of a fresh list of its own.
        let tail_encoded = unsafe { (cur.as_ptr() as *const usize).read() };
        let new_head_addr = key.decode(cur.as_ptr() as usize, tail_encoded);
        let terminator = key.encode(cur.as_ptr() as usize, 0);
        unsafe { (cur.as_ptr() as *mut usize).write(terminator) };

        self.head = NonNull::new(new_head_addr as *mut u8);
        self.len -= n;
        Some((head, cur, n))
    }
}

/// Consumes a free list from the head, decoding and bounds-checking each
/// link as it goes.
pub struct FreeListIter {
    next: Option<NonNull<u8>>,
    key: FreeListKey,
    slab_range: (usize, usize),
}

impl Iterator for FreeListIter {
    type Item = NonNull<u8>;

    fn next(&mut self) -> Option<NonNull<u8>> {
        let cur = self.next?;
        let encoded = unsafe { (cur.as_ptr() as *const usize).read() };
        let decoded = self.key.decode(cur.as_ptr() as usize, encoded);

        if decoded == 0 {
            self.next = None;
            return Some(cur);
        }

        let (lo, hi) = self.slab_range;
        if decoded < lo || decoded >= hi {
            fatal_error(format_args!(
                "corrupted free list: decoded next-pointer {decoded:#x} is outside slab [{lo:#x}, {hi:#x})"
            ));
        }

        self.next = NonNull::new(decoded as *mut u8);
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_consume_roundtrips_in_lifo_order() {
        let key = FreeListKey::new(0x1234_5678_9abc_def0, 0x0fed_cba9_8765_4321);
        let mut objs = [[0u8; 16]; 4];
        let mut builder = FreeListBuilder::new();
        let ptrs: Vec<NonNull<u8>> = objs
            .iter_mut()
            .map(|o| NonNull::new(o.as_mut_ptr()).unwrap())
            .collect();

        for p in &ptrs {
            unsafe { builder.push(*p, &key) };
        }

        let lo = ptrs.iter().map(|p| p.as_ptr() as usize).min().unwrap();
        let hi = ptrs.iter().map(|p| p.as_ptr() as usize).max().unwrap() + 16;
        let iter = builder.into_iter(key, (lo, hi));
        let popped: Vec<NonNull<u8>> = iter.collect();

        let mut expected = ptrs;
        expected.reverse();
        assert_eq!(popped, expected);
    }

    #[test]
    fn take_segment_reports_correct_bounds_and_count() {
        let key = FreeListKey::new(1, 2);
        let mut objs = [[0u8; 16]; 3];
        let mut builder = FreeListBuilder::new();
        let ptrs: Vec<NonNull<u8>> = objs
            .iter_mut()
            .map(|o| NonNull::new(o.as_mut_ptr()).unwrap())
            .collect();
        for p in &ptrs {
            unsafe { builder.push(*p, &key) };
        }
        let (first, last, count) = builder.take_segment().unwrap();
        assert_eq!(count, 3);
        assert_eq!(first, ptrs[2]);
        assert_eq!(last, ptrs[0]);
        assert!(builder.is_empty());
    }

    #[test]
    fn take_up_to_leaves_remainder_in_builder() {
        let key = FreeListKey::new(7, 9);
        let mut objs = [[0u8; 16]; 5];
        let mut builder = FreeListBuilder::new();
        let ptrs: Vec<NonNull<u8>> = objs
            .iter_mut()
            .map(|o| NonNull::new(o.as_mut_ptr()).unwrap())
            .collect();
        for p in &ptrs {
            unsafe { builder.push(*p, &key) };
        }
        // pushed in order 0,1,2,3,4 so the list head-to-tail is 4,3,2,1,0
        let (first, _last, count) = builder.take_up_to(2, &key).unwrap();
        assert_eq!(count, 2);
        assert_eq!(first, ptrs[4]);
        assert_eq!(builder.len(), 3);

        let lo = ptrs.iter().map(|p| p.as_ptr() as usize).min().unwrap();
        let hi = ptrs.iter().map(|p| p.as_ptr() as usize).max().unwrap() + 16;
        let taken: Vec<NonNull<u8>> = FreeListIter {
            next: Some(first),
            key,
            slab_range: (lo, hi),
        }
        .collect();
        assert_eq!(taken, vec![ptrs[4], ptrs[3]]);

        let rest: Vec<NonNull<u8>> = builder.into_iter(key, (lo, hi)).collect();
        assert_eq!(rest, vec![ptrs[2], ptrs[1], ptrs[0]]);
    }

    #[test]
    fn pop_yields_objects_in_lifo_order_and_updates_len() {
        let key = FreeListKey::new(11, 13);
        let mut objs = [[0u8; 16]; 3];
        let mut builder = FreeListBuilder::new();
        let ptrs: Vec<NonNull<u8>> = objs
            .iter_mut()
            .map(|o| NonNull::new(o.as_mut_ptr()).unwrap())
            .collect();
        for p in &ptrs {
            unsafe { builder.push(*p, &key) };
        }
        assert_eq!(builder.pop(&key), Some(ptrs[2]));
        assert_eq!(builder.len(), 2);
        assert_eq!(builder.pop(&key), Some(ptrs[1]));
        assert_eq!(builder.pop(&key), Some(ptrs[0]));
        assert_eq!(builder.pop(&key), None);
        assert!(builder.is_empty());
    }

    #[test]
    fn take_up_to_n_at_least_len_behaves_like_take_segment() {
        let key = FreeListKey::new(3, 4);
        let mut objs = [[0u8; 16]; 2];
        let mut builder = FreeListBuilder::new();
        let ptrs: Vec<NonNull<u8>> = objs
            .iter_mut()
            .map(|o| NonNull::new(o.as_mut_ptr()).unwrap())
            .collect();
        for p in &ptrs {
            unsafe { builder.push(*p, &key) };
        }
        let (_, _, count) = builder.take_up_to(100, &key).unwrap();
        assert_eq!(count, 2);
        assert!(builder.is_empty());
    }
}
