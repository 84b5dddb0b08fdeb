//! The back end: turns the range pipeline and the pagemap into
//! chunk-and-metadata allocation for the front end.
//!
//! [`Backend`] owns the two process-wide pipelines (one for heap chunks,
//! one for slab-metadata allocations) plus the pagemap that indexes both.
//! It is the thing a [`crate::pool::Pool`] and every [`crate::local::Alloc`]
//! share a `'static` reference to.

use crate::bits::next_pow2;
use crate::config::{MAX_SIZE_BITS, MIN_CHUNK_BITS, MIN_CHUNK_SIZE, MIN_SMALL_SIZE_BITS, REFILL_SIZE_BITS};
use crate::pagemap::FlatPagemap;
use crate::range::{
    CommitRange, DecayRange, GlobalRange, LargeBuddyRange, PagemapRegisterRange, PalRange, Range,
    SmallBuddyRange, StatsRange,
};
use crate::remote::RemoteAllocatorId;
use crate::sizeclass::{sizeclass_to_size, SizeClass};
use crate::slab::SlabMetadata;
use core::ptr::NonNull;
use slagalloc_pal::Pal;

#[cfg(feature = "hardened")]
use crate::range::SubRange;

/// What a pagemap entry says about the chunk-sized granule it covers.
///
/// A bare `usize` address (not `NonNull<SlabMetadata>`/a raw pointer) is
/// used for the metadata slot so the type stays an ordinary `Copy`
/// value with no `unsafe impl Send`/`Sync` of its own to maintain — see
/// `DESIGN.md` for the rationale. This crate's buddy allocators keep
/// their own free-block bookkeeping rather than threading it through
/// pagemap entries, so there is no `boundary`/red-black-colour state left
/// to carry here.
#[derive(Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    /// Owned by the back end: unmapped, or mid-flight in a range stage.
    BackendOwned,
    Small(SizeClass),
    /// A large (chunk-direct) allocation; payload is `log2` of its size.
    Large(u8),
}

impl Default for EntryKind {
    fn default() -> Self {
        EntryKind::BackendOwned
    }
}

/// One pagemap record per `MIN_CHUNK_SIZE` granule.
///
/// `remote_key` is the owning allocator's free-list encoding key for
/// *cross-thread* frees, fixed for that allocator's whole lifetime and
/// copied into every entry for a chunk it owns. A sender batching frees
/// bound for the same destination needs one consistent key to encode the
/// whole outbound chain with, even when the individual objects come from
/// several different slabs (each with its own *local* key) owned by that
/// same destination — see `DESIGN.md`.
#[derive(Clone, Copy, Default)]
pub struct MetaEntry {
    meta_addr: usize,
    owner: RemoteAllocatorId,
    remote_key: crate::freelist::FreeListKey,
    kind: EntryKind,
}

impl MetaEntry {
    fn small(
        meta: NonNull<SlabMetadata>,
        owner: RemoteAllocatorId,
        remote_key: crate::freelist::FreeListKey,
        sc: SizeClass,
    ) -> Self {
        MetaEntry {
            meta_addr: meta.as_ptr() as usize,
            owner,
            remote_key,
            kind: EntryKind::Small(sc),
        }
    }

    fn large(owner: RemoteAllocatorId, remote_key: crate::freelist::FreeListKey, log2_size: u8) -> Self {
        MetaEntry {
            meta_addr: 0,
            owner,
            remote_key,
            kind: EntryKind::Large(log2_size),
        }
    }

    pub fn is_backend_owned(&self) -> bool {
        self.kind == EntryKind::BackendOwned
    }

    pub fn owner(&self) -> RemoteAllocatorId {
        self.owner
    }

    pub fn remote_key(&self) -> crate::freelist::FreeListKey {
        self.remote_key
    }

    pub fn sizeclass(&self) -> Option<SizeClass> {
        match self.kind {
            EntryKind::Small(sc) => Some(sc),
            _ => None,
        }
    }

    /// Object size implied by this entry: the sizeclass's exact size for
    /// small allocations, or the rounded chunk size for large ones. `0`
    /// for a backend-owned (unmapped/unowned) entry.
    pub fn object_size(&self) -> usize {
        match self.kind {
            EntryKind::BackendOwned => 0,
            EntryKind::Small(sc) => sizeclass_to_size(sc),
            EntryKind::Large(bits) => 1usize << bits,
        }
    }

    /// The owning slab's metadata record, for small allocations only.
    pub fn slab_meta(&self) -> Option<NonNull<SlabMetadata>> {
        match self.kind {
            EntryKind::Small(_) => NonNull::new(self.meta_addr as *mut SlabMetadata),
            _ => None,
        }
    }
}

/// The process-wide pipeline every thread's per-thread heap-chunk cache
/// ultimately refills from: `PalRange -> PagemapRegisterRange ->
/// LargeBuddyRange`, serialised by a spin lock (`GlobalRange`) with
/// current/peak byte counters (`StatsRange`) on top.
pub type ObjectGlobalPipeline<P> = StatsRange<
    GlobalRange<LargeBuddyRange<PagemapRegisterRange<P, MetaEntry, PalRange<P>>, MAX_SIZE_BITS, REFILL_SIZE_BITS>>,
>;

type MetaGlobalPlain<P> = GlobalRange<
    CommitRange<P, SmallBuddyRange<PagemapRegisterRange<P, MetaEntry, PalRange<P>>, MIN_SMALL_SIZE_BITS>>,
>;

/// The process-wide pipeline slab-metadata allocations are carved from: a
/// sub-chunk buddy refilling a whole chunk at a time, serialised the same
/// way as [`ObjectGlobalPipeline`]. Unlike the object pipeline, there is no
/// per-thread local cache sitting on top of this one to commit pages before
/// they're touched, so `CommitRange` lives directly in this pipeline
/// instead. Built with `SubRange`'s guard-paged indirection under the
/// `hardened` feature.
#[cfg(not(feature = "hardened"))]
pub type MetaGlobalPipeline<P> = MetaGlobalPlain<P>;
#[cfg(feature = "hardened")]
pub type MetaGlobalPipeline<P> = SubRange<MetaGlobalPlain<P>>;

/// A thread's private front cache over the global object pipeline: its
/// own decay epochs, its own commit/decommit calls, and its own small
/// buddy cache, all refilling from a `'static` reference to the one
/// shared [`ObjectGlobalPipeline`].
pub type ObjectLocalPipeline<P> =
    DecayRange<P, CommitRange<P, LargeBuddyRange<&'static ObjectGlobalPipeline<P>, MAX_SIZE_BITS, REFILL_SIZE_BITS>>>;

/// Owns the pagemap and the two global range pipelines every allocator in
/// the process ultimately shares. One instance per `Pal` type, reached via
/// [`crate::pool::global_backend`] for the crate's default [`slagalloc_pal::SystemPal`]
/// configuration.
pub struct Backend<P: Pal> {
    pagemap: &'static FlatPagemap<MetaEntry, P, MIN_CHUNK_BITS>,
    object_global: ObjectGlobalPipeline<P>,
    meta_global: MetaGlobalPipeline<P>,
}

impl<P: Pal> Backend<P> {
    /// Build a fresh backend. Reserves (but does not commit) the pagemap's
    /// full address-space table; everything else is lazy.
    ///
    /// The pagemap is leaked to `'static` here rather than owned inline:
    /// every range stage that needs to register pagemap pages
    /// (`PagemapRegisterRange`) borrows it for `'static`, and a `Backend`
    /// is itself only ever used as a process-wide singleton that outlives
    /// every thread that touches it, so leaking here costs nothing over
    /// the life of the process.
    pub fn new() -> Self {
        let pagemap: &'static FlatPagemap<MetaEntry, P, MIN_CHUNK_BITS> =
            Box::leak(Box::new(FlatPagemap::new()));

        let object_global = StatsRange::new(GlobalRange::new(LargeBuddyRange::new(PagemapRegisterRange::new(
            pagemap,
            PalRange::default(),
        ))));

        let meta_plain = GlobalRange::new(CommitRange::new(SmallBuddyRange::new(PagemapRegisterRange::new(
            pagemap,
            PalRange::default(),
        ))));
        #[cfg(not(feature = "hardened"))]
        let meta_global = meta_plain;
        #[cfg(feature = "hardened")]
        let meta_global = SubRange::new::<P>(meta_plain);

        Backend {
            pagemap,
            object_global,
            meta_global,
        }
    }

    pub fn pagemap(&self) -> &'static FlatPagemap<MetaEntry, P, MIN_CHUNK_BITS> {
        self.pagemap
    }

    /// Build a fresh per-thread object-range cache feeding from this
    /// backend's global pipeline, with its decay timer registered.
    pub fn new_object_local(&'static self) -> &'static ObjectLocalPipeline<P> {
        let cache = DecayRange::new(CommitRange::new(LargeBuddyRange::new(&self.object_global)));
        cache.leak_and_start_timer()
    }

    fn write_entry(&self, chunk: usize, size: usize, entry: MetaEntry) {
        let mut addr = chunk;
        while addr < chunk + size {
            self.pagemap.set(addr, entry);
            addr += MIN_CHUNK_SIZE;
        }
    }

    /// Carve `SlabMetadata` from the meta range, a `geometry.slab_size`-byte
    /// chunk from `object_local`, and publish the pagemap entry for every
    /// granule of the new chunk before handing either pointer back.
    pub fn alloc_chunk<O: Range>(
        &self,
        object_local: &O,
        sc: SizeClass,
        slab_size: usize,
        owner: RemoteAllocatorId,
        remote_key: crate::freelist::FreeListKey,
        slab_key: crate::freelist::FreeListKey,
    ) -> Option<(NonNull<u8>, NonNull<SlabMetadata>)> {
        let meta_raw = self.alloc_meta_data(core::mem::size_of::<SlabMetadata>())?;
        let chunk = match object_local.alloc_range(slab_size) {
            Some(c) => c,
            None => {
                self.dealloc_meta_data(meta_raw, core::mem::size_of::<SlabMetadata>());
                return None;
            }
        };

        let slab_start = chunk.as_ptr() as usize;
        let slab_end = slab_start + slab_size;
        let meta_typed = meta_raw.cast::<SlabMetadata>();
        unsafe {
            meta_typed
                .as_ptr()
                .write(SlabMetadata::new(sc, owner, slab_start, slab_end, slab_key));
        }

        self.write_entry(
            slab_start,
            slab_size,
            MetaEntry::small(meta_typed, owner, remote_key, sc),
        );
        Some((chunk, meta_typed))
    }

    /// Spec §4.6 `dealloc_chunk`: erase the pagemap entries, return the
    /// metadata record and the chunk to their respective range pipelines.
    pub fn dealloc_chunk<O: Range>(&self, object_local: &O, meta: NonNull<SlabMetadata>, chunk: NonNull<u8>, size: usize) {
        self.write_entry(chunk.as_ptr() as usize, size, MetaEntry::default());
        unsafe { core::ptr::drop_in_place(meta.as_ptr()) };
        self.dealloc_meta_data(meta.cast::<u8>(), core::mem::size_of::<SlabMetadata>());
        object_local.dealloc_range(chunk, size);
    }

    /// Allocate a large (non-small-sizeclass) object directly as a chunk,
    /// rounding `requested` up to the smallest power of two at least
    /// `MIN_CHUNK_SIZE` that can hold it.
    pub fn alloc_large<O: Range>(
        &self,
        object_local: &O,
        requested: usize,
        owner: RemoteAllocatorId,
        remote_key: crate::freelist::FreeListKey,
    ) -> Option<NonNull<u8>> {
        let size = next_pow2(requested).max(MIN_CHUNK_SIZE);
        let chunk = object_local.alloc_range(size)?;
        let log2_size = size.trailing_zeros() as u8;
        self.write_entry(chunk.as_ptr() as usize, size, MetaEntry::large(owner, remote_key, log2_size));
        Some(chunk)
    }

    pub fn dealloc_large<O: Range>(&self, object_local: &O, chunk: NonNull<u8>, size: usize) {
        self.write_entry(chunk.as_ptr() as usize, size, MetaEntry::default());
        object_local.dealloc_range(chunk, size);
    }

    /// Spec §4.6 `alloc_meta_data`: allocate `size` bytes (rounded up to a
    /// power of two) from the meta range.
    pub fn alloc_meta_data(&self, size: usize) -> Option<NonNull<u8>> {
        let rounded = next_pow2(size).max(1 << MIN_SMALL_SIZE_BITS);
        self.meta_global.alloc_range(rounded)
    }

    pub fn dealloc_meta_data(&self, p: NonNull<u8>, size: usize) {
        let rounded = next_pow2(size).max(1 << MIN_SMALL_SIZE_BITS);
        self.meta_global.dealloc_range(p, rounded);
    }

    pub fn object_global(&self) -> &ObjectGlobalPipeline<P> {
        &self.object_global
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entropy::LocalEntropy;
    use crate::freelist::FreeListKey;
    use crate::sizeclass::{size_to_sizeclass, SlabGeometry};
    use slagalloc_pal::SystemPal;

    fn key() -> crate::freelist::FreeListKey {
        let mut e = LocalEntropy::new::<SystemPal>();
        FreeListKey::new(e.get_next(), e.get_next())
    }

    #[test]
    fn alloc_and_dealloc_chunk_roundtrips_pagemap_entries() {
        let backend: Backend<SystemPal> = Backend::new();
        let sc = size_to_sizeclass(48);
        let geo = SlabGeometry::of(sc);
        let owner = RemoteAllocatorId::none();

        let (chunk, meta) = backend
            .alloc_chunk(backend.object_global(), sc, geo.slab_size, owner, key(), key())
            .expect("alloc_chunk failed");

        let entry = backend.pagemap().get(chunk.as_ptr() as usize);
        assert!(!entry.is_backend_owned());
        assert_eq!(entry.sizeclass(), Some(sc));
        assert_eq!(entry.slab_meta(), Some(meta));

        backend.dealloc_chunk(backend.object_global(), meta, chunk, geo.slab_size);
        let entry_after = backend.pagemap().get(chunk.as_ptr() as usize);
        assert!(entry_after.is_backend_owned());
    }

    #[test]
    fn alloc_large_rounds_up_to_a_power_of_two_chunk() {
        let backend: Backend<SystemPal> = Backend::new();
        let owner = RemoteAllocatorId::none();
        let chunk = backend
            .alloc_large(backend.object_global(), 100_000, owner, key())
            .expect("alloc_large failed");
        let entry = backend.pagemap().get(chunk.as_ptr() as usize);
        assert_eq!(entry.object_size(), 131072); // next_pow2(100_000)
        backend.dealloc_large(backend.object_global(), chunk, entry.object_size());
    }

    #[test]
    fn meta_data_alloc_is_distinct_from_object_chunks() {
        let backend: Backend<SystemPal> = Backend::new();
        let a = backend.alloc_meta_data(64).expect("meta alloc failed");
        let b = backend.alloc_meta_data(64).expect("meta alloc failed");
        assert_ne!(a, b);
        backend.dealloc_meta_data(a, 64);
        backend.dealloc_meta_data(b, 64);
    }
}
