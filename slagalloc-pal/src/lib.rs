// Copyright 2017 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE file). This file
// may not be copied, modified, or distributed except according to those terms.

//! Platform abstraction layer for `slagalloc`.
//!
//! The core allocator crate is generic over a [`Pal`] and never talks to the
//! operating system directly; this crate supplies the trait and one
//! concrete, `libc`-backed implementation ([`SystemPal`]). A `Pal` reserves
//! address space, commits and decommits pages within a reservation, zeroes
//! memory, supplies entropy for the core's free-list key derivation, and
//! (optionally) drives a periodic callback used for temporal decay of
//! cached address ranges.

mod system;
mod timer;

pub use system::SystemPal;

use std::ptr::NonNull;
use std::time::Duration;

/// A platform abstraction layer.
///
/// Implementations must be safe to share between threads: every method may
/// be called concurrently, from any number of threads, with no external
/// synchronisation.
///
/// # Safety
///
/// Implementors must ensure `reserve` returns address space not aliased by
/// any other live allocation or by a previous reservation that has not been
/// `release`d, and that `notify_using`/`notify_not_using`/`zero` are only
/// ever asked to operate within a range previously returned by `reserve`.
pub unsafe trait Pal: Send + Sync + 'static {
    /// Whether this PAL can invoke a callback on a periodic tick. When
    /// `false`, `register_timer` must not be called.
    const SUPPORTS_TIMERS: bool;

    /// The natural page size of the platform, in bytes. Always a power of
    /// two.
    fn page_size() -> usize;

    /// Reserve `size` bytes of address space, aligned to `size` (`size`
    /// must itself be a power of two no smaller than the page size). The
    /// range is reserved but not necessarily committed: no physical memory
    /// need back it until `notify_using` is called on some sub-range.
    /// Returns `None` on address-space exhaustion.
    fn reserve(size: usize) -> Option<NonNull<u8>>;

    /// Fully release a reservation made by `reserve`, returning the address
    /// space to the operating system. The core allocator does not call
    /// this in ordinary operation (it only ever decommits, via
    /// `notify_not_using`, and keeps reservations for the life of the
    /// process) but the method exists for deterministic teardown in tests.
    ///
    /// # Safety
    /// `base`/`size` must exactly match a single prior `reserve` call, and
    /// there must be no outstanding references into the range.
    unsafe fn release(base: NonNull<u8>, size: usize);

    /// Mark `[base, base + size)` as in use. The PAL may commit physical
    /// pages backing this range; callers must do this before touching any
    /// byte in the range.
    ///
    /// # Safety
    /// `[base, base + size)` must lie within a range returned by a prior
    /// `reserve` call, and `base`/`size` should be page-aligned.
    unsafe fn notify_using(base: NonNull<u8>, size: usize);

    /// Mark `[base, base + size)` as no longer in use. The PAL may release
    /// the physical pages backing the range without releasing the
    /// address-space reservation; a subsequent `notify_using` on the same
    /// range must make it accessible again. The contents of the range
    /// after a `notify_not_using`/`notify_using` pair are unspecified.
    ///
    /// # Safety
    /// `[base, base + size)` must lie within a range returned by a prior
    /// `reserve` call, and `base`/`size` should be page-aligned.
    unsafe fn notify_not_using(base: NonNull<u8>, size: usize);

    /// Zero `[base, base + size)`.
    ///
    /// # Safety
    /// `[base, base + size)` must be writable memory from a prior
    /// `notify_using` call.
    unsafe fn zero(base: NonNull<u8>, size: usize);

    /// Return 64 bits of entropy, used to seed the core's per-allocator
    /// free-list encoding key. Implementations should source this from the
    /// OS entropy pool rather than deriving it from, say, the current time.
    fn get_entropy64() -> u64;

    /// Register `callback` to run roughly every `period`. Only called when
    /// `SUPPORTS_TIMERS` is true. At most one callback is ever registered
    /// over the life of a process; a second call replaces the prior one.
    fn register_timer(period: Duration, callback: fn());
}
