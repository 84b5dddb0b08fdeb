//! Global pool of idle allocator states.
//!
//! A thread's [`crate::local::Alloc`] is acquired from here on first use
//! and returned on `teardown`/thread exit, so repeated thread creation
//! doesn't cost a fresh back-end wiring (and fresh thread-local decay
//! timer registration) every time. Two independent structures track the
//! allocators this pool knows about: a lock-free LIFO stack of idle
//! states (the fast acquire/release path) and a separate append-only
//! iteration list of every allocator ever created, used only by
//! [`Pool::debug_check_empty`] (§4.10.1) and never touched on the hot
//! path.

use crate::backend::Backend;
use core::sync::atomic::{AtomicPtr, Ordering};
use slagalloc_pal::{Pal, SystemPal};
use spin::{Mutex, Once};

/// One pool-managed allocator state plus its free-stack link. `alloc`
/// must stay the first field: [`Pool::release`] casts a
/// `&mut Alloc<P>` straight back to `*mut PoolNode<P>` rather than
/// threading an extra pointer through the public API, relying on
/// `repr(C)` field order to make that cast exact.
#[repr(C)]
struct PoolNode<P: Pal> {
    alloc: crate::local::Alloc<P>,
    next: AtomicPtr<PoolNode<P>>,
}

/// Lock-free Treiber stack of idle [`PoolNode`]s, plus the all-allocators
/// iteration list required by `debug_check_empty`.
pub struct Pool<P: Pal> {
    backend: &'static Backend<P>,
    idle: AtomicPtr<PoolNode<P>>,
    all: Mutex<Vec<*mut PoolNode<P>>>,
}

// `idle`/`all` only ever hold pointers to heap nodes this pool leaked and
// owns for the life of the process; every access goes through the atomic
// stack or the mutex, so sharing `&Pool` across threads is sound.
unsafe impl<P: Pal> Sync for Pool<P> {}
unsafe impl<P: Pal> Send for Pool<P> {}

impl<P: Pal> Pool<P> {
    fn new(backend: &'static Backend<P>) -> Self {
        Pool {
            backend,
            idle: AtomicPtr::new(core::ptr::null_mut()),
            all: Mutex::new(Vec::new()),
        }
    }

    /// Pop an idle allocator off the stack, or build a fresh one wired to
    /// this pool's backend if the stack is empty.
    pub fn acquire(&'static self) -> &'static mut crate::local::Alloc<P> {
        loop {
            let head = self.idle.load(Ordering::Acquire);
            if head.is_null() {
                break;
            }
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            if self
                .idle
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return unsafe { &mut (*head).alloc };
            }
        }

        let node = Box::leak(Box::new(PoolNode {
            alloc: crate::local::Alloc::new(self.backend),
            next: AtomicPtr::new(core::ptr::null_mut()),
        }));
        self.all.lock().push(node as *mut PoolNode<P>);
        &mut node.alloc
    }

    /// Return an allocator to the idle stack. `alloc` must be a
    /// `&'static mut` previously handed out by [`Self::acquire`] on this
    /// same pool.
    pub fn release(&'static self, alloc: &'static mut crate::local::Alloc<P>) {
        alloc.flush();
        let node = alloc as *mut crate::local::Alloc<P> as *mut PoolNode<P>;
        loop {
            let head = self.idle.load(Ordering::Acquire);
            unsafe { (*node).next.store(head, Ordering::Release) };
            if self
                .idle
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Spec §4.10.1: walk every allocator this pool has ever created
    /// (live or idle) and check that each one's bookkeeping is internally
    /// consistent. Intended for tests, not production use.
    #[cfg(any(test, feature = "debug-check-empty"))]
    pub fn debug_check_empty(&self) -> bool {
        self.all
            .lock()
            .iter()
            .all(|&node| unsafe { (*node).alloc.debug_check_empty() })
    }
}

static GLOBAL_BACKEND: Once<Backend<SystemPal>> = Once::new();
static GLOBAL_POOL: Once<Pool<SystemPal>> = Once::new();

/// The process-wide back end for the crate's default [`SystemPal`]
/// configuration, lazily built on first use.
pub fn global_backend() -> &'static Backend<SystemPal> {
    GLOBAL_BACKEND.call_once(Backend::new)
}

/// The process-wide allocator pool for [`SystemPal`], lazily built on
/// first use. Declared as a concrete, non-generic singleton (rather than
/// one keyed by `P`) because a `static` item cannot mention a generic
/// type parameter of the function that would otherwise parameterise it;
/// embedders that need a different `Pal` construct their own `Pool`
/// directly instead of going through this accessor.
pub fn global_pool() -> &'static Pool<SystemPal> {
    GLOBAL_POOL.call_once(|| Pool::new(global_backend()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_without_release_builds_distinct_allocators() {
        let pool = global_pool();
        let a = pool.acquire();
        let b = pool.acquire();
        assert_ne!(a as *const _, b as *const _);
        pool.release(a);
        pool.release(b);
    }

    #[test]
    fn release_then_acquire_reuses_the_same_node() {
        let pool = global_pool();
        let a = pool.acquire();
        let a_ptr = a as *mut crate::local::Alloc<SystemPal>;
        pool.release(a);
        let b = pool.acquire();
        assert_eq!(a_ptr, b as *mut crate::local::Alloc<SystemPal>);
        pool.release(b);
    }

    #[test]
    fn debug_check_empty_holds_for_freshly_acquired_allocators() {
        let pool = global_pool();
        let a = pool.acquire();
        pool.release(a);
        assert!(pool.debug_check_empty());
    }
}
