//! Recoverable and fatal error paths.
//!
//! Conditions the caller gave us bad input for (an unsupported layout, a
//! genuine out-of-memory) come back as [`AllocError`]. Conditions that
//! indicate a corrupted heap (a free-list check that didn't hold, a cycle
//! in an available-slab list that shouldn't have one) are never
//! recoverable and funnel through [`fatal_error`], which logs and aborts
//! rather than returning — continuing after a corruption signal would just
//! hand an attacker a more convenient primitive.

use core::fmt;

/// A recoverable allocator error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The requested layout cannot be produced by this allocator (for
    /// instance, an alignment larger than any size class supports).
    UnsupportedLayout,
    /// The back end could not obtain more address space or memory from the
    /// platform.
    OutOfMemory,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::UnsupportedLayout => write!(f, "unsupported layout"),
            AllocError::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

impl std::error::Error for AllocError {}

/// Log `msg` at error level and abort the process.
///
/// Used for conditions that indicate heap corruption or a client violating
/// an invariant the allocator depends on for memory safety (double free,
/// a free-list decode mismatch, a cycle in a slab list). There is no
/// well-defined way to continue once one of these has been observed.
#[cold]
#[inline(never)]
pub fn fatal_error(msg: impl fmt::Display) -> ! {
    log::error!("slagalloc: fatal error: {msg}");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_distinct() {
        assert_ne!(
            AllocError::UnsupportedLayout.to_string(),
            AllocError::OutOfMemory.to_string()
        );
    }
}
