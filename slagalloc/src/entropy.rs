//! Per-allocator entropy source.
//!
//! `LocalEntropy` is seeded once from the platform's entropy source and
//! then runs a cheap Feistel-style counter cipher to produce an unbounded
//! stream of pseudo-random 64-bit values without calling back into the OS
//! on every allocation. It is used to derive the free-list encoding keys
//! (see [`crate::freelist`]) and nothing security-sensitive beyond that —
//! it is not a general-purpose CSPRNG.

use slagalloc_pal::Pal;

pub struct LocalEntropy {
    bit_source: u64,
    local_key: u64,
    local_counter: u64,
    constant_key: u64,
}

impl LocalEntropy {
    /// Seed a fresh entropy source from `PAL`'s OS-backed entropy.
    pub fn new<P: Pal>() -> Self {
        let mut e = LocalEntropy {
            bit_source: 0,
            local_key: P::get_entropy64(),
            local_counter: P::get_entropy64(),
            constant_key: 0,
        };
        e.constant_key = e.get_next();
        e.bit_source = e.get_next();
        e
    }

    /// A key fixed for the lifetime of this `LocalEntropy`, for callers
    /// with no storage of their own to hold a per-use key.
    pub fn constant_key(&self) -> u64 {
        self.constant_key
    }

    /// One pseudo-random bit, cycled every 64 calls; far cheaper than
    /// [`Self::get_next`] for callers that only need a coin flip.
    pub fn next_bit(&mut self) -> u32 {
        let bottom_bit = self.bit_source & 1;
        self.bit_source = (bottom_bit << 63) | (self.bit_source >> 1);
        (self.bit_source & 1) as u32
    }

    /// The next 64-bit value in the stream. Has a period of 2^64.
    pub fn get_next(&mut self) -> u64 {
        let mut c = self.local_counter.wrapping_add(1);
        self.local_counter = c;
        for _ in 0..2 {
            let bottom = c & 0xffff_ffff;
            c = (c << 32) | (((bottom.wrapping_mul(self.local_key)) ^ c) >> 32);
        }
        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slagalloc_pal::SystemPal;

    #[test]
    fn get_next_is_not_constant() {
        let mut e = LocalEntropy::new::<SystemPal>();
        let a = e.get_next();
        let b = e.get_next();
        let c = e.get_next();
        assert!(a != b || b != c);
    }

    #[test]
    fn next_bit_cycles_through_0_and_1() {
        let mut e = LocalEntropy::new::<SystemPal>();
        let mut saw_zero = false;
        let mut saw_one = false;
        for _ in 0..128 {
            match e.next_bit() {
                0 => saw_zero = true,
                1 => saw_one = true,
                _ => unreachable!(),
            }
        }
        assert!(saw_zero && saw_one);
    }
}
