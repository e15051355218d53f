//! Global cell identifiers and deterministic seed derivation
//!
//! Gids are allocated in contiguous blocks, one block per population, in rule
//! order, identically on every rank. Ownership is the fixed round-robin
//! partition `gid % nhosts`. Randomness is never drawn from a shared mutable
//! stream: every stochastic site derives a fresh seed from (stage seed, rule
//! label, gid) through one hash, so results are reproducible and independent
//! of rank count.

use crate::error::{NetError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::Range;

/// Globally unique cell identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Gid(u64);

impl Gid {
    /// Create a gid from its raw value
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw identifier value
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// The rank owning this gid under the round-robin partition
    pub const fn owner(&self, nhosts: usize) -> usize {
        (self.0 % nhosts as u64) as usize
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gid:{}", self.0)
    }
}

/// 32-bit deterministic hash of a label, for labels folded into seeds
pub fn seed_from_label(label: &str) -> u64 {
    let digest = Sha256::digest(label.as_bytes());
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as u64
}

/// Derive the seed for one stochastic site
///
/// Hashes (stage seed, rule label, gid) and truncates to 64 bits. Every
/// random draw in instantiation flows through a generator seeded by this
/// function, keyed by the entity the draw belongs to.
pub fn derive_seed(stage_seed: u64, label: &str, gid: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(stage_seed.to_le_bytes());
    hasher.update(label.as_bytes());
    hasher.update(gid.to_le_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

/// Monotonic block allocator for the global gid space
///
/// Each population claims one contiguous block. Blocks never overlap and are
/// never reused; exhaustion is fatal.
#[derive(Debug, Clone, Default)]
pub struct GidAllocator {
    next: u64,
}

impl GidAllocator {
    /// Create an allocator starting at gid 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the next contiguous block of `count` gids
    pub fn next_block(&mut self, count: u64) -> Result<Range<u64>> {
        let start = self.next;
        let end = start
            .checked_add(count)
            .ok_or(NetError::GidExhausted { count })?;
        self.next = end;
        Ok(start..end)
    }

    /// Gids allocated so far
    pub fn allocated(&self) -> u64 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_are_contiguous_and_disjoint() {
        let mut alloc = GidAllocator::new();
        let a = alloc.next_block(20).unwrap();
        let b = alloc.next_block(5).unwrap();
        assert_eq!(a, 0..20);
        assert_eq!(b, 20..25);
        assert_eq!(alloc.allocated(), 25);
    }

    #[test]
    fn test_allocator_overflow_is_fatal() {
        let mut alloc = GidAllocator::new();
        alloc.next_block(u64::MAX - 1).unwrap();
        assert!(matches!(
            alloc.next_block(2),
            Err(NetError::GidExhausted { .. })
        ));
    }

    #[test]
    fn test_owner_partition() {
        assert_eq!(Gid::new(0).owner(4), 0);
        assert_eq!(Gid::new(5).owner(4), 1);
        assert_eq!(Gid::new(7).owner(1), 0);
    }

    #[test]
    fn test_seed_derivation_is_stable_and_keyed() {
        let a = derive_seed(1, "E->I", 42);
        assert_eq!(a, derive_seed(1, "E->I", 42));
        assert_ne!(a, derive_seed(2, "E->I", 42));
        assert_ne!(a, derive_seed(1, "E->E", 42));
        assert_ne!(a, derive_seed(1, "E->I", 43));
    }

    #[test]
    fn test_label_hash_fits_32_bits() {
        let h = seed_from_label("background");
        assert!(h <= u32::MAX as u64);
        assert_eq!(h, seed_from_label("background"));
        assert_ne!(h, seed_from_label("Background"));
    }
}
