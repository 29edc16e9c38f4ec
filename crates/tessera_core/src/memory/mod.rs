//! # Memory Management
//!
//! Block pools for archetype storage and the byte arena backing the
//! deferred operation log.
//!
//! ## Design Philosophy
//!
//! - Blocks are fixed-size and cache-line aligned
//! - Released blocks are recycled, not returned to the allocator
//! - Arena memory is freed all at once

mod arena;
mod pool;

pub use arena::{Arena, ArenaSpan};
pub use pool::{BlockMemory, BlockPool, CacheLine, PoolId};

/// Alignment of every block and arena node, one cache line.
pub const BLOCK_ALIGNMENT: usize = 64;

/// Rounds `value` up to the next multiple of `alignment`.
///
/// An alignment of 0 or 1 leaves the value unchanged.
#[inline]
#[must_use]
pub const fn align_forward(value: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        value
    } else {
        (value + alignment - 1) & !(alignment - 1)
    }
}
