//! # Arena Allocator
//!
//! A bump allocator over a chain of data nodes. Allocations are freed all at
//! once when the arena is reset.

use super::pool::BlockMemory;
use super::{align_forward, BLOCK_ALIGNMENT};

/// Location of an allocation inside an [`Arena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ArenaSpan {
    node: u32,
    offset: u32,
    len: u32,
}

impl ArenaSpan {
    /// A span covering no bytes.
    pub const EMPTY: Self = Self {
        node: 0,
        offset: 0,
        len: 0,
    };

    /// Returns the size of the allocation in bytes.
    #[inline]
    #[must_use]
    pub const fn len(self) -> usize {
        self.len as usize
    }

    /// Returns true if the span covers no bytes.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.len == 0
    }
}

/// A bump-pointer arena made of 64-byte aligned data nodes.
///
/// When the current node cannot serve a request a new node is appended. A
/// request larger than the regular node size gets a node of its own size.
///
/// # Thread Safety
///
/// This arena is NOT thread-safe. Use one arena per operation log.
///
/// # Example
///
/// ```rust,ignore
/// let mut arena = Arena::new(16 * 1024);
///
/// let span = arena.alloc(64, 8);
/// arena.bytes_mut(span).fill(1);
///
/// // Frees everything but the first node
/// arena.reset();
/// ```
#[derive(Debug)]
pub struct Arena {
    /// Size of a regular data node.
    node_size: usize,
    /// All data nodes, never empty.
    nodes: Vec<BlockMemory>,
    /// Allocation offset inside the last node.
    cursor: usize,
}

impl Arena {
    /// Creates an arena with one data node of `node_size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `node_size` is zero.
    #[must_use]
    pub fn new(node_size: usize) -> Self {
        assert!(node_size > 0, "Arena node size must be greater than zero");
        Self {
            node_size,
            nodes: vec![BlockMemory::zeroed(node_size)],
            cursor: 0,
        }
    }

    /// Returns the regular node size in bytes.
    #[inline]
    #[must_use]
    pub const fn node_size(&self) -> usize {
        self.node_size
    }

    /// Returns the number of data nodes in use.
    #[inline]
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the number of bytes used in the current node.
    #[inline]
    #[must_use]
    pub const fn used(&self) -> usize {
        self.cursor
    }

    /// Allocates `size` zeroed bytes aligned to `alignment`.
    ///
    /// # Arguments
    ///
    /// * `size` - Number of bytes
    /// * `alignment` - Power of two up to 64 (0 is treated as 1)
    ///
    /// # Panics
    ///
    /// Panics if the alignment is not a power of two or exceeds 64.
    pub fn alloc(&mut self, size: usize, alignment: usize) -> ArenaSpan {
        let alignment = alignment.max(1);
        assert!(
            alignment.is_power_of_two() && alignment <= BLOCK_ALIGNMENT,
            "Unsupported arena alignment: {alignment}"
        );
        if size == 0 {
            return ArenaSpan::EMPTY;
        }

        let mut node = self.nodes.len() - 1;
        let mut offset = align_forward(self.cursor, alignment);
        if offset + size > self.nodes[node].len() {
            self.nodes
                .push(BlockMemory::zeroed(self.node_size.max(size)));
            node += 1;
            offset = 0;
        }
        self.cursor = offset + size;

        ArenaSpan {
            node: node as u32,
            offset: offset as u32,
            len: size as u32,
        }
    }

    /// Returns the bytes of an allocation.
    #[inline]
    #[must_use]
    pub fn bytes(&self, span: ArenaSpan) -> &[u8] {
        if span.is_empty() {
            return &[];
        }
        let start = span.offset as usize;
        &self.nodes[span.node as usize].bytes()[start..start + span.len()]
    }

    /// Returns the mutable bytes of an allocation.
    #[inline]
    pub fn bytes_mut(&mut self, span: ArenaSpan) -> &mut [u8] {
        if span.is_empty() {
            return &mut [];
        }
        let start = span.offset as usize;
        &mut self.nodes[span.node as usize].bytes_mut()[start..start + span.len()]
    }

    /// Releases every node and starts over with a single fresh node.
    ///
    /// Previously returned spans become invalid and must not be used.
    pub fn reset(&mut self) {
        self.nodes.clear();
        self.nodes.push(BlockMemory::zeroed(self.node_size));
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_allocation() {
        let mut arena = Arena::new(1024);
        let span = arena.alloc(10, 4);
        assert_eq!(span.len(), 10);
        assert_eq!(arena.bytes(span).len(), 10);
        assert_eq!(arena.used(), 10);
    }

    #[test]
    fn test_arena_alignment() {
        let mut arena = Arena::new(1024);
        let _ = arena.alloc(3, 1);
        let span = arena.alloc(8, 8);
        assert_eq!(arena.bytes(span).as_ptr() as usize % 8, 0);
        assert_eq!(arena.used(), 16);
    }

    #[test]
    fn test_arena_grows_new_node() {
        let mut arena = Arena::new(128);
        let first = arena.alloc(100, 1);
        let second = arena.alloc(100, 1);
        assert_eq!(arena.node_count(), 2);

        arena.bytes_mut(first).fill(1);
        arena.bytes_mut(second).fill(2);
        assert!(arena.bytes(first).iter().all(|&b| b == 1));
        assert!(arena.bytes(second).iter().all(|&b| b == 2));
    }

    #[test]
    fn test_arena_oversized_request() {
        let mut arena = Arena::new(128);
        let span = arena.alloc(1000, 16);
        assert_eq!(arena.bytes(span).len(), 1000);
        assert_eq!(arena.node_count(), 2);
    }

    #[test]
    fn test_arena_reset() {
        let mut arena = Arena::new(64);
        let _ = arena.alloc(60, 1);
        let _ = arena.alloc(60, 1);
        assert_eq!(arena.node_count(), 2);

        arena.reset();
        assert_eq!(arena.node_count(), 1);
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn test_arena_empty_span() {
        let mut arena = Arena::new(64);
        let span = arena.alloc(0, 8);
        assert!(span.is_empty());
        assert!(arena.bytes(span).is_empty());
        assert_eq!(arena.used(), 0);
    }
}
