//! # Block Pool
//!
//! Fixed-size, cache-line aligned blocks for archetype data.
//!
//! Every archetype is assigned one pool at registration; its blocks are
//! taken from that pool and given back when they are no longer needed.

use bytemuck::{Pod, Zeroable};

use super::BLOCK_ALIGNMENT;

/// One 64-byte, 64-aligned unit of block memory.
///
/// Blocks are slices of cache lines so their start is always aligned for
/// any component with an alignment up to 64.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, align(64))]
pub struct CacheLine([u8; BLOCK_ALIGNMENT]);

/// Handle of a pool registered in the archetype index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PoolId(u32);

impl PoolId {
    /// The default pool, created from the storage configuration.
    pub const DEFAULT: Self = Self(0);

    #[inline]
    #[must_use]
    pub(crate) const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the index of the pool.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// An owned, zero-initialized, 64-byte aligned memory region.
pub struct BlockMemory {
    lines: Box<[CacheLine]>,
}

impl BlockMemory {
    /// Allocates `size` zeroed bytes, rounded up to whole cache lines.
    #[must_use]
    pub fn zeroed(size: usize) -> Self {
        let line_count = size.div_ceil(BLOCK_ALIGNMENT);
        Self {
            lines: vec![CacheLine::zeroed(); line_count].into_boxed_slice(),
        }
    }

    /// Returns the size in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len() * BLOCK_ALIGNMENT
    }

    /// Returns true if the region holds no bytes.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Views the region as bytes.
    #[inline]
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.lines)
    }

    /// Views the region as mutable bytes.
    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.lines)
    }
}

impl std::fmt::Debug for BlockMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockMemory").field("len", &self.len()).finish()
    }
}

/// A pool of equally sized blocks.
///
/// Released blocks are kept on a free list and handed out again, zeroed,
/// before any new memory is requested from the allocator.
///
/// # Thread Safety
///
/// This pool is NOT thread-safe. It is owned by the archetype index.
///
/// # Example
///
/// ```rust,ignore
/// let mut pool = BlockPool::new(16 * 1024);
///
/// let block = pool.allocate();
/// pool.release(block);
/// assert_eq!(pool.free_count(), 1);
/// ```
#[derive(Debug)]
pub struct BlockPool {
    /// Size of every block in bytes.
    block_size: usize,
    /// Released blocks ready for reuse.
    free_list: Vec<BlockMemory>,
    /// Blocks currently handed out.
    allocated_count: usize,
}

impl BlockPool {
    /// Creates an empty pool handing out blocks of `block_size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is zero or not a multiple of 64.
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        assert!(
            block_size > 0 && block_size % BLOCK_ALIGNMENT == 0,
            "Block size must be a non-zero multiple of {BLOCK_ALIGNMENT}, got {block_size}"
        );
        Self {
            block_size,
            free_list: Vec::new(),
            allocated_count: 0,
        }
    }

    /// Returns the size of every block in bytes.
    #[inline]
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the number of blocks currently handed out.
    #[inline]
    #[must_use]
    pub const fn allocated_count(&self) -> usize {
        self.allocated_count
    }

    /// Returns the number of released blocks waiting for reuse.
    #[inline]
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    /// Hands out a zeroed block.
    pub fn allocate(&mut self) -> BlockMemory {
        self.allocated_count += 1;
        match self.free_list.pop() {
            Some(mut block) => {
                block.bytes_mut().fill(0);
                block
            }
            None => BlockMemory::zeroed(self.block_size),
        }
    }

    /// Takes a block back.
    ///
    /// # Panics
    ///
    /// Panics if the block was not sized by this pool.
    pub fn release(&mut self, block: BlockMemory) {
        assert_eq!(
            block.len(),
            self.block_size,
            "Released block does not belong to this pool"
        );
        debug_assert!(self.allocated_count > 0, "Pool released more blocks than it handed out");
        self.allocated_count = self.allocated_count.saturating_sub(1);
        self.free_list.push(block);
    }

    /// Drops every cached free block.
    pub fn shrink(&mut self) {
        self.free_list.clear();
        self.free_list.shrink_to_fit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_memory_is_aligned() {
        let block = BlockMemory::zeroed(100);
        assert_eq!(block.len(), 128);
        assert_eq!(block.bytes().as_ptr() as usize % BLOCK_ALIGNMENT, 0);
        assert!(block.bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_pool_allocate_release() {
        let mut pool = BlockPool::new(1024);

        let block = pool.allocate();
        assert_eq!(block.len(), 1024);
        assert_eq!(pool.allocated_count(), 1);

        pool.release(block);
        assert_eq!(pool.allocated_count(), 0);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_pool_reuse_is_zeroed() {
        let mut pool = BlockPool::new(256);

        let mut block = pool.allocate();
        block.bytes_mut().fill(0xAB);
        pool.release(block);

        let block = pool.allocate();
        assert_eq!(pool.free_count(), 0);
        assert!(block.bytes().iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic(expected = "multiple of 64")]
    fn test_pool_rejects_unaligned_size() {
        let _ = BlockPool::new(100);
    }

    #[test]
    #[should_panic(expected = "does not belong")]
    fn test_pool_rejects_foreign_block() {
        let mut pool = BlockPool::new(256);
        pool.release(BlockMemory::zeroed(512));
    }
}
