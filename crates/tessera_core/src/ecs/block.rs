//! # Data Blocks
//!
//! A data block is one pool allocation holding up to `entity_count_max`
//! entities of a single archetype, column by column:
//!
//! ```text
//! [filter data][Entity × max][Component 1 × max][Component 2 × max]...
//! ```
//!
//! Live entities always occupy slots `0..entity_count` with no holes.

use crate::memory::BlockMemory;

/// Block filter callback: `(block filter data, requested filter data)`.
pub type BlockFilterFn = fn(&[u8], &[u8]) -> bool;

/// Per-archetype rule selecting which blocks may receive an entity.
///
/// A block stores `data_size` bytes of filter data in front of its
/// columns. An entity placed with filter data only goes into a block whose
/// stored data is accepted by `matches`.
#[derive(Clone, Copy)]
pub struct BlockFilter {
    /// Bytes of filter data stored at the start of every block.
    pub data_size: u32,
    /// Decides if a block's filter data accepts the requested data.
    pub matches: BlockFilterFn,
}

impl BlockFilter {
    /// No filter data, every block accepts every entity.
    pub const NONE: Self = Self {
        data_size: 0,
        matches: accept_any,
    };

    /// Creates a filter storing `data_size` bytes per block.
    #[must_use]
    pub const fn new(data_size: u32, matches: BlockFilterFn) -> Self {
        Self { data_size, matches }
    }

    /// Filter accepting blocks whose stored data equals the requested data.
    #[must_use]
    pub const fn equal(data_size: u32) -> Self {
        Self::new(data_size, bytes_equal)
    }

    /// Checks a block's stored filter data against requested data.
    ///
    /// Empty requested data matches every block.
    #[inline]
    #[must_use]
    pub fn accepts(&self, block_data: &[u8], requested: &[u8]) -> bool {
        self.data_size == 0 || requested.is_empty() || (self.matches)(block_data, requested)
    }
}

impl Default for BlockFilter {
    fn default() -> Self {
        Self::NONE
    }
}

impl std::fmt::Debug for BlockFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockFilter")
            .field("data_size", &self.data_size)
            .finish_non_exhaustive()
    }
}

fn accept_any(_: &[u8], _: &[u8]) -> bool {
    true
}

fn bytes_equal(block_data: &[u8], requested: &[u8]) -> bool {
    block_data == requested
}

/// One block of archetype storage.
#[derive(Debug)]
pub struct DataBlock {
    memory: BlockMemory,
    entity_count: u32,
    entity_count_max: u32,
}

impl DataBlock {
    pub(crate) fn new(memory: BlockMemory, entity_count_max: u32) -> Self {
        Self {
            memory,
            entity_count: 0,
            entity_count_max,
        }
    }

    /// Returns the number of live entities.
    #[inline]
    #[must_use]
    pub const fn entity_count(&self) -> u32 {
        self.entity_count
    }

    /// Returns the capacity of the block.
    #[inline]
    #[must_use]
    pub const fn entity_count_max(&self) -> u32 {
        self.entity_count_max
    }

    /// Returns true if no more entities fit.
    #[inline]
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.entity_count >= self.entity_count_max
    }

    /// Returns true if the block holds no entities.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entity_count == 0
    }

    /// Returns the raw block memory.
    #[inline]
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.memory.bytes()
    }

    /// Returns the raw block memory, mutably.
    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.memory.bytes_mut()
    }

    /// Returns the first `size` bytes, where filter data is stored.
    #[inline]
    #[must_use]
    pub fn filter_data(&self, size: usize) -> &[u8] {
        &self.memory.bytes()[..size]
    }

    /// Claims the next free slot.
    pub(crate) fn push_slot(&mut self) -> u32 {
        debug_assert!(!self.is_full(), "Pushed into a full data block");
        let slot = self.entity_count;
        self.entity_count += 1;
        slot
    }

    /// Drops the last slot.
    pub(crate) fn pop_slot(&mut self) {
        debug_assert!(!self.is_empty(), "Popped from an empty data block");
        self.entity_count -= 1;
    }

    pub(crate) fn into_memory(self) -> BlockMemory {
        self.memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_slots() {
        let mut block = DataBlock::new(BlockMemory::zeroed(256), 2);
        assert!(block.is_empty());
        assert_eq!(block.push_slot(), 0);
        assert_eq!(block.push_slot(), 1);
        assert!(block.is_full());
        block.pop_slot();
        assert_eq!(block.entity_count(), 1);
    }

    #[test]
    fn test_filter_accepts() {
        let filter = BlockFilter::equal(4);
        assert!(filter.accepts(&[1, 2, 3, 4], &[1, 2, 3, 4]));
        assert!(!filter.accepts(&[1, 2, 3, 4], &[4, 3, 2, 1]));
        assert!(filter.accepts(&[1, 2, 3, 4], &[]));
        assert!(BlockFilter::NONE.accepts(&[], &[9]));
    }
}
