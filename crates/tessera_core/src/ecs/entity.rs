//! # Entity Management
//!
//! Entities are lightweight identifiers consisting of:
//! - An index, unique among living entities
//! - A generation counter for safe reuse
//!
//! An entity carries no data of its own. Inside data blocks it is stored as
//! the synthetic entity component in the first column of every archetype.

use std::collections::VecDeque;

use bytemuck::{Pod, Zeroable};

use super::component::{Component, ComponentInfo};
use crate::config::StorageConfig;

/// Unique handle of an entity.
///
/// The handle is split into two parts:
/// - Lower 32 bits: Index
/// - Upper 32 bits: Generation counter for detecting stale handles
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable)]
#[repr(transparent)]
pub struct Entity(u64);

impl Entity {
    /// Invalid entity handle.
    pub const INVALID: Self = Self(u64::MAX);

    /// Creates a handle from index and generation.
    #[inline]
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | (index as u64))
    }

    /// Returns the index portion of the handle.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    /// Returns the generation portion of the handle.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Returns the raw 64-bit value.
    #[inline]
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    /// Checks if this handle is the invalid handle.
    #[inline]
    #[must_use]
    pub const fn is_invalid(self) -> bool {
        self.0 == u64::MAX
    }

    /// Returns the description of the synthetic entity component.
    #[inline]
    #[must_use]
    pub fn info() -> ComponentInfo {
        ComponentInfo::of::<Self>()
    }
}

impl Default for Entity {
    fn default() -> Self {
        Self::INVALID
    }
}

impl Component for Entity {
    const NAME: &'static str = "tessera.entity";
}

/// Allocator of entity handles.
///
/// Destroying an entity bumps the generation of its index, so old handles
/// stop being alive. Retired indices are queued and only reused once
/// enough of them have accumulated, which keeps generations from cycling
/// quickly on a small set of indices.
#[derive(Debug)]
pub struct EntityIndex {
    /// Current generation of every index ever handed out.
    generations: Vec<u32>,
    /// Whether the current generation of an index is handed out.
    alive: Vec<bool>,
    /// Retired indices, reused in FIFO order.
    free_indices: VecDeque<u32>,
    /// Queue length required before indices are reused.
    min_free_before_reuse: usize,
    /// Upper bound of handed out indices.
    max_entity_count: u32,
}

impl EntityIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            generations: Vec::new(),
            alive: Vec::new(),
            free_indices: VecDeque::new(),
            min_free_before_reuse: config.min_free_indices_before_reuse,
            max_entity_count: config.max_entity_count,
        }
    }

    /// Returns the number of living entities.
    #[inline]
    #[must_use]
    pub fn count(&self) -> usize {
        self.generations.len() - self.free_indices.len()
    }

    /// Checks if the handle refers to a living entity.
    #[must_use]
    pub fn is_alive(&self, entity: Entity) -> bool {
        let index = entity.index() as usize;
        self.alive.get(index).copied().unwrap_or(false)
            && self.generations[index] == entity.generation()
    }

    /// Creates a new entity.
    ///
    /// # Panics
    ///
    /// Panics if the configured maximum entity count is reached.
    pub fn create(&mut self) -> Entity {
        if !self.free_indices.is_empty() && self.free_indices.len() >= self.min_free_before_reuse {
            if let Some(index) = self.free_indices.pop_front() {
                self.alive[index as usize] = true;
                return Entity::new(index, self.generations[index as usize]);
            }
        }

        let index = self.generations.len();
        assert!(
            index < self.max_entity_count as usize,
            "Moved past the maximum allowed number of entities ({})",
            self.max_entity_count
        );
        self.generations.push(0);
        self.alive.push(true);
        Entity::new(index as u32, 0)
    }

    /// Creates an entity for every slot of `out`.
    ///
    /// Bulk creation always takes fresh indices.
    ///
    /// # Returns
    ///
    /// False, with nothing created, if the batch would pass the maximum
    /// entity count.
    pub fn create_many(&mut self, out: &mut [Entity]) -> bool {
        let first = self.generations.len();
        let end = first + out.len();
        if end > self.max_entity_count as usize {
            return false;
        }

        self.generations.resize(end, 0);
        self.alive.resize(end, true);
        for (offset, slot) in out.iter_mut().enumerate() {
            *slot = Entity::new((first + offset) as u32, 0);
        }
        true
    }

    /// Destroys an entity.
    ///
    /// # Returns
    ///
    /// False if the handle was not alive.
    pub fn destroy(&mut self, entity: Entity) -> bool {
        if !self.is_alive(entity) {
            return false;
        }
        let index = entity.index();
        let generation = &mut self.generations[index as usize];
        *generation = generation.wrapping_add(1);
        self.alive[index as usize] = false;
        self.free_indices.push_back(index);
        true
    }

    /// Destroys every living entity in `entities`.
    ///
    /// # Returns
    ///
    /// The number of entities actually destroyed.
    pub fn destroy_many(&mut self, entities: &[Entity]) -> usize {
        entities.iter().filter(|&&entity| self.destroy(entity)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with_reuse(threshold: usize) -> EntityIndex {
        EntityIndex::new(&StorageConfig {
            min_free_indices_before_reuse: threshold,
            ..StorageConfig::default()
        })
    }

    #[test]
    fn test_entity_id_packing() {
        let entity = Entity::new(12345, 67890);
        assert_eq!(entity.index(), 12345);
        assert_eq!(entity.generation(), 67890);
        assert!(Entity::INVALID.is_invalid());
        assert_eq!(Entity::default(), Entity::INVALID);
    }

    #[test]
    fn test_entity_component_layout() {
        let info = Entity::info();
        assert_eq!(info.size, 8);
        assert_eq!(info.alignment, 8);
    }

    #[test]
    fn test_create_destroy() {
        let mut index = index_with_reuse(1024);
        let a = index.create();
        let b = index.create();
        assert_ne!(a, b);
        assert_eq!(index.count(), 2);

        assert!(index.destroy(a));
        assert!(!index.is_alive(a));
        assert!(index.is_alive(b));
        assert!(!index.destroy(a));
        assert_eq!(index.count(), 1);
    }

    #[test]
    fn test_next_generation_is_not_alive_before_reuse() {
        let mut index = index_with_reuse(0);
        let a = index.create();
        assert!(index.destroy(a));

        let next = Entity::new(a.index(), a.generation() + 1);
        assert!(!index.is_alive(next));
        assert!(!index.destroy(next));
        assert_eq!(index.count(), 0);

        let reused = index.create();
        assert_eq!(reused, next);
        assert!(index.is_alive(reused));
    }

    #[test]
    fn test_reuse_waits_for_threshold() {
        let mut index = index_with_reuse(2);
        let a = index.create();
        let b = index.create();

        index.destroy(a);
        // Only one retired index, a fresh one is used
        let c = index.create();
        assert_eq!(c.index(), 2);

        index.destroy(b);
        let d = index.create();
        assert_eq!(d.index(), a.index());
        assert_eq!(d.generation(), 1);
        assert!(!index.is_alive(a));
        assert!(index.is_alive(d));
    }

    #[test]
    fn test_create_many() {
        let mut index = index_with_reuse(0);
        let mut batch = [Entity::INVALID; 4];
        assert!(index.create_many(&mut batch));
        assert_eq!(index.count(), 4);
        assert!(batch.iter().all(|&e| index.is_alive(e)));
        assert_eq!(index.destroy_many(&batch[..2]), 2);
        assert_eq!(index.count(), 2);
    }

    #[test]
    fn test_create_many_respects_maximum() {
        let mut index = EntityIndex::new(&StorageConfig {
            max_entity_count: 3,
            ..StorageConfig::default()
        });
        let mut batch = [Entity::INVALID; 4];
        assert!(!index.create_many(&mut batch));
        assert_eq!(index.count(), 0);
    }

    #[test]
    fn test_unknown_index_not_alive() {
        let index = index_with_reuse(0);
        assert!(!index.is_alive(Entity::new(7, 0)));
        assert!(!index.is_alive(Entity::INVALID));
    }
}
