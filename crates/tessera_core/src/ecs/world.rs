//! # World
//!
//! Couples the entity index with entity storage, so destroying an entity
//! both retires its handle and frees its data.

use super::archetype::{Archetype, ArchetypeDescriptor};
use super::component::Component;
use super::entity::{Entity, EntityIndex};
use super::operations::EntityOperations;
use super::storage::EntityStorage;
use crate::config::StorageConfig;

/// Entity handles plus their component data.
///
/// # Example
///
/// ```rust,ignore
/// let mut world = World::new(&StorageConfig::default());
/// let mover = world.register_archetype(
///     &ArchetypeDescriptor::new("Mover").with::<Position>().with::<Velocity>(),
/// );
///
/// let entity = world.create();
/// world.set_archetype(entity, mover);
/// world.get_mut::<Velocity>(entity).unwrap().x = 1.0;
/// ```
#[derive(Debug)]
pub struct World {
    entities: EntityIndex,
    storage: EntityStorage,
}

impl World {
    /// Creates an empty world.
    #[must_use]
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            entities: EntityIndex::new(config),
            storage: EntityStorage::new(config),
        }
    }

    /// Returns the entity index.
    #[inline]
    #[must_use]
    pub const fn entity_index(&self) -> &EntityIndex {
        &self.entities
    }

    /// Returns the entity index mutably, e.g. to reserve handles for
    /// recorded operations.
    #[inline]
    pub fn entity_index_mut(&mut self) -> &mut EntityIndex {
        &mut self.entities
    }

    /// Returns the storage.
    #[inline]
    #[must_use]
    pub const fn storage(&self) -> &EntityStorage {
        &self.storage
    }

    /// Returns the storage mutably.
    #[inline]
    pub fn storage_mut(&mut self) -> &mut EntityStorage {
        &mut self.storage
    }

    /// Creates an entity without data.
    pub fn create(&mut self) -> Entity {
        self.entities.create()
    }

    /// Creates `count` entities without data.
    ///
    /// # Returns
    ///
    /// An empty list if the batch would pass the maximum entity count.
    pub fn create_many(&mut self, count: usize) -> Vec<Entity> {
        let mut entities = vec![Entity::INVALID; count];
        if self.entities.create_many(&mut entities) {
            entities
        } else {
            tracing::error!("Cannot create {count} entities, the entity index is exhausted");
            Vec::new()
        }
    }

    /// Destroys an entity and its data.
    ///
    /// # Returns
    ///
    /// False if the entity was not alive.
    pub fn destroy(&mut self, entity: Entity) -> bool {
        if !self.entities.destroy(entity) {
            return false;
        }
        self.storage.erase_data(entity);
        true
    }

    /// Checks if the handle refers to a living entity.
    #[inline]
    #[must_use]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    /// Registers an archetype.
    pub fn register_archetype(&mut self, descriptor: &ArchetypeDescriptor) -> Archetype {
        self.storage.register_archetype(descriptor)
    }

    /// Moves a living entity into an archetype, dropping its data.
    pub fn set_archetype(&mut self, entity: Entity, archetype: Archetype) {
        if self.check_alive(entity) {
            self.storage.set_archetype(entity, archetype);
        }
    }

    /// Moves a living entity into an archetype, keeping shared data.
    pub fn change_archetype(&mut self, entity: Entity, archetype: Archetype) {
        if self.check_alive(entity) {
            self.storage.change_archetype(entity, archetype);
        }
    }

    /// Adds component `T` with a value to a living entity.
    pub fn add_component<T: Component>(&mut self, entity: Entity, value: T) {
        if self.check_alive(entity) {
            self.storage.add_component_value(entity, value);
        }
    }

    /// Removes component `T` from a living entity.
    pub fn remove_component<T: Component>(&mut self, entity: Entity) {
        if self.check_alive(entity) {
            self.storage.remove_component(entity, T::ID);
        }
    }

    /// Returns a component value of a living entity.
    #[must_use]
    pub fn get<T: Component>(&self, entity: Entity) -> Option<&T> {
        if !self.entities.is_alive(entity) {
            return None;
        }
        self.storage.get(entity)
    }

    /// Returns a component value of a living entity, mutably.
    pub fn get_mut<T: Component>(&mut self, entity: Entity) -> Option<&mut T> {
        if !self.entities.is_alive(entity) {
            return None;
        }
        self.storage.get_mut(entity)
    }

    /// Applies a recorded operation log.
    ///
    /// Destroy operations also retire the entity handles. Entities that
    /// died after the operation was recorded are skipped.
    pub fn execute_operations(&mut self, operations: &EntityOperations) {
        for view in operations {
            let entities = &self.entities;
            self.storage.apply_operation_where(&view, |entity| {
                let alive = entities.is_alive(entity);
                if !alive {
                    tracing::error!("Skipping {entity:?} in a recorded operation, it is not alive");
                }
                alive
            });
            if !view.archetype().is_valid() {
                self.entities.destroy_many(view.entities());
            }
        }
    }

    fn check_alive(&self, entity: Entity) -> bool {
        let alive = self.entities.is_alive(entity);
        if !alive {
            tracing::warn!("Ignoring {entity:?}, the entity is not alive");
        }
        alive
    }
}
