//! # Entity Storage
//!
//! Places entities into the blocks of their archetype and moves them
//! between archetypes.
//!
//! ## Compaction
//!
//! ```text
//! remove E1:  [E0 E1 E2 E3] -> [E0 E3 E2]
//! ```
//!
//! The last entity of a block fills the hole left by a removed one, so
//! live entities always occupy the front of every block.

use std::collections::HashMap;

use super::archetype::{
    Archetype, ArchetypeDescriptor, ArchetypeIndex, ArchetypeInfo, ArchetypeInstance,
};
use super::block::DataBlock;
use super::component::{Component, ComponentId, ComponentInfo};
use super::entity::Entity;
use super::operations::{EntityOperations, OperationView};
use crate::config::StorageConfig;
use crate::memory::PoolId;

/// Where an entity's data lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntityLocation {
    /// Archetype the entity belongs to.
    pub archetype: ArchetypeInstance,
    /// Block index inside the archetype's block chain.
    pub block: u32,
    /// Slot inside the block.
    pub slot: u32,
}

/// Owner of all archetype blocks and entity locations.
///
/// # Thread Safety
///
/// Not synchronized. Structural changes from other threads are recorded in
/// an [`EntityOperations`] log and applied here by a single owner.
///
/// # Example
///
/// ```rust,ignore
/// let mut storage = EntityStorage::new(&StorageConfig::default());
/// let archetype = storage.register_archetype(
///     &ArchetypeDescriptor::new("Mover").with::<Position>(),
/// );
///
/// storage.set_archetype(entity, archetype);
/// storage.get_mut::<Position>(entity).unwrap().x = 1.0;
/// ```
#[derive(Debug)]
pub struct EntityStorage {
    index: ArchetypeIndex,
    /// Block chain of every archetype instance.
    chains: Vec<Vec<DataBlock>>,
    locations: HashMap<Entity, EntityLocation>,
}

impl EntityStorage {
    /// Creates an empty storage with its own archetype index.
    #[must_use]
    pub fn new(config: &StorageConfig) -> Self {
        Self::with_index(ArchetypeIndex::new(config))
    }

    /// Creates an empty storage around an existing archetype index.
    #[must_use]
    pub fn with_index(index: ArchetypeIndex) -> Self {
        let chains = (0..index.registered_archetype_count())
            .map(|_| Vec::new())
            .collect();
        Self {
            index,
            chains,
            locations: HashMap::new(),
        }
    }

    /// Returns the archetype index.
    #[inline]
    #[must_use]
    pub const fn archetype_index(&self) -> &ArchetypeIndex {
        &self.index
    }

    /// Registers an archetype, see [`ArchetypeIndex::register_archetype`].
    pub fn register_archetype(&mut self, descriptor: &ArchetypeDescriptor) -> Archetype {
        let archetype = self.index.register_archetype(descriptor);
        self.sync_chains();
        archetype
    }

    /// Registers an additional block pool.
    pub fn add_pool(&mut self, block_size: usize) -> PoolId {
        self.index.add_pool(block_size)
    }

    /// Returns the location of an entity.
    #[inline]
    #[must_use]
    pub fn location(&self, entity: Entity) -> Option<EntityLocation> {
        self.locations.get(&entity).copied()
    }

    /// Returns the archetype of an entity, [`Archetype::INVALID`] if none.
    #[must_use]
    pub fn archetype_of(&self, entity: Entity) -> Archetype {
        self.location(entity).map_or(Archetype::INVALID, |location| {
            self.index.instance_info(location.archetype).archetype()
        })
    }

    /// Returns the number of entities with data.
    #[inline]
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.locations.len()
    }

    /// Returns the number of entities stored for an archetype.
    #[must_use]
    pub fn archetype_entity_count(&self, archetype: Archetype) -> usize {
        self.index
            .instance_of(archetype)
            .map_or(0, |instance| {
                self.blocks(instance)
                    .iter()
                    .map(|block| block.entity_count() as usize)
                    .sum()
            })
    }

    /// Returns the number of blocks allocated for an archetype.
    #[must_use]
    pub fn block_count(&self, archetype: Archetype) -> usize {
        self.index
            .instance_of(archetype)
            .map_or(0, |instance| self.blocks(instance).len())
    }

    /// Returns the block chain of an archetype instance.
    #[inline]
    #[must_use]
    pub fn blocks(&self, instance: ArchetypeInstance) -> &[DataBlock] {
        self.chains
            .get(instance.index())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub(crate) fn chains_mut(&mut self) -> std::slice::IterMut<'_, Vec<DataBlock>> {
        self.chains.iter_mut()
    }

    pub(crate) fn block_mut(
        &mut self,
        instance: ArchetypeInstance,
        block: u32,
    ) -> Option<&mut DataBlock> {
        self.chains
            .get_mut(instance.index())?
            .get_mut(block as usize)
    }

    /// Returns a component value of an entity.
    #[must_use]
    pub fn get<T: Component>(&self, entity: Entity) -> Option<&T> {
        let bytes = self.component_bytes(entity, T::ID)?;
        bytemuck::try_from_bytes(bytes).ok()
    }

    /// Returns a component value of an entity, mutably.
    pub fn get_mut<T: Component>(&mut self, entity: Entity) -> Option<&mut T> {
        let bytes = self.component_bytes_mut(entity, T::ID)?;
        bytemuck::try_from_bytes_mut(bytes).ok()
    }

    /// Returns the raw bytes of one component of an entity.
    #[must_use]
    pub fn component_bytes(&self, entity: Entity, id: ComponentId) -> Option<&[u8]> {
        let location = self.live_location(entity)?;
        let info = self.index.instance_info(location.archetype);
        let range = info.element_range(info.component_slot(id)?, location.slot as usize)?;
        let block = self.blocks(location.archetype).get(location.block as usize)?;
        block.bytes().get(range)
    }

    /// Returns the raw bytes of one component of an entity, mutably.
    pub fn component_bytes_mut(&mut self, entity: Entity, id: ComponentId) -> Option<&mut [u8]> {
        let location = self.live_location(entity)?;
        let info = self.index.instance_info(location.archetype);
        let range = info.element_range(info.component_slot(id)?, location.slot as usize)?;
        let block = self.block_mut(location.archetype, location.block)?;
        block.bytes_mut().get_mut(range)
    }

    /// Moves an entity into an archetype without keeping any data.
    ///
    /// Every component except the entity itself starts zeroed. If the
    /// entity already is in the archetype nothing happens.
    ///
    /// # Panics
    ///
    /// Panics if the archetype is not registered.
    pub fn set_archetype(&mut self, entity: Entity, archetype: Archetype) {
        self.migrate(entity, archetype, &[], false);
    }

    /// Like [`Self::set_archetype`], placing the entity only into blocks
    /// whose filter accepts `filter_data`.
    pub fn set_archetype_with_filter(
        &mut self,
        entity: Entity,
        archetype: Archetype,
        filter_data: &[u8],
    ) {
        self.migrate(entity, archetype, filter_data, false);
    }

    /// Moves an entity into an archetype, keeping shared components.
    ///
    /// Components present in both archetypes are copied, components only
    /// the new archetype has start zeroed, the rest are dropped. An entity
    /// without an archetype is placed as with [`Self::set_archetype`].
    ///
    /// # Panics
    ///
    /// Panics if the archetype is not registered.
    pub fn change_archetype(&mut self, entity: Entity, archetype: Archetype) {
        self.migrate(entity, archetype, &[], true);
    }

    /// Like [`Self::change_archetype`], placing the entity only into
    /// blocks whose filter accepts `filter_data`.
    pub fn change_archetype_with_filter(
        &mut self,
        entity: Entity,
        archetype: Archetype,
        filter_data: &[u8],
    ) {
        self.migrate(entity, archetype, filter_data, true);
    }

    /// Removes all data of an entity.
    ///
    /// Does nothing if the entity has no data.
    pub fn erase_data(&mut self, entity: Entity) {
        let Some(location) = self.locations.remove(&entity) else {
            return;
        };
        if self.is_stale(location) {
            tracing::error!(
                "Cannot erase {:?}, entity seems to be dead (block {} slot {})",
                entity,
                location.block,
                location.slot
            );
            return;
        }
        self.compact(location);
    }

    /// Adds a component, moving the entity into the extended archetype.
    ///
    /// The archetype is registered on the fly if needed. Adding a component
    /// the entity already has does nothing.
    pub fn add_component(&mut self, entity: Entity, component: ComponentInfo) {
        let entity_component = self.index.entity_component();
        let components = match self.location(entity) {
            Some(location) => {
                let info = self.index.instance_info(location.archetype);
                if info.has_component(component.id) {
                    return;
                }
                let mut components = info.components().to_vec();
                let position = components[1..].partition_point(|c| c.id < component.id) + 1;
                components.insert(position, component);
                components
            }
            None => vec![entity_component, component],
        };

        let archetype = self.find_or_register(&components);
        self.migrate(entity, archetype, &[], true);
    }

    /// Adds component `T` and writes its value.
    pub fn add_component_value<T: Component>(&mut self, entity: Entity, value: T) {
        self.add_component(entity, ComponentInfo::of::<T>());
        if let Some(slot) = self.get_mut::<T>(entity) {
            *slot = value;
        }
    }

    /// Removes a component, moving the entity into the reduced archetype.
    ///
    /// Removing the last component erases the entity's data.
    pub fn remove_component(&mut self, entity: Entity, id: ComponentId) {
        let Some(location) = self.location(entity) else {
            tracing::warn!("Cannot remove a component from {entity:?}, it has no archetype");
            return;
        };

        let info = self.index.instance_info(location.archetype);
        if !info.has_component(id) {
            return;
        }
        if info.components().len() <= 2 {
            self.erase_data(entity);
            return;
        }

        let components: Vec<ComponentInfo> = info
            .components()
            .iter()
            .filter(|c| c.id != id)
            .copied()
            .collect();
        let archetype = self.find_or_register(&components);
        self.migrate(entity, archetype, &[], true);
    }

    /// Applies every recorded operation in order.
    pub fn execute_operations(&mut self, operations: &EntityOperations) {
        for view in operations.iter() {
            self.apply_operation(&view);
        }
    }

    /// Applies a single recorded operation.
    ///
    /// Operations on [`Archetype::INVALID`] erase the listed entities.
    /// Others move every listed entity into the archetype and write the
    /// attached component values.
    ///
    /// # Panics
    ///
    /// Panics if the operation carries data for a component the archetype
    /// does not have, or data of the wrong size.
    pub fn apply_operation(&mut self, view: &OperationView<'_>) {
        self.apply_operation_where(view, |_| true);
    }

    /// Applies a single recorded operation to the entities `keep` accepts.
    ///
    /// Skipped entities are neither moved nor written. Values are only
    /// written to entities that ended up in the operation's archetype.
    ///
    /// # Panics
    ///
    /// Same as [`apply_operation`](Self::apply_operation).
    pub fn apply_operation_where<F>(&mut self, view: &OperationView<'_>, mut keep: F)
    where
        F: FnMut(Entity) -> bool,
    {
        let archetype = view.archetype();
        let kept: Vec<bool> = view.entities().iter().map(|&entity| keep(entity)).collect();
        let entities = || {
            view.entities()
                .iter()
                .zip(&kept)
                .filter(|&(_, &is_kept)| is_kept)
                .map(|(&entity, _)| entity)
        };

        if !archetype.is_valid() {
            for entity in entities() {
                self.erase_data(entity);
            }
            return;
        }

        let filter_data = view.filter_data();
        for entity in entities() {
            self.migrate(entity, archetype, filter_data, true);
        }

        let target = self.archetype_info(archetype).instance();
        for (id, data) in view.components() {
            let info = self.archetype_info(archetype);
            let Some(slot) = info.component_slot(id) else {
                panic!(
                    "Archetype '{}' has no component {id:?} to write",
                    info.name()
                );
            };
            let size = info.components()[slot].size as usize;
            assert_eq!(
                data.len(),
                size * view.entities().len(),
                "Component data does not match the component size"
            );
            if size == 0 {
                continue;
            }
            let values = view.entities().iter().zip(&kept).zip(data.chunks_exact(size));
            for ((&entity, &is_kept), value) in values {
                if !is_kept || self.live_location(entity).map(|l| l.archetype) != Some(target) {
                    continue;
                }
                if let Some(bytes) = self.component_bytes_mut(entity, id) {
                    bytes.copy_from_slice(value);
                }
            }
        }
    }

    /// Returns trailing empty blocks of every archetype to their pools.
    ///
    /// # Returns
    ///
    /// The number of released blocks.
    pub fn release_empty_blocks(&mut self) -> usize {
        let mut released = 0;
        for (instance, chain) in self.chains.iter_mut().enumerate() {
            let pool = self
                .index
                .instance_info(ArchetypeInstance::from_index(instance))
                .pool();
            while chain.last().is_some_and(DataBlock::is_empty) {
                if let Some(block) = chain.pop() {
                    self.index.pool_mut(pool).release(block.into_memory());
                    released += 1;
                }
            }
        }
        if released > 0 {
            tracing::debug!("Released {released} empty blocks");
        }
        released
    }

    fn archetype_info(&self, archetype: Archetype) -> &ArchetypeInfo {
        match self.index.archetype_info(archetype) {
            Some(info) => info,
            None => panic!("Archetype {archetype:?} is not registered"),
        }
    }

    fn sync_chains(&mut self) {
        let registered = self.index.registered_archetype_count();
        if self.chains.len() < registered {
            self.chains.resize_with(registered, Vec::new);
        }
    }

    fn find_or_register(&mut self, components: &[ComponentInfo]) -> Archetype {
        let identifiers: Vec<ComponentId> = components.iter().map(|c| c.id).collect();
        let archetype = self.index.find_archetype_by_components(&identifiers);
        if archetype.is_valid() {
            return archetype;
        }

        let name = components[1..]
            .iter()
            .map(|c| c.name)
            .collect::<Vec<_>>()
            .join("|");
        self.register_archetype(&ArchetypeDescriptor::from_components(name, &components[1..]))
    }

    /// Returns the location of an entity if it points at a live slot.
    fn live_location(&self, entity: Entity) -> Option<EntityLocation> {
        self.location(entity)
            .filter(|&location| !self.is_stale(location))
    }

    fn is_stale(&self, location: EntityLocation) -> bool {
        self.blocks(location.archetype)
            .get(location.block as usize)
            .map_or(true, |block| location.slot >= block.entity_count())
    }

    /// Moves an entity into `archetype`, optionally keeping shared data.
    fn migrate(&mut self, entity: Entity, archetype: Archetype, filter_data: &[u8], preserve: bool) {
        let target = self.archetype_info(archetype).instance();
        self.sync_chains();

        let current = self.location(entity);
        if let Some(location) = current {
            if location.archetype == target {
                return;
            }
            if self.is_stale(location) {
                tracing::error!(
                    "Cannot move {:?}, entity seems to be dead (block {} slot {})",
                    entity,
                    location.block,
                    location.slot
                );
                return;
            }
        }

        let destination = self.acquire_slot(target, filter_data);
        self.prepare_slot(destination, entity);

        if let Some(source) = current {
            if preserve {
                self.copy_shared_components(source, destination);
            }
            self.compact(source);
        }
        self.locations.insert(entity, destination);
    }

    /// Claims a slot in the first block with room, allocating a block at
    /// the end of the chain if all are full.
    fn acquire_slot(&mut self, instance: ArchetypeInstance, filter_data: &[u8]) -> EntityLocation {
        let info = self.index.instance_info(instance);
        let filter = info.filter();
        let pool = info.pool();
        let entity_count_max = info.entity_count_max();
        let filter_size = filter.data_size as usize;

        let chain = &mut self.chains[instance.index()];
        let found = chain.iter().position(|block| {
            !block.is_full() && filter.accepts(block.filter_data(filter_size), filter_data)
        });

        let block_index = match found {
            Some(index) => index,
            None => {
                let mut block = DataBlock::new(self.index.pool_mut(pool).allocate(), entity_count_max);
                if filter_size > 0 && !filter_data.is_empty() {
                    assert_eq!(
                        filter_data.len(),
                        filter_size,
                        "Filter data does not match the archetype's filter size"
                    );
                    block.bytes_mut()[..filter_size].copy_from_slice(filter_data);
                }
                tracing::trace!(
                    "Allocated block {} for archetype instance {}",
                    chain.len(),
                    instance.index()
                );
                chain.push(block);
                chain.len() - 1
            }
        };

        let slot = chain[block_index].push_slot();
        EntityLocation {
            archetype: instance,
            block: block_index as u32,
            slot,
        }
    }

    /// Writes the entity into its column and zeroes every other component.
    fn prepare_slot(&mut self, location: EntityLocation, entity: Entity) {
        let info = self.index.instance_info(location.archetype);
        let block = &mut self.chains[location.archetype.index()][location.block as usize];
        let bytes = block.bytes_mut();
        let slot = location.slot as usize;

        for component_slot in 1..info.components().len() {
            if let Some(range) = info.element_range(component_slot, slot) {
                bytes[range].fill(0);
            }
        }
        if let Some(range) = info.element_range(0, slot) {
            bytes[range].copy_from_slice(bytemuck::bytes_of(&entity));
        }
    }

    /// Copies every component both archetypes share.
    fn copy_shared_components(&mut self, source: EntityLocation, destination: EntityLocation) {
        let source_info = self.index.instance_info(source.archetype);
        let destination_info = self.index.instance_info(destination.archetype);
        let (source_chain, destination_chain) = chain_pair(
            &mut self.chains,
            source.archetype.index(),
            destination.archetype.index(),
        );
        let source_bytes = source_chain[source.block as usize].bytes();
        let destination_bytes = destination_chain[destination.block as usize].bytes_mut();

        let source_ids = source_info.identifiers();
        let destination_ids = destination_info.identifiers();
        let (mut i, mut j) = (1, 1);
        while i < source_ids.len() && j < destination_ids.len() {
            match source_ids[i].cmp(&destination_ids[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    let from = source_info.element_range(i, source.slot as usize);
                    let to = destination_info.element_range(j, destination.slot as usize);
                    if let (Some(from), Some(to)) = (from, to) {
                        assert_eq!(
                            from.len(),
                            to.len(),
                            "Component size differs between archetypes"
                        );
                        destination_bytes[to].copy_from_slice(&source_bytes[from]);
                    }
                    i += 1;
                    j += 1;
                }
            }
        }
    }

    /// Removes a slot by moving the block's last entity into it.
    fn compact(&mut self, location: EntityLocation) {
        let info = self.index.instance_info(location.archetype);
        let block = &mut self.chains[location.archetype.index()][location.block as usize];
        let last = block.entity_count() - 1;

        if location.slot != last {
            let bytes = block.bytes_mut();
            for component_slot in 0..info.components().len() {
                let (Some(from), Some(to)) = (
                    info.element_range(component_slot, last as usize),
                    info.element_range(component_slot, location.slot as usize),
                ) else {
                    continue;
                };
                bytes.copy_within(from, to.start);
            }

            let moved = info
                .element_range(0, location.slot as usize)
                .map(|range| bytemuck::pod_read_unaligned::<Entity>(&bytes[range]));
            if let Some(moved) = moved {
                if let Some(moved_location) = self.locations.get_mut(&moved) {
                    moved_location.slot = location.slot;
                }
            }
        }
        block.pop_slot();
    }
}

/// Borrows one chain immutably and another mutably.
fn chain_pair(
    chains: &mut [Vec<DataBlock>],
    read: usize,
    write: usize,
) -> (&[DataBlock], &mut [DataBlock]) {
    assert_ne!(read, write, "Migration between the same archetype");
    if read < write {
        let (head, tail) = chains.split_at_mut(write);
        (&head[read], &mut tail[0])
    } else {
        let (head, tail) = chains.split_at_mut(read);
        (&tail[0], &mut head[write])
    }
}
