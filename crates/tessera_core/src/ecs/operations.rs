//! # Entity Operations
//!
//! A deferred log of structural changes. Producers record operations while
//! storage is busy being iterated; the owner applies the whole log at a
//! sync point, in recording order.
//!
//! ## Memory
//!
//! - Operation nodes live in a pool that grows in batches and recycles
//!   nodes through an index free list
//! - Entity lists, component identifiers and component values are copied
//!   into a byte arena of data nodes
//!
//! Both are released at once by [`EntityOperations::clear`].
//!
//! ## Record Layout
//!
//! ```text
//! [Entity × n][id: u64 × c][size: u32 × c][offset: u32 × c][values...]
//! ```

use std::ops::Range;

use super::archetype::Archetype;
use super::component::{Component, ComponentId, ComponentInfo};
use super::entity::{Entity, EntityIndex};
use crate::config::StorageConfig;
use crate::memory::{align_forward, Arena, ArenaSpan};

/// Handle of a recorded operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationHandle(u32);

#[derive(Clone, Copy, Debug)]
struct OperationNode {
    archetype: Archetype,
    entity_count: u32,
    component_count: u32,
    data: ArenaSpan,
    filter: ArenaSpan,
    next: Option<u32>,
}

impl OperationNode {
    const EMPTY: Self = Self {
        archetype: Archetype::INVALID,
        entity_count: 0,
        component_count: 0,
        data: ArenaSpan::EMPTY,
        filter: ArenaSpan::EMPTY,
        next: None,
    };
}

/// Values of one component for every entity of an operation.
#[derive(Clone, Copy, Debug)]
pub struct ComponentData<'a> {
    /// Component the values belong to.
    pub id: ComponentId,
    /// Size of one value.
    pub size: u32,
    /// Alignment of one value.
    pub alignment: u32,
    /// One value per entity, back to back.
    pub bytes: &'a [u8],
}

impl<'a> ComponentData<'a> {
    /// Wraps typed values, one per entity.
    #[must_use]
    pub fn of<T: Component>(values: &'a [T]) -> Self {
        let info = ComponentInfo::of::<T>();
        Self {
            id: info.id,
            size: info.size,
            alignment: info.alignment,
            bytes: bytemuck::cast_slice(values),
        }
    }
}

/// The deferred operation log.
///
/// # Example
///
/// ```rust,ignore
/// let mut operations = EntityOperations::new(&StorageConfig::default());
///
/// let positions = [Position::default(); 3];
/// operations
///     .build(archetype)
///     .create_entities(&mut entity_index, 3)
///     .with_data(&[ComponentData::of(&positions)]);
///
/// storage.execute_operations(&operations);
/// operations.clear();
/// ```
#[derive(Debug)]
pub struct EntityOperations {
    nodes: Vec<OperationNode>,
    free_nodes: Vec<u32>,
    /// Node ranges allocated per growth step.
    allocations: Vec<Range<u32>>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
    node_batch: usize,
    arena: Arena,
}

impl EntityOperations {
    /// Creates an empty log sized by `config`.
    #[must_use]
    pub fn new(config: &StorageConfig) -> Self {
        let mut operations = Self {
            nodes: Vec::new(),
            free_nodes: Vec::new(),
            allocations: Vec::new(),
            head: None,
            tail: None,
            len: 0,
            node_batch: config.operation_node_batch.max(1),
            arena: Arena::new(config.operation_data_node_size),
        };
        operations.grow();
        operations
    }

    /// Returns the number of recorded operations.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if nothing is recorded.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the number of node batches allocated so far.
    #[inline]
    #[must_use]
    pub fn node_allocation_count(&self) -> usize {
        self.allocations.len()
    }

    /// Returns the number of arena data nodes in use.
    #[inline]
    #[must_use]
    pub fn data_node_count(&self) -> usize {
        self.arena.node_count()
    }

    /// Appends an empty operation with `size` bytes of aligned storage.
    ///
    /// Every other recording method is built on top of this one.
    pub fn new_storage_operation(&mut self, size: usize, alignment: usize) -> (OperationHandle, ArenaSpan) {
        if self.free_nodes.is_empty() {
            self.grow();
        }
        let Some(index) = self.free_nodes.pop() else {
            unreachable!("operation pool grew without free nodes");
        };

        let data = self.arena.alloc(size, alignment);
        self.nodes[index as usize] = OperationNode {
            data,
            ..OperationNode::EMPTY
        };

        match self.tail {
            Some(tail) => self.nodes[tail as usize].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;

        (OperationHandle(index), data)
    }

    /// Records moving one entity into `archetype`.
    pub fn set_archetype(&mut self, entity: Entity, archetype: Archetype) {
        self.build(archetype).with_entities(&[entity]).finalize();
    }

    /// Records destroying entities.
    pub fn destroy_entities(&mut self, entities: &[Entity]) {
        self.build(Archetype::INVALID).with_entities(entities).finalize();
    }

    /// Starts recording an operation targeting `archetype`.
    ///
    /// [`Archetype::INVALID`] records a destroy operation.
    pub fn build(&mut self, archetype: Archetype) -> OperationBuilder<'_> {
        OperationBuilder {
            operations: self,
            archetype,
            entities: Vec::new(),
            filter: Vec::new(),
            finished: false,
        }
    }

    /// Iterates recorded operations in recording order.
    #[must_use]
    pub fn iter(&self) -> OperationIter<'_> {
        OperationIter {
            operations: self,
            next: self.head,
        }
    }

    /// Drops every recorded operation, releases every node batch but the
    /// first and resets the data arena to one node.
    pub fn clear(&mut self) {
        self.allocations.truncate(1);
        let kept = self.allocations.first().cloned().unwrap_or(0..0);
        self.nodes.truncate(kept.end as usize);
        self.nodes.shrink_to(kept.end as usize);
        self.nodes.fill(OperationNode::EMPTY);
        self.free_nodes.clear();
        self.free_nodes.extend(kept.rev());
        self.head = None;
        self.tail = None;
        self.len = 0;
        self.arena.reset();
        if self.free_nodes.is_empty() {
            self.allocations.clear();
            self.grow();
        }
    }

    fn grow(&mut self) {
        let start = self.nodes.len() as u32;
        let end = start + self.node_batch as u32;
        self.nodes.resize(end as usize, OperationNode::EMPTY);
        self.free_nodes.extend((start..end).rev());
        self.allocations.push(start..end);
    }

    fn write_record(
        &mut self,
        archetype: Archetype,
        entities: &[Entity],
        filter: &[u8],
        components: &[ComponentData<'_>],
    ) {
        let entity_bytes = std::mem::size_of_val(entities);
        let component_count = components.len();
        let ids_start = entity_bytes;
        let sizes_start = ids_start + component_count * 8;
        let offsets_start = sizes_start + component_count * 4;

        let mut cursor = offsets_start + component_count * 4;
        let mut alignment = std::mem::align_of::<Entity>();
        let mut value_offsets = Vec::with_capacity(component_count);
        for component in components {
            let component_alignment = (component.alignment as usize).max(1);
            alignment = alignment.max(component_alignment);
            cursor = align_forward(cursor, component_alignment);
            value_offsets.push(cursor as u32);
            cursor += component.bytes.len();
        }

        let (handle, span) = self.new_storage_operation(cursor, alignment);
        let filter_span = self.arena.alloc(filter.len(), 1);
        self.arena.bytes_mut(filter_span).copy_from_slice(filter);

        let bytes = self.arena.bytes_mut(span);
        bytes[..entity_bytes].copy_from_slice(bytemuck::cast_slice(entities));
        for (i, component) in components.iter().enumerate() {
            let id_at = ids_start + i * 8;
            bytes[id_at..id_at + 8].copy_from_slice(&component.id.raw().to_ne_bytes());
            let size_at = sizes_start + i * 4;
            bytes[size_at..size_at + 4].copy_from_slice(&component.size.to_ne_bytes());
            let offset_at = offsets_start + i * 4;
            bytes[offset_at..offset_at + 4].copy_from_slice(&value_offsets[i].to_ne_bytes());
            let value_at = value_offsets[i] as usize;
            bytes[value_at..value_at + component.bytes.len()].copy_from_slice(component.bytes);
        }

        let node = &mut self.nodes[handle.0 as usize];
        node.archetype = archetype;
        node.entity_count = entities.len() as u32;
        node.component_count = component_count as u32;
        node.filter = filter_span;
    }
}

/// Records one operation. Dropping the builder finalizes it.
pub struct OperationBuilder<'a> {
    operations: &'a mut EntityOperations,
    archetype: Archetype,
    entities: Vec<Entity>,
    filter: Vec<u8>,
    finished: bool,
}

impl OperationBuilder<'_> {
    /// Places the entities only into blocks accepting `filter_data`.
    #[must_use]
    pub fn with_filter(mut self, filter_data: &[u8]) -> Self {
        self.filter = filter_data.to_vec();
        self
    }

    /// Adds existing entities to the operation.
    #[must_use]
    pub fn with_entities(mut self, entities: &[Entity]) -> Self {
        self.entities.extend_from_slice(entities);
        self
    }

    /// Creates `count` new entities now and adds them to the operation.
    #[must_use]
    pub fn create_entities(mut self, index: &mut EntityIndex, count: usize) -> Self {
        let start = self.entities.len();
        self.entities.resize(start + count, Entity::INVALID);
        if !index.create_many(&mut self.entities[start..]) {
            tracing::error!("Cannot create {count} entities, the entity index is exhausted");
            self.entities.truncate(start);
        }
        self
    }

    /// Returns the entities of the operation so far.
    #[inline]
    #[must_use]
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// Attaches component values and records the operation.
    ///
    /// # Panics
    ///
    /// Panics if a component's values do not cover exactly one value per
    /// entity.
    pub fn with_data(mut self, components: &[ComponentData<'_>]) -> Vec<Entity> {
        for component in components {
            assert_eq!(
                component.bytes.len(),
                component.size as usize * self.entities.len(),
                "Component {:?} needs one value per entity",
                component.id
            );
        }
        self.flush(components);
        std::mem::take(&mut self.entities)
    }

    /// Records the operation without component values.
    pub fn finalize(mut self) -> Vec<Entity> {
        self.flush(&[]);
        std::mem::take(&mut self.entities)
    }

    fn flush(&mut self, components: &[ComponentData<'_>]) {
        if self.finished {
            return;
        }
        self.finished = true;
        if self.entities.is_empty() {
            return;
        }
        self.operations
            .write_record(self.archetype, &self.entities, &self.filter, components);
    }
}

impl Drop for OperationBuilder<'_> {
    fn drop(&mut self) {
        self.flush(&[]);
    }
}

/// Read-only view of one recorded operation.
#[derive(Clone, Copy, Debug)]
pub struct OperationView<'a> {
    archetype: Archetype,
    entities: &'a [Entity],
    identifiers: &'a [u64],
    sizes: &'a [u32],
    offsets: &'a [u32],
    record: &'a [u8],
    filter: &'a [u8],
}

impl<'a> OperationView<'a> {
    /// Returns the target archetype, [`Archetype::INVALID`] for destroys.
    #[inline]
    #[must_use]
    pub const fn archetype(&self) -> Archetype {
        self.archetype
    }

    /// Returns the entities of the operation.
    #[inline]
    #[must_use]
    pub const fn entities(&self) -> &'a [Entity] {
        self.entities
    }

    /// Returns the block filter data, empty if none.
    #[inline]
    #[must_use]
    pub const fn filter_data(&self) -> &'a [u8] {
        self.filter
    }

    /// Returns the number of components with values.
    #[inline]
    #[must_use]
    pub const fn component_count(&self) -> usize {
        self.identifiers.len()
    }

    /// Iterates `(component, values)` pairs, one value per entity.
    pub fn components(&self) -> impl Iterator<Item = (ComponentId, &'a [u8])> + 'a {
        let (identifiers, sizes, offsets) = (self.identifiers, self.sizes, self.offsets);
        let record = self.record;
        let entity_count = self.entities.len();
        identifiers
            .iter()
            .zip(sizes)
            .zip(offsets)
            .map(move |((&id, &size), &offset)| {
                let start = offset as usize;
                let len = size as usize * entity_count;
                (ComponentId::from_raw(id), &record[start..start + len])
            })
    }
}

/// Iterator over recorded operations.
pub struct OperationIter<'a> {
    operations: &'a EntityOperations,
    next: Option<u32>,
}

impl<'a> Iterator for OperationIter<'a> {
    type Item = OperationView<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = &self.operations.nodes[self.next? as usize];
        self.next = node.next;

        let record = self.operations.arena.bytes(node.data);
        let entity_count = node.entity_count as usize;
        let component_count = node.component_count as usize;
        let ids_start = entity_count * 8;
        let sizes_start = ids_start + component_count * 8;
        let offsets_start = sizes_start + component_count * 4;
        let header_end = offsets_start + component_count * 4;

        if record.len() < header_end {
            return Some(OperationView {
                archetype: node.archetype,
                entities: &[],
                identifiers: &[],
                sizes: &[],
                offsets: &[],
                record,
                filter: &[],
            });
        }

        Some(OperationView {
            archetype: node.archetype,
            entities: bytemuck::cast_slice(&record[..ids_start]),
            identifiers: bytemuck::cast_slice(&record[ids_start..sizes_start]),
            sizes: bytemuck::cast_slice(&record[sizes_start..offsets_start]),
            offsets: bytemuck::cast_slice(&record[offsets_start..header_end]),
            record,
            filter: self.operations.arena.bytes(node.filter),
        })
    }
}

impl<'a> IntoIterator for &'a EntityOperations {
    type Item = OperationView<'a>;
    type IntoIter = OperationIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::{Pod, Zeroable};

    #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Health {
        value: u32,
    }

    impl Component for Health {
        const NAME: &'static str = "test.health";
    }

    fn config() -> StorageConfig {
        StorageConfig {
            operation_node_batch: 4,
            operation_data_node_size: 256,
            ..StorageConfig::default()
        }
    }

    fn some_archetype() -> Archetype {
        Archetype::from_identifiers(&[Entity::ID, Health::ID])
    }

    #[test]
    fn test_records_in_order() {
        let mut operations = EntityOperations::new(&config());
        let archetype = some_archetype();

        operations.set_archetype(Entity::new(0, 0), archetype);
        operations.destroy_entities(&[Entity::new(1, 0), Entity::new(2, 0)]);
        operations.set_archetype(Entity::new(3, 0), archetype);

        let views: Vec<_> = operations.iter().collect();
        assert_eq!(views.len(), 3);
        assert_eq!(views[0].archetype(), archetype);
        assert_eq!(views[0].entities(), &[Entity::new(0, 0)]);
        assert!(!views[1].archetype().is_valid());
        assert_eq!(views[1].entities().len(), 2);
        assert_eq!(views[2].entities(), &[Entity::new(3, 0)]);
    }

    #[test]
    fn test_builder_with_data() {
        let mut operations = EntityOperations::new(&config());
        let mut index = EntityIndex::new(&StorageConfig::default());
        let values = [Health { value: 7 }, Health { value: 9 }];

        let created = operations
            .build(some_archetype())
            .create_entities(&mut index, 2)
            .with_data(&[ComponentData::of(&values)]);
        assert_eq!(created.len(), 2);
        assert_eq!(index.count(), 2);

        let view = operations.iter().next().unwrap();
        assert_eq!(view.entities(), created.as_slice());
        assert_eq!(view.component_count(), 1);
        let (id, bytes) = view.components().next().unwrap();
        assert_eq!(id, Health::ID);
        let decoded: &[Health] = bytemuck::cast_slice(bytes);
        assert_eq!(decoded, &values);
    }

    #[test]
    fn test_builder_finalizes_on_drop() {
        let mut operations = EntityOperations::new(&config());
        {
            let _builder = operations
                .build(some_archetype())
                .with_entities(&[Entity::new(5, 0)])
                .with_filter(&[1, 2, 3, 4]);
        }
        assert_eq!(operations.len(), 1);
        let view = operations.iter().next().unwrap();
        assert_eq!(view.filter_data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_empty_builder_records_nothing() {
        let mut operations = EntityOperations::new(&config());
        let _ = operations.build(some_archetype()).finalize();
        assert!(operations.is_empty());
        assert_eq!(operations.iter().count(), 0);
    }

    #[test]
    #[should_panic(expected = "one value per entity")]
    fn test_data_must_cover_entities() {
        let mut operations = EntityOperations::new(&config());
        let values = [Health { value: 1 }];
        let _ = operations
            .build(some_archetype())
            .with_entities(&[Entity::new(0, 0), Entity::new(1, 0)])
            .with_data(&[ComponentData::of(&values)]);
    }

    #[test]
    fn test_node_pool_grows_in_batches() {
        let mut operations = EntityOperations::new(&config());
        assert_eq!(operations.node_allocation_count(), 1);
        for i in 0..5 {
            operations.set_archetype(Entity::new(i, 0), some_archetype());
        }
        assert_eq!(operations.node_allocation_count(), 2);
        assert_eq!(operations.len(), 5);
    }

    #[test]
    fn test_large_record_spills_into_new_node() {
        let mut operations = EntityOperations::new(&config());
        let entities: Vec<Entity> = (0..100).map(|i| Entity::new(i, 0)).collect();
        operations.destroy_entities(&entities);
        assert!(operations.data_node_count() >= 2);
        let view = operations.iter().next().unwrap();
        assert_eq!(view.entities(), entities.as_slice());
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut operations = EntityOperations::new(&config());
        let entities: Vec<Entity> = (0..100).map(|i| Entity::new(i, 0)).collect();
        for chunk in entities.chunks(10) {
            operations.destroy_entities(chunk);
        }

        operations.clear();
        assert!(operations.is_empty());
        assert_eq!(operations.iter().count(), 0);
        assert_eq!(operations.node_allocation_count(), 1);
        assert_eq!(operations.data_node_count(), 1);

        operations.set_archetype(Entity::new(0, 0), some_archetype());
        assert_eq!(operations.iter().count(), 1);
    }

    #[test]
    fn test_clear_keeps_only_the_first_node_batch() {
        let mut operations = EntityOperations::new(&config());
        for i in 0..10 {
            operations.set_archetype(Entity::new(i, 0), some_archetype());
        }
        assert_eq!(operations.node_allocation_count(), 3);

        operations.clear();
        assert_eq!(operations.node_allocation_count(), 1);
        for i in 0..4 {
            operations.set_archetype(Entity::new(i, 0), some_archetype());
        }
        assert_eq!(operations.node_allocation_count(), 1);
        assert_eq!(operations.len(), 4);

        operations.set_archetype(Entity::new(4, 0), some_archetype());
        assert_eq!(operations.node_allocation_count(), 2);
        let recorded: Vec<Entity> = operations.iter().map(|view| view.entities()[0]).collect();
        assert_eq!(recorded, (0..5).map(|i| Entity::new(i, 0)).collect::<Vec<_>>());
    }
}
