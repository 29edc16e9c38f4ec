//! # Component Queries
//!
//! A query names the components it reads or writes as a Rust type:
//!
//! ```rust,ignore
//! let query = ComponentQuery::<(Entity, &Position, &mut Velocity, Option<&Mass>)>::new(
//!     storage.archetype_index(),
//! );
//! query.for_each_entity(&mut storage, |(entity, position, velocity, mass)| {
//!     // ...
//! });
//! ```
//!
//! - `&T` is a required, read-only component
//! - `&mut T` is a required, writable component
//! - `Option<&T>` / `Option<&mut T>` are optional components
//! - `Entity` yields the entity handle
//!
//! Matching archetypes are resolved once and cached together with the
//! column offsets of every term. Iteration only walks blocks that hold
//! entities.

use std::marker::PhantomData;

use super::archetype::{Archetype, ArchetypeIndex, ArchetypeInfo, ArchetypeInstance};
use super::component::{Component, ComponentId, Tag};
use super::entity::Entity;
use super::storage::EntityStorage;

/// One component requested by a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueryTerm {
    /// The requested component.
    pub id: ComponentId,
    /// Archetypes without the component still match.
    pub optional: bool,
    /// The component is only read.
    pub read_only: bool,
    /// Size of one value in bytes.
    pub size: u32,
}

impl QueryTerm {
    /// Describes a term for component `T`.
    #[must_use]
    pub fn of<T: Component>(optional: bool, read_only: bool) -> Self {
        Self {
            id: T::ID,
            optional,
            read_only,
            size: std::mem::size_of::<T>() as u32,
        }
    }
}

/// Runtime form of a query: its terms in parameter order plus tags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryDescriptor {
    terms: Vec<QueryTerm>,
    tags: Vec<ComponentId>,
}

impl QueryDescriptor {
    /// Derives the descriptor of query parameter `Q`.
    ///
    /// # Panics
    ///
    /// Panics if a component appears twice or a term has no data.
    #[must_use]
    pub fn of<Q: QueryParam>() -> Self {
        let mut terms = Vec::new();
        Q::terms(&mut terms);
        for (position, term) in terms.iter().enumerate() {
            assert!(
                term.size > 0,
                "Query term {:?} has no data, require tags with `with_tag`",
                term.id
            );
            assert!(
                terms[..position].iter().all(|other| other.id != term.id),
                "Component {:?} appears twice in a query",
                term.id
            );
        }
        Self {
            terms,
            tags: Vec::new(),
        }
    }

    /// Additionally requires the tag `T`.
    #[must_use]
    pub fn with_tag<T: Tag>(self) -> Self {
        self.with_tag_id(T::ID)
    }

    /// Additionally requires the tag `id`.
    ///
    /// # Panics
    ///
    /// Panics if the tag is already required.
    #[must_use]
    pub fn with_tag_id(mut self, id: ComponentId) -> Self {
        match self.tags.binary_search(&id) {
            Ok(_) => panic!("Tag {id:?} appears twice in a query"),
            Err(position) => self.tags.insert(position, id),
        }
        self
    }

    /// Returns the terms in parameter order.
    #[inline]
    #[must_use]
    pub fn terms(&self) -> &[QueryTerm] {
        &self.terms
    }

    /// Returns the required tags, sorted.
    #[inline]
    #[must_use]
    pub fn tags(&self) -> &[ComponentId] {
        &self.tags
    }
}

/// Column bytes of one block, handed out in term order.
pub struct ColumnSource<'a> {
    columns: std::vec::IntoIter<Option<&'a mut [u8]>>,
}

impl<'a> ColumnSource<'a> {
    /// Splits block memory into the columns of `count` entities starting
    /// at slot `first`.
    fn split(
        bytes: &'a mut [u8],
        layout: &[Option<ColumnLayout>],
        first: usize,
        count: usize,
    ) -> Self {
        let mut order: Vec<usize> = (0..layout.len()).filter(|&i| layout[i].is_some()).collect();
        order.sort_unstable_by_key(|&i| layout[i].map_or(0, |column| column.offset));

        let mut columns: Vec<Option<&'a mut [u8]>> = (0..layout.len()).map(|_| None).collect();
        let mut rest = bytes;
        let mut consumed = 0;
        for i in order {
            let Some(column) = layout[i] else {
                continue;
            };
            let start = column.offset + column.size * first;
            let len = column.size * count;
            let (_, tail) = std::mem::take(&mut rest).split_at_mut(start - consumed);
            let (slice, tail) = tail.split_at_mut(len);
            columns[i] = Some(slice);
            rest = tail;
            consumed = start + len;
        }

        Self {
            columns: columns.into_iter(),
        }
    }

    /// Takes the next column, which must exist.
    ///
    /// # Panics
    ///
    /// Panics if the archetype lacks the column.
    pub fn required(&mut self) -> &'a mut [u8] {
        match self.columns.next().flatten() {
            Some(column) => column,
            None => panic!("Query column missing for a required component"),
        }
    }

    /// Takes the next column if the archetype has it.
    pub fn optional(&mut self) -> Option<&'a mut [u8]> {
        self.columns.next().flatten()
    }
}

/// A type usable as query parameter.
///
/// `Block` is what a block-wise callback receives (column slices), `Item`
/// is what a per-entity callback receives.
pub trait QueryParam {
    /// Columns of one block.
    type Block<'a>;
    /// Values of one entity.
    type Item<'a>;

    /// Appends the terms of this parameter in order.
    fn terms(out: &mut Vec<QueryTerm>);

    /// Takes this parameter's columns from a block.
    fn fetch<'a>(source: &mut ColumnSource<'a>) -> Self::Block<'a>;

    /// Takes the values of the next entity from the columns.
    fn next_item<'a>(block: &mut Self::Block<'a>) -> Self::Item<'a>;
}

fn read_column<'a, T: Component>(bytes: &'a mut [u8]) -> &'a [T] {
    bytemuck::cast_slice(bytes)
}

fn write_column<'a, T: Component>(bytes: &'a mut [u8]) -> &'a mut [T] {
    bytemuck::cast_slice_mut(bytes)
}

fn next_ref<'a, T>(slice: &mut &'a [T]) -> &'a T {
    let current: &'a [T] = *slice;
    match current.split_first() {
        Some((first, rest)) => {
            *slice = rest;
            first
        }
        None => panic!("Query block exhausted"),
    }
}

fn next_mut<'a, T>(slice: &mut &'a mut [T]) -> &'a mut T {
    match std::mem::take(slice).split_first_mut() {
        Some((first, rest)) => {
            *slice = rest;
            first
        }
        None => panic!("Query block exhausted"),
    }
}

impl QueryParam for Entity {
    type Block<'a> = &'a [Entity];
    type Item<'a> = Entity;

    fn terms(out: &mut Vec<QueryTerm>) {
        out.push(QueryTerm::of::<Entity>(false, true));
    }

    fn fetch<'a>(source: &mut ColumnSource<'a>) -> &'a [Entity] {
        read_column(source.required())
    }

    fn next_item<'a>(block: &mut Self::Block<'a>) -> Self::Item<'a> {
        *next_ref(block)
    }
}

impl<T: Component> QueryParam for &T {
    type Block<'a> = &'a [T];
    type Item<'a> = &'a T;

    fn terms(out: &mut Vec<QueryTerm>) {
        out.push(QueryTerm::of::<T>(false, true));
    }

    fn fetch<'a>(source: &mut ColumnSource<'a>) -> &'a [T] {
        read_column(source.required())
    }

    fn next_item<'a>(block: &mut Self::Block<'a>) -> Self::Item<'a> {
        next_ref(block)
    }
}

impl<T: Component> QueryParam for &mut T {
    type Block<'a> = &'a mut [T];
    type Item<'a> = &'a mut T;

    fn terms(out: &mut Vec<QueryTerm>) {
        out.push(QueryTerm::of::<T>(false, false));
    }

    fn fetch<'a>(source: &mut ColumnSource<'a>) -> &'a mut [T] {
        write_column(source.required())
    }

    fn next_item<'a>(block: &mut Self::Block<'a>) -> Self::Item<'a> {
        next_mut(block)
    }
}

impl<T: Component> QueryParam for Option<&T> {
    type Block<'a> = Option<&'a [T]>;
    type Item<'a> = Option<&'a T>;

    fn terms(out: &mut Vec<QueryTerm>) {
        out.push(QueryTerm::of::<T>(true, true));
    }

    fn fetch<'a>(source: &mut ColumnSource<'a>) -> Option<&'a [T]> {
        source.optional().map(read_column)
    }

    fn next_item<'a>(block: &mut Self::Block<'a>) -> Self::Item<'a> {
        match block {
            Some(slice) => Some(next_ref(slice)),
            None => None,
        }
    }
}

impl<T: Component> QueryParam for Option<&mut T> {
    type Block<'a> = Option<&'a mut [T]>;
    type Item<'a> = Option<&'a mut T>;

    fn terms(out: &mut Vec<QueryTerm>) {
        out.push(QueryTerm::of::<T>(true, false));
    }

    fn fetch<'a>(source: &mut ColumnSource<'a>) -> Option<&'a mut [T]> {
        source.optional().map(write_column)
    }

    fn next_item<'a>(block: &mut Self::Block<'a>) -> Self::Item<'a> {
        match block {
            Some(slice) => Some(next_mut(slice)),
            None => None,
        }
    }
}

macro_rules! impl_query_param_tuple {
    ($($name:ident),+) => {
        impl<$($name: QueryParam),+> QueryParam for ($($name,)+) {
            type Block<'a> = ($($name::Block<'a>,)+);
            type Item<'a> = ($($name::Item<'a>,)+);

            fn terms(out: &mut Vec<QueryTerm>) {
                $($name::terms(out);)+
            }

            fn fetch<'a>(source: &mut ColumnSource<'a>) -> Self::Block<'a> {
                ($($name::fetch(source),)+)
            }

            #[allow(non_snake_case)]
            fn next_item<'a>(block: &mut Self::Block<'a>) -> Self::Item<'a> {
                let ($($name,)+) = block;
                ($($name::next_item($name),)+)
            }
        }
    };
}

impl_query_param_tuple!(A);
impl_query_param_tuple!(A, B);
impl_query_param_tuple!(A, B, C);
impl_query_param_tuple!(A, B, C, D);
impl_query_param_tuple!(A, B, C, D, E);
impl_query_param_tuple!(A, B, C, D, E, F);
impl_query_param_tuple!(A, B, C, D, E, F, G);
impl_query_param_tuple!(A, B, C, D, E, F, G, H);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ColumnLayout {
    offset: usize,
    size: usize,
}

#[derive(Clone, Debug)]
struct ArchetypeColumns {
    instance: ArchetypeInstance,
    columns: Vec<Option<ColumnLayout>>,
}

/// Maps every query term to its slot in an archetype, `None` if absent.
#[must_use]
pub fn argument_slot_map(terms: &[QueryTerm], info: &ArchetypeInfo) -> Vec<Option<usize>> {
    terms
        .iter()
        .map(|term| info.component_slot(term.id))
        .collect()
}

fn column_layouts(terms: &[QueryTerm], info: &ArchetypeInfo) -> Vec<Option<ColumnLayout>> {
    argument_slot_map(terms, info)
        .into_iter()
        .zip(terms)
        .map(|(slot, term)| {
            let slot = slot?;
            assert_eq!(
                info.components()[slot].size,
                term.size,
                "Component {:?} has a different size in archetype '{}'",
                term.id,
                info.name()
            );
            info.column_offset(slot).map(|offset| ColumnLayout {
                offset,
                size: term.size as usize,
            })
        })
        .collect()
}

/// A typed query over entity storage.
///
/// # Example
///
/// ```rust,ignore
/// let query = ComponentQuery::<(&Position, &mut Velocity)>::new(storage.archetype_index());
///
/// query.for_each_block(&mut storage, |count, (positions, velocities)| {
///     for i in 0..count {
///         velocities[i].x += positions[i].x;
///     }
/// });
/// ```
pub struct ComponentQuery<Q: QueryParam> {
    descriptor: QueryDescriptor,
    archetypes: Vec<Archetype>,
    layouts: Vec<ArchetypeColumns>,
    _marker: PhantomData<fn() -> Q>,
}

impl<Q: QueryParam> ComponentQuery<Q> {
    /// Creates the query and resolves matching archetypes.
    #[must_use]
    pub fn new(index: &ArchetypeIndex) -> Self {
        Self::with_descriptor(QueryDescriptor::of::<Q>(), index)
    }

    /// Creates the query from a descriptor extended with tags.
    ///
    /// # Panics
    ///
    /// Panics if the descriptor's terms differ from those of `Q`.
    #[must_use]
    pub fn with_descriptor(descriptor: QueryDescriptor, index: &ArchetypeIndex) -> Self {
        assert_eq!(
            descriptor.terms(),
            QueryDescriptor::of::<Q>().terms(),
            "Query descriptor does not match the query parameters"
        );
        let mut query = Self {
            descriptor,
            archetypes: Vec::new(),
            layouts: Vec::new(),
            _marker: PhantomData,
        };
        query.refresh(index);
        query
    }

    /// Resolves matching archetypes again, picking up new registrations.
    pub fn refresh(&mut self, index: &ArchetypeIndex) {
        index.find_archetypes(
            &mut self.archetypes,
            &self.descriptor.terms,
            &self.descriptor.tags,
        );

        let mut infos = Vec::with_capacity(self.archetypes.len());
        index.fetch_archetype_infos(&self.archetypes, &mut infos);
        self.layouts = infos
            .iter()
            .map(|info| ArchetypeColumns {
                instance: info.instance(),
                columns: column_layouts(&self.descriptor.terms, info),
            })
            .collect();
        self.layouts.sort_by_key(|layout| layout.instance);
    }

    /// Returns the descriptor.
    #[inline]
    #[must_use]
    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.descriptor
    }

    /// Returns the matching archetypes.
    #[inline]
    #[must_use]
    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    /// Returns the number of entities the query visits.
    #[must_use]
    pub fn entity_count(&self, storage: &EntityStorage) -> usize {
        self.layouts
            .iter()
            .flat_map(|layout| storage.blocks(layout.instance))
            .map(|block| block.entity_count() as usize)
            .sum()
    }

    /// Returns the number of non-empty blocks the query visits.
    #[must_use]
    pub fn block_count(&self, storage: &EntityStorage) -> usize {
        self.layouts
            .iter()
            .flat_map(|layout| storage.blocks(layout.instance))
            .filter(|block| !block.is_empty())
            .count()
    }

    /// Calls `callback` with the entity count and columns of every
    /// non-empty matching block.
    pub fn for_each_block<'s, F>(&self, storage: &'s mut EntityStorage, mut callback: F)
    where
        F: FnMut(usize, Q::Block<'s>),
    {
        let mut layouts = self.layouts.iter().peekable();
        for (instance, chain) in storage.chains_mut().enumerate() {
            let Some(layout) = layouts.next_if(|layout| layout.instance.index() == instance) else {
                continue;
            };
            for block in chain.iter_mut() {
                let count = block.entity_count() as usize;
                if count == 0 {
                    continue;
                }
                let mut source = ColumnSource::split(block.bytes_mut(), &layout.columns, 0, count);
                callback(count, Q::fetch(&mut source));
            }
            if layouts.peek().is_none() {
                break;
            }
        }
    }

    /// Calls `callback` for every matching entity.
    pub fn for_each_entity<'s, F>(&self, storage: &'s mut EntityStorage, mut callback: F)
    where
        F: FnMut(Q::Item<'s>),
    {
        self.for_each_block(storage, |count, mut block| {
            for _ in 0..count {
                callback(Q::next_item(&mut block));
            }
        });
    }

    /// Calls `callback` for a single entity if its archetype matches.
    ///
    /// # Returns
    ///
    /// False if the entity has no data or does not match the query.
    pub fn for_entity<'s, F>(&self, storage: &'s mut EntityStorage, entity: Entity, callback: F) -> bool
    where
        F: FnOnce(Q::Item<'s>),
    {
        let Some(location) = storage.location(entity) else {
            return false;
        };
        let Ok(position) = self
            .layouts
            .binary_search_by_key(&location.archetype, |layout| layout.instance)
        else {
            return false;
        };
        let Some(block) = storage.block_mut(location.archetype, location.block) else {
            return false;
        };
        if location.slot >= block.entity_count() {
            return false;
        }

        let layout = &self.layouts[position];
        let mut source =
            ColumnSource::split(block.bytes_mut(), &layout.columns, location.slot as usize, 1);
        let mut columns = Q::fetch(&mut source);
        callback(Q::next_item(&mut columns));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::ecs::archetype::ArchetypeDescriptor;
    use bytemuck::{Pod, Zeroable};

    #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Position {
        x: f32,
        y: f32,
    }

    impl Component for Position {
        const NAME: &'static str = "test.position";
    }

    #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Velocity {
        x: f32,
        y: f32,
    }

    impl Component for Velocity {
        const NAME: &'static str = "test.velocity";
    }

    #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Mass {
        value: f64,
    }

    impl Component for Mass {
        const NAME: &'static str = "test.mass";
    }

    #[allow(dead_code)]
    struct Sleeping;

    impl Tag for Sleeping {
        const NAME: &'static str = "test.sleeping";
    }

    fn storage() -> EntityStorage {
        EntityStorage::new(&StorageConfig {
            block_size: 512,
            ..StorageConfig::default()
        })
    }

    #[test]
    fn test_descriptor_terms() {
        let descriptor = QueryDescriptor::of::<(Entity, &Position, Option<&mut Velocity>)>();
        let terms = descriptor.terms();
        assert_eq!(terms.len(), 3);
        assert_eq!(terms[0].id, Entity::ID);
        assert!(terms[1].read_only && !terms[1].optional);
        assert!(!terms[2].read_only && terms[2].optional);
        assert_eq!(terms[2].size, 8);
    }

    #[test]
    #[should_panic(expected = "appears twice")]
    fn test_descriptor_rejects_duplicates() {
        let _ = QueryDescriptor::of::<(&Position, &mut Position)>();
    }

    #[test]
    fn test_slot_map_with_missing_optional() {
        let mut storage = storage();
        let archetype = storage.register_archetype(
            &ArchetypeDescriptor::new("pm").with::<Position>().with::<Mass>(),
        );
        let info = storage.archetype_index().archetype_info(archetype).unwrap();
        let descriptor = QueryDescriptor::of::<(Entity, &Position, Option<&Velocity>)>();

        let slots = argument_slot_map(descriptor.terms(), info);
        assert_eq!(slots[0], Some(0));
        assert_eq!(slots[1], info.component_slot(Position::ID));
        assert_eq!(slots[2], None);
    }

    #[test]
    fn test_for_each_entity_updates_values() {
        let mut storage = storage();
        let archetype = storage.register_archetype(
            &ArchetypeDescriptor::new("pv").with::<Position>().with::<Velocity>(),
        );
        for i in 0..100 {
            let entity = Entity::new(i, 0);
            storage.set_archetype(entity, archetype);
            *storage.get_mut::<Velocity>(entity).unwrap() = Velocity { x: 1.0, y: i as f32 };
        }

        let query = ComponentQuery::<(&mut Position, &Velocity)>::new(storage.archetype_index());
        assert!(query.block_count(&storage) > 1);
        query.for_each_entity(&mut storage, |(position, velocity)| {
            position.x += velocity.x;
            position.y += velocity.y;
        });

        for i in 0..100 {
            let position = storage.get::<Position>(Entity::new(i, 0)).unwrap();
            assert_eq!(*position, Position { x: 1.0, y: i as f32 });
        }
    }

    #[test]
    fn test_for_each_block_skips_empty_blocks() {
        let mut storage = storage();
        let archetype = storage.register_archetype(&ArchetypeDescriptor::new("p").with::<Position>());
        let entities: Vec<Entity> = (0..40).map(|i| Entity::new(i, 0)).collect();
        for &entity in &entities {
            storage.set_archetype(entity, archetype);
        }
        // Empty the first block completely
        let first_block: Vec<Entity> = entities
            .iter()
            .copied()
            .filter(|&e| storage.location(e).unwrap().block == 0)
            .collect();
        for entity in &first_block {
            storage.erase_data(*entity);
        }

        let query = ComponentQuery::<(Entity, &Position)>::new(storage.archetype_index());
        let mut visited = 0;
        query.for_each_block(&mut storage, |count, (block_entities, positions)| {
            assert!(count > 0);
            assert_eq!(block_entities.len(), count);
            assert_eq!(positions.len(), count);
            visited += count;
        });
        assert_eq!(visited, 40 - first_block.len());
        assert_eq!(query.entity_count(&storage), visited);
    }

    #[test]
    fn test_optional_columns() {
        let mut storage = storage();
        let with_velocity = storage.register_archetype(
            &ArchetypeDescriptor::new("pv").with::<Position>().with::<Velocity>(),
        );
        let without = storage.register_archetype(&ArchetypeDescriptor::new("p").with::<Position>());
        storage.set_archetype(Entity::new(0, 0), with_velocity);
        storage.set_archetype(Entity::new(1, 0), without);

        let query =
            ComponentQuery::<(Entity, &Position, Option<&mut Velocity>)>::new(storage.archetype_index());
        assert_eq!(query.archetypes().len(), 2);

        let mut seen = Vec::new();
        query.for_each_entity(&mut storage, |(entity, _, velocity)| {
            seen.push((entity, velocity.is_some()));
        });
        seen.sort();
        assert_eq!(seen, vec![(Entity::new(0, 0), true), (Entity::new(1, 0), false)]);
    }

    #[test]
    fn test_tag_filter() {
        let mut storage = storage();
        let awake = storage.register_archetype(&ArchetypeDescriptor::new("awake").with::<Position>());
        let asleep = storage.register_archetype(
            &ArchetypeDescriptor::new("asleep")
                .with::<Position>()
                .with_tag::<Sleeping>(),
        );

        let all = ComponentQuery::<&Position>::new(storage.archetype_index());
        assert_eq!(all.archetypes(), &[awake, asleep]);

        let sleeping = ComponentQuery::<&Position>::with_descriptor(
            QueryDescriptor::of::<&Position>().with_tag::<Sleeping>(),
            storage.archetype_index(),
        );
        assert_eq!(sleeping.archetypes(), &[asleep]);
    }

    #[test]
    fn test_refresh_picks_up_new_archetypes() {
        let mut storage = storage();
        storage.register_archetype(&ArchetypeDescriptor::new("p").with::<Position>());
        let mut query = ComponentQuery::<&Position>::new(storage.archetype_index());
        assert_eq!(query.archetypes().len(), 1);

        storage.register_archetype(&ArchetypeDescriptor::new("pm").with::<Position>().with::<Mass>());
        assert_eq!(query.archetypes().len(), 1);
        query.refresh(storage.archetype_index());
        assert_eq!(query.archetypes().len(), 2);
    }

    #[test]
    fn test_for_entity() {
        let mut storage = storage();
        let archetype = storage.register_archetype(
            &ArchetypeDescriptor::new("pm").with::<Position>().with::<Mass>(),
        );
        let entity = Entity::new(3, 0);
        storage.set_archetype(Entity::new(2, 0), archetype);
        storage.set_archetype(entity, archetype);

        let query = ComponentQuery::<(&mut Mass, Option<&Velocity>)>::new(storage.archetype_index());
        let found = query.for_entity(&mut storage, entity, |(mass, velocity)| {
            assert!(velocity.is_none());
            mass.value = 42.0;
        });
        assert!(found);
        assert_eq!(storage.get::<Mass>(entity).unwrap().value, 42.0);
        assert_eq!(storage.get::<Mass>(Entity::new(2, 0)).unwrap().value, 0.0);
        assert!(!query.for_entity(&mut storage, Entity::new(9, 0), |_| {}));
    }
}
