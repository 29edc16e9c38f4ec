//! # Archetype Index
//!
//! An archetype is a unique, sorted set of components. Every entity with
//! exactly that set lives in blocks laid out by the archetype.
//!
//! ## Block Layout
//!
//! ```text
//! Archetype {Entity, Position, Velocity}, 16 KiB block:
//! [filter][E0 E1 ... En][P0 P1 ... Pn][V0 V1 ... Vn]
//! ```
//!
//! Columns are packed one after another, each aligned to its component.
//! Iterating one component touches one contiguous run of memory.
//!
//! ## Matching
//!
//! Both archetype component lists and query terms are sorted by
//! identifier, so matching a query against an archetype is a single merge
//! walk over both lists.

use std::collections::HashMap;
use std::ops::Range;

use super::block::{BlockFilter, DataBlock};
use super::component::{Component, ComponentId, ComponentInfo, Tag};
use super::entity::Entity;
use super::query::QueryTerm;
use crate::config::StorageConfig;
use crate::memory::{align_forward, BlockPool, PoolId, BLOCK_ALIGNMENT};

/// Column offset of components without storage (tags).
pub const NO_STORAGE: u32 = u32::MAX;

/// Handle of an archetype, derived from its sorted component identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Archetype(u64);

impl Archetype {
    /// The invalid archetype. Operations targeting it destroy entities.
    pub const INVALID: Self = Self(0);

    const SEED: u64 = ComponentId::from_name("tessera.archetype").raw();
    const MIX: u64 = 0x9e37_79b9_7f4a_7c15;

    /// Computes the handle of an ordered component identifier list.
    #[must_use]
    pub fn from_identifiers(identifiers: &[ComponentId]) -> Self {
        let mut hash = Self::SEED;
        for id in identifiers {
            hash = (hash.rotate_left(5) ^ id.raw()).wrapping_mul(Self::MIX);
        }
        Self(hash)
    }

    /// Returns the raw handle value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Checks if this is a real archetype handle.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

/// Dense index of a registered archetype, in registration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ArchetypeInstance(u32);

impl ArchetypeInstance {
    #[inline]
    #[must_use]
    pub(crate) const fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    /// Returns the dense index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Definition of an archetype prior to registration.
///
/// The entity component always occupies slot 0. All other components are
/// kept sorted by identifier and must be unique.
///
/// # Example
///
/// ```rust,ignore
/// let descriptor = ArchetypeDescriptor::new("Projectile")
///     .with::<Position>()
///     .with::<Velocity>()
///     .with_tag::<Hostile>();
/// ```
#[derive(Clone, Debug)]
pub struct ArchetypeDescriptor {
    name: String,
    components: Vec<ComponentInfo>,
    filter: BlockFilter,
    pool: PoolId,
}

impl ArchetypeDescriptor {
    /// Starts a descriptor holding only the entity component.
    ///
    /// Slot 0 holds [`Entity::info`] until registration, which puts the
    /// index's entity component there.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            components: vec![Entity::info()],
            filter: BlockFilter::NONE,
            pool: PoolId::DEFAULT,
        }
    }

    /// Builds a descriptor from component descriptions in any order.
    ///
    /// An entity component in `components` is ignored.
    ///
    /// # Panics
    ///
    /// Panics if a component is listed twice.
    #[must_use]
    pub fn from_components(name: impl Into<String>, components: &[ComponentInfo]) -> Self {
        components
            .iter()
            .filter(|info| info.id != Entity::ID)
            .fold(Self::new(name), |descriptor, &info| descriptor.with_info(info))
    }

    /// Adds the data component `T`.
    #[must_use]
    pub fn with<T: Component>(self) -> Self {
        self.with_info(ComponentInfo::of::<T>())
    }

    /// Adds the tag `T`.
    #[must_use]
    pub fn with_tag<T: Tag>(self) -> Self {
        self.with_info(T::info())
    }

    /// Adds a component from its runtime description.
    ///
    /// # Panics
    ///
    /// Panics if the component is already part of the descriptor.
    #[must_use]
    pub fn with_info(mut self, info: ComponentInfo) -> Self {
        assert!(
            info.id != self.components[0].id,
            "The entity component is always present"
        );
        match self.components[1..].binary_search_by_key(&info.id, |c| c.id) {
            Ok(_) => panic!("Component '{}' added twice to archetype '{}'", info.name, self.name),
            Err(position) => self.components.insert(position + 1, info),
        }
        self
    }

    /// Stores filter data in every block of the archetype.
    #[must_use]
    pub fn with_filter(mut self, filter: BlockFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Allocates the archetype's blocks from `pool`.
    #[must_use]
    pub fn in_pool(mut self, pool: PoolId) -> Self {
        self.pool = pool;
        self
    }

    /// Returns the archetype name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the components, entity first, the rest sorted.
    #[inline]
    #[must_use]
    pub fn components(&self) -> &[ComponentInfo] {
        &self.components
    }

    /// Returns the component identifiers in storage order.
    #[must_use]
    pub fn identifiers(&self) -> Vec<ComponentId> {
        self.components.iter().map(|c| c.id).collect()
    }

    /// Returns the handle this descriptor registers as in an index using
    /// the default entity component.
    #[must_use]
    pub fn archetype(&self) -> Archetype {
        Archetype::from_identifiers(&self.identifiers())
    }
}

/// Metadata of a registered archetype. Immutable once registered.
#[derive(Debug)]
pub struct ArchetypeInfo {
    archetype: Archetype,
    instance: ArchetypeInstance,
    name: String,
    components: Vec<ComponentInfo>,
    identifiers: Vec<ComponentId>,
    offsets: Vec<u32>,
    entity_count_max: u32,
    pool: PoolId,
    filter: BlockFilter,
}

impl ArchetypeInfo {
    /// Returns the archetype handle.
    #[inline]
    #[must_use]
    pub const fn archetype(&self) -> Archetype {
        self.archetype
    }

    /// Returns the dense instance index.
    #[inline]
    #[must_use]
    pub const fn instance(&self) -> ArchetypeInstance {
        self.instance
    }

    /// Returns the archetype name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the components, entity first, the rest sorted.
    #[inline]
    #[must_use]
    pub fn components(&self) -> &[ComponentInfo] {
        &self.components
    }

    /// Returns the component identifiers in storage order.
    #[inline]
    #[must_use]
    pub fn identifiers(&self) -> &[ComponentId] {
        &self.identifiers
    }

    /// Returns the column offsets, [`NO_STORAGE`] for tags.
    #[inline]
    #[must_use]
    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    /// Returns how many entities fit into one block.
    #[inline]
    #[must_use]
    pub const fn entity_count_max(&self) -> u32 {
        self.entity_count_max
    }

    /// Returns the pool blocks are allocated from.
    #[inline]
    #[must_use]
    pub const fn pool(&self) -> PoolId {
        self.pool
    }

    /// Returns the block filter.
    #[inline]
    #[must_use]
    pub const fn filter(&self) -> BlockFilter {
        self.filter
    }

    /// Returns the slot of a component inside this archetype.
    ///
    /// [`Entity::ID`] always resolves to slot 0, whichever entity component
    /// the index uses.
    #[must_use]
    pub fn component_slot(&self, id: ComponentId) -> Option<usize> {
        if self.identifiers[0] == id || id == Entity::ID {
            return Some(0);
        }
        self.identifiers[1..]
            .binary_search(&id)
            .ok()
            .map(|position| position + 1)
    }

    /// Checks if the archetype contains a component.
    #[inline]
    #[must_use]
    pub fn has_component(&self, id: ComponentId) -> bool {
        self.component_slot(id).is_some()
    }

    /// Returns the byte offset of a slot's column, `None` for tags.
    #[inline]
    #[must_use]
    pub fn column_offset(&self, slot: usize) -> Option<usize> {
        match self.offsets[slot] {
            NO_STORAGE => None,
            offset => Some(offset as usize),
        }
    }

    /// Returns the byte range of one entity's value in a column.
    ///
    /// # Arguments
    ///
    /// * `slot` - Component slot in this archetype
    /// * `entity_slot` - Entity slot inside the block
    #[inline]
    #[must_use]
    pub fn element_range(&self, slot: usize, entity_slot: usize) -> Option<Range<usize>> {
        let size = self.components[slot].size as usize;
        self.column_offset(slot).map(|offset| {
            let start = offset + size * entity_slot;
            start..start + size
        })
    }

    /// Returns the live values of component `T` in a block.
    #[must_use]
    pub fn slice_for<'b, T: Component>(&self, block: &'b DataBlock) -> Option<&'b [T]> {
        let range = self.live_column::<T>(block.entity_count())?;
        Some(bytemuck::cast_slice(&block.bytes()[range]))
    }

    /// Returns the live values of component `T` in a block, mutably.
    #[must_use]
    pub fn slice_for_mut<'b, T: Component>(&self, block: &'b mut DataBlock) -> Option<&'b mut [T]> {
        let range = self.live_column::<T>(block.entity_count())?;
        Some(bytemuck::cast_slice_mut(&mut block.bytes_mut()[range]))
    }

    /// Returns the live entities of a block.
    #[must_use]
    pub fn entities<'b>(&self, block: &'b DataBlock) -> &'b [Entity] {
        match self.column_offset(0) {
            Some(offset) => {
                let len = std::mem::size_of::<Entity>() * block.entity_count() as usize;
                bytemuck::cast_slice(&block.bytes()[offset..offset + len])
            }
            None => &[],
        }
    }

    fn live_column<T: Component>(&self, entity_count: u32) -> Option<Range<usize>> {
        let slot = self.component_slot(T::ID)?;
        let size = self.components[slot].size as usize;
        if size != std::mem::size_of::<T>() || size == 0 {
            return None;
        }
        let offset = self.column_offset(slot)?;
        Some(offset..offset + size * entity_count as usize)
    }
}

/// Registry of archetypes and the block pools they allocate from.
///
/// # Example
///
/// ```rust,ignore
/// let mut index = ArchetypeIndex::new(&StorageConfig::default());
/// let archetype = index.register_archetype(
///     &ArchetypeDescriptor::new("Mover").with::<Position>().with::<Velocity>(),
/// );
///
/// let mut found = Vec::new();
/// index.find_archetypes(&mut found, QueryDescriptor::of::<&Position>().terms(), &[]);
/// assert_eq!(found, vec![archetype]);
/// ```
#[derive(Debug)]
pub struct ArchetypeIndex {
    entity_component: ComponentInfo,
    infos: Vec<ArchetypeInfo>,
    lookup: HashMap<Archetype, ArchetypeInstance>,
    pools: Vec<BlockPool>,
}

impl ArchetypeIndex {
    /// Creates an empty index with the default pool sized by `config`.
    #[must_use]
    pub fn new(config: &StorageConfig) -> Self {
        Self::with_entity_component(config, Entity::info())
    }

    /// Creates an empty index expecting `entity_component` in slot 0.
    ///
    /// # Panics
    ///
    /// Panics if the entity component is not 8 bytes with alignment 8.
    #[must_use]
    pub fn with_entity_component(config: &StorageConfig, entity_component: ComponentInfo) -> Self {
        assert!(
            entity_component.size == 8 && entity_component.alignment == 8,
            "The entity component must be a 64-bit handle"
        );
        Self {
            entity_component,
            infos: Vec::new(),
            lookup: HashMap::new(),
            pools: vec![BlockPool::new(config.block_size)],
        }
    }

    /// Returns the entity component expected in slot 0.
    #[inline]
    #[must_use]
    pub const fn entity_component(&self) -> ComponentInfo {
        self.entity_component
    }

    /// Registers an additional block pool.
    pub fn add_pool(&mut self, block_size: usize) -> PoolId {
        self.pools.push(BlockPool::new(block_size));
        PoolId::new((self.pools.len() - 1) as u32)
    }

    /// Returns a pool.
    ///
    /// # Panics
    ///
    /// Panics if the pool does not exist.
    #[inline]
    #[must_use]
    pub fn pool(&self, pool: PoolId) -> &BlockPool {
        &self.pools[pool.index()]
    }

    /// Returns a pool, mutably.
    ///
    /// # Panics
    ///
    /// Panics if the pool does not exist.
    #[inline]
    pub fn pool_mut(&mut self, pool: PoolId) -> &mut BlockPool {
        &mut self.pools[pool.index()]
    }

    /// Returns the number of registered archetypes.
    #[inline]
    #[must_use]
    pub fn registered_archetype_count(&self) -> usize {
        self.infos.len()
    }

    /// Registers an archetype and computes its block layout.
    ///
    /// Registering an already known component set logs a warning and
    /// returns the existing handle.
    ///
    /// # Panics
    ///
    /// - Fewer than two components (the entity component plus one more)
    /// - Slot 0 is neither [`Entity::info`] nor the index's entity component
    /// - The entity component appears past slot 0
    /// - A component alignment above 64
    /// - The block cannot hold filter data and at least one entity
    pub fn register_archetype(&mut self, descriptor: &ArchetypeDescriptor) -> Archetype {
        let components = descriptor.components();
        assert!(
            components.len() >= 2,
            "Archetype '{}' needs at least one component besides the entity",
            descriptor.name()
        );
        assert!(
            components[0] == Entity::info() || components[0] == self.entity_component,
            "Archetype '{}' does not start with the entity component",
            descriptor.name()
        );
        let mut components = components.to_vec();
        components[0] = self.entity_component;
        assert!(
            components[1..].iter().all(|c| c.id != self.entity_component.id),
            "Archetype '{}' lists the entity component twice",
            descriptor.name()
        );

        let identifiers: Vec<ComponentId> = components.iter().map(|c| c.id).collect();
        let archetype = Archetype::from_identifiers(&identifiers);
        if let Some(&existing) = self.lookup.get(&archetype) {
            tracing::warn!(
                "Archetype '{}' is already registered as '{}'",
                descriptor.name(),
                self.infos[existing.index()].name
            );
            return archetype;
        }
        assert!(archetype.is_valid(), "Archetype identifier collides with INVALID");

        let pool = descriptor.pool;
        let block_size = self.pool(pool).block_size();
        let filter = descriptor.filter;
        let (offsets, entity_count_max) =
            compute_layout(&components, filter.data_size as usize, block_size);

        let instance = ArchetypeInstance(self.infos.len() as u32);
        tracing::debug!(
            "Registered archetype '{}' ({} components, {} entities per block)",
            descriptor.name(),
            components.len(),
            entity_count_max
        );

        self.infos.push(ArchetypeInfo {
            archetype,
            instance,
            name: descriptor.name().to_string(),
            components,
            identifiers,
            offsets,
            entity_count_max,
            pool,
            filter,
        });
        self.lookup.insert(archetype, instance);
        archetype
    }

    /// Finds every archetype that satisfies a query.
    ///
    /// Terms naming the entity component are skipped. An archetype is
    /// returned when it contains every required term and every tag.
    ///
    /// # Panics
    ///
    /// Panics if the query has neither a required component nor a tag.
    pub fn find_archetypes(
        &self,
        out: &mut Vec<Archetype>,
        terms: &[QueryTerm],
        tags: &[ComponentId],
    ) {
        out.clear();

        let mut conditions: Vec<QueryTerm> = terms
            .iter()
            .filter(|term| term.id != self.entity_component.id && term.id != Entity::ID)
            .copied()
            .collect();
        conditions.sort_unstable_by_key(|term| term.id);
        let mut tags = tags.to_vec();
        tags.sort_unstable();

        assert!(
            !tags.is_empty() || conditions.iter().any(|term| !term.optional),
            "Query needs at least one required component or tag"
        );

        for info in &self.infos {
            let Some(matched) = contains_required_components(&conditions, &info.identifiers)
            else {
                continue;
            };
            if !contains_required_tags(&tags, &info.identifiers) {
                continue;
            }
            if matched as usize + tags.len() > 0 {
                out.push(info.archetype);
            }
        }
    }

    /// Returns the archetype registered for an exact identifier list.
    ///
    /// The list must be in storage order: entity first, the rest sorted.
    /// Returns [`Archetype::INVALID`] if the set is not registered.
    #[must_use]
    pub fn find_archetype_by_components(&self, identifiers: &[ComponentId]) -> Archetype {
        let archetype = Archetype::from_identifiers(identifiers);
        if self.lookup.contains_key(&archetype) {
            archetype
        } else {
            Archetype::INVALID
        }
    }

    /// Returns the metadata of an archetype.
    #[inline]
    #[must_use]
    pub fn archetype_info(&self, archetype: Archetype) -> Option<&ArchetypeInfo> {
        self.lookup
            .get(&archetype)
            .map(|instance| &self.infos[instance.index()])
    }

    /// Returns the instance index of an archetype.
    #[inline]
    #[must_use]
    pub fn instance_of(&self, archetype: Archetype) -> Option<ArchetypeInstance> {
        self.lookup.get(&archetype).copied()
    }

    /// Returns the metadata of an instance.
    ///
    /// # Panics
    ///
    /// Panics if the instance does not exist.
    #[inline]
    #[must_use]
    pub fn instance_info(&self, instance: ArchetypeInstance) -> &ArchetypeInfo {
        &self.infos[instance.index()]
    }

    /// Iterates all registered archetypes in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ArchetypeInfo> {
        self.infos.iter()
    }

    /// Resolves a batch of handles to their metadata.
    ///
    /// `out` is cleared first.
    ///
    /// # Panics
    ///
    /// Panics if any handle is not registered.
    pub fn fetch_archetype_infos<'a>(
        &'a self,
        archetypes: &[Archetype],
        out: &mut Vec<&'a ArchetypeInfo>,
    ) {
        out.clear();
        out.extend(archetypes.iter().map(|&archetype| {
            match self.archetype_info(archetype) {
                Some(info) => info,
                None => panic!("Archetype {archetype:?} is not registered"),
            }
        }));
    }

    /// Resolves a batch of handles to their instance indices.
    ///
    /// # Panics
    ///
    /// Panics if the slices differ in length or a handle is not registered.
    pub fn fetch_archetype_instances(
        &self,
        archetypes: &[Archetype],
        out: &mut [ArchetypeInstance],
    ) {
        assert_eq!(
            archetypes.len(),
            out.len(),
            "Archetype and output spans differ in size"
        );
        for (archetype, slot) in archetypes.iter().zip(out.iter_mut()) {
            *slot = match self.instance_of(*archetype) {
                Some(instance) => instance,
                None => panic!("Archetype {archetype:?} is not registered"),
            };
        }
    }
}

/// Computes column offsets and the per-block entity capacity.
fn compute_layout(
    components: &[ComponentInfo],
    filter_size: usize,
    block_size: usize,
) -> (Vec<u32>, u32) {
    let size_sum: usize = components.iter().map(|c| c.size as usize).sum();
    let alignment_sum: usize = components.iter().map(|c| c.alignment as usize).sum();
    for component in components {
        assert!(
            component.alignment as usize <= BLOCK_ALIGNMENT,
            "Component '{}' requires alignment {} above {BLOCK_ALIGNMENT}",
            component.name,
            component.alignment
        );
    }

    let available = block_size.saturating_sub(filter_size + alignment_sum);
    let entity_count_max = available / size_sum;
    assert!(
        entity_count_max > 0,
        "Block of {block_size} bytes cannot hold a single entity"
    );

    let mut cursor = filter_size;
    let offsets = components
        .iter()
        .map(|component| {
            if component.alignment == 0 {
                return NO_STORAGE;
            }
            cursor = align_forward(cursor, component.alignment as usize);
            let offset = cursor;
            cursor += component.size as usize * entity_count_max;
            offset as u32
        })
        .collect();
    debug_assert!(cursor <= block_size, "Archetype layout overflows its block");

    (offsets, entity_count_max as u32)
}

/// Merge-walks sorted query conditions against an archetype's identifiers.
///
/// `identifiers[0]` is the entity component and is skipped. Conditions must
/// be sorted by identifier and must not name the entity component.
///
/// # Returns
///
/// The number of conditions present in the archetype, or `None` if a
/// required condition is missing.
#[must_use]
pub fn contains_required_components(
    conditions: &[QueryTerm],
    identifiers: &[ComponentId],
) -> Option<u32> {
    let identifiers = identifiers.get(1..).unwrap_or(&[]);
    let mut cursor = 0;
    let mut matched = 0;

    for condition in conditions {
        while cursor < identifiers.len() && identifiers[cursor] < condition.id {
            cursor += 1;
        }
        if cursor < identifiers.len() && identifiers[cursor] == condition.id {
            matched += 1;
            cursor += 1;
        } else if !condition.optional {
            return None;
        }
    }
    Some(matched)
}

/// Merge-walks sorted tag identifiers against an archetype's identifiers.
///
/// Every tag must be present.
#[must_use]
pub fn contains_required_tags(tags: &[ComponentId], identifiers: &[ComponentId]) -> bool {
    let identifiers = identifiers.get(1..).unwrap_or(&[]);
    let mut cursor = 0;

    tags.iter().all(|tag| {
        while cursor < identifiers.len() && identifiers[cursor] < *tag {
            cursor += 1;
        }
        cursor < identifiers.len() && identifiers[cursor] == *tag
    })
}
