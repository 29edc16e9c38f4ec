//! # TESSERA Core
//!
//! Archetype based entity storage:
//! - Entities grouped by component set into cache-aligned, pooled blocks
//! - Typed queries resolved once, iterated block by block
//! - Deferred operation logs for structural changes
//!
//! ## Architecture Rules
//!
//! 1. **No unsafe code** - Block memory is viewed through `bytemuck`
//! 2. **Data-oriented design** - One contiguous column per component and block
//! 3. **Single writer** - Storage is mutated by one owner, other threads record operations
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessera_core::{ArchetypeDescriptor, ComponentQuery, StorageConfig, World};
//!
//! let mut world = World::new(&StorageConfig::default());
//! let mover = world.register_archetype(
//!     &ArchetypeDescriptor::new("Mover").with::<Position>().with::<Velocity>(),
//! );
//!
//! let query = ComponentQuery::<(&mut Position, &Velocity)>::new(world.storage().archetype_index());
//! query.for_each_entity(world.storage_mut(), |(position, velocity)| {
//!     position.x += velocity.x;
//! });
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]
#![allow(clippy::cast_possible_truncation, clippy::module_name_repetitions)]

pub mod config;
pub mod ecs;
pub mod error;
pub mod memory;
pub mod sync;

pub use config::StorageConfig;
pub use ecs::{
    Archetype, ArchetypeDescriptor, ArchetypeIndex, BlockFilter, Component, ComponentData,
    ComponentId, ComponentInfo, ComponentQuery, Entity, EntityIndex, EntityOperations,
    EntityStorage, QueryDescriptor, Tag, World,
};
pub use error::{TesseraError, TesseraResult};
pub use memory::{BlockPool, PoolId};
pub use sync::OperationQueue;
