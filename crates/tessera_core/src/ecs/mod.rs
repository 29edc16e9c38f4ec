//! # Entity Component System
//!
//! Archetype based storage: entities with the same component set share
//! fixed-size blocks, one column per component.
//!
//! ## Design Philosophy
//!
//! - Components are plain old data, stored as bytes in pooled blocks
//! - Archetypes are resolved once, iteration only touches block memory
//! - Structural changes from other threads go through an operation log

pub mod archetype;
mod block;
mod component;
mod entity;
mod operations;
pub mod query;
mod storage;
mod world;

pub use archetype::{
    Archetype, ArchetypeDescriptor, ArchetypeIndex, ArchetypeInfo, ArchetypeInstance, NO_STORAGE,
};
pub use block::{BlockFilter, BlockFilterFn, DataBlock};
pub use component::{Component, ComponentId, ComponentInfo, Tag};
pub use entity::{Entity, EntityIndex};
pub use operations::{
    ComponentData, EntityOperations, OperationBuilder, OperationHandle, OperationIter,
    OperationView,
};
pub use query::{ComponentQuery, QueryDescriptor, QueryParam, QueryTerm};
pub use storage::{EntityLocation, EntityStorage};
pub use world::World;
