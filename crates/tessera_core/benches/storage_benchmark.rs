//! # Archetype Storage Benchmark
//!
//! Measures:
//! 1. Query iteration over a dense archetype
//! 2. Migration between archetypes
//! 3. Recording and applying an operation log

#![allow(missing_docs)]
#![allow(dead_code)]

use bytemuck::{Pod, Zeroable};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tessera_core::{
    ArchetypeDescriptor, Component, ComponentData, ComponentQuery, Entity, EntityOperations,
    StorageConfig, World,
};

const ENTITY_COUNT: usize = 100_000;

#[derive(Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
struct Position {
    x: f32,
    y: f32,
    z: f32,
}

impl Component for Position {
    const NAME: &'static str = "bench.position";
}

#[derive(Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
struct Velocity {
    x: f32,
    y: f32,
    z: f32,
}

impl Component for Velocity {
    const NAME: &'static str = "bench.velocity";
}

#[derive(Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
struct Frozen {
    ticks: u32,
}

impl Component for Frozen {
    const NAME: &'static str = "bench.frozen";
}

fn populated_world() -> (World, Vec<Entity>) {
    let config = StorageConfig::default();
    let mut world = World::new(&config);
    let mover = world.register_archetype(
        &ArchetypeDescriptor::new("mover").with::<Position>().with::<Velocity>(),
    );

    let velocities = vec![
        Velocity {
            x: 1.0,
            y: 0.5,
            z: 0.25,
        };
        ENTITY_COUNT
    ];
    let mut operations = EntityOperations::new(&config);
    let entities = operations
        .build(mover)
        .create_entities(world.entity_index_mut(), ENTITY_COUNT)
        .with_data(&[ComponentData::of(&velocities)]);
    world.execute_operations(&operations);
    (world, entities)
}

fn bench_query_iteration(c: &mut Criterion) {
    let (mut world, _) = populated_world();
    let query = ComponentQuery::<(&mut Position, &Velocity)>::new(world.storage().archetype_index());

    c.bench_function("query_for_each_entity_100k", |b| {
        b.iter(|| {
            query.for_each_entity(world.storage_mut(), |(position, velocity)| {
                position.x += velocity.x * 0.016;
                position.y += velocity.y * 0.016;
                position.z += velocity.z * 0.016;
            });
        });
    });

    c.bench_function("query_for_each_block_100k", |b| {
        b.iter(|| {
            query.for_each_block(world.storage_mut(), |count, (positions, velocities)| {
                for i in 0..count {
                    positions[i].x += velocities[i].x * 0.016;
                }
            });
        });
    });

    let read = ComponentQuery::<&Position>::new(world.storage().archetype_index());
    c.bench_function("query_sum_100k", |b| {
        b.iter(|| {
            let mut sum = 0.0f32;
            read.for_each_entity(world.storage_mut(), |position| sum += position.x);
            black_box(sum)
        });
    });
}

fn bench_migration(c: &mut Criterion) {
    let (mut world, entities) = populated_world();
    let frozen = world.register_archetype(
        &ArchetypeDescriptor::new("frozen")
            .with::<Position>()
            .with::<Velocity>()
            .with::<Frozen>(),
    );
    let mover = world
        .storage()
        .archetype_of(entities[0]);
    let batch = &entities[..1_000];

    c.bench_function("migrate_1k_round_trip", |b| {
        b.iter(|| {
            for &entity in batch {
                world.change_archetype(entity, frozen);
            }
            for &entity in batch {
                world.change_archetype(entity, mover);
            }
        });
    });
}

fn bench_operation_log(c: &mut Criterion) {
    let config = StorageConfig::default();
    let mut world = World::new(&config);
    let mover = world.register_archetype(
        &ArchetypeDescriptor::new("mover").with::<Position>().with::<Velocity>(),
    );
    let entities = world.create_many(10_000);
    let velocities = vec![Velocity::default(); entities.len()];
    let mut operations = EntityOperations::new(&config);

    c.bench_function("record_and_apply_10k", |b| {
        b.iter(|| {
            operations
                .build(mover)
                .with_entities(&entities)
                .with_data(&[ComponentData::of(&velocities)]);
            world.execute_operations(&operations);
            operations.clear();

            operations.build(mover).with_entities(&entities).finalize();
            black_box(operations.len());
            operations.clear();
        });
    });
}

criterion_group!(
    benches,
    bench_query_iteration,
    bench_migration,
    bench_operation_log,
);
criterion_main!(benches);
