//! # Operation Queue
//!
//! Hands recorded operation logs from worker threads to the owner of the
//! world.
//!
//! ```text
//! worker A: acquire -> record -> submit ─┐
//! worker B: acquire -> record -> submit ─┼─> pending ─> drain(world)
//! worker C: acquire -> record -> submit ─┘                  │
//!                  ▲                                         │
//!                  └──────────── recycled (cleared) ◄────────┘
//! ```

use parking_lot::Mutex;

use crate::config::StorageConfig;
use crate::ecs::{EntityOperations, World};

/// Collects operation logs submitted from many threads.
///
/// Logs are applied in submission order. Applied logs are cleared and
/// kept for reuse, so steady-state recording does not allocate new node
/// batches or data nodes.
#[derive(Debug)]
pub struct OperationQueue {
    config: StorageConfig,
    pending: Mutex<Vec<EntityOperations>>,
    recycled: Mutex<Vec<EntityOperations>>,
}

impl OperationQueue {
    /// Creates an empty queue whose logs use `config`.
    #[must_use]
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            config: config.clone(),
            pending: Mutex::new(Vec::new()),
            recycled: Mutex::new(Vec::new()),
        }
    }

    /// Returns an empty log, reusing a previously applied one if possible.
    #[must_use]
    pub fn acquire(&self) -> EntityOperations {
        self.recycled
            .lock()
            .pop()
            .unwrap_or_else(|| EntityOperations::new(&self.config))
    }

    /// Queues a log for the next [`Self::drain`]. Empty logs are recycled
    /// right away.
    pub fn submit(&self, operations: EntityOperations) {
        if operations.is_empty() {
            self.recycled.lock().push(operations);
            return;
        }
        self.pending.lock().push(operations);
    }

    /// Returns the number of logs waiting to be applied.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Applies every pending log to `world`.
    ///
    /// # Returns
    ///
    /// The number of applied logs.
    pub fn drain(&self, world: &mut World) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock());
        let applied = pending.len();

        let mut recycled = Vec::with_capacity(applied);
        for mut operations in pending {
            world.execute_operations(&operations);
            operations.clear();
            recycled.push(operations);
        }
        self.recycled.lock().extend(recycled);

        if applied > 0 {
            tracing::trace!("Applied {applied} operation logs");
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::{ArchetypeDescriptor, Component, ComponentData, Entity};
    use bytemuck::{Pod, Zeroable};

    #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Score {
        value: u64,
    }

    impl Component for Score {
        const NAME: &'static str = "test.score";
    }

    #[test]
    fn test_submit_from_threads() {
        let config = StorageConfig::default();
        let mut world = World::new(&config);
        let archetype = world.register_archetype(&ArchetypeDescriptor::new("scored").with::<Score>());
        let batches: Vec<Vec<Entity>> = (0..4).map(|_| world.create_many(25)).collect();

        let queue = OperationQueue::new(&config);
        std::thread::scope(|scope| {
            for (worker, entities) in batches.iter().enumerate() {
                let queue = &queue;
                scope.spawn(move || {
                    let scores: Vec<Score> = entities
                        .iter()
                        .map(|_| Score { value: worker as u64 })
                        .collect();
                    let mut operations = queue.acquire();
                    operations
                        .build(archetype)
                        .with_entities(entities)
                        .with_data(&[ComponentData::of(&scores)]);
                    queue.submit(operations);
                });
            }
        });

        assert_eq!(queue.pending_count(), 4);
        assert_eq!(queue.drain(&mut world), 4);
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(world.storage().entity_count(), 100);
        for (worker, entities) in batches.iter().enumerate() {
            for &entity in entities {
                assert_eq!(world.get::<Score>(entity), Some(&Score { value: worker as u64 }));
            }
        }
    }

    #[test]
    fn test_applied_logs_are_recycled() {
        let config = StorageConfig::default();
        let mut world = World::new(&config);
        let queue = OperationQueue::new(&config);

        let entity = world.create();
        let mut operations = queue.acquire();
        operations.destroy_entities(&[entity]);
        queue.submit(operations);
        queue.drain(&mut world);
        assert!(!world.is_alive(entity));

        let reused = queue.acquire();
        assert!(reused.is_empty());
        assert_eq!(queue.drain(&mut world), 0);
    }
}
