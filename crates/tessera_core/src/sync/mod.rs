//! # Cross-Thread Recording
//!
//! Storage has a single owner. Other threads record structural changes
//! into [`EntityOperations`](crate::ecs::EntityOperations) logs and hand
//! them over through an [`OperationQueue`], which the owner drains once
//! per frame.

mod operation_queue;

pub use operation_queue::OperationQueue;
