//! Generation-safe entity store with typed component pools, queries and
//! schedules.
//!
//! Entities are `{slot, generation}` handles into an arena; components live
//! in one `BTreeMap` pool per type so iteration is deterministic. Queries
//! lock the pools they touch, which lets the world refuse structural edits
//! that would disturb an iteration in progress.
//!
//! # Invariants
//! - A destroyed entity's handle never resolves again, even after its slot
//!   is reused.
//! - A pool never holds a component for a dead slot.
//! - Query iteration order is ascending slot order.

mod entity;
mod error;
mod pool;
mod query;
mod schedule;
mod world;

pub use entity::{Entity, EntityAllocator};
pub use error::EcsError;
pub use pool::{Component, ComponentPool};
pub use query::{ComponentAccess, Join, Query, QueryData, QueryIter, QuerySignature, Read, Write};
pub use schedule::{Render, ScheduleLabel, SystemInfo, Update};
pub use world::{ComponentMut, ComponentRef, EntityBuilder, World};

pub fn crate_info() -> &'static str {
    "playground-ecs v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("ecs"));
    }
}
