//! The world: entity slots, component pools and schedules under one owner.
//!
//! Every operation takes `&self` so systems can call back into the world
//! while iterating a query. Overlap between a live query and a structural
//! edit of the same component type is detected at runtime.
//!
//! # Invariants
//! - Destroying an entity removes its components from every pool before the
//!   slot is released.
//! - Stale handles never resolve; operations on them are silent no-ops.
//! - A failed structural edit leaves every pool unchanged.

use crate::entity::{Entity, EntityAllocator};
use crate::error::EcsError;
use crate::pool::{Component, ComponentPool, ErasedPool, PoolCell, PoolEntry};
use crate::query::{Query, QueryData, QuerySignature};
use crate::schedule::{
    ScheduleLabel, ScheduleRegistry, SystemEntry, SystemInfo, short_system_name,
};
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock};
use std::any::{TypeId, type_name};
use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

#[derive(Default)]
pub struct World {
    entities: RefCell<EntityAllocator>,
    pools: RefCell<HashMap<TypeId, PoolEntry>>,
    schedules: RefCell<ScheduleRegistry>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Entities ---

    pub fn create(&self) -> Entity {
        self.entities.borrow_mut().allocate()
    }

    /// Create an entity and attach components fluently.
    pub fn spawn(&self) -> EntityBuilder<'_> {
        EntityBuilder {
            world: self,
            entity: self.create(),
        }
    }

    /// Destroy `entity` and all of its components.
    ///
    /// Returns `Ok(false)` for a stale handle. Fails without side effects if
    /// a live query holds a pool the entity has a component in; pools the
    /// entity is absent from never block.
    pub fn destroy(&self, entity: Entity) -> Result<bool, EcsError> {
        if !self.is_alive(entity) {
            return Ok(false);
        }
        let pools: Vec<Arc<dyn ErasedPool>> = self
            .pools
            .borrow()
            .values()
            .map(|p| p.erased.clone())
            .collect();
        for pool in &pools {
            pool.check_removable(entity.slot())?;
        }
        for pool in &pools {
            pool.remove_slot(entity.slot());
        }
        self.entities.borrow_mut().deallocate(entity);
        Ok(true)
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.borrow().is_alive(entity)
    }

    /// Live handles in ascending slot order.
    pub fn alive_entities(&self) -> Vec<Entity> {
        self.entities.borrow().alive().collect()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.borrow().alive_count()
    }

    pub(crate) fn entity_at(&self, slot: u32) -> Option<Entity> {
        self.entities.borrow().current(slot)
    }

    // --- Components ---

    /// Attach `value`, replacing any existing `T`. Returns `Ok(false)` for a
    /// stale handle.
    pub fn add_component<T: Component>(&self, entity: Entity, value: T) -> Result<bool, EcsError> {
        if !self.is_alive(entity) {
            return Ok(false);
        }
        self.pool::<T>().try_insert(entity.slot(), value)?;
        Ok(true)
    }

    /// Detach and return `entity`'s `T`. Absent or stale is `Ok(None)`, even
    /// while a query holds the pool.
    pub fn remove_component<T: Component>(&self, entity: Entity) -> Result<Option<T>, EcsError> {
        if !self.is_alive(entity) {
            return Ok(None);
        }
        match self.existing_pool::<T>() {
            Some(pool) => pool.try_remove(entity.slot()),
            None => Ok(None),
        }
    }

    pub fn has_component<T: Component>(&self, entity: Entity) -> bool {
        matches!(self.try_get::<T>(entity), Ok(Some(_)))
    }

    /// Shared access to `entity`'s `T`, or `None` if stale or absent.
    pub fn try_get<T: Component>(&self, entity: Entity) -> Result<Option<ComponentRef<T>>, EcsError> {
        if !self.is_alive(entity) {
            return Ok(None);
        }
        let Some(pool) = self.existing_pool::<T>() else {
            return Ok(None);
        };
        if !pool.contains(entity.slot()) {
            return Ok(None);
        }
        let guard = pool.data().try_read_arc().ok_or(EcsError::BorrowConflict {
            component: type_name::<T>(),
            operation: "read",
        })?;
        Ok(guard.contains(entity.slot()).then_some(ComponentRef {
            guard,
            slot: entity.slot(),
        }))
    }

    /// Exclusive access to `entity`'s `T`, or `None` if stale or absent.
    pub fn try_get_mut<T: Component>(
        &self,
        entity: Entity,
    ) -> Result<Option<ComponentMut<T>>, EcsError> {
        if !self.is_alive(entity) {
            return Ok(None);
        }
        let Some(pool) = self.existing_pool::<T>() else {
            return Ok(None);
        };
        if !pool.contains(entity.slot()) {
            return Ok(None);
        }
        let guard = pool.data().try_write_arc().ok_or(EcsError::BorrowConflict {
            component: type_name::<T>(),
            operation: "write",
        })?;
        Ok(guard.contains(entity.slot()).then_some(ComponentMut {
            guard,
            slot: entity.slot(),
        }))
    }

    /// Number of entities currently holding a `T`.
    pub fn component_count<T: Component>(&self) -> usize {
        self.existing_pool::<T>().map_or(0, |p| p.len())
    }

    // --- Queries ---

    /// Lock the pools `Q` names and return a view over matching entities.
    pub fn query<Q: QueryData>(&self) -> Result<Query<'_, Q>, EcsError> {
        Query::new(self)
    }

    /// Typed pool, created on first use so queries always have a lock to
    /// contend on.
    pub(crate) fn pool<T: Component>(&self) -> Arc<PoolCell<T>> {
        self.pools
            .borrow_mut()
            .entry(TypeId::of::<T>())
            .or_insert_with(PoolEntry::new::<T>)
            .typed::<T>()
    }

    fn existing_pool<T: Component>(&self) -> Option<Arc<PoolCell<T>>> {
        self.pools
            .borrow()
            .get(&TypeId::of::<T>())
            .map(PoolEntry::typed::<T>)
    }

    // --- Schedules ---

    /// Append `system` to schedule `L`. Registering again appends again.
    pub fn add_system<L: ScheduleLabel, Q: QueryData>(
        &self,
        mut system: impl FnMut(Query<'_, Q>) + 'static,
    ) {
        let info = SystemInfo {
            name: short_system_name(std::any::type_name_of_val(&system)),
            signature: QuerySignature::of::<Q>(),
        };
        tracing::debug!(
            schedule = L::name(),
            system = %info.name,
            signature = %info.signature,
            "system registered"
        );
        let run = Box::new(move |world: &World| -> Result<(), EcsError> {
            system(world.query::<Q>()?);
            Ok(())
        });
        self.schedules
            .borrow_mut()
            .push(TypeId::of::<L>(), L::name(), SystemEntry { info, run });
    }

    /// Run every system of `L` once, in registration order.
    ///
    /// Stops at the first system whose query cannot be acquired. Systems
    /// added to `L` during the run execute from the next run on.
    pub fn run_schedule<L: ScheduleLabel>(&self) -> Result<(), EcsError> {
        let label = TypeId::of::<L>();
        let systems = self.schedules.borrow_mut().begin(label, L::name())?;
        let mut run = ScheduleRun {
            registry: &self.schedules,
            label,
            systems,
        };
        let _span = tracing::debug_span!("run_schedule", schedule = L::name()).entered();

        for system in &mut run.systems {
            if let Err(err) = (system.run)(self) {
                tracing::debug!(system = %system.info.name, %err, "system aborted");
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn system_count<L: ScheduleLabel>(&self) -> usize {
        self.schedules.borrow().count(TypeId::of::<L>())
    }

    pub fn systems<L: ScheduleLabel>(&self) -> Vec<SystemInfo> {
        self.schedules.borrow().infos(TypeId::of::<L>())
    }

    /// Release all entities, components and systems.
    ///
    /// Call once, after GPU work that references scene data has finished.
    pub fn teardown(self) {
        let schedules = self.schedules.borrow();
        tracing::debug!(
            entities = self.entity_count(),
            pools = self.pools.borrow().len(),
            systems = schedules.total(),
            labels = ?schedules.labels(),
            "world teardown"
        );
    }
}

/// Systems taken out of the registry for one run. Handing them back on
/// drop keeps the schedule intact when a system unwinds.
struct ScheduleRun<'w> {
    registry: &'w RefCell<ScheduleRegistry>,
    label: TypeId,
    systems: Vec<SystemEntry>,
}

impl Drop for ScheduleRun<'_> {
    fn drop(&mut self) {
        let systems = std::mem::take(&mut self.systems);
        if let Ok(mut registry) = self.registry.try_borrow_mut() {
            registry.finish(self.label, systems);
        }
    }
}

/// Fluent component attachment for a freshly created entity.
pub struct EntityBuilder<'w> {
    world: &'w World,
    entity: Entity,
}

impl EntityBuilder<'_> {
    pub fn with<T: Component>(self, value: T) -> Result<Self, EcsError> {
        self.world.add_component(self.entity, value)?;
        Ok(self)
    }

    pub fn id(&self) -> Entity {
        self.entity
    }
}

/// Shared borrow of one component; holds its pool's read lock.
pub struct ComponentRef<T: Component> {
    guard: ArcRwLockReadGuard<RawRwLock, ComponentPool<T>>,
    slot: u32,
}

impl<T: Component> Deref for ComponentRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.get(self.slot).expect("component pinned by pool guard")
    }
}

/// Exclusive borrow of one component; holds its pool's write lock.
pub struct ComponentMut<T: Component> {
    guard: ArcRwLockWriteGuard<RawRwLock, ComponentPool<T>>,
    slot: u32,
}

impl<T: Component> Deref for ComponentMut<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.get(self.slot).expect("component pinned by pool guard")
    }
}

impl<T: Component> DerefMut for ComponentMut<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard
            .get_mut(self.slot)
            .expect("component pinned by pool guard")
    }
}
