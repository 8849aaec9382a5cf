//! Per-type component storage.
//!
//! Each pool is a `BTreeMap` keyed by entity slot so iteration is ascending
//! and deterministic. Pool data lives behind an `Arc<RwLock<..>>` borrow
//! flag: queries hold owned guards, and structural edits only ever *try* to
//! lock, turning an overlap into an error instead of a deadlock or aliasing.
//!
//! Which slots a pool occupies is tracked next to the data lock, so
//! membership can be answered even while a query holds the pool for
//! writing. Edits touching a slot the pool does not hold never conflict.
//!
//! # Invariants
//! - A pool never holds an entry for a dead slot.
//! - At most one entry per slot.
//! - The occupied set always equals the key set of the pool data.

use crate::error::EcsError;
use parking_lot::RwLock;
use std::any::{Any, type_name};
use std::collections::btree_map;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Plain data attachable to an entity.
pub trait Component: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Component for T {}

#[derive(Debug)]
pub struct ComponentPool<T> {
    items: BTreeMap<u32, T>,
}

impl<T> Default for ComponentPool<T> {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }
}

impl<T> ComponentPool<T> {
    /// Insert or replace; returns the previous value.
    pub fn insert(&mut self, slot: u32, value: T) -> Option<T> {
        self.items.insert(slot, value)
    }

    pub fn remove(&mut self, slot: u32) -> Option<T> {
        self.items.remove(&slot)
    }

    pub fn get(&self, slot: u32) -> Option<&T> {
        self.items.get(&slot)
    }

    pub fn get_mut(&mut self, slot: u32) -> Option<&mut T> {
        self.items.get_mut(&slot)
    }

    pub fn contains(&self, slot: u32) -> bool {
        self.items.contains_key(&slot)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, u32, T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> btree_map::IterMut<'_, u32, T> {
        self.items.iter_mut()
    }
}

pub(crate) type SharedPool<T> = Arc<RwLock<ComponentPool<T>>>;

/// A pool's data lock plus the set of slots it occupies.
///
/// Keys only change through [`PoolCell::try_insert`] and
/// [`PoolCell::try_remove`], which update both under the data write lock.
pub(crate) struct PoolCell<T> {
    data: SharedPool<T>,
    occupied: RwLock<BTreeSet<u32>>,
}

impl<T: Component> PoolCell<T> {
    fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(ComponentPool::default())),
            occupied: RwLock::new(BTreeSet::new()),
        }
    }

    /// The lock queries and component guards borrow through.
    pub(crate) fn data(&self) -> &SharedPool<T> {
        &self.data
    }

    pub(crate) fn contains(&self, slot: u32) -> bool {
        self.occupied.read().contains(&slot)
    }

    pub(crate) fn len(&self) -> usize {
        self.occupied.read().len()
    }

    /// Insert or replace. Fails if a query holds the pool.
    pub(crate) fn try_insert(&self, slot: u32, value: T) -> Result<Option<T>, EcsError> {
        let mut data = self.data.try_write().ok_or(conflict::<T>("add"))?;
        self.occupied.write().insert(slot);
        Ok(data.insert(slot, value))
    }

    /// Remove `slot` if present. Fails only if it is present and a query
    /// holds the pool.
    pub(crate) fn try_remove(&self, slot: u32) -> Result<Option<T>, EcsError> {
        if !self.contains(slot) {
            return Ok(None);
        }
        let mut data = self.data.try_write().ok_or(conflict::<T>("remove"))?;
        self.occupied.write().remove(&slot);
        Ok(data.remove(slot))
    }
}

fn conflict<T>(operation: &'static str) -> EcsError {
    EcsError::QueryMutationConflict {
        component: type_name::<T>(),
        operation,
    }
}

/// Type-erased view used when an operation spans every pool.
pub(crate) trait ErasedPool: Send + Sync {
    fn component_name(&self) -> &'static str;

    /// Err if `slot` is present and the pool is held by a query.
    fn check_removable(&self, slot: u32) -> Result<(), EcsError>;

    /// Remove `slot`; callers run [`ErasedPool::check_removable`] first.
    fn remove_slot(&self, slot: u32) -> bool;

    fn len(&self) -> usize;
}

impl<T: Component> ErasedPool for PoolCell<T> {
    fn component_name(&self) -> &'static str {
        type_name::<T>()
    }

    fn check_removable(&self, slot: u32) -> Result<(), EcsError> {
        if !self.contains(slot) || self.data.try_write().is_some() {
            return Ok(());
        }
        Err(conflict::<T>("destroy an entity holding"))
    }

    fn remove_slot(&self, slot: u32) -> bool {
        matches!(self.try_remove(slot), Ok(Some(_)))
    }

    fn len(&self) -> usize {
        PoolCell::len(self)
    }
}

/// One registered pool, held both typed and erased.
pub(crate) struct PoolEntry {
    typed: Arc<dyn Any + Send + Sync>,
    pub(crate) erased: Arc<dyn ErasedPool>,
}

impl PoolEntry {
    pub(crate) fn new<T: Component>() -> Self {
        let cell = Arc::new(PoolCell::<T>::new());
        Self {
            typed: cell.clone(),
            erased: cell,
        }
    }

    pub(crate) fn typed<T: Component>(&self) -> Arc<PoolCell<T>> {
        self.typed
            .clone()
            .downcast::<PoolCell<T>>()
            .expect("pool stored under its own TypeId")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_replaces_existing_slot() {
        let mut pool = ComponentPool::default();
        assert_eq!(pool.insert(3, "a"), None);
        assert_eq!(pool.insert(3, "b"), Some("a"));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.get(3), Some(&"b"));
    }

    #[test]
    fn iteration_is_ascending_by_slot() {
        let mut pool = ComponentPool::default();
        for slot in [7, 2, 9, 0] {
            pool.insert(slot, slot * 10);
        }
        let slots: Vec<u32> = pool.iter().map(|(s, _)| *s).collect();
        assert_eq!(slots, vec![0, 2, 7, 9]);
    }

    #[test]
    fn occupied_set_follows_inserts_and_removals() {
        let cell = PoolCell::<u32>::new();
        cell.try_insert(4, 1).unwrap();
        cell.try_insert(4, 2).unwrap();
        cell.try_insert(9, 3).unwrap();
        assert_eq!(cell.len(), 2);
        assert_eq!(cell.try_remove(4).unwrap(), Some(2));
        assert!(!cell.contains(4));
        assert!(cell.contains(9));
        assert_eq!(cell.data().read().len(), 1);
    }

    #[test]
    fn only_present_slots_conflict_while_write_held() {
        let entry = PoolEntry::new::<u32>();
        let cell = entry.typed::<u32>();
        cell.try_insert(1, 5).unwrap();
        let guard = cell.data().write_arc();
        assert!(entry.erased.check_removable(1).is_err());
        assert!(entry.erased.check_removable(2).is_ok());
        assert_eq!(cell.try_remove(2).unwrap(), None);
        assert!(cell.try_remove(1).is_err());
        assert!(cell.try_insert(2, 7).is_err());
        assert_eq!(entry.erased.len(), 1);
        drop(guard);
        assert!(entry.erased.check_removable(1).is_ok());
        assert!(entry.erased.remove_slot(1));
        assert_eq!(entry.erased.len(), 0);
    }

    #[test]
    fn present_slot_conflicts_while_read_held() {
        let entry = PoolEntry::new::<u32>();
        let cell = entry.typed::<u32>();
        cell.try_insert(1, 5).unwrap();
        let _guard = cell.data().read_arc();
        assert!(entry.erased.check_removable(2).is_ok());
        assert!(entry.erased.check_removable(1).is_err());
    }
}
