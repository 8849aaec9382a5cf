//! Generation-tagged entity handles and the slot allocator behind them.
//!
//! # Invariants
//! - A slot's generation strictly increases each time its entity is destroyed.
//! - No two live entities share a slot.
//! - A slot whose generation would wrap is retired instead of reused.

use std::fmt;

/// Handle identifying a logical object in a [`World`](crate::World).
///
/// Two handles are equal iff slot and generation both match. A handle whose
/// generation no longer matches its slot is stale and never resolves.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity {
    slot: u32,
    generation: u32,
}

impl Entity {
    pub fn slot(self) -> u32 {
        self.slot
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.slot, self.generation)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.slot, self.generation)
    }
}

#[derive(Debug, Clone, Copy)]
struct SlotEntry {
    generation: u32,
    alive: bool,
}

/// Slot table plus freelist.
///
/// ```text
/// slots:     [g0 alive, g1 free, g0 alive, g2 free]
/// free_list: [1, 3]          <- popped from the back on allocate
/// ```
#[derive(Debug, Default)]
pub struct EntityAllocator {
    slots: Vec<SlotEntry>,
    free_list: Vec<u32>,
    alive: usize,
}

impl EntityAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a handle, reusing the most recently freed slot if any.
    pub fn allocate(&mut self) -> Entity {
        self.alive += 1;
        if let Some(slot) = self.free_list.pop() {
            let entry = &mut self.slots[slot as usize];
            entry.alive = true;
            return Entity {
                slot,
                generation: entry.generation,
            };
        }
        let slot = u32::try_from(self.slots.len()).expect("entity slot space exhausted");
        self.slots.push(SlotEntry {
            generation: 0,
            alive: true,
        });
        Entity {
            slot,
            generation: 0,
        }
    }

    /// Release `entity`'s slot. Returns `false` if the handle was already stale.
    pub fn deallocate(&mut self, entity: Entity) -> bool {
        if !self.is_alive(entity) {
            return false;
        }
        let entry = &mut self.slots[entity.slot as usize];
        entry.alive = false;
        self.alive -= 1;
        match entry.generation.checked_add(1) {
            Some(next) => {
                entry.generation = next;
                self.free_list.push(entity.slot);
            }
            // Retired: reusing it would hand out a generation seen before.
            None => tracing::debug!(slot = entity.slot, "retiring slot at generation limit"),
        }
        true
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.slots
            .get(entity.slot as usize)
            .is_some_and(|e| e.alive && e.generation == entity.generation)
    }

    /// The live handle currently occupying `slot`, if any.
    pub fn current(&self, slot: u32) -> Option<Entity> {
        self.slots
            .get(slot as usize)
            .filter(|e| e.alive)
            .map(|e| Entity {
                slot,
                generation: e.generation,
            })
    }

    pub fn alive_count(&self) -> usize {
        self.alive
    }

    /// Live handles in ascending slot order.
    pub fn alive(&self) -> impl Iterator<Item = Entity> + '_ {
        self.slots.iter().enumerate().filter_map(|(slot, e)| {
            e.alive.then_some(Entity {
                slot: slot as u32,
                generation: e.generation,
            })
        })
    }

    #[cfg(test)]
    fn force_generation(&mut self, slot: u32, generation: u32) {
        self.slots[slot as usize].generation = generation;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_fresh_slots_in_order() {
        let mut alloc = EntityAllocator::new();
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert_eq!((a.slot(), a.generation()), (0, 0));
        assert_eq!((b.slot(), b.generation()), (1, 0));
        assert_eq!(alloc.alive_count(), 2);
    }

    #[test]
    fn reused_slot_gets_new_generation() {
        let mut alloc = EntityAllocator::new();
        let a = alloc.allocate();
        assert!(alloc.deallocate(a));
        let b = alloc.allocate();
        assert_eq!(b.slot(), a.slot());
        assert_ne!(b.generation(), a.generation());
        assert!(!alloc.is_alive(a));
        assert!(alloc.is_alive(b));
    }

    #[test]
    fn double_deallocate_is_noop() {
        let mut alloc = EntityAllocator::new();
        let a = alloc.allocate();
        assert!(alloc.deallocate(a));
        assert!(!alloc.deallocate(a));
        assert_eq!(alloc.alive_count(), 0);
    }

    #[test]
    fn freed_slot_is_not_alive_before_reuse() {
        let mut alloc = EntityAllocator::new();
        let a = alloc.allocate();
        alloc.deallocate(a);
        assert_eq!(alloc.current(a.slot()), None);
        assert_eq!(alloc.alive().count(), 0);
    }

    #[test]
    fn alive_iterates_ascending_slots() {
        let mut alloc = EntityAllocator::new();
        let ids: Vec<Entity> = (0..5).map(|_| alloc.allocate()).collect();
        alloc.deallocate(ids[1]);
        alloc.deallocate(ids[3]);
        let slots: Vec<u32> = alloc.alive().map(Entity::slot).collect();
        assert_eq!(slots, vec![0, 2, 4]);
    }

    #[test]
    fn slot_at_generation_limit_is_retired() {
        let mut alloc = EntityAllocator::new();
        let a = alloc.allocate();
        alloc.force_generation(a.slot(), u32::MAX);
        let a = alloc.current(a.slot()).unwrap();
        assert!(alloc.deallocate(a));
        let b = alloc.allocate();
        assert_ne!(b.slot(), a.slot());
        assert!(!alloc.is_alive(a));
    }

    #[test]
    fn handle_formats_with_generation() {
        let mut alloc = EntityAllocator::new();
        let a = alloc.allocate();
        assert_eq!(a.to_string(), "0v0");
        assert_eq!(format!("{a:?}"), "Entity(0v0)");
    }
}
