//! Typed views over entities that hold every requested component.
//!
//! A query is described by access markers: `Read<T>`, `Write<T>`, or a
//! tuple of up to four of them. Acquiring a [`Query`] locks each involved
//! pool for its whole lifetime, so pools cannot change shape underneath
//! an iteration in progress.
//!
//! # Invariants
//! - Items are yielded in ascending slot order.
//! - Only entities holding every requested type are yielded.
//! - [`Query::iter`] restarts from the first match each time it is called.

use crate::entity::Entity;
use crate::error::EcsError;
use crate::pool::{Component, ComponentPool};
use crate::world::World;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock};
use std::any::TypeId;
use std::collections::btree_map;
use std::fmt;
use std::iter::Map;
use std::marker::PhantomData;

/// Shared access to `T`.
pub struct Read<T>(PhantomData<fn() -> T>);

/// Exclusive access to `T`.
pub struct Write<T>(PhantomData<fn() -> T>);

/// One component type requested by a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentAccess {
    pub type_id: TypeId,
    pub name: &'static str,
    pub mutable: bool,
}

impl fmt::Display for ComponentAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.name.rsplit("::").next().unwrap_or(self.name);
        if self.mutable {
            write!(f, "&mut {short}")
        } else {
            write!(f, "&{short}")
        }
    }
}

/// The component accesses a query (and therefore a system) requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySignature(pub Vec<ComponentAccess>);

impl QuerySignature {
    pub fn of<Q: QueryData>() -> Self {
        Self(Q::accesses())
    }

    pub fn reads<T: 'static>(&self) -> bool {
        self.0.iter().any(|a| a.type_id == TypeId::of::<T>())
    }

    pub fn writes<T: 'static>(&self) -> bool {
        self.0
            .iter()
            .any(|a| a.type_id == TypeId::of::<T>() && a.mutable)
    }
}

impl fmt::Display for QuerySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, access) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{access}")?;
        }
        f.write_str(")")
    }
}

/// Describes how a query acquires its pools and walks them.
pub trait QueryData: 'static {
    type Guards: 'static;
    type Item<'q>;
    type Iter<'q>: Iterator<Item = (u32, Self::Item<'q>)>
    where
        Self::Guards: 'q;

    fn accesses() -> Vec<ComponentAccess>;

    fn acquire(world: &World) -> Result<Self::Guards, EcsError>;

    fn iter(guards: &mut Self::Guards) -> Self::Iter<'_>;
}

type ReadEntry<'q, T> = (&'q u32, &'q T);
type WriteEntry<'q, T> = (&'q u32, &'q mut T);

impl<T: Component> QueryData for Read<T> {
    type Guards = ArcRwLockReadGuard<RawRwLock, ComponentPool<T>>;
    type Item<'q> = &'q T;
    type Iter<'q>
        = Map<btree_map::Iter<'q, u32, T>, fn(ReadEntry<'q, T>) -> (u32, &'q T)>
    where
        Self::Guards: 'q;

    fn accesses() -> Vec<ComponentAccess> {
        vec![access::<T>(false)]
    }

    fn acquire(world: &World) -> Result<Self::Guards, EcsError> {
        world
            .pool::<T>()
            .data()
            .try_read_arc()
            .ok_or(EcsError::BorrowConflict {
                component: std::any::type_name::<T>(),
                operation: "query",
            })
    }

    fn iter(guards: &mut Self::Guards) -> Self::Iter<'_> {
        guards.iter().map(read_entry as fn(_) -> _)
    }
}

impl<T: Component> QueryData for Write<T> {
    type Guards = ArcRwLockWriteGuard<RawRwLock, ComponentPool<T>>;
    type Item<'q> = &'q mut T;
    type Iter<'q>
        = Map<btree_map::IterMut<'q, u32, T>, fn(WriteEntry<'q, T>) -> (u32, &'q mut T)>
    where
        Self::Guards: 'q;

    fn accesses() -> Vec<ComponentAccess> {
        vec![access::<T>(true)]
    }

    fn acquire(world: &World) -> Result<Self::Guards, EcsError> {
        world
            .pool::<T>()
            .data()
            .try_write_arc()
            .ok_or(EcsError::BorrowConflict {
                component: std::any::type_name::<T>(),
                operation: "query",
            })
    }

    fn iter(guards: &mut Self::Guards) -> Self::Iter<'_> {
        guards.iter_mut().map(write_entry as fn(_) -> _)
    }
}

fn read_entry<'q, T>((slot, value): ReadEntry<'q, T>) -> (u32, &'q T) {
    (*slot, value)
}

fn write_entry<'q, T>((slot, value): WriteEntry<'q, T>) -> (u32, &'q mut T) {
    (*slot, value)
}

fn access<T: 'static>(mutable: bool) -> ComponentAccess {
    ComponentAccess {
        type_id: TypeId::of::<T>(),
        name: std::any::type_name::<T>(),
        mutable,
    }
}

/// Merge-join over slot-sorted iterators; yields only slots present in all.
pub struct Join<I>(I);

macro_rules! impl_query_tuple {
    ($(($name:ident, $item:ident, $idx:tt)),+) => {
        impl<$($name: QueryData),+> QueryData for ($($name,)+) {
            type Guards = ($($name::Guards,)+);
            type Item<'q> = ($($name::Item<'q>,)+);
            type Iter<'q>
                = Join<($($name::Iter<'q>,)+)>
            where
                Self::Guards: 'q;

            fn accesses() -> Vec<ComponentAccess> {
                let mut all = Vec::new();
                $(all.extend($name::accesses());)+
                all
            }

            fn acquire(world: &World) -> Result<Self::Guards, EcsError> {
                Ok(($($name::acquire(world)?,)+))
            }

            fn iter(guards: &mut Self::Guards) -> Self::Iter<'_> {
                Join(($($name::iter(&mut guards.$idx),)+))
            }
        }

        impl<$($name, $item),+> Iterator for Join<($($name,)+)>
        where
            $($name: Iterator<Item = (u32, $item)>),+
        {
            type Item = (u32, ($($item,)+));

            fn next(&mut self) -> Option<Self::Item> {
                let mut heads = ($(self.0.$idx.next()?,)+);
                loop {
                    let target = 0u32 $(.max(heads.$idx.0))+;
                    let mut aligned = true;
                    $(
                        while heads.$idx.0 < target {
                            heads.$idx = self.0.$idx.next()?;
                        }
                        if heads.$idx.0 != target {
                            aligned = false;
                        }
                    )+
                    if aligned {
                        return Some((target, ($(heads.$idx.1,)+)));
                    }
                }
            }
        }
    };
}

impl_query_tuple!((A, IA, 0));
impl_query_tuple!((A, IA, 0), (B, IB, 1));
impl_query_tuple!((A, IA, 0), (B, IB, 1), (C, IC, 2));
impl_query_tuple!((A, IA, 0), (B, IB, 1), (C, IC, 2), (D, ID, 3));

/// A live view over the world's pools.
///
/// Holding a `Query` keeps its pools locked: while it exists, structural
/// edits to those component types report [`EcsError::QueryMutationConflict`].
pub struct Query<'w, Q: QueryData> {
    world: &'w World,
    guards: Q::Guards,
}

impl<'w, Q: QueryData> Query<'w, Q> {
    pub(crate) fn new(world: &'w World) -> Result<Self, EcsError> {
        let accesses = Q::accesses();
        for (i, a) in accesses.iter().enumerate() {
            let clash = accesses[i + 1..]
                .iter()
                .any(|b| b.type_id == a.type_id && (a.mutable || b.mutable));
            if clash {
                return Err(EcsError::AccessConflict { component: a.name });
            }
        }
        let guards = Q::acquire(world)?;
        Ok(Self { world, guards })
    }

    /// Fresh traversal from the lowest matching slot.
    pub fn iter(&mut self) -> QueryIter<'_, Q> {
        QueryIter {
            world: self.world,
            inner: Q::iter(&mut self.guards),
        }
    }

    /// The world this query reads from, for structural edits on other types.
    pub fn world(&self) -> &'w World {
        self.world
    }

    pub fn entities(&mut self) -> Vec<Entity> {
        self.iter().map(|(entity, _)| entity).collect()
    }

    pub fn len(&mut self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&mut self) -> bool {
        self.iter().next().is_none()
    }

    pub fn signature(&self) -> QuerySignature {
        QuerySignature::of::<Q>()
    }
}

pub struct QueryIter<'q, Q: QueryData> {
    world: &'q World,
    inner: Q::Iter<'q>,
}

impl<'q, Q: QueryData> Iterator for QueryIter<'q, Q> {
    type Item = (Entity, Q::Item<'q>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (slot, item) = self.inner.next()?;
            if let Some(entity) = self.world.entity_at(slot) {
                return Some((entity, item));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_skips_unmatched_slots() {
        let a = vec![(0, 'a'), (2, 'b'), (5, 'c'), (9, 'd')].into_iter();
        let b = vec![(1, 10), (2, 20), (9, 90), (11, 110)].into_iter();
        let joined: Vec<_> = Join((a, b)).collect();
        assert_eq!(joined, vec![(2, ('b', 20)), (9, ('d', 90))]);
    }

    #[test]
    fn join_of_three_with_empty_member_is_empty() {
        let a = vec![(0, ()), (1, ())].into_iter();
        let b = vec![(0, ()), (1, ())].into_iter();
        let c = Vec::<(u32, ())>::new().into_iter();
        assert_eq!(Join((a, b, c)).count(), 0);
    }

    #[test]
    fn signature_display_lists_accesses() {
        struct Pos;
        struct Vel;
        let sig = QuerySignature::of::<(Read<Pos>, Write<Vel>)>();
        assert_eq!(sig.to_string(), "(&Pos, &mut Vel)");
        assert!(sig.writes::<Vel>());
        assert!(!sig.writes::<Pos>());
    }

    #[test]
    fn empty_world_query_is_empty() {
        let world = World::new();
        let mut q = world.query::<(Read<u32>, Write<u64>)>().unwrap();
        assert!(q.is_empty());
        assert_eq!(q.signature().0.len(), 2);
    }
}
