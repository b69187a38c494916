//! GPU kernel generation and loop parallelization for a JIT backend.
//!
//! The pipeline, leaves first:
//! - [`classify`] maps IR opcodes to NVVM mnemonics
//! - [`symbol_map`] assigns kernel parameter slots to host symbols
//! - [`analysis`] decides which loops qualify for offload or vectorization
//! - [`emit`] renders a loop (or a whole method) as NVVM IR text
//! - [`host_transform`] splices the CPU/GPU dual path around an offloaded loop
//! - [`vectorize`] rewrites a loop to use vector operations
//! - [`parallelizer`] walks the region tree and drives all of the above

pub mod analysis;
pub mod classify;
pub mod config;
pub mod emit;
pub mod error;
pub mod host_transform;
pub mod ir;
pub mod parallelizer;
pub mod samples;
pub mod supervisor;
pub mod symbol_map;
pub mod vectorize;

#[cfg(test)]
mod analysis_tests;
#[cfg(test)]
mod classify_tests;
#[cfg(test)]
mod host_transform_tests;
#[cfg(test)]
mod integration_tests;
#[cfg(test)]
mod ir_tests;
#[cfg(test)]
mod symbol_map_tests;
#[cfg(test)]
mod vectorize_tests;

use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use config::{GpuOptions, ObjectModel, SimdTarget};
pub use error::{CompilerError, Result};
pub use parallelizer::{Parallelizer, PassReport};

// =============================================================================
// Generic ID allocation
// =============================================================================

/// Generic counter for generating unique IDs.
///
/// The ID type must implement `From<u32>` to convert the raw counter value.
#[derive(Debug, Clone, PartialEq)]
pub struct IdSource<Id> {
    next_id: u32,
    _phantom: PhantomData<Id>,
}

impl<Id: From<u32>> IdSource<Id> {
    pub fn new() -> Self {
        IdSource {
            next_id: 0,
            _phantom: PhantomData,
        }
    }

    pub fn next(&mut self) -> Id {
        let id = Id::from(self.next_id);
        self.next_id += 1;
        id
    }
}

impl<Id: From<u32>> Default for IdSource<Id> {
    fn default() -> Self {
        Self::new()
    }
}

/// Arena that allocates IDs and stores associated items.
///
/// IDs are dense and never reused. Iteration follows allocation order.
#[derive(Debug, Clone)]
pub struct IdArena<Id, T> {
    source: IdSource<Id>,
    items: IndexMap<Id, T>,
}

impl<Id: Hash + Eq, T: PartialEq> PartialEq for IdArena<Id, T> {
    fn eq(&self, other: &Self) -> bool {
        self.source.next_id == other.source.next_id && self.items == other.items
    }
}

impl<Id: From<u32> + Copy + Eq + Hash, T> IdArena<Id, T> {
    pub fn new() -> Self {
        IdArena {
            source: IdSource::new(),
            items: IndexMap::new(),
        }
    }

    /// Allocate a new ID and store the item.
    pub fn alloc(&mut self, item: T) -> Id {
        let id = self.source.next();
        self.items.insert(id, item);
        id
    }

    /// Get an item by ID.
    pub fn get(&self, id: Id) -> Option<&T> {
        self.items.get(&id)
    }

    /// Get a mutable reference to an item by ID.
    pub fn get_mut(&mut self, id: Id) -> Option<&mut T> {
        self.items.get_mut(&id)
    }

    pub fn contains(&self, id: Id) -> bool {
        self.items.contains_key(&id)
    }

    /// Iterate over all (id, item) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&Id, &T)> {
        self.items.iter()
    }

    /// All IDs in allocation order.
    pub fn ids(&self) -> impl Iterator<Item = Id> + '_ {
        self.items.keys().copied()
    }

    /// Iterate over all items (without IDs).
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.items.values()
    }

    /// Number of items in the arena.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if the arena is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<Id: From<u32> + Copy + Eq + Hash, T> Default for IdArena<Id, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id: From<u32> + Copy + Eq + Hash + std::fmt::Debug, T> Index<Id> for IdArena<Id, T> {
    type Output = T;

    fn index(&self, id: Id) -> &T {
        match self.items.get(&id) {
            Some(item) => item,
            None => panic!("IdArena: unknown id {:?}", id),
        }
    }
}

impl<Id: From<u32> + Copy + Eq + Hash + std::fmt::Debug, T> IndexMut<Id> for IdArena<Id, T> {
    fn index_mut(&mut self, id: Id) -> &mut T {
        match self.items.get_mut(&id) {
            Some(item) => item,
            None => panic!("IdArena: unknown id {:?}", id),
        }
    }
}

impl<'a, Id: From<u32> + Copy + Eq + Hash, T> IntoIterator for &'a IdArena<Id, T> {
    type Item = (&'a Id, &'a T);
    type IntoIter = indexmap::map::Iter<'a, Id, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

// Arenas serialize as a plain sequence; the position of an item is its ID.
impl<Id, T: Serialize> Serialize for IdArena<Id, T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.items.values())
    }
}

impl<'de, Id: From<u32> + Copy + Eq + Hash, T: Deserialize<'de>> Deserialize<'de>
    for IdArena<Id, T>
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let items = Vec::<T>::deserialize(deserializer)?;
        let mut arena = IdArena::new();
        for item in items {
            arena.alloc(item);
        }
        Ok(arena)
    }
}
