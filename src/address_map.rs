//! Old-address remapping tables.
//!
//! Pointers in a document hold the addresses their targets had when the file was written.
//! An [`AddressMap`] maps such a stale address to whatever replaced it in memory, counting
//! how often each entry was looked up so unused data can be dropped after a read pass.

use std::collections::HashMap;

use crate::format::IdCode;
use crate::graph::EntityId;

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    nr: i32,
    users: u32,
}

/// Map from stale address to a live value, with usage counters.
#[derive(Debug, Clone)]
pub struct AddressMap<T> {
    entries: HashMap<u64, Entry<T>>,
}

impl<T> Default for AddressMap<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> AddressMap<T> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `old → value`. Returns false when an entry for `old` already existed, in
    /// which case it is overwritten (and its usage reset). Null addresses are rejected and
    /// also return false.
    pub fn insert(&mut self, old: u64, value: T, nr: i32) -> bool {
        if old == 0 {
            return false;
        }
        self.entries
            .insert(
                old,
                Entry {
                    value,
                    nr,
                    users: 0,
                },
            )
            .is_none()
    }

    /// Looks up `old`, optionally counting the access.
    pub fn lookup(&mut self, old: u64, increment_usage: bool) -> Option<&T> {
        let entry = self.entries.get_mut(&old)?;
        if increment_usage {
            entry.users += 1;
        }
        Some(&entry.value)
    }

    /// Mutable lookup of `old`, optionally counting the access.
    pub fn lookup_mut(&mut self, old: u64, increment_usage: bool) -> Option<&mut T> {
        let entry = self.entries.get_mut(&old)?;
        if increment_usage {
            entry.users += 1;
        }
        Some(&mut entry.value)
    }

    /// Looks up `old` without touching the counter.
    pub fn peek(&self, old: u64) -> Option<&T> {
        self.entries.get(&old).map(|e| &e.value)
    }

    /// The count stored with the entry (`nr` of the record, or the entity type tag).
    pub fn nr(&self, old: u64) -> Option<i32> {
        self.entries.get(&old).map(|e| e.nr)
    }

    /// Usage count of `old`, or `None` if absent.
    pub fn users(&self, old: u64) -> Option<u32> {
        self.entries.get(&old).map(|e| e.users)
    }

    /// Drops entries nobody looked up. Returns how many were dropped.
    pub fn clear_unused(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.users > 0);
        before - self.entries.len()
    }

    /// Hands out the values that were looked up, dropping the rest. The map is empty
    /// afterwards.
    pub fn drain_used(&mut self) -> Vec<(u64, T)> {
        let mut used: Vec<(u64, T)> = self
            .entries
            .drain()
            .filter(|(_, e)| e.users > 0)
            .map(|(old, e)| (old, e.value))
            .collect();
        used.sort_by_key(|(old, _)| *old);
        used
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mutable access to every value.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.values_mut().map(|e| &mut e.value)
    }

    /// Every stale address with its value.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &T)> {
        self.entries.iter().map(|(old, e)| (*old, &e.value))
    }
}

/// What an entity map resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityRef {
    /// Arena slot of the entity.
    pub id: EntityId,
    /// Type tag of the entity.
    pub code: IdCode,
    /// True when the entity lives in an external document.
    pub linked: bool,
}

/// Per-file map from stale entity address to live entity.
///
/// Entries can be repointed to another entity (placeholder replaced by the real one) or to
/// nothing (weak reference dropped); a nulled entry keeps resolving to `None`.
#[derive(Debug, Clone, Default)]
pub struct EntityMap {
    inner: AddressMap<Option<EntityRef>>,
}

fn code_tag(code: IdCode) -> i32 {
    let [a, b] = code.as_bytes();
    i32::from(a) << 8 | i32::from(b)
}

impl EntityMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entity under its stale address.
    pub fn insert_entity(&mut self, old: u64, entity: EntityRef) -> bool {
        self.inner.insert(old, Some(entity), code_tag(entity.code))
    }

    /// Resolves a stale address. With `linked_only`, local entities are not returned: an
    /// entity of an external document may only point into its own document.
    pub fn lookup_entity(&mut self, old: u64, linked_only: bool) -> Option<EntityRef> {
        let found = (*self.inner.lookup(old, true)?)?;
        if linked_only && !found.linked {
            return None;
        }
        Some(found)
    }

    /// Resolves without counting.
    pub fn peek_entity(&self, old: u64) -> Option<EntityRef> {
        self.inner.peek(old).copied().flatten()
    }

    /// True if `old` has an entry, even a nulled one.
    pub fn contains(&self, old: u64) -> bool {
        self.inner.peek(old).is_some()
    }

    /// Stale address currently mapped to `id`.
    pub fn address_of(&self, id: EntityId) -> Option<u64> {
        self.inner
            .iter()
            .find(|(_, v)| v.is_some_and(|e| e.id == id))
            .map(|(old, _)| old)
    }

    /// Replaces every entry pointing at `from` with `to` (or with nothing).
    /// Returns the number of entries rewritten.
    pub fn repoint(&mut self, from: EntityId, to: Option<EntityRef>) -> usize {
        let mut n = 0;
        for value in self.inner.values_mut() {
            if value.is_some_and(|e| e.id == from) {
                *value = to;
                n += 1;
            }
        }
        n
    }

    /// Usage count of `old`.
    pub fn users(&self, old: u64) -> Option<u32> {
        self.inner.users(old)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.inner.clear();
    }
}
