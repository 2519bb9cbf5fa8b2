#![forbid(unsafe_code)]

//! Entry store and dependency graph.
//!
//! Entries live in a generational arena and are addressed by [`EntryId`]
//! handles. Dependency and dependent sets hold handles, never references, so
//! they carry no ownership: the store alone decides when an entry dies (when
//! its owner is released). A handle that outlives its entry fails the
//! generation check and resolves to `None`.
//!
//! # Invariants
//!
//! 1. `state` starts at 1 and only ever increases.
//! 2. An entry is never its own dependency.
//! 3. `dependents` edges only exist from *live* entries: an entry is live when
//!    it is observed or has dependents of its own. Edges are pruned as soon as
//!    the reading entry stops being live.
//! 4. `index`, `owners` and the arena agree: every live handle is reachable
//!    from exactly one `(owner, key)` pair.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use ahash::{AHashMap, AHashSet};

use crate::error::Result;
use crate::key::{Key, OwnerId};

/// Type-erased cached value.
pub(crate) type Value = Rc<dyn Any>;

/// Type-erased getter. Receives the previous value and returns `Some(new)`
/// when the recomputed value differs from it, `None` when it is unchanged.
pub(crate) type Getter = Rc<dyn Fn(Option<&Value>) -> Result<Option<Value>>>;

/// Generational handle of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId {
    index: u32,
    generation: u32,
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry{}v{}", self.index, self.generation)
    }
}

/// Memoization record for one `(owner, key)` pair.
pub(crate) struct Entry {
    pub(crate) owner: OwnerId,
    pub(crate) key: Key,
    pub(crate) value: Option<Value>,
    /// Bumped on every actual value change.
    pub(crate) state: u64,
    /// `state + Σ dep.state` at the end of the last computation; 0 = invalid.
    pub(crate) checksum: u64,
    /// Entries read by the last successful computation, in read order.
    pub(crate) deps: Vec<EntryId>,
    /// Live entries that read this one.
    pub(crate) dependents: Vec<EntryId>,
    /// Number of registered observers.
    pub(crate) observers: usize,
    /// Last getter used to compute this entry; needed to revalidate it when a
    /// dependent touches it.
    pub(crate) getter: Option<Getter>,
}

impl Entry {
    fn new(owner: OwnerId, key: Key) -> Self {
        Self {
            owner,
            key,
            value: None,
            state: 1,
            checksum: 0,
            deps: Vec::new(),
            dependents: Vec::new(),
            observers: 0,
            getter: None,
        }
    }

    pub(crate) fn observed(&self) -> bool {
        self.observers > 0
    }

    /// Observed, or feeding something observed.
    pub(crate) fn is_live(&self) -> bool {
        self.observed() || !self.dependents.is_empty()
    }
}

/// Read-only view of an entry, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub key: Key,
    pub state: u64,
    pub checksum: u64,
    pub observed: bool,
    pub has_value: bool,
    pub dependencies: usize,
    pub dependents: usize,
}

struct ArenaSlot {
    generation: u32,
    entry: Option<Entry>,
    next_free: Option<u32>,
}

/// Owns every entry; resolves `(owner, key)` pairs to handles.
pub(crate) struct Store {
    slots: Vec<ArenaSlot>,
    free_head: Option<u32>,
    index: AHashMap<(OwnerId, Key), EntryId>,
    /// Live owners and the entries they own.
    owners: AHashMap<OwnerId, Vec<EntryId>>,
    next_owner: u64,
}

impl Store {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            index: AHashMap::new(),
            owners: AHashMap::new(),
            next_owner: 1,
        }
    }

    pub(crate) fn create_owner(&mut self) -> OwnerId {
        let id = OwnerId::new(self.next_owner);
        self.next_owner += 1;
        self.owners.insert(id, Vec::new());
        id
    }

    pub(crate) fn is_live_owner(&self, owner: OwnerId) -> bool {
        self.owners.contains_key(&owner)
    }

    /// Number of live entries across all owners.
    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    /// Look up or create the entry for `(owner, key)`.
    ///
    /// Returns `None` if the owner has been released.
    pub(crate) fn resolve(&mut self, owner: OwnerId, key: Key) -> Option<EntryId> {
        if let Some(&id) = self.index.get(&(owner, key.clone())) {
            return Some(id);
        }
        let owned = self.owners.get_mut(&owner)?;
        let entry = Entry::new(owner, key.clone());
        let id = match self.free_head {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                debug_assert!(slot.entry.is_none(), "free slot should be empty");
                self.free_head = slot.next_free.take();
                slot.entry = Some(entry);
                EntryId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(ArenaSlot {
                    generation: 0,
                    entry: Some(entry),
                    next_free: None,
                });
                EntryId {
                    index,
                    generation: 0,
                }
            }
        };
        owned.push(id);
        self.index.insert((owner, key), id);
        Some(id)
    }

    /// Look up an existing entry without creating it.
    pub(crate) fn find(&self, owner: OwnerId, key: &Key) -> Option<EntryId> {
        self.index.get(&(owner, key.clone())).copied()
    }

    pub(crate) fn get(&self, id: EntryId) -> Option<&Entry> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Record that `context` read `dep` during its computation.
    ///
    /// The reverse edge is only created when `context` is live.
    pub(crate) fn link(&mut self, context: EntryId, dep: EntryId) {
        if context == dep {
            return;
        }
        let Some(ctx) = self.get_mut(context) else {
            return;
        };
        if !ctx.deps.contains(&dep) {
            ctx.deps.push(dep);
        }
        let live = ctx.is_live();
        if live {
            if let Some(entry) = self.get_mut(dep) {
                if !entry.dependents.contains(&context) {
                    entry.dependents.push(context);
                }
            }
        }
    }

    /// Drop every dependency edge of `id` (forward and reverse), pruning
    /// reverse edges of dependencies that stop being live as a result.
    pub(crate) fn clear_deps(&mut self, id: EntryId) {
        let deps = match self.get_mut(id) {
            Some(entry) => std::mem::take(&mut entry.deps),
            None => return,
        };
        self.detach(id, deps);
    }

    /// Replace the dependencies of `id` with `deps`, relinking reverse edges
    /// if `id` is live. Handles of removed entries are dropped.
    pub(crate) fn restore_deps(&mut self, id: EntryId, deps: Vec<EntryId>) {
        self.clear_deps(id);
        for dep in deps {
            if self.get(dep).is_some() {
                self.link(id, dep);
            }
        }
    }

    /// Remove the reverse edges held on behalf of `id` if it is no longer
    /// live. Forward dependencies are kept so checksums stay meaningful.
    pub(crate) fn prune(&mut self, id: EntryId) {
        let deps = match self.get(id) {
            Some(entry) if !entry.is_live() => entry.deps.clone(),
            _ => return,
        };
        self.detach(id, deps);
    }

    fn detach(&mut self, id: EntryId, deps: Vec<EntryId>) {
        let mut work: Vec<(EntryId, Vec<EntryId>)> = vec![(id, deps)];
        while let Some((reader, deps)) = work.pop() {
            for dep in deps {
                let Some(entry) = self.get_mut(dep) else {
                    continue;
                };
                let before = entry.dependents.len();
                entry.dependents.retain(|&d| d != reader);
                if before != entry.dependents.len() && !entry.is_live() {
                    work.push((dep, entry.deps.clone()));
                }
            }
        }
    }

    /// `state` of `id` plus the states of its dependencies, or `None` if a
    /// dependency no longer exists.
    pub(crate) fn checksum_of(&self, id: EntryId) -> Option<u64> {
        let entry = self.get(id)?;
        let mut sum = entry.state;
        for &dep in &entry.deps {
            sum = sum.wrapping_add(self.get(dep)?.state);
        }
        Some(sum)
    }

    /// Observed entries reachable from `id` through dependent edges,
    /// depth-first, `id` itself first. Each entry appears once.
    pub(crate) fn observed_closure(&self, id: EntryId) -> Vec<EntryId> {
        let mut seen = AHashSet::new();
        let mut observed = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if !seen.insert(next) {
                continue;
            }
            let Some(entry) = self.get(next) else {
                continue;
            };
            if entry.observed() {
                observed.push(next);
            }
            stack.extend(entry.dependents.iter().rev().copied());
        }
        observed
    }

    pub(crate) fn entries_of(&self, owner: OwnerId) -> Vec<EntryId> {
        self.owners.get(&owner).cloned().unwrap_or_default()
    }

    pub(crate) fn snapshot(&self, owner: OwnerId) -> Vec<EntrySnapshot> {
        self.entries_of(owner)
            .into_iter()
            .filter_map(|id| self.get(id))
            .map(|entry| EntrySnapshot {
                key: entry.key.clone(),
                state: entry.state,
                checksum: entry.checksum,
                observed: entry.observed(),
                has_value: entry.value.is_some(),
                dependencies: entry.deps.len(),
                dependents: entry.dependents.len(),
            })
            .collect()
    }

    /// Remove an owner and all of its entries. Entries of other owners that
    /// depended on them are invalidated. Returns the removed handles.
    pub(crate) fn remove_owner(&mut self, owner: OwnerId) -> Vec<EntryId> {
        let Some(ids) = self.owners.remove(&owner) else {
            return Vec::new();
        };
        for &id in &ids {
            self.clear_deps(id);
            let dependents = match self.get_mut(id) {
                Some(entry) => std::mem::take(&mut entry.dependents),
                None => continue,
            };
            for reader in dependents {
                if let Some(entry) = self.get_mut(reader) {
                    entry.deps.retain(|&d| d != id);
                    entry.checksum = 0;
                }
            }
        }
        for &id in &ids {
            let Some(entry) = self.free(id) else {
                continue;
            };
            self.index.remove(&(owner, entry.key));
        }
        ids
    }

    fn free(&mut self, id: EntryId) -> Option<Entry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        slot.next_free = self.free_head;
        self.free_head = Some(id.index);
        Some(entry)
    }
}
