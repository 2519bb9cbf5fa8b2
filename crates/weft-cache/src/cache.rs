#![forbid(unsafe_code)]

//! The memoization engine.
//!
//! [`Cache`] maps `(owner, key)` pairs to entries, computes values lazily,
//! records which entries a computation read, and notifies observers of
//! transitive dependents through the deferred [`emitter`](crate::emitter).
//!
//! # Validity
//!
//! An entry's cached value is usable iff `checksum != 0` and `checksum`
//! equals `state + Σ dep.state` over its dependencies. Checking this first
//! *touches* every dependency (revalidating it, recomputing it if needed),
//! so a change deep in the graph surfaces as a state bump on the direct
//! dependency.
//!
//! # Read/write separation
//!
//! `set` and `invalidate` fail with
//! [`CacheError::IllegalWriteDuringRead`] while any computation is in flight.
//! Writes only mark observers dirty; callbacks run on the next
//! [`flush`](Cache::flush), so a chain of writes in one tick results in at most
//! one notification per entry.
//!
//! # Example
//!
//! ```
//! use weft_cache::Cache;
//!
//! let cache = Cache::new();
//! let host = cache.owner();
//! let id = host.id();
//!
//! cache.set(id, "first", |v, _| Ok(v), String::from("Ada"))?;
//! let c = cache.clone();
//! let greeting = cache.get(id, "greeting", move |_| {
//!     let first: String = c.get(id, "first", |prev| Ok(prev.unwrap_or_default()))?;
//!     Ok(format!("Hello, {first}"))
//! })?;
//! assert_eq!(greeting, "Hello, Ada");
//! # Ok::<(), weft_cache::CacheError>(())
//! ```

use std::any::type_name;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::config::CacheConfig;
use crate::context::ComputationContext;
use crate::emitter::{self, Callback, Emitter, EmitterState, FlushReport};
use crate::error::{CacheError, Result};
use crate::key::{Key, Owner, OwnerId};
use crate::store::{EntryId, EntrySnapshot, Getter, Store, Value};

/// Counters describing cache activity since creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Reads answered from a valid cached value.
    pub hits: u64,
    /// Getter invocations that completed successfully.
    pub recomputes: u64,
    /// `set` calls that changed a value.
    pub writes: u64,
    /// `invalidate` calls.
    pub invalidations: u64,
    /// Entries queued on the emitter.
    pub dispatched: u64,
    /// Completed flushes.
    pub flushes: u64,
    /// Observer callbacks invoked.
    pub callbacks: u64,
    /// Observer callbacks that failed or panicked.
    pub observer_failures: u64,
}

pub(crate) struct CacheInner {
    config: CacheConfig,
    store: RefCell<Store>,
    context: ComputationContext,
    emitter: RefCell<Emitter>,
    stats: Cell<CacheStats>,
}

/// Dependency-tracking memoization cache.
///
/// Cloning a `Cache` creates a new handle to the **same** cache. The cache is
/// single-threaded (`!Send`): all reads, writes and flushes happen on the
/// thread that created it, which is what makes the single computation context
/// sound.
///
/// Getters usually capture a clone of the cache. The entry keeps its getter,
/// so that reference cycle lives until the owner is released.
#[derive(Clone)]
pub struct Cache {
    inner: Rc<CacheInner>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("entries", &self.inner.store.borrow().len())
            .field("emitter", &self.inner.emitter.borrow().state())
            .field("computing", &self.inner.context.is_active())
            .finish()
    }
}

impl Cache {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    #[must_use]
    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            inner: Rc::new(CacheInner {
                config,
                store: RefCell::new(Store::new()),
                context: ComputationContext::new(),
                emitter: RefCell::new(Emitter::new()),
                stats: Cell::new(CacheStats::default()),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Allocate a new owner. Its entries live until the handle is dropped.
    pub fn owner(&self) -> Owner {
        let id = self.inner.store.borrow_mut().create_owner();
        Owner::new(id, Rc::downgrade(&self.inner))
    }

    /// Release an owner and all of its entries, listeners and pending
    /// notifications. Dropping the [`Owner`] handle does the same.
    pub fn release(&self, owner: impl Into<OwnerId>) {
        self.inner.release(owner.into());
    }

    /// Return the current value for `(owner, key)`, calling `compute` only if
    /// the cached value is missing or stale.
    ///
    /// `compute` receives the previous value. Reads of other entries made
    /// inside `compute` are recorded as dependencies of this entry.
    ///
    /// # Errors
    ///
    /// - [`CacheError::CircularDependency`] if the entry is already being
    ///   computed further up the call stack.
    /// - [`CacheError::DepthExceeded`] past [`CacheConfig::max_depth`].
    /// - Any error returned by `compute`, unchanged. The last good value and
    ///   checksum are kept.
    pub fn get<T, F>(&self, owner: OwnerId, key: impl Into<Key>, compute: F) -> Result<T>
    where
        T: Clone + PartialEq + 'static,
        F: Fn(Option<T>) -> Result<T> + 'static,
    {
        let key = key.into();
        let id = self.inner.resolve(owner, &key)?;
        let getter_key = key.clone();
        let value = self
            .inner
            .read(id, Some(move || erase::<T, F>(getter_key, compute)))?
            .ok_or_else(|| CacheError::Uninitialized { key: key.clone() })?;
        downcast(&value, &key)
    }

    /// Store `setter(value, previous)` for `(owner, key)` without running any
    /// getter. A changed value bumps the entry's state, forces its next `get`
    /// to re-run the getter, and marks observed dependents dirty.
    ///
    /// # Errors
    ///
    /// [`CacheError::IllegalWriteDuringRead`] if called while a computation is
    /// in flight; any error returned by `setter`.
    pub fn set<T, V, S>(&self, owner: OwnerId, key: impl Into<Key>, setter: S, value: V) -> Result<T>
    where
        T: Clone + PartialEq + 'static,
        S: FnOnce(V, Option<T>) -> Result<T>,
    {
        let key = key.into();
        self.inner.ensure_writable(&key)?;
        let id = self.inner.resolve(owner, &key)?;
        let previous = self.inner.typed_value::<T>(id, &key)?;
        let next = setter(value, previous.clone())?;
        if previous.as_ref() != Some(&next) {
            {
                let mut store = self.inner.store.borrow_mut();
                if let Some(entry) = store.get_mut(id) {
                    entry.checksum = 0;
                    entry.state += 1;
                    entry.value = Some(Rc::new(next.clone()));
                }
            }
            self.inner.bump(|s| s.writes += 1);
            self.inner.notify(id);
        }
        Ok(next)
    }

    /// Force the next `get` of `(owner, key)` to recompute, and mark observed
    /// dependents dirty now. With `clear_value`, the stored value is dropped
    /// too, so the getter receives `None` as its previous value.
    ///
    /// # Errors
    ///
    /// [`CacheError::IllegalWriteDuringRead`] if called while a computation is
    /// in flight.
    pub fn invalidate(&self, owner: OwnerId, key: impl Into<Key>, clear_value: bool) -> Result<()> {
        let key = key.into();
        self.inner.ensure_writable(&key)?;
        let id = self.inner.resolve(owner, &key)?;
        self.inner.invalidate_entry(id, clear_value);
        Ok(())
    }

    /// Invalidate every entry of `owner`.
    ///
    /// # Errors
    ///
    /// Same as [`Cache::invalidate`].
    pub fn invalidate_all(&self, owner: OwnerId, clear_value: bool) -> Result<()> {
        self.inner.ensure_writable(&Key::from("*"))?;
        let ids = {
            let store = self.inner.store.borrow();
            if !store.is_live_owner(owner) {
                return Err(CacheError::ReleasedOwner { owner });
            }
            store.entries_of(owner)
        };
        for id in ids {
            self.inner.invalidate_entry(id, clear_value);
        }
        Ok(())
    }

    /// Watch `(owner, key)`. The value is read once now (with `compute`) as
    /// the baseline; afterwards `callback(value, previous)` runs during a
    /// flush whenever the entry or anything it depends on changed and the
    /// re-read value differs from the last one delivered.
    ///
    /// The returned [`Subscription`] unsubscribes when dropped.
    ///
    /// # Errors
    ///
    /// Any error from the baseline read; the entry is left unobserved.
    pub fn observe<T, F, C>(
        &self,
        owner: OwnerId,
        key: impl Into<Key>,
        compute: F,
        mut callback: C,
    ) -> Result<Subscription>
    where
        T: Clone + PartialEq + 'static,
        F: Fn(Option<T>) -> Result<T> + 'static,
        C: FnMut(&T, Option<&T>) -> Result<()> + 'static,
    {
        let key = key.into();
        let id = self.inner.resolve(owner, &key)?;
        if let Some(entry) = self.inner.store.borrow_mut().get_mut(id) {
            entry.observers += 1;
        }

        let compute = Rc::new(compute);
        let baseline = match self.get(owner, key.clone(), share::<T, F>(&compute)) {
            Ok(value) => value,
            Err(err) => {
                self.inner.unobserve(id);
                return Err(err);
            }
        };

        let weak = Rc::downgrade(&self.inner);
        let read_key = key.clone();
        let mut last = Some(baseline);
        let listener: Callback = Box::new(move || {
            let Some(inner) = weak.upgrade() else {
                return Ok(());
            };
            let cache = Cache { inner };
            let value = cache.get(owner, read_key.clone(), share::<T, F>(&compute))?;
            if last.as_ref() == Some(&value) {
                return Ok(());
            }
            let previous = last.replace(value.clone());
            callback(&value, previous.as_ref())
        });
        let listener = self
            .inner
            .emitter
            .borrow_mut()
            .subscribe(id, owner, key, listener);

        Ok(Subscription {
            cache: Rc::downgrade(&self.inner),
            entry: id,
            listener,
            active: Cell::new(true),
        })
    }

    /// Run observer callbacks for every entry marked dirty since the last
    /// flush. Callback failures are logged and counted, never propagated.
    ///
    /// Does nothing while a computation is in flight or another flush runs.
    pub fn flush(&self) -> FlushReport {
        if self.inner.context.is_active() {
            tracing::debug!("flush requested during a computation; deferred");
            return FlushReport::default();
        }
        let Some(batch) = self.inner.emitter.borrow_mut().begin_flush() else {
            return FlushReport::default();
        };
        let span = tracing::debug_span!("cache.flush", entries = batch.len());
        let _guard = span.enter();

        let report = emitter::run_batch(&self.inner.emitter, batch);
        let reschedule = self.inner.emitter.borrow_mut().end_flush();
        self.inner.bump(|s| {
            s.flushes += 1;
            s.callbacks += report.callbacks as u64;
            s.observer_failures += report.failures as u64;
        });
        tracing::debug!(
            callbacks = report.callbacks,
            failures = report.failures,
            reschedule,
            "flush complete"
        );
        if reschedule {
            self.inner.schedule();
        }
        report
    }

    /// Stored value of `(owner, key)`, without recomputing or recording a
    /// dependency.
    ///
    /// # Errors
    ///
    /// [`CacheError::TypeMismatch`] if the stored value is not a `T`;
    /// [`CacheError::ReleasedOwner`] for a released owner.
    pub fn peek<T>(&self, owner: OwnerId, key: impl Into<Key>) -> Result<Option<T>>
    where
        T: Clone + 'static,
    {
        let key = key.into();
        let store = self.inner.store.borrow();
        if !store.is_live_owner(owner) {
            return Err(CacheError::ReleasedOwner { owner });
        }
        let Some(entry) = store.find(owner, &key).and_then(|id| store.get(id)) else {
            return Ok(None);
        };
        entry.value.as_ref().map(|v| downcast(v, &key)).transpose()
    }

    /// Number of value changes of `(owner, key)` so far; 0 if no value was
    /// ever stored. Does not revalidate.
    #[must_use]
    pub fn version(&self, owner: OwnerId, key: impl Into<Key>) -> u64 {
        let store = self.inner.store.borrow();
        store
            .find(owner, &key.into())
            .and_then(|id| store.get(id))
            .map_or(0, |entry| entry.state - 1)
    }

    /// Diagnostic snapshot of every entry of `owner`.
    #[must_use]
    pub fn entries(&self, owner: OwnerId) -> Vec<EntrySnapshot> {
        self.inner.store.borrow().snapshot(owner)
    }

    /// Number of live entries across all owners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.store.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a computation is in flight.
    #[must_use]
    pub fn is_computing(&self) -> bool {
        self.inner.context.is_active()
    }

    /// Whether dirty entries are waiting for a flush.
    #[must_use]
    pub fn is_flush_scheduled(&self) -> bool {
        self.inner.emitter.borrow().state() == EmitterState::Scheduled
    }

    /// Number of entries waiting for the next flush.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.emitter.borrow().pending_len()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner.stats.get()
    }
}

impl CacheInner {
    fn bump(&self, f: impl FnOnce(&mut CacheStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    fn resolve(&self, owner: OwnerId, key: &Key) -> Result<EntryId> {
        self.store
            .borrow_mut()
            .resolve(owner, key.clone())
            .ok_or(CacheError::ReleasedOwner { owner })
    }

    fn key_of(&self, id: EntryId) -> Key {
        self.store
            .borrow()
            .get(id)
            .map_or_else(|| Key::from("<released>"), |entry| entry.key.clone())
    }

    fn ensure_writable(&self, key: &Key) -> Result<()> {
        if self.context.is_active() {
            self.context.clear();
            return Err(CacheError::IllegalWriteDuringRead { key: key.clone() });
        }
        Ok(())
    }

    fn typed_value<T: Clone + 'static>(&self, id: EntryId, key: &Key) -> Result<Option<T>> {
        let store = self.store.borrow();
        store
            .get(id)
            .and_then(|entry| entry.value.as_ref())
            .map(|value| downcast(value, key))
            .transpose()
    }

    /// Core read. `fresh` builds the getter to use (and remember) if the
    /// entry must be recomputed; revalidation passes `None` and falls back to
    /// the remembered getter.
    fn read<M>(&self, id: EntryId, fresh: Option<M>) -> Result<Option<Value>>
    where
        M: FnOnce() -> Getter,
    {
        if self.context.contains(id) {
            self.context.clear();
            return Err(CacheError::CircularDependency {
                key: self.key_of(id),
            });
        }
        if self.context.depth() >= self.config.max_depth {
            self.context.clear();
            return Err(CacheError::DepthExceeded {
                key: self.key_of(id),
                limit: self.config.max_depth,
            });
        }
        if let Some(parent) = self.context.current() {
            self.store.borrow_mut().link(parent, id);
        }

        // Any early `?` return drops the frame unfinished, clearing the
        // whole context.
        let frame = self.context.enter(id);

        let checksum = match self.store.borrow().get(id) {
            Some(entry) => entry.checksum,
            None => {
                frame.finish();
                return Ok(None);
            }
        };
        if checksum != 0 && self.revalidate(id)? == Some(checksum) {
            let mut store = self.store.borrow_mut();
            let value = store.get_mut(id).and_then(|entry| {
                if entry.getter.is_none() {
                    entry.getter = fresh.map(|make| make());
                }
                entry.value.clone()
            });
            drop(store);
            tracing::trace!(entry = %id, "cache hit");
            self.bump(|s| s.hits += 1);
            frame.finish();
            return Ok(value);
        }

        let (getter, previous, saved_deps) = {
            let mut store = self.store.borrow_mut();
            let Some(entry) = store.get_mut(id) else {
                frame.finish();
                return Ok(None);
            };
            if let Some(make) = fresh {
                entry.getter = Some(make());
            }
            let getter = entry.getter.clone();
            let previous = entry.value.clone();
            let saved_deps = entry.deps.clone();
            if getter.is_some() {
                store.clear_deps(id);
            }
            (getter, previous, saved_deps)
        };
        let Some(getter) = getter else {
            frame.finish();
            return Ok(previous);
        };

        if tracing::enabled!(tracing::Level::TRACE) {
            if let Some(entry) = self.store.borrow().get(id) {
                tracing::trace!(owner = %entry.owner, key = %entry.key, state = entry.state, "recomputing");
            }
        }
        let changed = match getter(previous.as_ref()) {
            Ok(changed) => changed,
            Err(err) => {
                // Back to the edges of the last successful computation; value
                // and checksum stay as they were.
                self.store.borrow_mut().restore_deps(id, saved_deps);
                self.context.clear();
                frame.finish();
                return Err(err);
            }
        };
        self.bump(|s| s.recomputes += 1);

        let (is_changed, value) = {
            let mut store = self.store.borrow_mut();
            let Some(entry) = store.get_mut(id) else {
                frame.finish();
                return Ok(None);
            };
            let is_changed = changed.is_some();
            if let Some(next) = changed {
                entry.state += 1;
                entry.value = Some(next);
            }
            let value = entry.value.clone();
            let checksum = store.checksum_of(id).unwrap_or(0);
            if let Some(entry) = store.get_mut(id) {
                entry.checksum = checksum;
            }
            (is_changed, value)
        };
        if is_changed {
            self.notify(id);
        }
        frame.finish();
        Ok(value)
    }

    /// Touch every dependency of `id`, then return the fresh checksum.
    fn revalidate(&self, id: EntryId) -> Result<Option<u64>> {
        let deps = match self.store.borrow().get(id) {
            Some(entry) => entry.deps.clone(),
            None => return Ok(None),
        };
        for dep in deps {
            self.read(dep, None::<fn() -> Getter>)?;
        }
        Ok(self.store.borrow().checksum_of(id))
    }

    fn invalidate_entry(&self, id: EntryId, clear_value: bool) {
        if let Some(entry) = self.store.borrow_mut().get_mut(id) {
            entry.checksum = 0;
        }
        self.bump(|s| s.invalidations += 1);
        self.notify(id);
        if clear_value {
            if let Some(entry) = self.store.borrow_mut().get_mut(id) {
                entry.value = None;
            }
        }
    }

    /// Queue `id` and every observed entry reachable through dependent edges.
    fn notify(&self, id: EntryId) {
        let observed = self.store.borrow().observed_closure(id);
        if observed.is_empty() {
            return;
        }
        let mut schedule = false;
        let queued = {
            let mut emitter = self.emitter.borrow_mut();
            let during_read = self.context.is_active();
            let before = emitter.pending_len();
            for entry in &observed {
                schedule |= emitter.dispatch(*entry, during_read);
            }
            emitter.pending_len() - before
        };
        self.bump(|s| s.dispatched += queued as u64);
        if schedule {
            self.schedule();
        }
    }

    fn schedule(&self) {
        if let Some(scheduler) = &self.config.scheduler {
            scheduler.schedule();
        }
    }

    /// Drop one observer of `id`; prune its reverse edges once unobserved.
    fn unobserve(&self, id: EntryId) {
        let mut store = self.store.borrow_mut();
        if let Some(entry) = store.get_mut(id) {
            entry.observers = entry.observers.saturating_sub(1);
        }
        store.prune(id);
    }

    pub(crate) fn release(&self, owner: OwnerId) {
        let removed = self.store.borrow_mut().remove_owner(owner);
        self.emitter.borrow_mut().purge(&removed);
        tracing::debug!(%owner, entries = removed.len(), "owner released");
    }
}

/// Handle returned by [`Cache::observe`].
///
/// Unsubscribes when dropped. [`unsubscribe`](Subscription::unsubscribe) is
/// idempotent and may be called from inside a flush.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cache: Weak<CacheInner>,
    entry: EntryId,
    listener: u64,
    active: Cell<bool>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if !self.active.replace(false) {
            return;
        }
        let Some(inner) = self.cache.upgrade() else {
            return;
        };
        if inner.emitter.borrow_mut().unsubscribe(self.entry, self.listener) {
            inner.unobserve(self.entry);
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.get()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("entry", &self.entry)
            .field("active", &self.active.get())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

fn downcast<T: Clone + 'static>(value: &Value, key: &Key) -> Result<T> {
    value
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| CacheError::TypeMismatch {
            key: key.clone(),
            expected: type_name::<T>(),
        })
}

/// Type-erase a typed getter. The erased form reports `None` when the new
/// value equals the previous one.
fn erase<T, F>(key: Key, compute: F) -> Getter
where
    T: Clone + PartialEq + 'static,
    F: Fn(Option<T>) -> Result<T> + 'static,
{
    Rc::new(move |previous: Option<&Value>| {
        let typed = previous.map(|value| downcast::<T>(value, &key)).transpose()?;
        let unchanged_from = previous.and_then(|value| value.downcast_ref::<T>());
        let next = compute(typed)?;
        if unchanged_from == Some(&next) {
            Ok(None)
        } else {
            Ok(Some(Rc::new(next) as Value))
        }
    })
}

fn share<T, F>(compute: &Rc<F>) -> impl Fn(Option<T>) -> Result<T> + 'static
where
    T: 'static,
    F: Fn(Option<T>) -> Result<T> + 'static,
{
    let compute = Rc::clone(compute);
    move |previous| compute(previous)
}
