#![forbid(unsafe_code)]

//! Derived properties that track their dependencies automatically.
//!
//! # Design
//!
//! [`Computed<T>`] binds a getter to an `(owner, key)` entry of the
//! [`Cache`]. Every property read inside the getter, whether an
//! [`Observable`](super::Observable), another `Computed` or a raw
//! [`Cache::get`], is recorded as a dependency. The next
//! [`get()`](Computed::get) after any dependency changed reruns the getter;
//! otherwise the cached value is returned.
//!
//! # Invariants
//!
//! 1. `get()` always returns a value consistent with the current state of all
//!    dependencies (no stale reads after a dependency write completes).
//! 2. The getter runs at most once per dependency change.
//! 3. A recomputation that yields an equal value does not bump the version,
//!    so dependents of this property do not recompute either.
//!
//! # Failure Modes
//!
//! - **Getter fails**: the error is returned from `get()`; the last good value
//!   is kept and the next `get()` retries.
//! - **Getter reads itself**: `get()` fails with
//!   [`CacheError::CircularDependency`](crate::CacheError::CircularDependency).

use std::fmt;
use std::rc::Rc;

use crate::cache::{Cache, Subscription};
use crate::error::Result;
use crate::key::{Key, OwnerId};

type ComputeFn<T> = Rc<dyn Fn(Option<T>) -> Result<T>>;

/// A lazily evaluated, memoized property.
///
/// Cloning a `Computed` creates a new handle to the **same** entry.
pub struct Computed<T> {
    cache: Cache,
    owner: OwnerId,
    key: Key,
    compute: ComputeFn<T>,
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            owner: self.owner,
            key: self.key.clone(),
            compute: Rc::clone(&self.compute),
        }
    }
}

impl<T: Clone + PartialEq + fmt::Debug + 'static> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("owner", &self.owner)
            .field("key", &self.key)
            .field("cached", &self.peek())
            .field("version", &self.version())
            .finish()
    }
}

impl<T: Clone + PartialEq + 'static> Computed<T> {
    /// Bind `compute` to `(owner, key)`. Nothing runs until the first `get()`.
    ///
    /// `compute` receives the previously computed value, if any.
    pub fn new(
        cache: &Cache,
        owner: OwnerId,
        key: impl Into<Key>,
        compute: impl Fn(Option<T>) -> Result<T> + 'static,
    ) -> Self {
        Self {
            cache: cache.clone(),
            owner,
            key: key.into(),
            compute: Rc::new(compute),
        }
    }

    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    #[must_use]
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Current value, recomputing if any dependency changed.
    ///
    /// # Errors
    ///
    /// Fails like [`Cache::get`].
    pub fn get(&self) -> Result<T> {
        self.cache.get(self.owner, self.key.clone(), self.getter())
    }

    /// Last computed value without revalidating.
    #[must_use]
    pub fn peek(&self) -> Option<T> {
        self.cache.peek(self.owner, self.key.clone()).ok().flatten()
    }

    /// Force the next `get()` to rerun the getter.
    ///
    /// # Errors
    ///
    /// Fails like [`Cache::invalidate`].
    pub fn invalidate(&self) -> Result<()> {
        self.cache.invalidate(self.owner, self.key.clone(), false)
    }

    /// Number of times the computed value changed.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.cache.version(self.owner, self.key.clone())
    }

    /// Run `callback(value, previous)` on the flush following each change of
    /// the computed value.
    ///
    /// # Errors
    ///
    /// Fails like [`Cache::observe`].
    pub fn subscribe(
        &self,
        callback: impl FnMut(&T, Option<&T>) -> Result<()> + 'static,
    ) -> Result<Subscription> {
        self.cache
            .observe(self.owner, self.key.clone(), self.getter(), callback)
    }

    fn getter(&self) -> impl Fn(Option<T>) -> Result<T> + 'static {
        let compute = Rc::clone(&self.compute);
        move |previous| compute(previous)
    }
}
