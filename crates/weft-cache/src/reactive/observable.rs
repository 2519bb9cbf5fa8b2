#![forbid(unsafe_code)]

//! Stored value properties.

use std::fmt;
use std::marker::PhantomData;

use crate::cache::{Cache, Subscription};
use crate::error::{CacheError, Result};
use crate::key::{Key, OwnerId};

/// A settable property of an owner.
///
/// Cloning an `Observable` creates a new handle to the **same** entry.
pub struct Observable<T> {
    cache: Cache,
    owner: OwnerId,
    key: Key,
    _value: PhantomData<fn() -> T>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            owner: self.owner,
            key: self.key.clone(),
            _value: PhantomData,
        }
    }
}

impl<T: Clone + PartialEq + fmt::Debug + 'static> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("owner", &self.owner)
            .field("key", &self.key)
            .field("value", &self.cache.peek::<T>(self.owner, self.key.clone()).ok().flatten())
            .field("version", &self.version())
            .finish()
    }
}

impl<T: Clone + PartialEq + 'static> Observable<T> {
    /// Bind `(owner, key)` and store `initial` in it.
    ///
    /// # Errors
    ///
    /// Fails like [`Cache::set`].
    pub fn new(cache: &Cache, owner: OwnerId, key: impl Into<Key>, initial: T) -> Result<Self> {
        let observable = Self {
            cache: cache.clone(),
            owner,
            key: key.into(),
            _value: PhantomData,
        };
        observable.set(initial)?;
        Ok(observable)
    }

    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    #[must_use]
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Current value. Inside a getter, the read is recorded as a dependency.
    ///
    /// # Errors
    ///
    /// Fails like [`Cache::get`].
    pub fn get(&self) -> Result<T> {
        self.cache.get(self.owner, self.key.clone(), stored(self.key.clone()))
    }

    /// Replace the value. Equal values are ignored.
    ///
    /// # Errors
    ///
    /// Fails like [`Cache::set`], e.g. when called from inside a getter.
    pub fn set(&self, value: T) -> Result<()> {
        self.cache
            .set(self.owner, self.key.clone(), |next, _| Ok(next), value)?;
        Ok(())
    }

    /// Modify the value in place.
    ///
    /// # Errors
    ///
    /// [`CacheError::Uninitialized`] if no value is stored; otherwise fails
    /// like [`Cache::set`].
    pub fn update(&self, f: impl FnOnce(&mut T)) -> Result<()> {
        let key = self.key.clone();
        self.cache.set(
            self.owner,
            self.key.clone(),
            move |(), previous: Option<T>| {
                let mut value = previous.ok_or(CacheError::Uninitialized { key })?;
                f(&mut value);
                Ok(value)
            },
            (),
        )?;
        Ok(())
    }

    /// Number of changes since the first value was stored.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.cache.version(self.owner, self.key.clone()).saturating_sub(1)
    }

    /// Run `callback(value, previous)` on the flush following each change.
    ///
    /// # Errors
    ///
    /// Fails like [`Cache::observe`].
    pub fn subscribe(
        &self,
        callback: impl FnMut(&T, Option<&T>) -> Result<()> + 'static,
    ) -> Result<Subscription> {
        self.cache
            .observe(self.owner, self.key.clone(), stored(self.key.clone()), callback)
    }
}

/// Getter of a stored property: hands back whatever was last set.
fn stored<T: 'static>(key: Key) -> impl Fn(Option<T>) -> Result<T> + 'static {
    move |previous| {
        previous.ok_or_else(|| CacheError::Uninitialized { key: key.clone() })
    }
}
