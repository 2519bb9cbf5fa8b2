#![forbid(unsafe_code)]

//! Owner identities and entry keys.
//!
//! An entry is addressed by an `(OwnerId, Key)` pair. Owners are allocated by
//! [`Cache::owner`](crate::Cache::owner) and never reused, so a stale
//! `OwnerId` captured by a closure can always be told apart from a live one.

use std::borrow::Cow;
use std::fmt;
use std::rc::Weak;

use crate::cache::CacheInner;

/// Opaque identity of an owner (a component instance, a model record, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerId(u64);

impl OwnerId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw ID value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner#{}", self.0)
    }
}

/// Key identifying one cached value of an owner.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    /// Named property, e.g. `"title"`.
    Name(Cow<'static, str>),
    /// Numeric slot, e.g. a list index or model id.
    Index(u64),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Index(index) => write!(f, "#{index}"),
        }
    }
}

impl From<&'static str> for Key {
    fn from(name: &'static str) -> Self {
        Self::Name(Cow::Borrowed(name))
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Self::Name(Cow::Owned(name))
    }
}

impl From<u64> for Key {
    fn from(index: u64) -> Self {
        Self::Index(index)
    }
}

impl From<usize> for Key {
    fn from(index: usize) -> Self {
        Self::Index(index as u64)
    }
}

/// RAII owner handle.
///
/// Dropping the handle releases every entry of the owner together with its
/// listeners and pending notifications. Use [`Owner::id`] to address entries;
/// the id is `Copy` and can be captured freely by getters.
#[must_use = "dropping an Owner releases all of its entries"]
pub struct Owner {
    id: OwnerId,
    cache: Weak<CacheInner>,
}

impl Owner {
    pub(crate) fn new(id: OwnerId, cache: Weak<CacheInner>) -> Self {
        Self { id, cache }
    }

    /// Identity used to address this owner's entries.
    #[must_use]
    pub fn id(&self) -> OwnerId {
        self.id
    }
}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Owner").field("id", &self.id).finish()
    }
}

impl From<&Owner> for OwnerId {
    fn from(owner: &Owner) -> Self {
        owner.id
    }
}

impl Drop for Owner {
    fn drop(&mut self) {
        if let Some(inner) = self.cache.upgrade() {
            inner.release(self.id);
        }
    }
}
