#![forbid(unsafe_code)]

//! Error type shared by every cache operation.

use std::error::Error as StdError;

use thiserror::Error;

use crate::key::{Key, OwnerId};

pub type Result<T> = std::result::Result<T, CacheError>;

/// Failures surfaced by [`Cache`](crate::Cache) operations.
///
/// Engine errors (`CircularDependency`, `IllegalWriteDuringRead`,
/// `DepthExceeded`) are programmer errors: they clear the computation context
/// and surface synchronously. `Compute` carries a failure raised by a getter
/// or setter and is passed through nested reads unchanged.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("circular computation of '{key}'")]
    CircularDependency { key: Key },

    #[error("cannot write '{key}' while a computation is running")]
    IllegalWriteDuringRead { key: Key },

    #[error("computation depth limit of {limit} exceeded while reading '{key}'")]
    DepthExceeded { key: Key, limit: usize },

    #[error("value of '{key}' is not a {expected}")]
    TypeMismatch { key: Key, expected: &'static str },

    #[error("'{key}' has no value")]
    Uninitialized { key: Key },

    #[error("owner {owner} has been released")]
    ReleasedOwner { owner: OwnerId },

    #[error(transparent)]
    Compute(Box<dyn StdError + 'static>),
}

impl CacheError {
    /// Wrap a getter/setter failure.
    #[must_use]
    pub fn compute(err: impl Into<Box<dyn StdError + 'static>>) -> Self {
        Self::Compute(err.into())
    }

    /// Whether this error was raised by the engine itself rather than by a
    /// getter, setter, or type conversion.
    #[must_use]
    pub fn is_engine_error(&self) -> bool {
        matches!(
            self,
            Self::CircularDependency { .. }
                | Self::IllegalWriteDuringRead { .. }
                | Self::DepthExceeded { .. }
        )
    }
}
