#![forbid(unsafe_code)]

//! Cache configuration.

use std::fmt;
use std::rc::Rc;

use crate::emitter::FlushScheduler;

/// Default limit on nested computations (reads inside reads, including
/// dependency revalidation).
pub const DEFAULT_MAX_DEPTH: usize = 256;

/// Configuration for a [`Cache`](crate::Cache).
///
/// # Example
///
/// ```
/// use std::cell::Cell;
/// use std::rc::Rc;
/// use weft_cache::{Cache, CacheConfig};
///
/// let requested = Rc::new(Cell::new(false));
/// let flag = Rc::clone(&requested);
/// let cache = Cache::with_config(
///     CacheConfig::default()
///         .with_max_depth(64)
///         .with_scheduler(move || flag.set(true)),
/// );
/// assert_eq!(cache.config().max_depth, 64);
/// ```
#[derive(Clone)]
pub struct CacheConfig {
    /// Maximum nesting of in-flight computations before a read fails with
    /// [`CacheError::DepthExceeded`](crate::CacheError::DepthExceeded).
    pub max_depth: usize,
    /// Notified when the emitter goes from idle to scheduled. Without one,
    /// the host is expected to poll [`Cache::is_flush_scheduled`](crate::Cache::is_flush_scheduled).
    pub scheduler: Option<Rc<dyn FlushScheduler>>,
}

impl CacheConfig {
    /// Set the nested computation limit. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    /// Install the flush scheduler.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: impl FlushScheduler + 'static) -> Self {
        self.scheduler = Some(Rc::new(scheduler));
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            scheduler: None,
        }
    }
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("max_depth", &self.max_depth)
            .field("scheduler", &self.scheduler.is_some())
            .finish()
    }
}
