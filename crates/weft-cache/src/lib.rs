#![forbid(unsafe_code)]

//! Weft cache: dependency-tracking memoization for component properties.
//!
//! Every computed property, template render and model read in Weft goes
//! through a [`Cache`]:
//!
//! - values are computed lazily per `(owner, key)` and cached,
//! - reads made during a computation are recorded as dependencies,
//! - a write invalidates dependents transitively (checked with a cheap
//!   state-sum checksum instead of rerunning getters),
//! - observers are notified in batches on the next [`Cache::flush`].
//!
//! The typed [`reactive`] handles wrap the raw `(owner, key)` API for
//! component code.
//!
//! # Example
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use weft_cache::Cache;
//! use weft_cache::reactive::{Computed, Observable};
//!
//! let cache = Cache::new();
//! let host = cache.owner();
//!
//! let count = Observable::new(&cache, host.id(), "count", 2)?;
//! let c = count.clone();
//! let label = Computed::new(&cache, host.id(), "label", move |_| {
//!     Ok(format!("{} items", c.get()?))
//! });
//!
//! let rendered = Rc::new(RefCell::new(Vec::new()));
//! let sink = Rc::clone(&rendered);
//! let _sub = label.subscribe(move |text: &String, _| {
//!     sink.borrow_mut().push(text.clone());
//!     Ok(())
//! })?;
//!
//! count.set(3)?;
//! count.set(4)?;
//! cache.flush();
//! assert_eq!(*rendered.borrow(), vec!["4 items".to_string()]);
//! # Ok::<(), weft_cache::CacheError>(())
//! ```

pub mod cache;
pub mod config;
mod context;
pub mod emitter;
pub mod error;
pub mod key;
pub mod reactive;
mod store;

pub use cache::{Cache, CacheStats, Subscription};
pub use config::{CacheConfig, DEFAULT_MAX_DEPTH};
pub use emitter::{EmitterState, FlushReport, FlushScheduler};
pub use error::{CacheError, Result};
pub use key::{Key, Owner, OwnerId};
pub use store::EntrySnapshot;
