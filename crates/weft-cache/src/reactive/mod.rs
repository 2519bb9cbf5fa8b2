#![forbid(unsafe_code)]

//! Typed property handles over the [`Cache`](crate::Cache).
//!
//! The cache itself is addressed with `(owner, key)` pairs and closures. The
//! property layer binds those once so component code can read and write
//! properties directly:
//!
//! - [`Observable`]: a stored value property (`get` / `set` / `update`).
//! - [`Computed`]: a derived property whose getter may read other
//!   properties; reads are tracked as dependencies automatically.
//! - [`Subscription`]: RAII guard returned by `subscribe`, unsubscribes on
//!   drop.
//!
//! # Invariants
//!
//! 1. Version increments exactly once per change of the stored value.
//! 2. Setting a value equal to the current value is a no-op (no version bump,
//!    no notifications).
//! 3. `Computed::get()` never returns a stale value.
//! 4. Subscribers run on the next [`Cache::flush`](crate::Cache::flush), not
//!    synchronously inside `set`.

pub mod computed;
pub mod observable;

pub use crate::cache::Subscription;
pub use computed::Computed;
pub use observable::Observable;
