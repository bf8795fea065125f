//! Keyed memoization primitive for Tessera.
//!
//! A [`Cache`] stores one entry per `(namespace, key)` pair. Each entry holds
//! the last value produced by a resolver, a validity flag, and the set of
//! entries it read while resolving. Reading an entry from inside another
//! entry's resolver records a dependency; changing or invalidating an entry
//! marks every entry that (transitively) depends on it as stale, so the next
//! read re-runs its resolver.
//!
//! # Operations
//!
//! - [`Cache::get`] -- memoized read with a resolver and validity predicate
//! - [`Cache::set`] -- publish a value directly, notifying dependents
//! - [`Cache::invalidate`] / [`Cache::invalidate_all`] -- mark stale, optionally
//!   discarding the last value
//! - [`Cache::observe`] / [`Cache::flush`] -- batched change notification
//!
//! # Design Rules
//!
//! 1. No lock is held while a resolver, observer or drop glue runs.
//! 2. Dependency stacks are kept per thread.
//! 3. Values are replaced, never mutated in place.

pub mod cache;
mod entry;
pub mod error;
pub mod observe;

pub use cache::{Cache, Validate};
pub use error::{CacheError, CacheResult};
pub use observe::Observation;
