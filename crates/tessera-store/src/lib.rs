//! Declarative model store for Tessera.
//!
//! Applications describe their data as [`Schema`]s and read and write it
//! through a [`Store`]. The store compiles each schema once, keeps loaded
//! instances in a dependency-tracking cache and talks to a pluggable
//! [`Storage`] adapter, or to its own memory when none is connected.
//!
//! # Operations
//!
//! - [`Store::get`] -- synchronous read of a model or list; returns the
//!   cached instance, a placeholder while loading, or an error instance
//! - [`Store::set`] -- create, update or delete; resolves once the adapter
//!   confirms
//! - [`Store::clear`] -- invalidate a definition or a single instance
//! - [`Store::pending`] / [`Store::ready`] / [`Store::error`] -- state
//!   predicates
//! - [`Store::observe`] -- change notification, delivered per frame
//!
//! # Design Rules
//!
//! 1. Instances are immutable; updates publish a new instance and release
//!    the old one from its schema.
//! 2. Contract violations are returned as [`StoreError`]; data failures are
//!    published as [`ModelError`] instances and cached like models.
//! 3. Reads never block: deferred adapter results land on the scheduler and
//!    are published when they complete.
//! 4. Creating or deleting an instance invalidates every definition that
//!    lists its definition as a context, once per flush.
//! 5. Schemas are identified by reference, never by content.

pub mod clock;
mod compiler;
pub mod config;
pub mod data;
pub mod error;
mod list;
pub mod memory;
pub mod model;
mod mutate;
pub mod params;
mod resolve;
pub mod scheduler;
pub mod schema;
pub mod storage;
pub mod store;
pub mod value;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheSetting, StoreConfig};
pub use data::Data;
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStorage;
pub use model::{ErrorCause, Model, ModelError, ModelList};
pub use mutate::SetFuture;
pub use params::Parameters;
pub use scheduler::{Scheduler, TokioScheduler};
pub use schema::{ComputeFn, FieldDefault, ListOptions, Schema, SchemaBuilder};
pub use storage::{BoxFuture, CachePolicy, FnStorage, Fetch, Operation, Storage};
pub use store::{ClearTarget, Definition, SetTarget, Store, StoreBuilder, Subscription};
pub use value::Value;
