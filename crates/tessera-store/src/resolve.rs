//! Resolution of cached instances.
//!
//! A read goes through the cache entry of `(definition, id)`. The entry is
//! resolved again when it was never loaded, was cleared, or its value failed
//! the definition's cache policy. Resolving keeps the cached value while it
//! is pending or still fresh, and otherwise calls the adapter: ready results
//! replace the value immediately, deferred ones are published when they
//! complete and mark the cached value pending in the meantime.

use std::sync::Arc;

use tracing::trace;

use crate::compiler::Config;
use crate::data::Data;
use crate::error::StoreResult;
use crate::list::ListConfig;
use crate::model::{ErrorCause, ModelError};
use crate::params::Parameters;
use crate::storage::{CachePolicy, Fetch};
use crate::store::{CacheKey, Namespace, Shared, Slot};
use crate::value::Value;

/// A definition that can be resolved: a model or a list.
pub(crate) trait Target: Send + Sync + 'static {
    fn namespace(&self) -> Namespace;
    fn placeholder(&self) -> Value;
    fn policy(&self) -> CachePolicy;
    fn contexts(&self) -> &[Arc<Config>];
    fn fetch(&self, parameters: &Parameters) -> Fetch<Option<Data>>;
    /// Build an instance from loaded data. Data of the wrong shape counts as
    /// not found.
    fn build(&self, data: Data) -> Result<Value, ErrorCause>;
    fn map_error(&self, cause: ErrorCause, id: Option<&str>) -> ModelError;
}

impl Target for Config {
    fn namespace(&self) -> Namespace {
        self.namespace
    }

    fn placeholder(&self) -> Value {
        Value::Model(self.placeholder.clone())
    }

    fn policy(&self) -> CachePolicy {
        self.policy
    }

    fn contexts(&self) -> &[Arc<Config>] {
        &self.contexts
    }

    fn fetch(&self, parameters: &Parameters) -> Fetch<Option<Data>> {
        self.storage.get(parameters)
    }

    fn build(&self, data: Data) -> Result<Value, ErrorCause> {
        if !data.is_object() {
            return Err(ErrorCause::NotFound);
        }
        match self.create(&data, None) {
            Ok(Some(model)) => Ok(Value::Model(model)),
            Ok(None) => Err(ErrorCause::NotFound),
            Err(err) => Err(ErrorCause::Contract(err)),
        }
    }

    fn map_error(&self, cause: ErrorCause, id: Option<&str>) -> ModelError {
        Config::map_error(self, cause, id)
    }
}

impl Target for ListConfig {
    fn namespace(&self) -> Namespace {
        self.namespace
    }

    fn placeholder(&self) -> Value {
        Value::List(self.placeholder.clone())
    }

    fn policy(&self) -> CachePolicy {
        self.item.policy
    }

    fn contexts(&self) -> &[Arc<Config>] {
        &self.contexts
    }

    fn fetch(&self, parameters: &Parameters) -> Fetch<Option<Data>> {
        self.item
            .storage
            .list(parameters)
            .map(|items| Some(Data::Array(items)))
    }

    fn build(&self, data: Data) -> Result<Value, ErrorCause> {
        match data {
            Data::Array(items) => self
                .create(&items)
                .map(Value::List)
                .map_err(ErrorCause::Contract),
            _ => Err(ErrorCause::NotFound),
        }
    }

    fn map_error(&self, cause: ErrorCause, id: Option<&str>) -> ModelError {
        self.item.map_error(cause, id)
    }
}

/// Read the current instance of `target` for `id`.
pub(crate) fn get<T: Target>(
    shared: &Arc<Shared>,
    target: &Arc<T>,
    id: Option<String>,
    parameters: Parameters,
) -> StoreResult<Value> {
    let namespace = target.namespace();
    let key = CacheKey::Id(id.clone());
    let policy = target.policy();
    let fresh = |slot: Option<&Slot>| match slot {
        Some(Slot::Value(value)) => policy.is_fresh(shared.stamp(value), shared.epoch.now()),
        _ => true,
    };
    let validate: Option<&dyn Fn(Option<&Slot>) -> bool> = match policy {
        CachePolicy::Forever => None,
        _ => Some(&fresh),
    };

    let slot = shared.cache.get(
        &namespace,
        &key,
        |last| Slot::Value(load(shared, target, id, &parameters, last.and_then(Slot::into_value))),
        validate,
    )?;
    Ok(slot.into_value().unwrap_or_default())
}

fn load<T: Target>(
    shared: &Arc<Shared>,
    target: &Arc<T>,
    id: Option<String>,
    parameters: &Parameters,
    cached: Option<Value>,
) -> Value {
    if let Some(value) = &cached {
        if value.is_placeholder() || shared.pending(value) {
            return value.clone();
        }
    }

    let now = shared.epoch.now();
    let stale = target
        .contexts()
        .iter()
        .filter(|context| shared.marker(context) == now)
        .count()
        > 0;

    if !stale {
        if let Some(value) = &cached {
            let policy = target.policy();
            if policy == CachePolicy::Forever || policy.is_fresh(shared.stamp(value), now) {
                return value.clone();
            }
        }
    }

    trace!(namespace = %target.namespace(), id = ?id, stale, "loading from storage");
    match target.fetch(parameters) {
        Fetch::Ready(result) => {
            let value = settle(target.as_ref(), id.as_deref(), result);
            shared.touch(&value);
            value
        }
        Fetch::Deferred(future) => {
            let store = Arc::downgrade(shared);
            let owner = Arc::clone(target);
            let key = id.clone();
            let spawned = shared.spawn(async move {
                let result = future.await.map(|data| {
                    data.map(|data| match &key {
                        Some(id) => data.with_id(id),
                        None => data,
                    })
                });
                let Some(shared) = store.upgrade() else { return };
                let value = settle(owner.as_ref(), key.as_deref(), result);
                trace!(namespace = %owner.namespace(), id = ?key, error = value.is_error(), "deferred load settled");
                shared.publish(owner.namespace(), key, value);
            });
            if let Err(err) = spawned {
                let value = Value::Error(target.map_error(ErrorCause::Contract(err), id.as_deref()));
                shared.touch(&value);
                return value;
            }
            match cached {
                Some(value) => {
                    shared.set_pending(&value, true);
                    value
                }
                None => target.placeholder(),
            }
        }
    }
}

/// Turn an adapter result into the value to publish.
fn settle<T: Target + ?Sized>(
    target: &T,
    id: Option<&str>,
    result: anyhow::Result<Option<Data>>,
) -> Value {
    let cause = match result {
        Ok(Some(data)) => match target.build(data) {
            Ok(value) => return value,
            Err(cause) => cause,
        },
        Ok(None) => ErrorCause::NotFound,
        Err(err) => ErrorCause::Storage(err),
    };
    Value::Error(target.map_error(cause, id))
}
