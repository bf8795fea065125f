//! Writes: create, update and delete through the definition's adapter.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::debug;

use crate::compiler::Config;
use crate::data::Data;
use crate::error::{StoreError, StoreResult};
use crate::model::{ErrorCause, Model, ModelError};
use crate::storage::{Fetch, Operation};
use crate::store::{CacheKey, Shared, SetTarget, Slot};
use crate::value::Value;

/// Completion of a write: the published instance, or the data error that
/// rejected it. A deletion resolves to a not-found error instance.
pub type SetFuture = Pin<Box<dyn Future<Output = Result<Value, ModelError>> + Send>>;

/// Toggles the pending flag of the instance being written.
struct Toggle {
    shared: Arc<Shared>,
    config: Arc<Config>,
    previous: Option<Model>,
}

impl Toggle {
    fn apply(&self, id: Option<&str>, pending: bool) {
        match &self.previous {
            Some(model) => self.shared.set_pending(&Value::Model(model.clone()), pending),
            None => {
                let key = CacheKey::Id(id.map(str::to_string));
                if let Some(Slot::Value(current)) = self.shared.cache.value(&self.config.namespace, &key) {
                    self.shared.set_pending(&current, pending);
                }
            }
        }
    }
}

pub(crate) fn set(shared: &Arc<Shared>, target: SetTarget, values: Data) -> StoreResult<SetFuture> {
    let (config, previous) = match target {
        SetTarget::Schema(schema) => (shared.compile(&schema)?, None),
        SetTarget::Model(model) => {
            let schema = model.schema().ok_or(StoreError::Untracked)?;
            (shared.compile(&schema)?, Some(model))
        }
    };
    if !config.storage.supports(Operation::Set) {
        return Err(StoreError::Unsupported(Operation::Set));
    }

    let toggle = Toggle {
        shared: Arc::clone(shared),
        config: Arc::clone(&config),
        previous: previous.clone(),
    };
    let mut id = previous.as_ref().and_then(Model::id).map(str::to_string);

    let local = match prepare(&config, previous.as_ref(), &values) {
        Ok(local) => local,
        Err(err) => {
            toggle.apply(id.as_deref(), false);
            return Ok(reject(config.map_error(ErrorCause::Contract(err), id.as_deref())));
        }
    };
    if let Some(created) = local.as_ref().and_then(Model::id) {
        id = Some(created.to_string());
    }

    let update_id = previous.as_ref().and(id.as_deref());
    debug!(
        namespace = %config.namespace,
        id = ?id,
        delete = local.is_none(),
        update = previous.is_some(),
        "writing model"
    );
    let fetch = match config.storage.set(update_id, local.as_ref()) {
        Fetch::Ready(Err(err)) => {
            toggle.apply(id.as_deref(), false);
            return Ok(reject(config.map_error(ErrorCause::Storage(err), id.as_deref())));
        }
        fetch => fetch,
    };
    toggle.apply(id.as_deref(), true);

    let shared = Arc::clone(shared);
    Ok(Box::pin(async move {
        let result = fetch.resolve().await;
        match commit(&shared, &config, previous.as_ref(), local, id.as_deref(), result) {
            Ok((value, invalidated)) => {
                if invalidated {
                    config.flushed().await;
                }
                Ok(value)
            }
            Err(cause) => {
                toggle.apply(id.as_deref(), false);
                Err(config.map_error(cause, id.as_deref()))
            }
        }
    }))
}

fn reject(err: ModelError) -> SetFuture {
    Box::pin(async move { Err(err) })
}

/// Check the values and build the local instance. `None` deletes.
fn prepare(config: &Config, previous: Option<&Model>, values: &Data) -> StoreResult<Option<Model>> {
    if previous.is_none() && !values.is_object() {
        return Err(StoreError::NotAnObject {
            found: values.kind_name(),
        });
    }
    if values.has_key("id") {
        return Err(StoreError::IdInValues);
    }
    config.create(values, previous)
}

/// Publish the confirmed instance and release the one it supersedes.
/// Returns it and whether the definition was invalidated.
fn commit(
    shared: &Shared,
    config: &Config,
    previous: Option<&Model>,
    local: Option<Model>,
    id: Option<&str>,
    result: anyhow::Result<Option<Data>>,
) -> Result<(Value, bool), ErrorCause> {
    let resolved = match result.map_err(ErrorCause::Storage)? {
        Some(data) if !data.is_null() => config
            .create(&data, None)
            .map_err(ErrorCause::Contract)?,
        _ => local,
    };

    if previous.is_some() {
        if let Some(model) = &resolved {
            if model.id() != id {
                return Err(ErrorCause::Contract(StoreError::IdMismatch {
                    local: id.unwrap_or_default().to_string(),
                    remote: model.id().unwrap_or_default().to_string(),
                }));
            }
        }
    }

    let key = resolved
        .as_ref()
        .and_then(Model::id)
        .or(id)
        .map(str::to_string);
    let value = match resolved {
        Some(model) => Value::Model(model),
        None => Value::Error(config.map_error(ErrorCause::NotFound, id)),
    };
    let replaced = shared.publish(config.namespace, key, value.clone());
    if let Some(previous) = previous {
        previous.release_tag();
    }
    let invalidate = value.is_error() || !replaced;
    if invalidate {
        config.invalidate();
    }
    Ok((value, invalidate))
}
