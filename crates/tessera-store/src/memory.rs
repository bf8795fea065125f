use std::sync::Weak;

use anyhow::anyhow;

use crate::data::Data;
use crate::model::Model;
use crate::params::Parameters;
use crate::storage::{CachePolicy, Fetch, Operation, Storage};
use crate::store::{CacheKey, Namespace, Shared, Slot};

/// Adapter of definitions without a connected storage.
///
/// The cache is the only copy of the data: `get` of an enumerable model
/// finds nothing, a singleton starts from its defaults, `set` confirms
/// every write as is, and `list` enumerates the instances currently cached
/// for the definition in creation order.
#[derive(Debug)]
pub struct MemoryStorage {
    enumerable: bool,
    namespace: Namespace,
    store: Weak<Shared>,
    policy: CachePolicy,
}

impl MemoryStorage {
    pub(crate) fn new(
        enumerable: bool,
        namespace: Namespace,
        store: Weak<Shared>,
        policy: CachePolicy,
    ) -> Self {
        Self {
            enumerable,
            namespace,
            store,
            policy,
        }
    }
}

impl Storage for MemoryStorage {
    fn supports(&self, operation: Operation) -> bool {
        match operation {
            Operation::Get | Operation::Set => true,
            Operation::List => self.enumerable,
        }
    }

    fn get(&self, _parameters: &Parameters) -> Fetch<Option<Data>> {
        if self.enumerable {
            Fetch::ready(None)
        } else {
            Fetch::ready(Some(Data::object()))
        }
    }

    fn set(&self, _id: Option<&str>, _model: Option<&Model>) -> Fetch<Option<Data>> {
        Fetch::ready(None)
    }

    fn list(&self, parameters: &Parameters) -> Fetch<Vec<Data>> {
        if !parameters.is_none() {
            return Fetch::failed(anyhow!(
                "memory-based model definition does not support parameters"
            ));
        }
        let Some(shared) = self.store.upgrade() else {
            return Fetch::ready(Vec::new());
        };
        let ids = shared
            .cache
            .entries(&self.namespace)
            .into_iter()
            .filter_map(|(key, slot)| match (key, slot) {
                (CacheKey::Id(Some(id)), Some(Slot::Value(value)))
                    if !value.is_error() && !value.is_placeholder() && !value.is_undefined() =>
                {
                    Some(Data::String(id))
                }
                _ => None,
            })
            .collect();
        Fetch::ready(ids)
    }

    fn cache(&self) -> CachePolicy {
        self.policy
    }
}
