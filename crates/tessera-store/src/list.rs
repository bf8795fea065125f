//! List definitions: arrays of models, either nested in a model field or
//! read at the top level through the item adapter's `list` operation.

use std::sync::{Arc, Weak};

use tracing::debug;

use crate::compiler::Config;
use crate::data::Data;
use crate::error::{StoreError, StoreResult};
use crate::model::{ListItem, ModelList};
use crate::storage::Operation;
use crate::store::{Namespace, Shared};
use crate::value::Value;

pub(crate) struct ListConfig {
    pub(crate) namespace: Namespace,
    pub(crate) item: Arc<Config>,
    pub(crate) placeholder: ModelList,
    /// The item definition: cached lists go stale when it invalidates.
    pub(crate) contexts: Vec<Arc<Config>>,
    store: Weak<Shared>,
}

impl ListConfig {
    pub(crate) fn compile(shared: &Arc<Shared>, item: Arc<Config>, nested: bool) -> StoreResult<Self> {
        if !nested {
            if !item.enumerable {
                return Err(StoreError::NotEnumerable);
            }
            if !item.storage.supports(Operation::List) {
                return Err(StoreError::Unsupported(Operation::List));
            }
        }
        let namespace = Namespace::next();
        let store = Arc::downgrade(shared);
        debug!(namespace = %namespace, item = %item.namespace, nested, "compiled list definition");
        Ok(ListConfig {
            namespace,
            placeholder: ModelList::placeholder(Arc::clone(&item), store.clone()),
            contexts: vec![Arc::clone(&item)],
            item,
            store,
        })
    }

    /// Build a list from raw items.
    ///
    /// Enumerable items are kept as id references; objects among them are
    /// created and published to the item definition first. Non-enumerable
    /// items are created and stored inline. Instances already belonging to
    /// the item schema are reused as they are.
    pub(crate) fn create(&self, items: &[Data]) -> StoreResult<ModelList> {
        let shared = self.store.upgrade().ok_or(StoreError::Detached)?;
        let mut list = Vec::with_capacity(items.len());
        for data in items {
            let entry = match data {
                Data::Model(model) if model.schema().is_some() => {
                    if !model.schema().is_some_and(|s| s.ptr_eq(&self.item.schema)) {
                        return Err(StoreError::ModelMismatch);
                    }
                    match model.id() {
                        Some(id) if self.item.enumerable => ListItem::Ref(id.to_string()),
                        _ => ListItem::Inline(model.clone()),
                    }
                }
                Data::Object(_) | Data::Model(_) => {
                    let model = self.item.create(data, None)?.ok_or(StoreError::ItemNotAnObject {
                        found: data.kind_name(),
                    })?;
                    match model.id().map(str::to_string) {
                        Some(id) if self.item.enumerable => {
                            shared.publish(
                                self.item.namespace,
                                Some(id.clone()),
                                Value::Model(model),
                            );
                            ListItem::Ref(id)
                        }
                        _ => ListItem::Inline(model),
                    }
                }
                Data::Null | Data::Array(_) => {
                    return Err(StoreError::ItemNotAnObject {
                        found: data.kind_name(),
                    })
                }
                primitive if self.item.enumerable => ListItem::Ref(primitive.to_key_string()),
                other => {
                    return Err(StoreError::ItemNotAnObject {
                        found: other.kind_name(),
                    })
                }
            };
            list.push(entry);
        }
        Ok(ModelList::new(list, Arc::clone(&self.item), self.store.clone()))
    }

    /// Value of an array field the data left out: empty for enumerable
    /// items, a single default item otherwise.
    pub(crate) fn default_list(&self) -> StoreResult<ModelList> {
        if self.item.enumerable {
            self.create(&[])
        } else {
            self.create(&[Data::object()])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::schema::Schema;
    use crate::storage::{Fetch, FnStorage};
    use crate::store::Store;

    fn store() -> Store {
        Store::builder().config(StoreConfig::quiet()).build()
    }

    #[test]
    fn top_level_lists_need_enumerable_items() {
        let store = store();
        let singleton = Schema::builder().field("v", "").build();
        assert!(matches!(
            store.0.compile_list(&singleton, false),
            Err(StoreError::NotEnumerable)
        ));
        assert!(store.0.compile_list(&singleton, true).is_ok());
    }

    #[test]
    fn top_level_lists_need_a_listing_adapter() {
        let store = store();
        let schema = Schema::builder()
            .id()
            .connect(FnStorage::new(|_| Fetch::ready(None)))
            .build();
        assert_eq!(
            store.0.compile_list(&schema, false).err(),
            Some(StoreError::Unsupported(Operation::List))
        );
    }

    #[test]
    fn enumerable_items_become_references() {
        let store = store();
        let item = Schema::builder().id().field("v", "").build();
        let list = store.0.compile_list(&item, true).unwrap();

        let created = list
            .create(&[
                Data::from_pairs([("id", "a"), ("v", "x")]),
                Data::from("b"),
                Data::from(3),
            ])
            .unwrap();
        assert_eq!(created.ids(), ["a", "b", "3"]);

        let first = created.get(0).unwrap();
        assert_eq!(first.as_model().unwrap().get("v").unwrap(), Value::from("x"));
        assert_eq!(created.get(9).unwrap(), Value::Undefined);
    }

    #[test]
    fn non_enumerable_items_are_inline() {
        let store = store();
        let item = Schema::builder().field("v", "").build();
        let list = store.0.compile_list(&item, true).unwrap();

        let created = list.create(&[Data::from_pairs([("v", "x")])]).unwrap();
        assert_eq!(created.len(), 1);
        assert!(created.ids().is_empty());

        assert_eq!(
            list.create(&[Data::from("x")]).unwrap_err(),
            StoreError::ItemNotAnObject { found: "string" }
        );
        assert_eq!(list.default_list().unwrap().len(), 1);
    }
}
