//! Model, list and error instances.
//!
//! Instances are immutable and reference counted. Side state (pending flag,
//! memoized computed and foreign fields) lives in the store's cache under a
//! namespace owned by the instance; the namespace is dropped together with
//! the instance, so the cache never extends its lifetime.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::compiler::Config;
use crate::data::Data;
use crate::error::{StoreError, StoreResult};
use crate::params::Parameters;
use crate::schema::{ComputeFn, Schema};
use crate::store::{CacheKey, Namespace, Shared};
use crate::value::Value;

/// Per-instance side state.
pub(crate) struct Meta {
    pub(crate) namespace: Namespace,
    stamp: AtomicU64,
    pub(crate) store: Weak<Shared>,
}

impl Meta {
    pub(crate) fn new(store: Weak<Shared>) -> Self {
        Self {
            namespace: Namespace::next(),
            stamp: AtomicU64::new(0),
            store,
        }
    }

    /// Load timestamp, `0` when not stamped yet.
    pub(crate) fn stamp(&self) -> u64 {
        self.stamp.load(Ordering::Acquire)
    }

    /// Stamp with `now` unless already stamped; returns the stamp in effect.
    pub(crate) fn stamp_once(&self, now: u64) -> u64 {
        match self
            .stamp
            .compare_exchange(0, now, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => now,
            Err(existing) => existing,
        }
    }

    pub(crate) fn set_stamp(&self, now: u64) {
        self.stamp.store(now, Ordering::Release);
    }
}

impl Drop for Meta {
    fn drop(&mut self) {
        if let Some(shared) = self.store.upgrade() {
            shared.cache.drop_namespace(&self.namespace);
        }
    }
}

/// Stored content of a model field.
#[derive(Clone)]
pub(crate) enum FieldSlot {
    Value(Value),
    /// Reference to an independently cached model.
    Foreign {
        config: Arc<Config>,
        id: Option<String>,
    },
    Computed(ComputeFn),
}

impl FieldSlot {
    pub(crate) fn as_value(&self) -> Option<&Value> {
        match self {
            FieldSlot::Value(value) => Some(value),
            _ => None,
        }
    }

    pub(crate) fn as_model(&self) -> Option<&Model> {
        self.as_value().and_then(Value::as_model)
    }
}

enum Body {
    Placeholder {
        keys: Arc<[Arc<str>]>,
    },
    Instance {
        id: Option<String>,
        fields: Vec<(Arc<str>, FieldSlot)>,
    },
}

struct ModelInner {
    meta: Meta,
    body: Body,
    tag: Mutex<Option<Schema>>,
}

/// An immutable model instance.
///
/// Updating a model through [`crate::Store::set`] produces a new instance;
/// the old one keeps its values but is no longer connected to its schema.
#[derive(Clone)]
pub struct Model(Arc<ModelInner>);

impl Model {
    pub(crate) fn placeholder(keys: Arc<[Arc<str>]>, store: Weak<Shared>) -> Self {
        Model(Arc::new(ModelInner {
            meta: Meta::new(store),
            body: Body::Placeholder { keys },
            tag: Mutex::new(None),
        }))
    }

    pub(crate) fn instance(
        id: Option<String>,
        fields: Vec<(Arc<str>, FieldSlot)>,
        schema: Schema,
        store: Weak<Shared>,
    ) -> Self {
        Model(Arc::new(ModelInner {
            meta: Meta::new(store),
            body: Body::Instance { id, fields },
            tag: Mutex::new(Some(schema)),
        }))
    }

    pub(crate) fn meta(&self) -> &Meta {
        &self.0.meta
    }

    pub(crate) fn slot(&self, key: &str) -> Option<&FieldSlot> {
        match &self.0.body {
            Body::Instance { fields, .. } => {
                fields.iter().find(|(k, _)| k.as_ref() == key).map(|(_, s)| s)
            }
            Body::Placeholder { .. } => None,
        }
    }

    /// Disconnect the instance from its schema once superseded.
    pub(crate) fn release_tag(&self) {
        let released = self.0.tag.lock().expect("lock poisoned").take();
        drop(released);
    }

    /// Identifier of an enumerable model.
    pub fn id(&self) -> Option<&str> {
        match &self.0.body {
            Body::Instance { id, .. } => id.as_deref(),
            Body::Placeholder { .. } => None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.0.body, Body::Placeholder { .. })
    }

    /// The schema this instance currently belongs to. `None` for
    /// placeholders and superseded instances.
    pub fn schema(&self) -> Option<Schema> {
        self.0.tag.lock().expect("lock poisoned").clone()
    }

    /// Visible field names in declaration order. Computed fields are not
    /// listed.
    pub fn keys(&self) -> Vec<&str> {
        match &self.0.body {
            Body::Instance { fields, .. } => fields
                .iter()
                .filter(|(_, slot)| !matches!(slot, FieldSlot::Computed(_)))
                .map(|(k, _)| k.as_ref())
                .collect(),
            Body::Placeholder { .. } => Vec::new(),
        }
    }

    /// Read a field.
    ///
    /// Computed fields are memoized per instance. Foreign fields resolve the
    /// referenced model through the store on every read and fall back to the
    /// last resolved value while this instance is pending. Declared fields of
    /// a placeholder fail with [`StoreError::Pending`].
    pub fn get(&self, key: &str) -> StoreResult<Value> {
        let fields = match &self.0.body {
            Body::Placeholder { keys } => {
                return Err(if keys.iter().any(|k| k.as_ref() == key) {
                    StoreError::Pending { key: key.to_string() }
                } else {
                    StoreError::UnknownField(key.to_string())
                });
            }
            Body::Instance { fields, .. } => fields,
        };

        let Some((name, slot)) = fields.iter().find(|(k, _)| k.as_ref() == key) else {
            return match (key, self.id()) {
                ("id", Some(id)) => Ok(Value::from(id)),
                _ => Err(StoreError::UnknownField(key.to_string())),
            };
        };

        match slot {
            FieldSlot::Value(value) => Ok(value.clone()),
            FieldSlot::Computed(compute) => match self.0.meta.store.upgrade() {
                Some(shared) => shared.memo(
                    self.0.meta.namespace,
                    CacheKey::Field(Arc::clone(name)),
                    |_| Ok(compute(self)),
                ),
                None => Ok(compute(self)),
            },
            FieldSlot::Foreign { config, id } => {
                let shared = self.0.meta.store.upgrade().ok_or(StoreError::Detached)?;
                let parameters = Parameters::from(id.clone());
                shared.memo(
                    self.0.meta.namespace,
                    CacheKey::Field(Arc::clone(name)),
                    |cached| {
                        if shared.is_pending(self.0.meta.namespace) {
                            return Ok(cached.unwrap_or_default());
                        }
                        shared.resolve_model(config, id.clone(), parameters)
                    },
                )
            }
        }
    }

    /// Raw data of this instance: its id, stored fields, ids of foreign
    /// references and raw list items. Computed fields are omitted.
    pub fn to_data(&self) -> Data {
        Data::Object(self.to_data_map())
    }

    pub(crate) fn to_data_map(&self) -> BTreeMap<String, Data> {
        let mut map = BTreeMap::new();
        let Body::Instance { id, fields } = &self.0.body else {
            return map;
        };
        if let Some(id) = id {
            map.insert("id".to_string(), Data::String(id.clone()));
        }
        for (key, slot) in fields {
            let data = match slot {
                FieldSlot::Value(value) => value.to_data(),
                FieldSlot::Foreign { id: Some(id), .. } => Data::String(id.clone()),
                FieldSlot::Foreign { id: None, .. } => match self.get(key) {
                    Ok(Value::Model(model)) => Data::Model(model),
                    _ => Data::Null,
                },
                FieldSlot::Computed(_) => continue,
            };
            map.insert(key.to_string(), data);
        }
        map
    }

    /// Visible JSON shape: stored and foreign fields, without the id and
    /// computed fields.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        if let Body::Instance { fields, .. } = &self.0.body {
            for (key, slot) in fields {
                let json = match slot {
                    FieldSlot::Value(value) => value.to_json(),
                    FieldSlot::Foreign { .. } => self
                        .get(key)
                        .map(|v| v.to_json())
                        .unwrap_or(serde_json::Value::Null),
                    FieldSlot::Computed(_) => continue,
                };
                map.insert(key.to_string(), json);
            }
        }
        serde_json::Value::Object(map)
    }
}

impl PartialEq for Model {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.body {
            Body::Placeholder { .. } => f.write_str("Model(<placeholder>)"),
            Body::Instance { id, fields } => {
                let mut s = f.debug_struct("Model");
                if let Some(id) = id {
                    s.field("id", id);
                }
                for (key, slot) in fields {
                    match slot {
                        FieldSlot::Value(value) => s.field(key, value),
                        FieldSlot::Foreign { id, .. } => s.field(key, &format_args!("<ref {id:?}>")),
                        FieldSlot::Computed(_) => continue,
                    };
                }
                s.finish()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Lists
// ---------------------------------------------------------------------------

/// Item of a model list.
#[derive(Clone, Debug)]
pub(crate) enum ListItem {
    /// Non-enumerable model stored inline.
    Inline(Model),
    /// Id of an enumerable model, resolved lazily.
    Ref(String),
}

struct ListInner {
    meta: Meta,
    placeholder: bool,
    items: Vec<ListItem>,
    item: Arc<Config>,
}

/// An immutable list of models.
///
/// Items referring to enumerable models hold only their id; reading such an
/// item resolves it through the store and yields the last resolved value
/// while the list itself is pending.
#[derive(Clone)]
pub struct ModelList(Arc<ListInner>);

impl ModelList {
    pub(crate) fn new(items: Vec<ListItem>, item: Arc<Config>, store: Weak<Shared>) -> Self {
        ModelList(Arc::new(ListInner {
            meta: Meta::new(store),
            placeholder: false,
            items,
            item,
        }))
    }

    pub(crate) fn placeholder(item: Arc<Config>, store: Weak<Shared>) -> Self {
        ModelList(Arc::new(ListInner {
            meta: Meta::new(store),
            placeholder: true,
            items: Vec::new(),
            item,
        }))
    }

    pub(crate) fn meta(&self) -> &Meta {
        &self.0.meta
    }

    pub fn is_placeholder(&self) -> bool {
        self.0.placeholder
    }

    pub fn len(&self) -> usize {
        self.0.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.items.is_empty()
    }

    /// Ids of enumerable items, in order.
    pub fn ids(&self) -> Vec<&str> {
        self.0
            .items
            .iter()
            .filter_map(|item| match item {
                ListItem::Ref(id) => Some(id.as_str()),
                ListItem::Inline(model) => model.id(),
            })
            .collect()
    }

    /// Item at `index`; [`Value::Undefined`] past the end.
    pub fn get(&self, index: usize) -> StoreResult<Value> {
        match self.0.items.get(index) {
            None => Ok(Value::Undefined),
            Some(ListItem::Inline(model)) => Ok(Value::Model(model.clone())),
            Some(ListItem::Ref(id)) => {
                let shared = self.0.meta.store.upgrade().ok_or(StoreError::Detached)?;
                let namespace = self.0.meta.namespace;
                shared.memo(namespace, CacheKey::Index(index), |cached| {
                    if shared.is_pending(namespace) {
                        return Ok(cached.unwrap_or_default());
                    }
                    shared.resolve_model(
                        &self.0.item,
                        Some(id.clone()),
                        Parameters::from(id.as_str()),
                    )
                })
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = StoreResult<Value>> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }

    pub(crate) fn to_data(&self) -> Data {
        Data::Array(
            self.0
                .items
                .iter()
                .map(|item| match item {
                    ListItem::Inline(model) => Data::Model(model.clone()),
                    ListItem::Ref(id) => Data::String(id.clone()),
                })
                .collect(),
        )
    }

    /// JSON array of the items' visible shapes; unresolved or failed items
    /// render as `null`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.iter()
                .map(|item| item.map(|v| v.to_json()).unwrap_or(serde_json::Value::Null))
                .collect(),
        )
    }
}

impl PartialEq for ModelList {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ModelList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.placeholder {
            return f.write_str("ModelList(<placeholder>)");
        }
        f.debug_list().entries(self.0.items.iter()).finish()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a data error occurred.
#[derive(Debug)]
pub enum ErrorCause {
    /// Storage had no record for the id.
    NotFound,
    /// The data violated the schema contract.
    Contract(StoreError),
    /// The adapter failed.
    Storage(anyhow::Error),
}

struct ErrorInner {
    meta: Meta,
    message: String,
    cause: ErrorCause,
    origin: Namespace,
    id: Option<String>,
    guarded: Arc<[Arc<str>]>,
}

/// A data error published in place of a model or list.
///
/// Declared fields of the failed definition are guarded: reading them fails
/// with [`StoreError::ErrorState`], so callers check [`crate::Store::error`]
/// first. `message` and `name` stay readable.
#[derive(Clone)]
pub struct ModelError(Arc<ErrorInner>);

impl ModelError {
    pub(crate) fn new(
        cause: ErrorCause,
        origin: Namespace,
        id: Option<String>,
        guarded: Arc<[Arc<str>]>,
        store: Weak<Shared>,
    ) -> Self {
        let message = match &cause {
            ErrorCause::NotFound => format!(
                "model instance with '{}' parameters not found",
                id.as_deref().unwrap_or("undefined")
            ),
            ErrorCause::Contract(err) => err.to_string(),
            ErrorCause::Storage(err) => format!("{err:#}"),
        };
        ModelError(Arc::new(ErrorInner {
            meta: Meta::new(store),
            message,
            cause,
            origin,
            id,
            guarded,
        }))
    }

    pub(crate) fn meta(&self) -> &Meta {
        &self.0.meta
    }

    pub(crate) fn origin(&self) -> Namespace {
        self.0.origin
    }

    pub fn message(&self) -> &str {
        &self.0.message
    }

    pub fn cause(&self) -> &ErrorCause {
        &self.0.cause
    }

    /// Id of the entry that failed.
    pub fn id(&self) -> Option<&str> {
        self.0.id.as_deref()
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.0.cause, ErrorCause::NotFound)
    }

    /// Guarded field access.
    pub fn get(&self, key: &str) -> StoreResult<Value> {
        match key {
            "message" => Ok(Value::from(self.0.message.as_str())),
            "name" => Ok(Value::from("Error")),
            _ if self.0.guarded.iter().any(|k| k.as_ref() == key) => {
                Err(StoreError::ErrorState { key: key.to_string() })
            }
            _ => Err(StoreError::UnknownField(key.to_string())),
        }
    }
}

impl PartialEq for ModelError {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelError")
            .field("message", &self.0.message)
            .field("id", &self.0.id)
            .field("cause", &self.0.cause)
            .finish()
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.message)
    }
}

impl std::error::Error for ModelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.0.cause {
            ErrorCause::NotFound => None,
            ErrorCause::Contract(err) => Some(err),
            ErrorCause::Storage(err) => Some(err.as_ref()),
        }
    }
}

impl Value {
    pub(crate) fn meta(&self) -> Option<&Meta> {
        match self {
            Value::Model(model) => Some(model.meta()),
            Value::List(list) => Some(list.meta()),
            Value::Error(err) => Some(err.meta()),
            _ => None,
        }
    }
}
