//! Model definition compiler.
//!
//! Turns a [`Schema`] into a [`Config`]: an ordered set of field operations
//! plus the adapter, cache policy and placeholder of the definition. A
//! [`Config`] builds model instances out of raw data and owns the debounced
//! invalidation of its definition.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::data::Data;
use crate::error::{StoreError, StoreResult};
use crate::list::ListConfig;
use crate::memory::MemoryStorage;
use crate::model::{ErrorCause, FieldSlot, Model, ModelError};
use crate::params::new_identifier;
use crate::schema::{ComputeFn, FieldDefault, Schema};
use crate::storage::{CachePolicy, Storage};
use crate::store::{CacheKey, Namespace, Shared};
use crate::value::Value;

/// Keys an error instance keeps readable.
const ERROR_KEYS: [&str; 4] = ["message", "name", "toString", "constructor"];

/// Primitive field kind, taken from the kind of the default.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Primitive {
    String,
    Number,
    Bool,
}

impl Primitive {
    fn of(default: &FieldDefault) -> Option<Self> {
        match default {
            FieldDefault::String(_) => Some(Primitive::String),
            FieldDefault::Number(_) => Some(Primitive::Number),
            FieldDefault::Bool(_) => Some(Primitive::Bool),
            _ => None,
        }
    }

    /// Convert raw data to this kind.
    pub(crate) fn coerce(self, data: &Data) -> Value {
        match self {
            Primitive::String => Value::from(data.to_key_string()),
            Primitive::Number => Value::Number(to_number(data)),
            Primitive::Bool => Value::Bool(truthy(data)),
        }
    }

    fn coerce_default(self, default: &FieldDefault) -> Option<Value> {
        let data = match default {
            FieldDefault::String(s) => Data::String(s.clone()),
            FieldDefault::Number(n) => Data::Number(*n),
            FieldDefault::Bool(b) => Data::Bool(*b),
            _ => return None,
        };
        Some(self.coerce(&data))
    }
}

pub(crate) fn truthy(data: &Data) -> bool {
    match data {
        Data::Null => false,
        Data::Bool(b) => *b,
        Data::Number(n) => *n != 0.0 && !n.is_nan(),
        Data::String(s) => !s.is_empty(),
        Data::Array(_) | Data::Object(_) | Data::Model(_) => true,
    }
}

pub(crate) fn to_number(data: &Data) -> f64 {
    match data {
        Data::Null => 0.0,
        Data::Bool(b) => f64::from(u8::from(*b)),
        Data::Number(n) => *n,
        Data::String(s) => parse_number(s),
        Data::Array(items) => match items.as_slice() {
            [] => 0.0,
            [item] => parse_number(&item.to_key_string()),
            _ => f64::NAN,
        },
        Data::Object(_) | Data::Model(_) => f64::NAN,
    }
}

/// Numeric value of a string: surrounding whitespace is ignored, the empty
/// string is zero, `0x`/`0o`/`0b` prefixes select a radix and anything
/// unparsable is NaN.
fn parse_number(input: &str) -> f64 {
    let s = input.trim();
    if s.is_empty() {
        return 0.0;
    }
    match s {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    let radix = match s.get(..2) {
        Some("0x" | "0X") => Some(16),
        Some("0o" | "0O") => Some(8),
        Some("0b" | "0B") => Some(2),
        _ => None,
    };
    if let Some(radix) = radix {
        return u64::from_str_radix(&s[2..], radix).map_or(f64::NAN, |n| n as f64);
    }
    let lower = s.to_ascii_lowercase();
    if lower.contains("inf") || lower.contains("nan") {
        return f64::NAN;
    }
    s.parse::<f64>().unwrap_or(f64::NAN)
}

/// How a field is built from raw data.
pub(crate) enum FieldOp {
    Identifier,
    Computed(ComputeFn),
    Scalar { kind: Primitive, default: Value },
    /// Non-enumerable, memory-backed model stored inline.
    NestedObject(Arc<Config>),
    /// Enumerable or connected model stored by reference.
    NestedForeign(Arc<Config>),
    ArrayOfScalar { kind: Primitive, default: Value },
    ArrayOfNested(Arc<ListConfig>),
    ArrayOfForeign(Arc<ListConfig>),
}

/// A compiled model definition.
pub(crate) struct Config {
    pub(crate) namespace: Namespace,
    pub(crate) schema: Schema,
    pub(crate) enumerable: bool,
    pub(crate) external: bool,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) policy: CachePolicy,
    pub(crate) placeholder: Model,
    pub(crate) fields: Vec<(Arc<str>, FieldOp)>,
    /// Definitions whose invalidation makes cached instances of this one
    /// stale.
    pub(crate) contexts: Vec<Arc<Config>>,
    guarded: Arc<[Arc<str>]>,
    /// `true` while an invalidation flush is scheduled.
    flush: Arc<watch::Sender<bool>>,
    store: Weak<Shared>,
}

impl Config {
    pub(crate) fn compile(shared: &Arc<Shared>, schema: &Schema) -> StoreResult<Self> {
        let namespace = Namespace::next();
        let store = Arc::downgrade(shared);
        let enumerable = schema.fields().any(|(key, _)| key == "id");
        let external = schema.is_connected();
        let storage: Arc<dyn Storage> = match &schema.0.storage {
            Some(storage) => Arc::clone(storage),
            None => Arc::new(MemoryStorage::new(
                enumerable,
                namespace,
                store.clone(),
                shared.settings.memory_cache.into(),
            )),
        };
        let policy = storage.cache();

        let mut fields = Vec::with_capacity(schema.0.fields.len());
        let mut contexts: Vec<Arc<Config>> = Vec::new();
        let mut keys = Vec::with_capacity(schema.0.fields.len());

        for (key, default) in &schema.0.fields {
            keys.push(Arc::clone(key));
            let op = if key.as_ref() == "id" {
                match default {
                    FieldDefault::Bool(true) => FieldOp::Identifier,
                    other => {
                        return Err(StoreError::InvalidIdentifier {
                            found: other.kind_name(),
                        })
                    }
                }
            } else {
                compile_field(shared, key, default, &mut contexts)?
            };
            fields.push((Arc::clone(key), op));
        }

        let guarded: Arc<[Arc<str>]> = keys
            .iter()
            .filter(|key| !ERROR_KEYS.contains(&key.as_ref()))
            .cloned()
            .collect();
        let (flush, _) = watch::channel(false);

        debug!(
            namespace = %namespace,
            fields = fields.len(),
            enumerable,
            external,
            policy = ?policy,
            "compiled model definition"
        );

        Ok(Config {
            namespace,
            schema: schema.clone(),
            enumerable,
            external,
            storage,
            policy,
            placeholder: Model::placeholder(keys.into(), store.clone()),
            fields,
            contexts,
            guarded,
            flush: Arc::new(flush),
            store,
        })
    }

    /// Build an instance from `data`, carrying over fields of `previous` that
    /// `data` leaves out.
    ///
    /// `Data::Null` yields `None` (deletion). Nested connected models given
    /// as objects are created and published to their own definition; given
    /// as a primitive they are stored as an id reference. `previous` stays
    /// connected; the write that publishes the result releases it.
    pub(crate) fn create(&self, data: &Data, previous: Option<&Model>) -> StoreResult<Option<Model>> {
        let owned;
        let values: &BTreeMap<String, Data> = match data {
            Data::Null => return Ok(None),
            Data::Object(map) => map,
            Data::Model(model) => {
                owned = model.to_data_map();
                &owned
            }
            other => {
                return Err(StoreError::NotAnObject {
                    found: other.kind_name(),
                })
            }
        };
        let shared = self.store.upgrade().ok_or(StoreError::Detached)?;

        let mut id = None;
        let mut slots = Vec::with_capacity(self.fields.len());
        for (key, op) in &self.fields {
            let raw = values.get(key.as_ref());
            let last = previous.and_then(|p| p.slot(key));
            let slot = match op {
                FieldOp::Identifier => {
                    id = Some(
                        previous
                            .and_then(Model::id)
                            .map(str::to_string)
                            .or_else(|| {
                                raw.map(Data::to_key_string).filter(|s| !s.is_empty())
                            })
                            .unwrap_or_else(new_identifier),
                    );
                    continue;
                }
                FieldOp::Computed(compute) => FieldSlot::Computed(Arc::clone(compute)),
                FieldOp::Scalar { kind, default } => FieldSlot::Value(match raw {
                    Some(raw) => kind.coerce(raw),
                    None => last
                        .and_then(FieldSlot::as_value)
                        .cloned()
                        .unwrap_or_else(|| default.clone()),
                }),
                FieldOp::NestedObject(nested) => FieldSlot::Value(match raw {
                    Some(raw) => nested
                        .create(raw, last.and_then(FieldSlot::as_model))?
                        .map(Value::Model)
                        .unwrap_or_default(),
                    None => match last.and_then(FieldSlot::as_value) {
                        Some(value) => value.clone(),
                        None => nested
                            .create(&Data::object(), None)?
                            .map(Value::Model)
                            .unwrap_or_default(),
                    },
                }),
                FieldOp::NestedForeign(nested) => match raw {
                    Some(raw) => foreign(&shared, nested, raw)?,
                    None => last.cloned().unwrap_or(FieldSlot::Value(Value::Undefined)),
                },
                FieldOp::ArrayOfScalar { kind, default } => FieldSlot::Value(match raw {
                    Some(Data::Array(items)) => {
                        Value::Array(items.iter().map(|item| kind.coerce(item)).collect())
                    }
                    Some(other) => return Err(not_an_array(key, other)),
                    None => last
                        .and_then(FieldSlot::as_value)
                        .cloned()
                        .unwrap_or_else(|| default.clone()),
                }),
                FieldOp::ArrayOfNested(list) | FieldOp::ArrayOfForeign(list) => {
                    FieldSlot::Value(match raw {
                        Some(Data::Array(items)) => Value::List(list.create(items)?),
                        Some(other) => return Err(not_an_array(key, other)),
                        None => match last.and_then(FieldSlot::as_value) {
                            Some(value) => value.clone(),
                            None => Value::List(list.default_list()?),
                        },
                    })
                }
            };
            slots.push((Arc::clone(key), slot));
        }

        Ok(Some(Model::instance(id, slots, self.schema.clone(), self.store.clone())))
    }

    /// Wrap a data failure into an error instance of this definition.
    pub(crate) fn map_error(&self, cause: ErrorCause, id: Option<&str>) -> ModelError {
        let err = ModelError::new(
            cause,
            self.namespace,
            id.map(str::to_string),
            Arc::clone(&self.guarded),
            self.store.clone(),
        );
        if self.store.upgrade().is_some_and(|s| s.settings.log_errors) {
            warn!(namespace = %self.namespace, id = ?id, error = %err, "model data error");
        }
        err
    }

    /// Schedule invalidation of every definition that lists this one as a
    /// context. Calls before the flush runs are coalesced.
    pub(crate) fn invalidate(&self) {
        let scheduled = self.flush.send_if_modified(|pending| {
            if *pending {
                false
            } else {
                *pending = true;
                true
            }
        });
        if !scheduled {
            return;
        }
        let Some(shared) = self.store.upgrade() else {
            self.flush.send_replace(false);
            return;
        };
        let pending = PendingFlush {
            store: Arc::downgrade(&shared),
            namespace: self.namespace,
            flush: Arc::clone(&self.flush),
        };
        debug!(namespace = %self.namespace, "invalidation scheduled");
        // A task the scheduler discards flushes as it is dropped.
        let _ = shared.spawn(async move { drop(pending) });
    }

    /// Wait until no invalidation flush is scheduled.
    pub(crate) async fn flushed(&self) {
        let mut flush = self.flush.subscribe();
        let _ = flush.wait_for(|pending| !*pending).await;
    }
}

/// Invalidation of a definition, applied when dropped. Runs inside the
/// scheduled flush task, or immediately if the scheduler discards the task.
struct PendingFlush {
    store: Weak<Shared>,
    namespace: Namespace,
    flush: Arc<watch::Sender<bool>>,
}

impl Drop for PendingFlush {
    fn drop(&mut self) {
        if let Some(shared) = self.store.upgrade() {
            shared.cache.invalidate(&self.namespace, &CacheKey::Marker, true);
        }
        self.flush.send_replace(false);
    }
}

fn compile_field(
    shared: &Arc<Shared>,
    key: &str,
    default: &FieldDefault,
    contexts: &mut Vec<Arc<Config>>,
) -> StoreResult<FieldOp> {
    Ok(match default {
        FieldDefault::Computed(compute) => FieldOp::Computed(Arc::clone(compute)),
        FieldDefault::Bool(_) | FieldDefault::Number(_) | FieldDefault::String(_) => {
            let kind = Primitive::of(default).unwrap_or(Primitive::String);
            let default = kind.coerce_default(default).unwrap_or_default();
            FieldOp::Scalar { kind, default }
        }
        FieldDefault::Object(schema) => {
            let nested = shared.compile(schema)?;
            if nested.enumerable || nested.external {
                FieldOp::NestedForeign(nested)
            } else {
                FieldOp::NestedObject(nested)
            }
        }
        FieldDefault::Array(slots) => match slots.first() {
            Some(FieldDefault::Object(schema)) => {
                let list = shared.compile_list(schema, true)?;
                if !list.item.enumerable {
                    FieldOp::ArrayOfNested(list)
                } else {
                    match slots.get(1) {
                        None => {}
                        Some(FieldDefault::Options(options)) => {
                            if options.loose
                                && !contexts.iter().any(|c| Arc::ptr_eq(c, &list.item))
                            {
                                contexts.push(Arc::clone(&list.item));
                            }
                        }
                        Some(other) => {
                            return Err(StoreError::InvalidListOptions {
                                key: key.to_string(),
                                found: other.kind_name(),
                            })
                        }
                    }
                    FieldOp::ArrayOfForeign(list)
                }
            }
            Some(first) => {
                let kind = Primitive::of(first).ok_or_else(|| StoreError::InvalidArrayElement {
                    key: key.to_string(),
                    found: first.kind_name(),
                })?;
                let items = slots
                    .iter()
                    .map(|slot| {
                        kind.coerce_default(slot).ok_or_else(|| StoreError::InvalidArrayElement {
                            key: key.to_string(),
                            found: slot.kind_name(),
                        })
                    })
                    .collect::<StoreResult<Vec<_>>>()?;
                FieldOp::ArrayOfScalar {
                    kind,
                    default: Value::Array(items.into()),
                }
            }
            None => {
                return Err(StoreError::InvalidArrayElement {
                    key: key.to_string(),
                    found: "undefined",
                })
            }
        },
        FieldDefault::Null | FieldDefault::Options(_) => {
            return Err(StoreError::InvalidDefault {
                key: key.to_string(),
                found: default.kind_name(),
            })
        }
    })
}

/// Slot for a foreign field given raw data.
fn foreign(shared: &Arc<Shared>, nested: &Arc<Config>, raw: &Data) -> StoreResult<FieldSlot> {
    let id = match raw {
        Data::Null => return Ok(FieldSlot::Value(Value::Undefined)),
        Data::Model(model) if model.schema().is_some() => {
            if !model.schema().is_some_and(|s| s.ptr_eq(&nested.schema)) {
                return Err(StoreError::ModelMismatch);
            }
            model.id().map(str::to_string)
        }
        Data::Object(_) | Data::Model(_) => {
            let model = nested.create(raw, None)?.ok_or(StoreError::NotAnObject {
                found: raw.kind_name(),
            })?;
            let id = model.id().map(str::to_string);
            shared.publish(nested.namespace, id.clone(), Value::Model(model));
            id
        }
        Data::Array(_) => {
            return Err(StoreError::NotAnObject {
                found: raw.kind_name(),
            })
        }
        primitive => Some(primitive.to_key_string()),
    };
    Ok(FieldSlot::Foreign {
        config: Arc::clone(nested),
        id,
    })
}

fn not_an_array(key: &str, found: &Data) -> StoreError {
    StoreError::NotAnArray {
        key: key.to_string(),
        found: found.kind_name(),
    }
}
