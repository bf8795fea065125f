//! Declarative model schemas.
//!
//! A schema is an ordered list of fields, each described by its default
//! value. The kind of the default selects how the field is compiled: `true`
//! under the reserved `id` key marks the model enumerable, a function makes a
//! computed field, primitives make scalar fields, a nested schema makes a
//! nested model and arrays make primitive arrays or model lists.

use std::fmt;
use std::sync::Arc;

use crate::model::Model;
use crate::storage::Storage;
use crate::store::Definition;
use crate::value::Value;

/// Function backing a computed field.
pub type ComputeFn = Arc<dyn Fn(&Model) -> Value + Send + Sync>;

/// Options of a model array.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Re-fetch the owning model whenever the referenced definition
    /// invalidates, so additions and removals show up in the array.
    pub loose: bool,
}

impl ListOptions {
    pub fn loose() -> Self {
        Self { loose: true }
    }
}

/// Default value of a schema field.
#[derive(Clone)]
pub enum FieldDefault {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Computed(ComputeFn),
    Object(Schema),
    Array(Vec<FieldDefault>),
    /// Second slot of a model array.
    Options(ListOptions),
}

impl FieldDefault {
    pub fn kind_name(&self) -> &'static str {
        match self {
            FieldDefault::Null => "null",
            FieldDefault::Bool(_) => "boolean",
            FieldDefault::Number(_) => "number",
            FieldDefault::String(_) => "string",
            FieldDefault::Computed(_) => "function",
            FieldDefault::Object(_) => "object",
            FieldDefault::Array(_) => "array",
            FieldDefault::Options(_) => "options",
        }
    }
}

impl fmt::Debug for FieldDefault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldDefault::Null => f.write_str("Null"),
            FieldDefault::Bool(b) => write!(f, "Bool({b})"),
            FieldDefault::Number(n) => write!(f, "Number({n})"),
            FieldDefault::String(s) => write!(f, "String({s:?})"),
            FieldDefault::Computed(_) => f.write_str("Computed(..)"),
            FieldDefault::Object(schema) => write!(f, "Object({schema:?})"),
            FieldDefault::Array(items) => f.debug_tuple("Array").field(items).finish(),
            FieldDefault::Options(options) => write!(f, "Options({options:?})"),
        }
    }
}

impl From<bool> for FieldDefault {
    fn from(value: bool) -> Self {
        FieldDefault::Bool(value)
    }
}

impl From<f64> for FieldDefault {
    fn from(value: f64) -> Self {
        FieldDefault::Number(value)
    }
}

impl From<i32> for FieldDefault {
    fn from(value: i32) -> Self {
        FieldDefault::Number(value.into())
    }
}

impl From<&str> for FieldDefault {
    fn from(value: &str) -> Self {
        FieldDefault::String(value.to_string())
    }
}

impl From<String> for FieldDefault {
    fn from(value: String) -> Self {
        FieldDefault::String(value)
    }
}

impl From<Schema> for FieldDefault {
    fn from(value: Schema) -> Self {
        FieldDefault::Object(value)
    }
}

impl From<&Schema> for FieldDefault {
    fn from(value: &Schema) -> Self {
        FieldDefault::Object(value.clone())
    }
}

impl From<ListOptions> for FieldDefault {
    fn from(value: ListOptions) -> Self {
        FieldDefault::Options(value)
    }
}

impl<T: Into<FieldDefault>> From<Vec<T>> for FieldDefault {
    fn from(value: Vec<T>) -> Self {
        FieldDefault::Array(value.into_iter().map(Into::into).collect())
    }
}

pub(crate) struct SchemaInner {
    pub(crate) fields: Vec<(Arc<str>, FieldDefault)>,
    pub(crate) storage: Option<Arc<dyn Storage>>,
}

/// A model schema. Cheap to clone; clones share identity.
///
/// Schemas are compared by identity: two separately built schemas with the
/// same fields are different definitions with separate caches.
#[derive(Clone)]
pub struct Schema(pub(crate) Arc<SchemaInner>);

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// `true` if both handles refer to the same schema.
    pub fn ptr_eq(&self, other: &Schema) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Identity key used to memoize compilation.
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// The list definition over this schema.
    pub fn list(&self) -> Definition {
        Definition::List(self.clone())
    }

    /// Declared fields in order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldDefault)> {
        self.0.fields.iter().map(|(k, v)| (k.as_ref(), v))
    }

    pub fn is_connected(&self) -> bool {
        self.0.storage.is_some()
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("fields", &self.0.fields.iter().map(|(k, _)| k.as_ref()).collect::<Vec<_>>())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Builder for [`Schema`]. Fields keep their declaration order; declaring a
/// key twice replaces the earlier default in place.
#[derive(Default)]
pub struct SchemaBuilder {
    fields: Vec<(Arc<str>, FieldDefault)>,
    storage: Option<Arc<dyn Storage>>,
}

impl SchemaBuilder {
    /// Declare the reserved `id` field, making the model enumerable.
    pub fn id(self) -> Self {
        self.field("id", true)
    }

    pub fn field(mut self, key: &str, default: impl Into<FieldDefault>) -> Self {
        let default = default.into();
        match self.fields.iter_mut().find(|(k, _)| k.as_ref() == key) {
            Some((_, slot)) => *slot = default,
            None => self.fields.push((Arc::from(key), default)),
        }
        self
    }

    pub fn computed<F>(self, key: &str, compute: F) -> Self
    where
        F: Fn(&Model) -> Value + Send + Sync + 'static,
    {
        self.field(key, FieldDefault::Computed(Arc::new(compute)))
    }

    pub fn nested(self, key: &str, schema: &Schema) -> Self {
        self.field(key, FieldDefault::Object(schema.clone()))
    }

    /// Array of models of `schema`.
    pub fn list(self, key: &str, schema: &Schema) -> Self {
        self.field(key, FieldDefault::Array(vec![FieldDefault::Object(schema.clone())]))
    }

    /// Array of models of `schema` with options.
    pub fn list_with(self, key: &str, schema: &Schema, options: ListOptions) -> Self {
        self.field(
            key,
            FieldDefault::Array(vec![
                FieldDefault::Object(schema.clone()),
                FieldDefault::Options(options),
            ]),
        )
    }

    /// Back the model with a storage adapter instead of memory.
    pub fn connect(self, storage: impl Storage + 'static) -> Self {
        self.connect_shared(Arc::new(storage))
    }

    pub fn connect_shared(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn build(self) -> Schema {
        Schema(Arc::new(SchemaInner {
            fields: self.fields,
            storage: self.storage,
        }))
    }
}
