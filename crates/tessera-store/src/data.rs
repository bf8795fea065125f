use std::collections::BTreeMap;

use crate::model::Model;
use crate::value::format_number;

/// Raw, untyped input for model creation: adapter results, `set` values and
/// parameters.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Data {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Data>),
    Object(BTreeMap<String, Data>),
    /// An existing instance passed back in, e.g. as a foreign reference.
    Model(Model),
}

impl Data {
    /// An empty object.
    pub fn object() -> Self {
        Data::Object(BTreeMap::new())
    }

    /// Build an object from key/value pairs.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Data>,
        I: IntoIterator<Item = (K, V)>,
    {
        Data::Object(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Short type name used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Data::Null => "null",
            Data::Bool(_) => "boolean",
            Data::Number(_) => "number",
            Data::String(_) => "string",
            Data::Array(_) => "array",
            Data::Object(_) => "object",
            Data::Model(_) => "model",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Data::Null)
    }

    /// `true` for objects and model instances.
    pub fn is_object(&self) -> bool {
        matches!(self, Data::Object(_) | Data::Model(_))
    }

    /// `true` for strings, numbers and booleans.
    pub fn is_primitive(&self) -> bool {
        matches!(self, Data::Bool(_) | Data::Number(_) | Data::String(_))
    }

    /// Field lookup on an object.
    pub fn get(&self, key: &str) -> Option<&Data> {
        match self {
            Data::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// `true` if the value is an object carrying `key`.
    pub fn has_key(&self, key: &str) -> bool {
        match self {
            Data::Object(map) => map.contains_key(key),
            Data::Model(model) => key == "id" && model.id().is_some(),
            _ => false,
        }
    }

    /// Return the object with its `id` replaced by `id`. Model instances are
    /// unwrapped to their raw data first; other values are returned as-is.
    pub fn with_id(self, id: &str) -> Self {
        match self {
            Data::Object(mut map) => {
                map.insert("id".into(), Data::String(id.to_string()));
                Data::Object(map)
            }
            Data::Model(model) => model.to_data().with_id(id),
            other => other,
        }
    }

    /// String conversion with the loose rules of a dynamic language:
    /// `1` becomes `"1"`, `true` becomes `"true"`, arrays are joined with
    /// commas and objects collapse to `"[object Object]"`.
    pub fn to_key_string(&self) -> String {
        match self {
            Data::Null => "null".into(),
            Data::Bool(b) => b.to_string(),
            Data::Number(n) => format_number(*n),
            Data::String(s) => s.clone(),
            Data::Array(items) => items
                .iter()
                .map(|item| match item {
                    Data::Null => String::new(),
                    other => other.to_key_string(),
                })
                .collect::<Vec<_>>()
                .join(","),
            Data::Object(_) | Data::Model(_) => "[object Object]".into(),
        }
    }

    /// JSON rendering. Model instances render their visible shape.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Data::Null => serde_json::Value::Null,
            Data::Bool(b) => serde_json::Value::Bool(*b),
            Data::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Data::String(s) => serde_json::Value::String(s.clone()),
            Data::Array(items) => serde_json::Value::Array(items.iter().map(Data::to_json).collect()),
            Data::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Data::Model(model) => model.to_json(),
        }
    }
}

impl From<serde_json::Value> for Data {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Data::Null,
            serde_json::Value::Bool(b) => Data::Bool(b),
            serde_json::Value::Number(n) => Data::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Data::String(s),
            serde_json::Value::Array(items) => Data::Array(items.into_iter().map(Data::from).collect()),
            serde_json::Value::Object(map) => {
                Data::Object(map.into_iter().map(|(k, v)| (k, Data::from(v))).collect())
            }
        }
    }
}

impl From<bool> for Data {
    fn from(value: bool) -> Self {
        Data::Bool(value)
    }
}

impl From<f64> for Data {
    fn from(value: f64) -> Self {
        Data::Number(value)
    }
}

impl From<i32> for Data {
    fn from(value: i32) -> Self {
        Data::Number(value.into())
    }
}

impl From<i64> for Data {
    fn from(value: i64) -> Self {
        Data::Number(value as f64)
    }
}

impl From<u32> for Data {
    fn from(value: u32) -> Self {
        Data::Number(value.into())
    }
}

impl From<&str> for Data {
    fn from(value: &str) -> Self {
        Data::String(value.to_string())
    }
}

impl From<String> for Data {
    fn from(value: String) -> Self {
        Data::String(value)
    }
}

impl From<Model> for Data {
    fn from(value: Model) -> Self {
        Data::Model(value)
    }
}

impl From<&Model> for Data {
    fn from(value: &Model) -> Self {
        Data::Model(value.clone())
    }
}

impl From<Vec<Data>> for Data {
    fn from(value: Vec<Data>) -> Self {
        Data::Array(value)
    }
}

impl From<BTreeMap<String, Data>> for Data {
    fn from(value: BTreeMap<String, Data>) -> Self {
        Data::Object(value)
    }
}

impl<T: Into<Data>> From<Option<T>> for Data {
    fn from(value: Option<T>) -> Self {
        value.map_or(Data::Null, Into::into)
    }
}
