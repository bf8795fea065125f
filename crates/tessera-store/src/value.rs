use std::sync::Arc;

use crate::data::Data;
use crate::model::{Model, ModelError, ModelList};

/// A value read from the store or from a model field.
///
/// Models, lists and errors compare by identity; primitives and primitive
/// arrays compare by value.
#[derive(Clone, Debug, Default)]
pub enum Value {
    /// Absent value, e.g. an unset foreign reference.
    #[default]
    Undefined,
    Bool(bool),
    Number(f64),
    String(Arc<str>),
    /// Array of primitives.
    Array(Arc<[Value]>),
    Model(Model),
    List(ModelList),
    Error(ModelError),
}

impl Value {
    /// Kind name used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Model(_) => "model",
            Value::List(_) => "list",
            Value::Error(_) => "error",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    /// `true` for the placeholder of a model or list definition.
    pub fn is_placeholder(&self) -> bool {
        match self {
            Value::Model(model) => model.is_placeholder(),
            Value::List(list) => list.is_placeholder(),
            _ => false,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_model(&self) -> Option<&Model> {
        match self {
            Value::Model(model) => Some(model),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ModelList> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ModelError> {
        match self {
            Value::Error(err) => Some(err),
            _ => None,
        }
    }

    /// Identity comparison: `true` only when both values share the same
    /// allocation (or are equal primitives).
    pub fn ptr_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::String(a), Value::String(b)) => a == b,
            _ => self == other,
        }
    }

    /// Visible JSON shape. Errors and undefined render as `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Undefined | Value::Error(_) => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.to_string()),
            Value::Array(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Model(model) => model.to_json(),
            Value::List(list) => list.to_json(),
        }
    }

    /// Raw data snapshot, the inverse of model creation.
    pub fn to_data(&self) -> Data {
        match self {
            Value::Undefined | Value::Error(_) => Data::Null,
            Value::Bool(b) => Data::Bool(*b),
            Value::Number(n) => Data::Number(*n),
            Value::String(s) => Data::String(s.to_string()),
            Value::Array(items) => Data::Array(items.iter().map(Value::to_data).collect()),
            Value::Model(model) => Data::Model(model.clone()),
            Value::List(list) => list.to_data(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a.to_bits() == b.to_bits() || a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b) || a == b,
            (Value::Model(a), Value::Model(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(value.into())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value.into())
    }
}

impl From<Model> for Value {
    fn from(value: Model) -> Self {
        Value::Model(value)
    }
}

impl From<ModelList> for Value {
    fn from(value: ModelList) -> Self {
        Value::List(value)
    }
}

impl From<ModelError> for Value {
    fn from(value: ModelError) -> Self {
        Value::Error(value)
    }
}

/// Render a number the way dynamic-language string conversion does:
/// integral values drop the fraction, `NaN` and infinities are spelled out,
/// and very large or very small magnitudes use exponent notation.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".into();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity".into() } else { "-Infinity".into() };
    }
    if n == 0.0 {
        return "0".into();
    }
    let abs = n.abs();
    if abs >= 1e21 {
        return format!("{n:e}").replacen('e', "e+", 1);
    }
    if abs < 1e-6 {
        return format!("{n:e}");
    }
    if n.fract() == 0.0 {
        return format!("{n:.0}");
    }
    format!("{n}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_numbers_like_string_conversion() {
        assert_eq!(format_number(1.0), "1");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(1.25), "1.25");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert_eq!(format_number(f64::NEG_INFINITY), "-Infinity");
        assert_eq!(format_number(1e21), "1e+21");
        assert_eq!(format_number(1e-7), "1e-7");
        assert_eq!(format_number(123456789.0), "123456789");
    }

    #[test]
    fn primitive_equality() {
        assert_eq!(Value::from("a"), Value::from("a"));
        assert_eq!(Value::Number(f64::NAN), Value::Number(f64::NAN));
        assert_ne!(Value::from(1), Value::from("1"));
        assert_ne!(Value::Undefined, Value::Bool(false));
    }

    #[test]
    fn arrays_compare_by_content_but_identity_is_separate() {
        let a = Value::Array(Arc::from(vec![Value::from(1)]));
        let b = Value::Array(Arc::from(vec![Value::from(1)]));
        assert_eq!(a, b);
        assert!(!a.ptr_eq(&b));
        assert!(a.ptr_eq(&a.clone()));
    }
}
