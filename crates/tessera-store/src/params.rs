use crate::data::Data;
use crate::error::{StoreError, StoreResult};
use crate::value::format_number;

/// Lookup parameters passed to [`crate::Store::get`] and on to the adapter.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Parameters {
    #[default]
    None,
    Value(Data),
}

impl Parameters {
    pub fn is_none(&self) -> bool {
        matches!(self, Parameters::None)
    }

    /// The raw parameter value, if any.
    pub fn data(&self) -> Option<&Data> {
        match self {
            Parameters::None => None,
            Parameters::Value(data) => Some(data),
        }
    }

    /// Canonical identifier of these parameters.
    ///
    /// Objects are sorted by key and JSON-encoded; primitives are stringified
    /// so that `1` and `"1"` address the same entry. Object values must be
    /// primitives or `null`.
    pub fn canonical(&self) -> StoreResult<Option<String>> {
        let data = match self {
            Parameters::None => return Ok(None),
            Parameters::Value(data) => data,
        };
        match data {
            Data::Bool(_) | Data::Number(_) | Data::String(_) => Ok(Some(data.to_key_string())),
            Data::Object(map) => {
                let mut out = String::from("{");
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&json_string(key));
                    out.push(':');
                    match value {
                        Data::Null => out.push_str("null"),
                        Data::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
                        Data::Number(n) if n.is_finite() => out.push_str(&format_number(*n)),
                        Data::Number(_) => out.push_str("null"),
                        Data::String(s) => out.push_str(&json_string(s)),
                        other => {
                            return Err(StoreError::NestedParameter {
                                key: key.clone(),
                                found: other.kind_name(),
                            })
                        }
                    }
                }
                out.push('}');
                Ok(Some(out))
            }
            other => Err(StoreError::InvalidParameters {
                found: other.kind_name(),
            }),
        }
    }

    /// Canonical identifier, or `None` when absent or malformed.
    ///
    /// Convenient for adapters keyed by id.
    pub fn id(&self) -> Option<String> {
        self.canonical().ok().flatten()
    }
}

fn json_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

/// Fresh random identifier for newly created enumerable models.
pub(crate) fn new_identifier() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl From<()> for Parameters {
    fn from(_: ()) -> Self {
        Parameters::None
    }
}

impl From<Data> for Parameters {
    fn from(value: Data) -> Self {
        Parameters::Value(value)
    }
}

impl From<&str> for Parameters {
    fn from(value: &str) -> Self {
        Parameters::Value(value.into())
    }
}

impl From<String> for Parameters {
    fn from(value: String) -> Self {
        Parameters::Value(value.into())
    }
}

impl From<&String> for Parameters {
    fn from(value: &String) -> Self {
        Parameters::Value(value.as_str().into())
    }
}

impl From<i32> for Parameters {
    fn from(value: i32) -> Self {
        Parameters::Value(value.into())
    }
}

impl From<i64> for Parameters {
    fn from(value: i64) -> Self {
        Parameters::Value(value.into())
    }
}

impl From<f64> for Parameters {
    fn from(value: f64) -> Self {
        Parameters::Value(value.into())
    }
}

impl From<bool> for Parameters {
    fn from(value: bool) -> Self {
        Parameters::Value(value.into())
    }
}

impl From<serde_json::Value> for Parameters {
    fn from(value: serde_json::Value) -> Self {
        Parameters::Value(value.into())
    }
}

impl<T: Into<Parameters>> From<Option<T>> for Parameters {
    fn from(value: Option<T>) -> Self {
        value.map_or(Parameters::None, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    // -----------------------------------------------------------------------
    // Canonical ids
    // -----------------------------------------------------------------------

    #[test]
    fn primitives_share_an_id_with_their_string_form() {
        assert_eq!(Parameters::from(1).canonical().unwrap(), Some("1".into()));
        assert_eq!(Parameters::from("1").canonical().unwrap(), Some("1".into()));
        assert_eq!(Parameters::from(true).canonical().unwrap(), Some("true".into()));
        assert_eq!(Parameters::None.canonical().unwrap(), None);
    }

    #[test]
    fn objects_are_sorted_and_encoded() {
        let params = Parameters::from(json!({"b": 2, "a": "x", "c": null, "d": 1.5}));
        assert_eq!(
            params.canonical().unwrap().as_deref(),
            Some(r#"{"a":"x","b":2,"c":null,"d":1.5}"#)
        );
    }

    #[test]
    fn nested_values_are_rejected() {
        let params = Parameters::from(json!({"id": "", "other": {"value": "test"}}));
        assert!(matches!(
            params.canonical(),
            Err(StoreError::NestedParameter { key, .. }) if key == "other"
        ));
        assert!(Parameters::from(json!({"list": [1]})).canonical().is_err());
    }

    #[test]
    fn null_and_arrays_are_invalid_parameters() {
        assert!(matches!(
            Parameters::from(json!(null)).canonical(),
            Err(StoreError::InvalidParameters { found: "null" })
        ));
        assert!(Parameters::from(json!([1, 2])).canonical().is_err());
    }

    #[test]
    fn identifiers_are_uuid_v4() {
        let id = new_identifier();
        let parsed = uuid::Uuid::parse_str(&id).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
        assert_ne!(id, new_identifier());
    }

    proptest! {
        /// Key order never changes the canonical id.
        #[test]
        fn prop_canonical_ignores_key_order(
            entries in proptest::collection::btree_map("[a-z]{1,6}", any::<i32>(), 0..8)
        ) {
            let forward: serde_json::Map<String, serde_json::Value> =
                entries.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
            let reversed: serde_json::Map<String, serde_json::Value> =
                entries.iter().rev().map(|(k, v)| (k.clone(), json!(v))).collect();
            let a = Parameters::from(serde_json::Value::Object(forward)).canonical().unwrap();
            let b = Parameters::from(serde_json::Value::Object(reversed)).canonical().unwrap();
            prop_assert_eq!(a, b);
        }

        /// Integral numbers and their decimal string address the same entry.
        #[test]
        fn prop_integer_and_string_ids_agree(n in any::<i32>()) {
            let from_number = Parameters::from(n).canonical().unwrap();
            let from_string = Parameters::from(n.to_string()).canonical().unwrap();
            prop_assert_eq!(from_number, from_string);
        }

        /// Canonical object ids are valid JSON.
        #[test]
        fn prop_object_ids_parse_as_json(
            entries in proptest::collection::btree_map("\\PC{0,8}", "\\PC{0,8}", 0..6)
        ) {
            let object: serde_json::Map<String, serde_json::Value> =
                entries.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
            let id = Parameters::from(serde_json::Value::Object(object.clone()))
                .canonical()
                .unwrap()
                .unwrap();
            let parsed: serde_json::Value = serde_json::from_str(&id).unwrap();
            prop_assert_eq!(parsed, serde_json::Value::Object(object));
        }
    }
}
