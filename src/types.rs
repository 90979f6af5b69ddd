use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::SqlBridgeError;

/// A value crossing the engine boundary: bound as a parameter, decoded from a column,
/// passed to or returned from a user-defined function.
///
/// Columns only ever decode to `Null`, `Integer`, `Float`, `Text` or `Blob`; `Bool` exists
/// for binding and binds as the integer 0 or 1:
/// ```rust
/// use sql_bridge::prelude::*;
///
/// let params = Params::from(vec![
///     Value::Integer(1),
///     Value::Text("alice".into()),
///     Value::Bool(true),
/// ]);
/// # let _ = params;
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// NULL value
    #[default]
    Null,
    /// Boolean value, stored as 0/1
    Bool(bool),
    /// Integer value (64-bit)
    Integer(i64),
    /// Floating point value (64-bit)
    Float(f64),
    /// Text/string value
    Text(String),
    /// Binary data
    Blob(Vec<u8>),
}

impl Value {
    /// Check if this value is NULL
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(value) => Some(*value),
            Value::Bool(value) => Some(i64::from(*value)),
            _ => None,
        }
    }

    /// Numeric view of the value; integers widen to `f64`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            Value::Integer(value) => Some(*value as f64),
            Value::Bool(value) => Some(f64::from(u8::from(*value))),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        if let Value::Text(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(value) => Some(*value),
            Value::Integer(1) => Some(true),
            Value::Integer(0) => Some(false),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_blob(&self) -> Option<&[u8]> {
        if let Value::Blob(bytes) = self {
            Some(bytes)
        } else {
            None
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Blob(_) => "blob",
        }
    }

    /// Convert a JSON value into a bindable value.
    ///
    /// Arrays made only of integers in `0..=255` become blobs. Objects and any other
    /// array have no bindable form.
    ///
    /// # Errors
    ///
    /// Returns [`SqlBridgeError::UnsupportedBindType`] for objects and non-byte arrays.
    pub fn from_json(json: &JsonValue) -> Result<Self, SqlBridgeError> {
        match json {
            JsonValue::Null => Ok(Value::Null),
            JsonValue::Bool(b) => Ok(Value::Bool(*b)),
            JsonValue::Number(n) => Ok(n
                .as_i64()
                .map(Value::Integer)
                .or_else(|| n.as_f64().map(Value::Float))
                .unwrap_or(Value::Null)),
            JsonValue::String(s) => Ok(Value::Text(s.clone())),
            JsonValue::Array(items) => json_bytes(items)
                .map(Value::Blob)
                .ok_or_else(|| SqlBridgeError::UnsupportedBindType(json.to_string())),
            JsonValue::Object(_) => Err(SqlBridgeError::UnsupportedBindType(json.to_string())),
        }
    }
}

pub(crate) fn json_bytes(items: &[JsonValue]) -> Option<Vec<u8>> {
    items
        .iter()
        .map(|item| item.as_u64().and_then(|n| u8::try_from(n).ok()))
        .collect()
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_owned())
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Blob(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Parameters for a statement: bound 1..N in order, or by placeholder name.
///
/// Named keys carry the placeholder prefix (`:a`, `@a`, `$a`). Keys the statement does not
/// declare are skipped without error.
#[derive(Debug, Clone, PartialEq)]
pub enum Params {
    Positional(Vec<Value>),
    Named(BTreeMap<String, Value>),
}

impl Params {
    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Params::Positional(values.into_iter().map(Into::into).collect())
    }

    pub fn named<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Params::Named(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Params::Positional(values) => values.len(),
            Params::Named(map) => map.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build parameters from a JSON array (positional) or object (named).
    ///
    /// # Errors
    ///
    /// Returns [`SqlBridgeError::UnsupportedBindType`] if the top-level value is neither an
    /// array nor an object, or if any element has no bindable form.
    pub fn from_json(json: &JsonValue) -> Result<Self, SqlBridgeError> {
        match json {
            JsonValue::Array(items) => Ok(Params::Positional(
                items
                    .iter()
                    .map(Value::from_json)
                    .collect::<Result<_, _>>()?,
            )),
            JsonValue::Object(map) => Ok(Params::Named(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), Value::from_json(v)?)))
                    .collect::<Result<_, SqlBridgeError>>()?,
            )),
            other => Err(SqlBridgeError::UnsupportedBindType(other.to_string())),
        }
    }

    #[must_use]
    pub fn to_json(&self) -> JsonValue {
        match self {
            Params::Positional(values) => {
                JsonValue::Array(values.iter().map(value_to_json).collect())
            }
            Params::Named(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), value_to_json(v)))
                    .collect(),
            ),
        }
    }
}

fn value_to_json(value: &Value) -> JsonValue {
    serde_json::to_value(value).unwrap_or(JsonValue::Null)
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Params::Positional(values)
    }
}

impl From<BTreeMap<String, Value>> for Params {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Params::Named(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_array_becomes_positional_params() {
        let params = Params::from_json(&json!([1, 2.5, "x", null, true, [0, 255]])).unwrap();
        assert_eq!(
            params,
            Params::Positional(vec![
                Value::Integer(1),
                Value::Float(2.5),
                Value::Text("x".into()),
                Value::Null,
                Value::Bool(true),
                Value::Blob(vec![0, 255]),
            ])
        );
    }

    #[test]
    fn json_object_becomes_named_params() {
        let params = Params::from_json(&json!({":a": 1, "$b": "two"})).unwrap();
        let Params::Named(map) = params else {
            panic!("expected named params");
        };
        assert_eq!(map.get(":a"), Some(&Value::Integer(1)));
        assert_eq!(map.get("$b"), Some(&Value::Text("two".into())));
    }

    #[test]
    fn nested_objects_are_rejected() {
        let err = Params::from_json(&json!([{"a": 1}])).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"Wrong API use : tried to bind a value of an unknown type ({"a":1})."#
        );
        assert!(Params::from_json(&json!([[1, 300]])).is_err());
        assert!(Params::from_json(&json!("scalar")).is_err());
    }

    #[test]
    fn values_serialize_untagged() {
        let encoded = serde_json::to_string(&vec![
            Value::Null,
            Value::Integer(7),
            Value::Float(0.5),
            Value::Text("t".into()),
            Value::Blob(vec![1, 2]),
        ])
        .unwrap();
        assert_eq!(encoded, r#"[null,7,0.5,"t",[1,2]]"#);
        let decoded: Vec<Value> = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded[1], Value::Integer(7));
        assert_eq!(decoded[2], Value::Float(0.5));
    }

    #[test]
    fn bool_reads_as_int() {
        assert_eq!(Value::Bool(true).as_int(), Some(1));
        assert_eq!(Value::Integer(0).as_bool(), Some(false));
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }
}
