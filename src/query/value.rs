//! Scalar values flowing through filters, entities, and cache keys.
//!
//! The store orders values of different types by a fixed type rank, with
//! integers and floats sharing one numeric rank. [`compare_values`] encodes
//! that total order and [`Value::sort_key`] renders a deterministic string
//! used wherever values must be hashed or deduplicated.
use std::cmp::Ordering;

use base64::engine::general_purpose::STANDARD_NO_PAD as BASE64_ENGINE;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Typed value tagged with explicit type information so serialized plans and
/// cached entities stay unambiguous.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Value {
    /// Null literal.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// Signed 64-bit integer literal.
    Int(i64),
    /// 64-bit floating point literal.
    Float(f64),
    /// UTF-8 string literal.
    String(String),
    /// Arbitrary binary payload represented as bytes.
    Bytes(Vec<u8>),
    /// Nanoseconds since Unix epoch in UTC.
    #[serde(deserialize_with = "serde_datetime::deserialize")]
    DateTime(i128),
}

impl Value {
    /// Returns true for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Deterministic textual key. Two values share a key iff they have the
    /// same variant and payload.
    pub fn sort_key(&self) -> String {
        match self {
            Value::Null => "null".into(),
            Value::Bool(v) => format!("bool:{v}"),
            Value::Int(v) => format!("int:{v}"),
            Value::Float(v) => format!("float:{v}"),
            Value::String(v) => format!("str:{v}"),
            Value::Bytes(v) => format!("bytes:{}", BASE64_ENGINE.encode(v)),
            Value::DateTime(v) => format!("datetime:{v}"),
        }
    }

    /// Short type label used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::DateTime(_) => "datetime",
        }
    }
}

mod serde_datetime {
    use serde::de::{self, Deserializer, Visitor};
    use std::fmt;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<i128, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct NanosVisitor;

        impl<'de> Visitor<'de> for NanosVisitor {
            type Value = i128;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("nanoseconds since Unix epoch as a number or string")
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<i128, E> {
                Ok(i128::from(value))
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<i128, E> {
                Ok(i128::from(value))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<i128, E> {
                value
                    .parse::<i128>()
                    .map_err(|err| E::custom(format!("invalid datetime literal '{value}': {err}")))
            }
        }

        deserializer.deserialize_any(NanosVisitor)
    }
}

/// Rank of a value's type in the store's cross-type ordering.
pub fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Int(_) | Value::Float(_) => 2,
        Value::String(_) => 3,
        Value::Bytes(_) => 4,
        Value::DateTime(_) => 5,
    }
}

/// Total order over values: null first, then by type rank, then by value.
pub fn compare_values(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::Float(a), Value::Float(b)) => compare_floats(*a, *b),
        (Value::Int(a), Value::Float(b)) => compare_floats(*a as f64, *b),
        (Value::Float(a), Value::Int(b)) => compare_floats(*a, *b as f64),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
        (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
        _ => type_rank(left).cmp(&type_rank(right)),
    }
}

fn compare_floats(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b)
        .unwrap_or_else(|| a.is_nan().cmp(&b.is_nan()))
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sorts_before_everything() {
        for other in [
            Value::Bool(false),
            Value::Int(i64::MIN),
            Value::String(String::new()),
            Value::DateTime(0),
        ] {
            assert_eq!(compare_values(&Value::Null, &other), Ordering::Less);
            assert_eq!(compare_values(&other, &Value::Null), Ordering::Greater);
        }
    }

    #[test]
    fn ints_and_floats_compare_numerically() {
        assert_eq!(compare_values(&Value::Int(2), &Value::Float(2.5)), Ordering::Less);
        assert_eq!(compare_values(&Value::Float(3.0), &Value::Int(3)), Ordering::Equal);
    }

    #[test]
    fn mixed_types_fall_back_to_rank() {
        assert_eq!(
            compare_values(&Value::String("a".into()), &Value::Int(99)),
            Ordering::Greater
        );
    }

    #[test]
    fn sort_keys_distinguish_types() {
        assert_ne!(Value::Int(1).sort_key(), Value::String("1".into()).sort_key());
        assert_eq!(Value::Bytes(vec![1, 2]).sort_key(), "bytes:AQI");
    }

    #[test]
    fn datetime_accepts_string_nanos() {
        let value: Value = serde_json::from_str(r#"{"t":"DateTime","v":"1700000000000000000"}"#)
            .expect("decode");
        assert_eq!(value, Value::DateTime(1_700_000_000_000_000_000));
    }
}
