//! Attribute values
//!
//! Scalars are stored natively. Anything else goes through a codec and is
//! kept as an opaque [`Value::Encoded`] blob tagged with its type name.

use crate::error::{CofferError, Result};
use crate::types::object_id::ObjectId;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Attribute name -> value
pub type Attributes = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Ref(ObjectId),
    Refs(Vec<ObjectId>),
    Encoded { type_name: String, blob: Vec<u8> },
}

impl Value {
    /// Wrap any serializable value as an encoded blob.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self> {
        let blob =
            serde_json::to_vec(value).map_err(|e| CofferError::Serialization(e.to_string()))?;
        Ok(Value::Encoded {
            type_name: std::any::type_name::<T>().to_string(),
            blob,
        })
    }

    /// Decode a blob produced by [`Value::encode`].
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            Value::Encoded { blob, .. } => serde_json::from_slice(blob)
                .map_err(|e| CofferError::Serialization(e.to_string())),
            other => Err(CofferError::Serialization(format!(
                "Expected encoded value, found {}",
                other.kind_name()
            ))),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_ref_id(&self) -> Option<&ObjectId> {
        match self {
            Value::Ref(id) => Some(id),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Timestamp(_) => "timestamp",
            Value::Ref(_) => "ref",
            Value::Refs(_) => "refs",
            Value::Encoded { .. } => "encoded",
        }
    }

    /// Exact comparison used for change detection. Floats compare by bit
    /// pattern so that NaN equals itself and a re-applied value is never
    /// reported as a change.
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        }
    }

    /// Total order for sorting fetch results. Values of different kinds are
    /// ordered by kind, nulls first.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).total_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.total_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Ref(a), Value::Ref(b)) => a.cmp(b),
            (Value::Refs(a), Value::Refs(b)) => a.cmp(b),
            (Value::Encoded { blob: a, .. }, Value::Encoded { blob: b, .. }) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::Text(_) => 3,
            Value::Bytes(_) => 4,
            Value::Timestamp(_) => 5,
            Value::Ref(_) => 6,
            Value::Refs(_) => 7,
            Value::Encoded { .. } => 8,
        }
    }

    /// Rewrite object references, dropping the ones `map` rejects.
    pub fn map_refs<F>(self, mut map: F) -> Value
    where
        F: FnMut(ObjectId) -> Option<ObjectId>,
    {
        match self {
            Value::Ref(id) => map(id).map(Value::Ref).unwrap_or(Value::Null),
            Value::Refs(ids) => Value::Refs(ids.into_iter().filter_map(map).collect()),
            other => other,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl From<ObjectId> for Value {
    fn from(v: ObjectId) -> Self {
        Value::Ref(v)
    }
}

impl From<Vec<ObjectId>> for Value {
    fn from(v: Vec<ObjectId>) -> Self {
        Value::Refs(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Build an [`Attributes`] map from `name => value` pairs.
#[macro_export]
macro_rules! attrs {
    () => { $crate::types::Attributes::new() };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::types::Attributes::new();
        $( map.insert(($name).to_string(), $crate::types::Value::from($value)); )+
        map
    }};
}
