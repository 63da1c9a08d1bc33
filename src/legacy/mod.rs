//! Legacy document model: `M`, `D`, `ObjectId` and the dynamic [`Value`] tree.
//!
//! These are the shapes callers of the old client API build queries and
//! documents from. Everything sent to the driver is rewritten from these
//! types by [`crate::convert`], everything read back is rewritten into them.

pub mod serde_helpers;

use bson::Bson;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::convert::{convert_inbound, convert_outbound};
use crate::error::{MgoError, Result};

/// Unordered document.
pub type M = HashMap<String, Value>;

/// Ordered document.
pub type D = Vec<DocElem>;

/// One key/value pair of an ordered document.
///
/// Passed to an operation, a `D` is sent as a document with its key order
/// intact. Nested in a caller struct it is encoded as a list of
/// `{name, value}` pairs unless the field uses
/// [`serde_helpers::ordered`], which stores it as a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocElem {
    pub name: String,
    pub value: Value,
}

impl DocElem {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Build an unordered [`M`] document.
///
/// ```ignore
/// let filter = m! { "name" => "John", "age" => m! { "$gt" => 20 } };
/// ```
#[macro_export]
macro_rules! m {
    () => { $crate::legacy::M::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::legacy::M::new();
        $( map.insert(::std::string::String::from($key), $crate::legacy::Value::from($value)); )+
        map
    }};
}

/// Build an ordered [`D`] document.
#[macro_export]
macro_rules! d {
    () => { $crate::legacy::D::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {
        vec![ $( $crate::legacy::DocElem::new($key, $value) ),+ ]
    };
}

/// Legacy identifier: the raw bytes of a 12-byte object id.
///
/// Values of any other length are representable so that malformed ids can be
/// carried through conversions untouched.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(Vec<u8>);

impl ObjectId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(bson::oid::ObjectId::new().bytes().to_vec())
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Parse a 24 character hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| MgoError::invalid_argument(format!("invalid ObjectId hex {s:?}: {e}")))?;
        if bytes.len() != 12 {
            return Err(MgoError::invalid_argument(format!(
                "invalid ObjectId hex {s:?}: expected 12 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    pub fn hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether this holds exactly 12 bytes.
    pub fn is_valid(&self) -> bool {
        self.0.len() == 12
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The driver identifier, if this one is well formed.
    pub fn to_modern(&self) -> Option<bson::oid::ObjectId> {
        let bytes: [u8; 12] = self.0.as_slice().try_into().ok()?;
        Some(bson::oid::ObjectId::from_bytes(bytes))
    }
}

impl From<bson::oid::ObjectId> for ObjectId {
    fn from(oid: bson::oid::ObjectId) -> Self {
        Self(oid.bytes().to_vec())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectIdHex({:?})", self.hex())
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        convert_outbound(&Value::ObjectId(self.clone())).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<De: Deserializer<'de>>(deserializer: De) -> std::result::Result<Self, De::Error> {
        use serde::de::Error;
        match Bson::deserialize(deserializer)? {
            Bson::ObjectId(oid) => Ok(oid.into()),
            Bson::Binary(bin) => Ok(Self(bin.bytes)),
            Bson::String(s) => Self::from_hex(&s).map_err(De::Error::custom),
            Bson::Null => Ok(Self::default()),
            other => Err(De::Error::custom(format!(
                "expected an ObjectId, found {:?}",
                other.element_type()
            ))),
        }
    }
}

/// A node of a legacy document tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
    ObjectId(ObjectId),
    Time(DateTime<Utc>),
    Array(Vec<Value>),
    M(M),
    D(D),
    /// Driver value without a legacy counterpart (regex, decimal, timestamp, ...).
    Other(Bson),
}

impl Value {
    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Value::Binary(bytes.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view accepting every numeric width.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(i64::from(*v)),
            Value::Int64(v) => Some(*v),
            Value::Double(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(v) => Some(f64::from(*v)),
            Value::Int64(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_object_id(&self) -> Option<&ObjectId> {
        match self {
            Value::ObjectId(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Time(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_m(&self) -> Option<&M> {
        match self {
            Value::M(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_d(&self) -> Option<&D> {
        match self {
            Value::D(d) => Some(d),
            _ => None,
        }
    }

    /// Look up a top-level key of an `M` or `D` document.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::M(m) => m.get(key),
            Value::D(d) => d.iter().find(|e| e.name == key).map(|e| &e.value),
            _ => None,
        }
    }

    /// Top-level keys of a document, in document order for `D`.
    pub fn keys(&self) -> Vec<&str> {
        match self {
            Value::M(m) => m.keys().map(String::as_str).collect(),
            Value::D(d) => d.iter().map(|e| e.name.as_str()).collect(),
            _ => Vec::new(),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        convert_outbound(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<De: Deserializer<'de>>(deserializer: De) -> std::result::Result<Self, De::Error> {
        Bson::deserialize(deserializer).map(convert_inbound)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int64(i64::from(v))
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int64(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Binary(v.to_vec())
    }
}

impl From<ObjectId> for Value {
    fn from(v: ObjectId) -> Self {
        Value::ObjectId(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Time(v)
    }
}

impl From<M> for Value {
    fn from(v: M) -> Self {
        Value::M(v)
    }
}

impl From<D> for Value {
    fn from(v: D) -> Self {
        Value::D(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<Vec<M>> for Value {
    fn from(v: Vec<M>) -> Self {
        Value::Array(v.into_iter().map(Value::M).collect())
    }
}

impl From<Vec<ObjectId>> for Value {
    fn from(v: Vec<ObjectId>) -> Self {
        Value::Array(v.into_iter().map(Value::ObjectId).collect())
    }
}

impl From<Vec<&str>> for Value {
    fn from(v: Vec<&str>) -> Self {
        Value::Array(v.into_iter().map(Value::from).collect())
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::M(v.into_iter().collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl From<Bson> for Value {
    fn from(v: Bson) -> Self {
        convert_inbound(v)
    }
}

impl From<bson::Document> for Value {
    fn from(v: bson::Document) -> Self {
        convert_inbound(Bson::Document(v))
    }
}

/// Serialize any value through the document codec into a legacy tree.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    Ok(convert_inbound(bson::to_bson(value)?))
}

/// Deserialize a legacy tree through the document codec.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(bson::from_bson(convert_outbound(&value))?)
}
