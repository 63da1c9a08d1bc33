//! Conversion between legacy [`Value`] trees and driver [`Bson`] values.
//!
//! Both directions are total: shapes that have no counterpart on the other
//! side are carried through as-is instead of failing.

use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use tracing::warn;

use crate::error::{MgoError, Result};
use crate::legacy::{self, DocElem, ObjectId, Value, D, M};

/// Rewrite a legacy tree into the driver representation.
///
/// `D` documents keep their key order, `M` documents come out in map order.
/// Identifiers that are not exactly 12 bytes are passed through as generic
/// binary. Times are truncated to millisecond precision.
pub fn convert_outbound(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Int32(v) => Bson::Int32(*v),
        Value::Int64(v) => Bson::Int64(*v),
        Value::Double(v) => Bson::Double(*v),
        Value::String(s) => Bson::String(s.clone()),
        Value::Binary(bytes) => generic_binary(bytes.clone()),
        Value::ObjectId(id) => match id.to_modern() {
            Some(oid) => Bson::ObjectId(oid),
            None => generic_binary(id.as_bytes().to_vec()),
        },
        Value::Time(t) => Bson::DateTime(bson::DateTime::from_chrono(*t)),
        Value::Array(items) => Bson::Array(items.iter().map(convert_outbound).collect()),
        Value::M(m) => Bson::Document(outbound_m(m)),
        Value::D(d) => Bson::Document(outbound_d(d)),
        Value::Other(b) => b.clone(),
    }
}

/// Like [`convert_outbound`] but only for document shapes.
pub fn convert_outbound_document(value: &Value) -> Option<Document> {
    match value {
        Value::M(m) => Some(outbound_m(m)),
        Value::D(d) => Some(outbound_d(d)),
        Value::Other(Bson::Document(doc)) => Some(doc.clone()),
        _ => None,
    }
}

fn outbound_m(m: &M) -> Document {
    m.iter()
        .map(|(k, v)| (k.clone(), convert_outbound(v)))
        .collect()
}

fn outbound_d(d: &D) -> Document {
    let mut doc = Document::new();
    for elem in d {
        doc.insert(elem.name.clone(), convert_outbound(&elem.value));
    }
    doc
}

fn generic_binary(bytes: Vec<u8>) -> Bson {
    Bson::Binary(Binary {
        subtype: BinarySubtype::Generic,
        bytes,
    })
}

/// Rewrite a driver value into the legacy representation. Documents become `M`.
pub fn convert_inbound(value: Bson) -> Value {
    inbound(value, false)
}

/// Rewrite a driver document into an ordered `D`, recursively.
pub fn convert_inbound_ordered(doc: Document) -> D {
    inbound_d(doc)
}

fn inbound(value: Bson, ordered: bool) -> Value {
    match value {
        Bson::Null => Value::Null,
        Bson::Boolean(b) => Value::Bool(b),
        Bson::Int32(v) => Value::Int32(v),
        Bson::Int64(v) => Value::Int64(v),
        Bson::Double(v) => Value::Double(v),
        Bson::String(s) => Value::String(s),
        Bson::ObjectId(oid) => Value::ObjectId(oid.into()),
        Bson::DateTime(dt) => Value::Time(dt.to_chrono()),
        Bson::Binary(bin) if is_generic(bin.subtype) => Value::Binary(bin.bytes),
        Bson::Array(items) => Value::Array(items.into_iter().map(|v| inbound(v, ordered)).collect()),
        Bson::Document(doc) if ordered => Value::D(inbound_d(doc)),
        Bson::Document(doc) => Value::M(
            doc.into_iter()
                .map(|(k, v)| (k, inbound(v, false)))
                .collect(),
        ),
        other => Value::Other(other),
    }
}

fn inbound_d(doc: Document) -> D {
    doc.into_iter()
        .map(|(name, v)| DocElem {
            name,
            value: inbound(v, true),
        })
        .collect()
}

fn is_generic(subtype: BinarySubtype) -> bool {
    matches!(subtype, BinarySubtype::Generic | BinarySubtype::BinaryOld)
}

impl Value {
    /// Lift an arbitrary serializable value into a legacy tree.
    ///
    /// Legacy and driver document types are recognized directly. Anything
    /// else is run through the document codec, so caller structs honour their
    /// serde attributes. A value the codec cannot represent, such as a `u64`
    /// above `i64::MAX`, is an `InvalidArgument` error rather than `Null`, so it
    /// can never widen into a match-everything selector.
    pub fn from_any<T: Serialize + 'static>(value: &T) -> Result<Value> {
        let any = value as &dyn Any;
        if let Some(v) = any.downcast_ref::<Value>() {
            return Ok(v.clone());
        }
        if let Some(m) = any.downcast_ref::<M>() {
            return Ok(Value::M(m.clone()));
        }
        if let Some(d) = any.downcast_ref::<D>() {
            return Ok(Value::D(d.clone()));
        }
        if let Some(items) = any.downcast_ref::<Vec<M>>() {
            return Ok(Value::Array(items.iter().cloned().map(Value::M).collect()));
        }
        if let Some(items) = any.downcast_ref::<Vec<D>>() {
            return Ok(Value::Array(items.iter().cloned().map(Value::D).collect()));
        }
        if let Some(items) = any.downcast_ref::<Vec<Value>>() {
            return Ok(Value::Array(items.clone()));
        }
        if let Some(ids) = any.downcast_ref::<Vec<ObjectId>>() {
            return Ok(Value::Array(ids.iter().cloned().map(Value::ObjectId).collect()));
        }
        if let Some(map) = any.downcast_ref::<BTreeMap<String, Value>>() {
            return Ok(Value::M(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()));
        }
        if let Some(id) = any.downcast_ref::<ObjectId>() {
            return Ok(Value::ObjectId(id.clone()));
        }
        if let Some(t) = any.downcast_ref::<DateTime<Utc>>() {
            return Ok(Value::Time(*t));
        }
        if let Some(doc) = any.downcast_ref::<Document>() {
            return Ok(Value::D(convert_inbound_ordered(doc.clone())));
        }
        if let Some(docs) = any.downcast_ref::<Vec<Document>>() {
            return Ok(Value::Array(
                docs.iter()
                    .map(|doc| Value::D(convert_inbound_ordered(doc.clone())))
                    .collect(),
            ));
        }
        if let Some(b) = any.downcast_ref::<Bson>() {
            return Ok(match b {
                Bson::Document(doc) => Value::D(convert_inbound_ordered(doc.clone())),
                other => convert_inbound(other.clone()),
            });
        }

        legacy::to_value(value).map_err(|err| {
            warn!(
                type_name = std::any::type_name::<T>(),
                error = %err,
                "value could not be converted to a document"
            );
            MgoError::invalid_argument(format!(
                "cannot convert {}: {err}",
                std::any::type_name::<T>()
            ))
        })
    }
}

/// Convert anything document-shaped into a driver document.
///
/// `Null` becomes the empty document, matching a nil selector.
pub(crate) fn to_document(value: &Value) -> Result<Document> {
    if value.is_null() {
        return Ok(Document::new());
    }
    convert_outbound_document(value).ok_or_else(|| {
        MgoError::invalid_argument(format!("expected a document, got {value:?}"))
    })
}

/// Shorthand for `to_document(&Value::from_any(value)?)`.
pub(crate) fn document_from_any<T: Serialize + 'static>(value: &T) -> Result<Document> {
    to_document(&Value::from_any(value)?)
}
