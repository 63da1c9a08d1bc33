//! Populating caller destinations from legacy document trees.

use bson::Document;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::any::Any;

use crate::convert::{convert_inbound_ordered, to_document};
use crate::error::{MgoError, Result};
use crate::legacy::serde_helpers::coerce_value_time;
use crate::legacy::{self, DocElem, ObjectId, Value, D, M};

/// Decode `source` into `dest`.
///
/// Legacy shapes (`Value`, `M`, `D`, `Vec<Value>`, `Vec<M>`, driver
/// `Document`) are assigned directly; timestamps and identifiers accept every
/// wire encoding; everything else goes through the serde codec. A `Null`
/// source means the lookup found nothing.
pub fn decode<T>(source: Value, dest: &mut T) -> Result<()>
where
    T: DeserializeOwned + 'static,
{
    if source.is_null() {
        return Err(MgoError::NotFound);
    }
    *dest = decode_owned(source)?;
    Ok(())
}

/// Decode a sequence of documents into a fresh vector stored in `dest`.
pub fn decode_slice<E>(source: Vec<Value>, dest: &mut Vec<E>) -> Result<()>
where
    E: DeserializeOwned + 'static,
{
    let mut out = Vec::with_capacity(source.len());
    for item in source {
        out.push(decode_owned(item)?);
    }
    *dest = out;
    Ok(())
}

/// Decode one value into a new `T`.
pub(crate) fn decode_owned<T>(source: Value) -> Result<T>
where
    T: DeserializeOwned + 'static,
{
    let mut slot: Option<T> = None;
    match assign_direct(source, &mut slot as &mut dyn Any)? {
        None => slot.ok_or_else(|| MgoError::decode("destination was not populated")),
        Some(rest) => legacy::from_value(rest),
    }
}

/// Try to assign `source` into an `Option<_>` slot of a recognized type.
/// Returns the source back when the slot type is not one of those.
fn assign_direct(source: Value, slot: &mut dyn Any) -> Result<Option<Value>> {
    if let Some(s) = slot.downcast_mut::<Option<Value>>() {
        *s = Some(source);
        return Ok(None);
    }
    if let Some(s) = slot.downcast_mut::<Option<M>>() {
        *s = Some(into_m(source)?);
        return Ok(None);
    }
    if let Some(s) = slot.downcast_mut::<Option<D>>() {
        *s = Some(into_d(source)?);
        return Ok(None);
    }
    if let Some(s) = slot.downcast_mut::<Option<Document>>() {
        *s = Some(to_document(&source)?);
        return Ok(None);
    }
    if let Some(s) = slot.downcast_mut::<Option<Vec<Value>>>() {
        *s = Some(into_array(source)?);
        return Ok(None);
    }
    if let Some(s) = slot.downcast_mut::<Option<Vec<M>>>() {
        let items = into_array(source)?;
        *s = Some(items.into_iter().map(into_m).collect::<Result<_>>()?);
        return Ok(None);
    }
    if let Some(s) = slot.downcast_mut::<Option<DateTime<Utc>>>() {
        let t = coerce_value_time(&source)
            .ok_or_else(|| MgoError::decode(format!("cannot decode {source:?} as a timestamp")))?;
        *s = Some(t);
        return Ok(None);
    }
    if let Some(s) = slot.downcast_mut::<Option<Vec<DateTime<Utc>>>>() {
        let items = into_array(source)?;
        let times = items
            .iter()
            .map(|v| {
                coerce_value_time(v)
                    .ok_or_else(|| MgoError::decode(format!("cannot decode {v:?} as a timestamp")))
            })
            .collect::<Result<_>>()?;
        *s = Some(times);
        return Ok(None);
    }
    if let Some(s) = slot.downcast_mut::<Option<ObjectId>>() {
        *s = Some(into_object_id(source)?);
        return Ok(None);
    }
    if let Some(s) = slot.downcast_mut::<Option<Vec<ObjectId>>>() {
        let items = into_array(source)?;
        *s = Some(items.into_iter().map(into_object_id).collect::<Result<_>>()?);
        return Ok(None);
    }
    Ok(Some(source))
}

fn into_m(source: Value) -> Result<M> {
    match source {
        Value::M(m) => Ok(m),
        Value::D(d) => Ok(d.into_iter().map(|e| (e.name, e.value)).collect()),
        other => Err(MgoError::decode(format!("cannot decode {other:?} into M"))),
    }
}

fn into_d(source: Value) -> Result<D> {
    match source {
        Value::D(d) => Ok(d),
        Value::M(m) => Ok(m
            .into_iter()
            .map(|(name, value)| DocElem { name, value })
            .collect()),
        Value::Other(bson::Bson::Document(doc)) => Ok(convert_inbound_ordered(doc)),
        other => Err(MgoError::decode(format!("cannot decode {other:?} into D"))),
    }
}

fn into_array(source: Value) -> Result<Vec<Value>> {
    match source {
        Value::Array(items) => Ok(items),
        other => Err(MgoError::decode(format!("cannot decode {other:?} into a slice"))),
    }
}

fn into_object_id(source: Value) -> Result<ObjectId> {
    match source {
        Value::ObjectId(id) => Ok(id),
        Value::Binary(bytes) => Ok(ObjectId::from_bytes(bytes)),
        Value::String(s) => ObjectId::from_hex(&s).map_err(|e| MgoError::decode(e.to_string())),
        other => Err(MgoError::decode(format!("cannot decode {other:?} as an ObjectId"))),
    }
}
