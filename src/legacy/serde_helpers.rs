//! `#[serde(with = ...)]` adapters for timestamp and ordered-document fields.
//!
//! Stored timestamps do not always come back as date-times: documents written
//! by other clients often hold epoch milliseconds as int32, int64 or double.
//! These adapters accept all of those and normalize to `DateTime<Utc>`.
//!
//! ```ignore
//! #[derive(Serialize, Deserialize)]
//! struct Event {
//!     #[serde(with = "mgo_compat::legacy::serde_helpers::time")]
//!     at: DateTime<Utc>,
//!     #[serde(with = "mgo_compat::legacy::serde_helpers::time_vec")]
//!     reminders: Vec<DateTime<Utc>>,
//! }
//! ```

use bson::Bson;
use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::Value;

/// Interpret a wire value as a timestamp.
pub(crate) fn coerce_time(value: &Bson) -> Option<DateTime<Utc>> {
    match value {
        Bson::DateTime(dt) => Some(dt.to_chrono()),
        Bson::Int32(ms) => DateTime::from_timestamp_millis(i64::from(*ms)),
        Bson::Int64(ms) => DateTime::from_timestamp_millis(*ms),
        Bson::Double(ms) if ms.is_finite() => DateTime::from_timestamp_millis(*ms as i64),
        Bson::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        _ => None,
    }
}

/// Same as [`coerce_time`] for a legacy value.
pub(crate) fn coerce_value_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Time(t) => Some(*t),
        Value::Int32(ms) => DateTime::from_timestamp_millis(i64::from(*ms)),
        Value::Int64(ms) => DateTime::from_timestamp_millis(*ms),
        Value::Double(ms) if ms.is_finite() => DateTime::from_timestamp_millis(*ms as i64),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Other(b) => coerce_time(b),
        _ => None,
    }
}

fn to_wire(t: &DateTime<Utc>) -> bson::DateTime {
    bson::DateTime::from_chrono(*t)
}

fn required<E: serde::de::Error>(raw: &Bson) -> Result<DateTime<Utc>, E> {
    coerce_time(raw).ok_or_else(|| E::custom(format!("cannot interpret {raw} as a timestamp")))
}

/// A single timestamp field.
pub mod time {
    use super::*;

    pub fn serialize<S: Serializer>(t: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        to_wire(t).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        required(&Bson::deserialize(d)?)
    }
}

/// An optional timestamp field; `null` reads as `None`.
pub mod option_time {
    use super::*;

    pub fn serialize<S: Serializer>(t: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        t.as_ref().map(to_wire).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        match Bson::deserialize(d)? {
            Bson::Null | Bson::Undefined => Ok(None),
            raw => required(&raw).map(Some),
        }
    }
}

/// A multi-valued timestamp field. Every element is coerced on its own.
pub mod time_vec {
    use super::*;

    pub fn serialize<S: Serializer>(ts: &[DateTime<Utc>], s: S) -> Result<S::Ok, S::Error> {
        ts.iter().map(to_wire).collect::<Vec<_>>().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<DateTime<Utc>>, D::Error> {
        match Bson::deserialize(d)? {
            Bson::Array(items) => items.iter().map(|raw| required::<D::Error>(raw)).collect(),
            Bson::Null => Ok(Vec::new()),
            other => Err(D::Error::custom(format!(
                "expected an array of timestamps, found {:?}",
                other.element_type()
            ))),
        }
    }
}

/// An ordered document field, stored as a document in key order.
pub mod ordered {
    use super::*;
    use crate::convert::{convert_inbound_ordered, convert_outbound};
    use crate::legacy::D;

    pub fn serialize<S: Serializer>(d: &D, s: S) -> Result<S::Ok, S::Error> {
        convert_outbound(&Value::D(d.clone())).serialize(s)
    }

    pub fn deserialize<'de, De: Deserializer<'de>>(d: De) -> Result<D, De::Error> {
        match Bson::deserialize(d)? {
            Bson::Document(doc) => Ok(convert_inbound_ordered(doc)),
            Bson::Null => Ok(D::new()),
            other => Err(De::Error::custom(format!(
                "expected a document, found {:?}",
                other.element_type()
            ))),
        }
    }
}
