//! # mgo-compat
//!
//! The classic mgo-style MongoDB API on top of the official `mongodb` driver.
//!
//! Code written against the legacy session/collection/query surface keeps
//! working: documents are built from [`M`] and [`D`], plain update documents
//! merge fields, lookups that find nothing return [`MgoError::NotFound`], and
//! cursors keep their first error.
//!
//! ## Features
//!
//! - Sessions with read modes and write safety
//! - Queries, iterators and find-and-modify
//! - Aggregation pipelines
//! - Ordered and unordered bulk writes
//! - Chunked blob storage (GridFS layout)
//!
//! ## Quick Start
//!
//! ```ignore
//! use mgo_compat::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> mgo_compat::Result<()> {
//!     let session = Session::dial("mongodb://localhost/app").await?;
//!     let people = session.db("").c("people");
//!
//!     people.insert(&[m! { "name" => "John", "age" => 30 }]).await?;
//!
//!     let mut john = M::new();
//!     people.find(&m! { "name" => "John" }).one(&mut john).await?;
//!
//!     // Sets `age`, keeps the other fields.
//!     people.update(&m! { "name" => "John" }, &m! { "age" => 31 }).await?;
//!
//!     session.close().await;
//!     Ok(())
//! }
//! ```

pub mod bulk;
pub mod collection;
pub mod convert;
pub mod database;
pub mod deadline;
pub mod decode;
pub mod error;
pub mod gridfs;
pub mod iter;
pub mod legacy;
pub mod pipe;
pub mod query;
pub mod session;

// Re-export main types
pub use bulk::{Bulk, BulkResult};
pub use collection::{ChangeInfo, Collation, Collection, Index};
pub use convert::{convert_inbound, convert_inbound_ordered, convert_outbound, convert_outbound_document};
pub use database::Database;
pub use decode::{decode, decode_slice};
pub use error::{BulkError, BulkErrorCase, ErrorKind, MgoError, QueryError, Result};
pub use gridfs::{GridFile, GridFs};
pub use iter::Iter;
pub use legacy::{DocElem, ObjectId, Value, D, M};
pub use pipe::Pipe;
pub use query::{Change, Query};
pub use session::{BuildInfo, DialOptions, DialOptionsBuilder, ModernMgo, Mode, Safe, Session};

pub use bson;

/// Prelude module for common imports.
pub mod prelude {
    pub use super::collection::{ChangeInfo, Collection, Index};
    pub use super::database::Database;
    pub use super::error::{MgoError, Result};
    pub use super::legacy::{DocElem, ObjectId, Value, D, M};
    pub use super::query::{Change, Query};
    pub use super::session::{Mode, Safe, Session};
    pub use super::{d, m};
    pub use serde::{Deserialize, Serialize};
}

/// Get the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
