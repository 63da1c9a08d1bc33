//! Database handles.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::collection::Collection;
use crate::convert::{convert_inbound_ordered, document_from_any};
use crate::deadline::{bounded, SHORT_TIMEOUT};
use crate::decode::decode;
use crate::error::Result;
use crate::gridfs::GridFs;
use crate::legacy::Value;

/// A handle to a database. Cheap to clone; shares the session's pool.
///
/// # Example
///
/// ```ignore
/// let db = session.db("inventory");
/// let items = db.c("items");
/// let mut stats = mgo_compat::M::new();
/// db.run(&mgo_compat::m! { "dbStats" => 1 }, &mut stats).await?;
/// ```
#[derive(Debug, Clone)]
pub struct Database {
    inner: mongodb::Database,
    name: String,
}

impl Database {
    pub(crate) fn new(inner: mongodb::Database, name: &str) -> Self {
        Self {
            inner,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Collection handle. Inherits the session's read mode and write safety.
    pub fn c(&self, name: &str) -> Collection {
        Collection::new(self.inner.collection(name), self.inner.clone())
    }

    /// Blob store whose collections are `<prefix>.files` and `<prefix>.chunks`.
    pub fn gridfs(&self, prefix: &str) -> GridFs {
        GridFs::new(self, prefix)
    }

    /// Run a raw command and decode the reply into `result`.
    ///
    /// Use a `D` for commands with more than one key; the command name must
    /// come first.
    pub async fn run<C, R>(&self, cmd: &C, result: &mut R) -> Result<()>
    where
        C: Serialize + 'static,
        R: DeserializeOwned + 'static,
    {
        let command = document_from_any(cmd)?;
        debug!(db = %self.name, command = ?command.keys().next(), "run command");
        let reply = bounded(SHORT_TIMEOUT, self.inner.run_command(command)).await?;
        decode(Value::D(convert_inbound_ordered(reply)), result)
    }

    pub async fn drop_database(&self) -> Result<()> {
        debug!(db = %self.name, "drop database");
        bounded(SHORT_TIMEOUT, self.inner.drop()).await
    }

    pub async fn collection_names(&self) -> Result<Vec<String>> {
        bounded(SHORT_TIMEOUT, self.inner.list_collection_names()).await
    }
}
