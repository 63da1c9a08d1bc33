//! Collection handles and their write operations.

use bson::{doc, Bson, Document};
use futures::TryStreamExt;
use mongodb::options::IndexOptions;
use mongodb::IndexModel;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::bulk::Bulk;
use crate::convert::{convert_inbound, convert_outbound, document_from_any, to_document};
use crate::database::Database;
use crate::deadline::{bounded, LONG_TIMEOUT, SHORT_TIMEOUT};
use crate::error::{MgoError, Result};
use crate::legacy::{Value, M};
use crate::pipe::Pipe;
use crate::query::Query;

/// Outcome of a multi-document write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeInfo {
    /// Documents modified.
    pub updated: u64,
    /// Documents removed.
    pub removed: u64,
    /// Documents matched, which may exceed `updated`.
    pub matched: u64,
    /// `_id` of a document inserted by an upsert.
    pub upserted_id: Option<Value>,
}

/// String comparison rules for an index or an aggregation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Collation {
    pub locale: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub case_first: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub strength: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub alternate: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub max_variable: String,
    #[serde(skip_serializing_if = "is_false")]
    pub normalization: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub case_level: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub numeric_ordering: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub backwards: bool,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl Collation {
    pub(crate) fn to_modern(&self) -> Result<mongodb::options::Collation> {
        Ok(bson::from_document(bson::to_document(self)?)?)
    }

    pub(crate) fn from_modern(collation: &mongodb::options::Collation) -> Result<Self> {
        Ok(bson::from_document(bson::to_document(collation)?)?)
    }
}

/// Index description.
///
/// Key fields are plain names for ascending order, `-name` for descending
/// and `$kind:name` for special indexes such as `$text:title`,
/// `$2dsphere:loc` or `$hashed:owner`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Index {
    pub key: Vec<String>,
    pub unique: bool,
    /// Accepted for compatibility; servers since 4.2 ignore it.
    pub background: bool,
    pub sparse: bool,
    /// Only index documents matching this filter.
    pub partial_filter: Option<M>,
    /// Remove documents this long after the time in the indexed field.
    pub expire_after: Option<Duration>,
    /// Explicit index name; generated by the server when empty.
    pub name: String,
    pub collation: Option<Collation>,
    pub default_language: String,
    pub language_override: String,
    /// Per-field weights of a text index.
    pub weights: Option<M>,
}

impl Index {
    #[allow(deprecated)]
    fn to_model(&self) -> Result<IndexModel> {
        let mut options = IndexOptions::default();
        options.unique = Some(self.unique);
        options.background = Some(self.background);
        options.sparse = Some(self.sparse);
        if !self.name.is_empty() {
            options.name = Some(self.name.clone());
        }
        if let Some(expire) = self.expire_after.filter(|d| !d.is_zero()) {
            options.expire_after = Some(expire);
        }
        if let Some(filter) = &self.partial_filter {
            options.partial_filter_expression = Some(to_document(&Value::M(filter.clone()))?);
        }
        if let Some(collation) = &self.collation {
            options.collation = Some(collation.to_modern()?);
        }
        if !self.default_language.is_empty() {
            options.default_language = Some(self.default_language.clone());
        }
        if !self.language_override.is_empty() {
            options.language_override = Some(self.language_override.clone());
        }
        if let Some(weights) = &self.weights {
            options.weights = Some(to_document(&Value::M(weights.clone()))?);
        }

        let mut model = IndexModel::default();
        model.keys = parse_index_key(&self.key)?;
        model.options = Some(options);
        Ok(model)
    }

    #[allow(deprecated)]
    fn from_model(model: IndexModel) -> Result<Self> {
        let options = model.options.unwrap_or_default();
        let mut index = Index {
            key: index_key_names(&model.keys, options.weights.as_ref()),
            unique: options.unique.unwrap_or(false),
            background: options.background.unwrap_or(false),
            sparse: options.sparse.unwrap_or(false),
            partial_filter: options.partial_filter_expression.map(into_m),
            expire_after: options.expire_after,
            name: options.name.unwrap_or_default(),
            default_language: options.default_language.unwrap_or_default(),
            language_override: options.language_override.unwrap_or_default(),
            weights: options.weights.map(into_m),
            ..Index::default()
        };
        if let Some(collation) = &options.collation {
            index.collation = Some(Collation::from_modern(collation)?);
        }
        Ok(index)
    }
}

fn into_m(doc: Document) -> M {
    doc.into_iter().map(|(k, v)| (k, convert_inbound(v))).collect()
}

/// Parse one sort or index field: `name`, `+name` or `-name`.
pub(crate) fn parse_sort_key(field: &str) -> Result<(String, Bson)> {
    let (name, order) = match field.strip_prefix('-') {
        Some(name) => (name, -1),
        None => (field.strip_prefix('+').unwrap_or(field), 1),
    };
    if name.is_empty() {
        return Err(MgoError::invalid_argument(format!("invalid sort key {field:?}")));
    }
    Ok((name.to_string(), Bson::Int32(order)))
}

/// Turn legacy index key fields into an ordered key document.
pub(crate) fn parse_index_key(key: &[String]) -> Result<Document> {
    let mut keys = Document::new();
    for field in key {
        let (name, kind) = match field.strip_prefix('$') {
            Some(special) => match special.split_once(':') {
                Some((kind, name)) if !kind.is_empty() && !name.is_empty() => {
                    (name.to_string(), Bson::String(kind.to_string()))
                }
                _ => return Err(MgoError::invalid_argument(format!("invalid index key {field:?}"))),
            },
            None => match field.strip_prefix('@') {
                Some(name) if !name.is_empty() => (name.to_string(), Bson::String("2d".into())),
                _ => parse_sort_key(field)?,
            },
        };
        keys.insert(name, kind);
    }
    if keys.is_empty() {
        return Err(MgoError::invalid_argument("index key must not be empty"));
    }
    Ok(keys)
}

/// The inverse of [`parse_index_key`]. Text indexes list their fields in the
/// weights document.
fn index_key_names(keys: &Document, weights: Option<&Document>) -> Vec<String> {
    let mut names = Vec::with_capacity(keys.len());
    for (name, kind) in keys {
        match (name.as_str(), kind) {
            ("_fts", Bson::String(k)) if k == "text" => {
                if let Some(weights) = weights {
                    names.extend(weights.keys().map(|field| format!("$text:{field}")));
                }
            }
            ("_ftsx", _) => {}
            (_, Bson::String(k)) => names.push(format!("${k}:{name}")),
            (_, Bson::Int32(v)) if *v < 0 => names.push(format!("-{name}")),
            (_, Bson::Int64(v)) if *v < 0 => names.push(format!("-{name}")),
            (_, Bson::Double(v)) if *v < 0.0 => names.push(format!("-{name}")),
            _ => names.push(name.clone()),
        }
    }
    names
}

/// Whether an update document uses operators such as `$set`.
pub(crate) fn has_update_operators(update: &Value) -> bool {
    match update {
        Value::M(m) => m.keys().any(|k| k.starts_with('$')),
        Value::D(d) => d.iter().any(|e| e.name.starts_with('$')),
        Value::Other(Bson::Document(doc)) => doc.keys().any(|k| k.starts_with('$')),
        _ => false,
    }
}

/// A plain document becomes `{$set: doc}` so that it merges fields instead
/// of replacing the stored document.
pub(crate) fn wrap_in_set(update: Value) -> Value {
    if has_update_operators(&update) {
        update
    } else {
        Value::M(crate::m! { "$set" => update })
    }
}

pub(crate) fn update_document<U: Serialize + 'static>(update: &U) -> Result<Document> {
    to_document(&wrap_in_set(Value::from_any(update)?))
}

/// Give a document without a usable `_id` a fresh ObjectId.
pub(crate) fn ensure_object_id(mut doc: Document) -> Document {
    let missing = match doc.get("_id") {
        None => {
            let mut out = doc! { "_id": bson::oid::ObjectId::new() };
            out.extend(doc);
            return out;
        }
        Some(Bson::Null) => true,
        Some(Bson::String(s)) => s.is_empty(),
        Some(Bson::Binary(bin)) => bin.bytes.is_empty(),
        Some(_) => false,
    };
    if missing {
        doc.insert("_id", bson::oid::ObjectId::new());
    }
    doc
}

fn id_filter<I: Serialize + 'static>(id: &I) -> Result<Document> {
    Ok(doc! { "_id": convert_outbound(&Value::from_any(id)?) })
}

/// A handle to a collection. Cheap to clone.
///
/// # Example
///
/// ```ignore
/// let people = session.db("app").c("people");
/// people.insert(&[m! { "name" => "John", "age" => 30 }]).await?;
///
/// let mut john = M::new();
/// people.find(&m! { "name" => "John" }).one(&mut john).await?;
///
/// people.update(&m! { "name" => "John" }, &m! { "age" => 31 }).await?;
/// ```
#[derive(Debug, Clone)]
pub struct Collection {
    inner: mongodb::Collection<Document>,
    db: mongodb::Database,
}

impl Collection {
    pub(crate) fn new(inner: mongodb::Collection<Document>, db: mongodb::Database) -> Self {
        Self { inner, db }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// `<database>.<collection>`.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.db.name(), self.inner.name())
    }

    pub(crate) fn inner(&self) -> &mongodb::Collection<Document> {
        &self.inner
    }

    pub(crate) fn db(&self) -> &mongodb::Database {
        &self.db
    }

    /// Insert documents. Documents without an `_id` get a new ObjectId.
    pub async fn insert<T: Serialize + 'static>(&self, docs: &[T]) -> Result<()> {
        let mut converted = docs
            .iter()
            .map(|doc| document_from_any(doc).map(ensure_object_id))
            .collect::<Result<Vec<_>>>()?;
        debug!(ns = %self.full_name(), count = converted.len(), "insert");

        match converted.len() {
            0 => Err(MgoError::invalid_argument("insert needs at least one document")),
            1 => {
                let doc = converted.remove(0);
                bounded(SHORT_TIMEOUT, self.inner.insert_one(doc)).await?;
                Ok(())
            }
            _ => {
                bounded(SHORT_TIMEOUT, self.inner.insert_many(converted)).await?;
                Ok(())
            }
        }
    }

    /// Start a query. A `Value::Null` filter matches every document.
    pub fn find<F: Serialize + 'static>(&self, filter: &F) -> Query {
        Query::new(self.clone(), document_from_any(filter))
    }

    /// Start a query for the document with the given `_id`.
    pub fn find_id<I: Serialize + 'static>(&self, id: &I) -> Query {
        Query::new(self.clone(), id_filter(id))
    }

    /// Number of documents in the collection.
    pub async fn count(&self) -> Result<u64> {
        bounded(SHORT_TIMEOUT, self.inner.count_documents(Document::new())).await
    }

    /// Remove the first matching document. Matching nothing is not an error.
    pub async fn remove<S: Serialize + 'static>(&self, selector: &S) -> Result<()> {
        let filter = document_from_any(selector)?;
        let result = bounded(SHORT_TIMEOUT, self.inner.delete_one(filter.clone())).await?;
        debug!(ns = %self.full_name(), filter = %filter, removed = result.deleted_count, "remove");
        Ok(())
    }

    pub async fn remove_id<I: Serialize + 'static>(&self, id: &I) -> Result<()> {
        self.remove(&id_filter(id)?).await
    }

    /// Remove every matching document.
    pub async fn remove_all<S: Serialize + 'static>(&self, selector: &S) -> Result<ChangeInfo> {
        let filter = document_from_any(selector)?;
        debug!(ns = %self.full_name(), filter = %filter, "remove all");
        let result = bounded(SHORT_TIMEOUT, self.inner.delete_many(filter)).await?;
        Ok(ChangeInfo {
            removed: result.deleted_count,
            matched: result.deleted_count,
            ..ChangeInfo::default()
        })
    }

    /// Update the first matching document. Matching nothing is not an error.
    ///
    /// An update without `$` operators sets the given fields and leaves the
    /// others in place.
    pub async fn update<S, U>(&self, selector: &S, update: &U) -> Result<()>
    where
        S: Serialize + 'static,
        U: Serialize + 'static,
    {
        let filter = document_from_any(selector)?;
        let update = update_document(update)?;
        let result = bounded(SHORT_TIMEOUT, self.inner.update_one(filter.clone(), update)).await?;
        debug!(ns = %self.full_name(), filter = %filter, matched = result.matched_count, "update");
        Ok(())
    }

    pub async fn update_id<I, U>(&self, id: &I, update: &U) -> Result<()>
    where
        I: Serialize + 'static,
        U: Serialize + 'static,
    {
        self.update(&id_filter(id)?, update).await
    }

    /// Update every matching document.
    pub async fn update_all<S, U>(&self, selector: &S, update: &U) -> Result<ChangeInfo>
    where
        S: Serialize + 'static,
        U: Serialize + 'static,
    {
        let filter = document_from_any(selector)?;
        let update = update_document(update)?;
        debug!(ns = %self.full_name(), filter = %filter, "update all");
        let result = bounded(SHORT_TIMEOUT, self.inner.update_many(filter, update)).await?;
        Ok(ChangeInfo {
            updated: result.modified_count,
            matched: result.matched_count,
            ..ChangeInfo::default()
        })
    }

    /// Update the first matching document, or insert one when nothing
    /// matches. The new `_id` is reported in [`ChangeInfo::upserted_id`].
    pub async fn upsert<S, U>(&self, selector: &S, update: &U) -> Result<ChangeInfo>
    where
        S: Serialize + 'static,
        U: Serialize + 'static,
    {
        let filter = document_from_any(selector)?;
        let update = update_document(update)?;
        debug!(ns = %self.full_name(), filter = %filter, "upsert");
        let result = bounded(
            SHORT_TIMEOUT,
            self.inner.update_one(filter, update).upsert(true),
        )
        .await?;
        Ok(ChangeInfo {
            updated: result.modified_count,
            matched: result.matched_count,
            upserted_id: result.upserted_id.map(convert_inbound),
            ..ChangeInfo::default()
        })
    }

    /// Create an index unless one with the same key exists.
    pub async fn ensure_index(&self, index: &Index) -> Result<()> {
        let model = index.to_model()?;
        debug!(ns = %self.full_name(), keys = %model.keys, "ensure index");
        bounded(LONG_TIMEOUT, self.inner.create_index(model)).await?;
        Ok(())
    }

    /// Shorthand for an index with default options.
    pub async fn ensure_index_key(&self, key: &[&str]) -> Result<()> {
        self.ensure_index(&Index {
            key: key.iter().map(|k| k.to_string()).collect(),
            ..Index::default()
        })
        .await
    }

    /// The collection's indexes, sorted by name.
    pub async fn indexes(&self) -> Result<Vec<Index>> {
        let models = bounded(SHORT_TIMEOUT, async {
            let cursor = self.inner.list_indexes().await?;
            cursor.try_collect::<Vec<IndexModel>>().await
        })
        .await?;
        let mut indexes = models
            .into_iter()
            .map(Index::from_model)
            .collect::<Result<Vec<_>>>()?;
        indexes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(indexes)
    }

    pub async fn drop_collection(&self) -> Result<()> {
        debug!(ns = %self.full_name(), "drop collection");
        bounded(SHORT_TIMEOUT, self.inner.drop()).await
    }

    /// Start an aggregation. Accepts a list of stages or a single stage.
    pub fn pipe<P: Serialize + 'static>(&self, pipeline: &P) -> Pipe {
        Pipe::new(self.clone(), pipeline)
    }

    /// Run a command against this collection's database.
    pub async fn run<C, R>(&self, cmd: &C, result: &mut R) -> Result<()>
    where
        C: Serialize + 'static,
        R: DeserializeOwned + 'static,
    {
        Database::new(self.db.clone(), self.db.name()).run(cmd, result).await
    }

    pub fn bulk(&self) -> Bulk {
        Bulk::new(self.clone())
    }
}
