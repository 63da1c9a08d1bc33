//! Query builder and find-and-modify.

use bson::{Bson, Document};
use mongodb::options::ReturnDocument;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::collection::{parse_sort_key, update_document, ChangeInfo, Collection};
use crate::convert::{convert_inbound, document_from_any};
use crate::deadline::{bounded, SHORT_TIMEOUT};
use crate::decode::decode;
use crate::error::{MgoError, Result};
use crate::iter::Iter;
use crate::legacy::Value;

/// Parameters of a find-and-modify.
#[derive(Debug, Clone, Default)]
pub struct Change {
    /// Update document; wrapped in `$set` when it has no operators.
    pub update: Value,
    /// Insert when nothing matches.
    pub upsert: bool,
    /// Delete the matched document instead of updating it.
    pub remove: bool,
    /// Return the document after the change rather than before.
    pub return_new: bool,
}

/// A query under construction. Created by [`Collection::find`].
///
/// Builder methods take and return the query by value; an invalid argument
/// is kept and reported by the terminal operation.
///
/// # Example
///
/// ```ignore
/// let mut page: Vec<M> = Vec::new();
/// people
///     .find(&m! { "canceled" => m! { "$ne" => true } })
///     .sort(&["name"])
///     .skip(5)
///     .limit(5)
///     .all(&mut page)
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct Query {
    coll: Collection,
    filter: Document,
    sort: Option<Document>,
    projection: Option<Document>,
    skip: u64,
    limit: i64,
    batch_size: Option<u32>,
    err: Option<MgoError>,
}

impl Query {
    pub(crate) fn new(coll: Collection, filter: Result<Document>) -> Self {
        let (filter, err) = match filter {
            Ok(filter) => (filter, None),
            Err(err) => (Document::new(), Some(err)),
        };
        Self {
            coll,
            filter,
            sort: None,
            projection: None,
            skip: 0,
            limit: 0,
            batch_size: None,
            err,
        }
    }

    /// Sort by the given fields; prefix a field with `-` for descending order.
    pub fn sort(mut self, fields: &[&str]) -> Self {
        let mut sort = Document::new();
        for field in fields {
            match parse_sort_key(field) {
                Ok((name, order)) => {
                    sort.insert(name, order);
                }
                Err(err) => {
                    self.err.get_or_insert(err);
                }
            }
        }
        self.sort = Some(sort);
        self
    }

    pub fn skip(mut self, n: u64) -> Self {
        self.skip = n;
        self
    }

    /// Maximum number of documents; 0 means no limit.
    pub fn limit(mut self, n: i64) -> Self {
        self.limit = n;
        self
    }

    /// Field projection, e.g. `m! { "name" => 1, "_id" => 0 }`.
    pub fn select<S: Serialize + 'static>(mut self, selector: &S) -> Self {
        match document_from_any(selector) {
            Ok(projection) => self.projection = Some(projection),
            Err(err) => {
                self.err.get_or_insert(err);
            }
        }
        self
    }

    /// Number of documents per server round trip.
    pub fn batch(mut self, n: u32) -> Self {
        self.batch_size = Some(n);
        self
    }

    fn check(&self) -> Result<()> {
        match &self.err {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Fetch the first matching document. Limit is ignored.
    pub async fn one<R>(&self, result: &mut R) -> Result<()>
    where
        R: DeserializeOwned + 'static,
    {
        self.check()?;
        debug!(ns = %self.coll.full_name(), filter = %self.filter, "find one");
        let mut action = self.coll.inner().find_one(self.filter.clone());
        if let Some(projection) = &self.projection {
            action = action.projection(projection.clone());
        }
        if let Some(sort) = &self.sort {
            action = action.sort(sort.clone());
        }
        if self.skip > 0 {
            action = action.skip(self.skip);
        }
        match bounded(SHORT_TIMEOUT, action).await? {
            Some(doc) => decode(convert_inbound(Bson::Document(doc)), result),
            None => Err(MgoError::NotFound),
        }
    }

    /// Fetch every matching document into `result`.
    pub async fn all<R>(&self, result: &mut Vec<R>) -> Result<()>
    where
        R: DeserializeOwned + 'static,
    {
        self.iter().await.all(result).await
    }

    /// Count the matching documents, honouring skip and limit.
    pub async fn count(&self) -> Result<u64> {
        self.check()?;
        let mut action = self.coll.inner().count_documents(self.filter.clone());
        if self.skip > 0 {
            action = action.skip(self.skip);
        }
        if self.limit > 0 {
            action = action.limit(self.limit.unsigned_abs());
        }
        bounded(SHORT_TIMEOUT, action).await
    }

    /// Open a cursor over the matching documents. Failures are reported by
    /// the returned iterator.
    pub async fn iter(&self) -> Iter {
        if let Err(err) = self.check() {
            return Iter::failed(err);
        }
        debug!(ns = %self.coll.full_name(), filter = %self.filter, "find");
        let mut action = self.coll.inner().find(self.filter.clone());
        if let Some(projection) = &self.projection {
            action = action.projection(projection.clone());
        }
        if let Some(sort) = &self.sort {
            action = action.sort(sort.clone());
        }
        if self.skip > 0 {
            action = action.skip(self.skip);
        }
        if self.limit != 0 {
            action = action.limit(self.limit);
        }
        if let Some(batch_size) = self.batch_size {
            action = action.batch_size(batch_size);
        }
        match bounded(SHORT_TIMEOUT, action).await {
            Ok(cursor) => Iter::new(cursor),
            Err(err) => Iter::failed(err),
        }
    }

    /// Find-and-modify the first matching document and decode the old or new
    /// version of it into `result`.
    ///
    /// An upsert that inserts while asking for the old document reports the
    /// new identifier in [`ChangeInfo::upserted_id`] and leaves `result`
    /// untouched.
    pub async fn apply<R>(&self, change: Change, result: &mut R) -> Result<ChangeInfo>
    where
        R: DeserializeOwned + 'static,
    {
        let (info, doc) = self.apply_change(change).await?;
        if let Some(doc) = doc {
            decode(doc, result)?;
        }
        Ok(info)
    }

    /// Like [`Query::apply`] without reading back a document.
    pub async fn apply_info(&self, change: Change) -> Result<ChangeInfo> {
        self.apply_change(change).await.map(|(info, _)| info)
    }

    async fn apply_change(&self, change: Change) -> Result<(ChangeInfo, Option<Value>)> {
        self.check()?;
        let coll = self.coll.inner();

        if change.remove {
            debug!(ns = %self.coll.full_name(), filter = %self.filter, "find and delete");
            let mut action = coll.find_one_and_delete(self.filter.clone());
            if let Some(sort) = &self.sort {
                action = action.sort(sort.clone());
            }
            return match bounded(SHORT_TIMEOUT, action).await? {
                Some(doc) => Ok((
                    ChangeInfo {
                        removed: 1,
                        ..ChangeInfo::default()
                    },
                    Some(convert_inbound(Bson::Document(doc))),
                )),
                None => Err(MgoError::NotFound),
            };
        }

        let update = update_document(&change.update)?;

        // Whether the upsert will insert decides how the outcome is reported.
        let inserting = change.upsert
            && bounded(SHORT_TIMEOUT, coll.find_one(self.filter.clone()))
                .await?
                .is_none();

        debug!(ns = %self.coll.full_name(), filter = %self.filter, upsert = change.upsert, "find and update");
        let mut action = coll
            .find_one_and_update(self.filter.clone(), update)
            .upsert(change.upsert)
            .return_document(if change.return_new {
                ReturnDocument::After
            } else {
                ReturnDocument::Before
            });
        if let Some(sort) = &self.sort {
            action = action.sort(sort.clone());
        }
        if let Some(projection) = &self.projection {
            action = action.projection(projection.clone());
        }

        match bounded(SHORT_TIMEOUT, action).await? {
            Some(doc) => {
                let info = if inserting {
                    ChangeInfo {
                        upserted_id: doc.get("_id").cloned().map(convert_inbound),
                        ..ChangeInfo::default()
                    }
                } else {
                    ChangeInfo {
                        updated: 1,
                        matched: 1,
                        ..ChangeInfo::default()
                    }
                };
                Ok((info, Some(convert_inbound(Bson::Document(doc)))))
            }
            None if inserting && !change.return_new => {
                // There is no "before" document; read the inserted one back for its id.
                let created = bounded(SHORT_TIMEOUT, coll.find_one(self.filter.clone()))
                    .await?
                    .ok_or(MgoError::NotFound)?;
                let info = ChangeInfo {
                    upserted_id: created.get("_id").cloned().map(convert_inbound),
                    ..ChangeInfo::default()
                };
                Ok((info, None))
            }
            None => Err(MgoError::NotFound),
        }
    }
}
