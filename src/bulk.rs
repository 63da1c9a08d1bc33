//! Batched writes.
//!
//! Queued operations are sent as `insert`, `update` and `delete` write
//! commands, one command per run of consecutive operations of the same kind.

use bson::{doc, Bson, Document};
use mongodb::error::ErrorKind as DriverErrorKind;
use mongodb::options::WriteConcern;
use serde::Serialize;
use tracing::{debug, warn};

use crate::collection::{ensure_object_id, Collection};
use crate::convert::document_from_any;
use crate::deadline::{bounded, LONG_TIMEOUT};
use crate::error::{BulkError, BulkErrorCase, MgoError, QueryError, Result};

/// Largest number of operations sent in one write command.
const MAX_BATCH: usize = 1000;

/// Counts reported by a successful [`Bulk::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkResult {
    /// Documents matched by updates and removals.
    pub matched: u64,
    /// Documents changed by updates, upserts and removals.
    pub modified: u64,
}

#[derive(Debug, Clone, PartialEq)]
enum BulkOp {
    Insert(Document),
    Update {
        filter: Document,
        update: Document,
        multi: bool,
        upsert: bool,
    },
    Delete {
        filter: Document,
        multi: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Insert,
    Update,
    Delete,
}

impl BulkOp {
    fn kind(&self) -> OpKind {
        match self {
            BulkOp::Insert(_) => OpKind::Insert,
            BulkOp::Update { .. } => OpKind::Update,
            BulkOp::Delete { .. } => OpKind::Delete,
        }
    }
}

/// A batch of writes against one collection. Created by [`Collection::bulk`].
///
/// Operations run in the order they were queued and stop at the first
/// failure, unless [`Bulk::unordered`] was called. Update documents are sent
/// as given.
///
/// ```ignore
/// let mut bulk = people.bulk();
/// bulk.insert(&[m! { "name" => "a" }])
///     .update(&m! { "name" => "a" }, &m! { "$set" => m! { "seen" => true } })
///     .remove(&m! { "name" => "b" });
/// let result = bulk.run().await?;
/// ```
#[derive(Debug)]
pub struct Bulk {
    coll: Collection,
    ops: Vec<BulkOp>,
    ordered: bool,
    err: Option<MgoError>,
}

impl Bulk {
    pub(crate) fn new(coll: Collection) -> Self {
        Self {
            coll,
            ops: Vec::new(),
            ordered: true,
            err: None,
        }
    }

    /// Keep going after a failed operation.
    pub fn unordered(&mut self) -> &mut Self {
        self.ordered = false;
        self
    }

    /// Queue documents for insertion. Documents without an `_id` get one.
    pub fn insert<T: Serialize + 'static>(&mut self, docs: &[T]) -> &mut Self {
        for doc in docs {
            match document_from_any(doc) {
                Ok(doc) => self.ops.push(BulkOp::Insert(ensure_object_id(doc))),
                Err(err) => self.record(err),
            }
        }
        self
    }

    /// Queue an update of the first document matching `selector`.
    pub fn update<S, U>(&mut self, selector: &S, update: &U) -> &mut Self
    where
        S: Serialize + 'static,
        U: Serialize + 'static,
    {
        self.push_update(selector, update, false, false)
    }

    /// Queue an update of every document matching `selector`.
    pub fn update_all<S, U>(&mut self, selector: &S, update: &U) -> &mut Self
    where
        S: Serialize + 'static,
        U: Serialize + 'static,
    {
        self.push_update(selector, update, true, false)
    }

    /// Queue an update of the first match, inserting when nothing matches.
    pub fn upsert<S, U>(&mut self, selector: &S, update: &U) -> &mut Self
    where
        S: Serialize + 'static,
        U: Serialize + 'static,
    {
        self.push_update(selector, update, false, true)
    }

    /// Queue removal of the first document matching `selector`.
    pub fn remove<S: Serialize + 'static>(&mut self, selector: &S) -> &mut Self {
        self.push_delete(selector, false)
    }

    /// Queue removal of every document matching `selector`.
    pub fn remove_all<S: Serialize + 'static>(&mut self, selector: &S) -> &mut Self {
        self.push_delete(selector, true)
    }

    fn push_update<S, U>(&mut self, selector: &S, update: &U, multi: bool, upsert: bool) -> &mut Self
    where
        S: Serialize + 'static,
        U: Serialize + 'static,
    {
        match (document_from_any(selector), document_from_any(update)) {
            (Ok(filter), Ok(update)) => self.ops.push(BulkOp::Update {
                filter,
                update,
                multi,
                upsert,
            }),
            (Err(err), _) | (_, Err(err)) => self.record(err),
        }
        self
    }

    fn push_delete<S: Serialize + 'static>(&mut self, selector: &S, multi: bool) -> &mut Self {
        match document_from_any(selector) {
            Ok(filter) => self.ops.push(BulkOp::Delete { filter, multi }),
            Err(err) => self.record(err),
        }
        self
    }

    fn record(&mut self, err: MgoError) {
        self.err.get_or_insert(err);
    }

    /// Send the queued operations.
    ///
    /// Per-operation failures are collected into [`MgoError::Bulk`], indexed by
    /// queue position. A write concern failure, or a batch that failed as a
    /// whole, is reported at index `-1` next to the cases already collected.
    pub async fn run(self) -> Result<BulkResult> {
        if let Some(err) = self.err {
            return Err(err);
        }
        let mut result = BulkResult::default();
        if self.ops.is_empty() {
            return Ok(result);
        }

        let db = self.coll.db();
        let write_concern = self.coll.inner().write_concern().cloned();
        let mut cases = Vec::new();

        for (offset, batch) in batches(&self.ops) {
            let command = write_command(self.coll.name(), batch, self.ordered, write_concern.as_ref())?;
            debug!(ns = %self.coll.full_name(), offset, ops = batch.len(), "bulk write");

            let failed_before = cases.len();
            match bounded(LONG_TIMEOUT, db.run_command(command)).await {
                Ok(reply) => tally(batch[0].kind(), &reply, offset, &mut result, &mut cases),
                Err(err) => {
                    debug!(ns = %self.coll.full_name(), offset, error = %err, "bulk batch failed");
                    cases.push(batch_failure(err)?);
                }
            }

            if self.ordered && cases.len() > failed_before {
                break;
            }
        }

        if cases.is_empty() {
            Ok(result)
        } else {
            warn!(ns = %self.coll.full_name(), failures = cases.len(), "bulk write failed");
            Err(MgoError::Bulk(BulkError::new(cases)))
        }
    }
}

/// Split into runs of one kind of at most [`MAX_BATCH`] operations, each with
/// the queue position of its first operation.
fn batches(ops: &[BulkOp]) -> Vec<(usize, &[BulkOp])> {
    let mut out = Vec::new();
    let mut start = 0;
    while start < ops.len() {
        let kind = ops[start].kind();
        let mut end = start + 1;
        while end < ops.len() && end - start < MAX_BATCH && ops[end].kind() == kind {
            end += 1;
        }
        out.push((start, &ops[start..end]));
        start = end;
    }
    out
}

fn write_command(
    coll: &str,
    batch: &[BulkOp],
    ordered: bool,
    write_concern: Option<&WriteConcern>,
) -> Result<Document> {
    let mut command = match batch.first().map(BulkOp::kind) {
        Some(OpKind::Insert) => doc! { "insert": coll },
        Some(OpKind::Update) => doc! { "update": coll },
        Some(OpKind::Delete) => doc! { "delete": coll },
        None => return Err(MgoError::invalid_argument("empty bulk batch")),
    };

    let mut documents = Vec::new();
    let mut updates = Vec::new();
    let mut deletes = Vec::new();
    for op in batch {
        match op {
            BulkOp::Insert(doc) => documents.push(Bson::Document(doc.clone())),
            BulkOp::Update {
                filter,
                update,
                multi,
                upsert,
            } => updates.push(Bson::Document(doc! {
                "q": filter.clone(),
                "u": update.clone(),
                "multi": *multi,
                "upsert": *upsert,
            })),
            BulkOp::Delete { filter, multi } => deletes.push(Bson::Document(doc! {
                "q": filter.clone(),
                "limit": if *multi { 0 } else { 1 },
            })),
        }
    }
    if !documents.is_empty() {
        command.insert("documents", documents);
    }
    if !updates.is_empty() {
        command.insert("updates", updates);
    }
    if !deletes.is_empty() {
        command.insert("deletes", deletes);
    }

    command.insert("ordered", ordered);
    if let Some(wc) = write_concern {
        command.insert("writeConcern", bson::to_document(wc)?);
    }
    Ok(command)
}

/// The case for a write command that failed as a whole.
fn batch_failure(err: MgoError) -> Result<BulkErrorCase> {
    let err = match err {
        MgoError::Transport(err) => match err.kind.as_ref() {
            DriverErrorKind::Command(cmd) => QueryError::new(cmd.code, cmd.message.clone()),
            _ => {
                let err = MgoError::Transport(err);
                QueryError::new(err.code().unwrap_or(0), err.to_string())
            }
        },
        MgoError::Timeout => QueryError::new(0, MgoError::Timeout.to_string()),
        other => return Err(other),
    };
    Ok(BulkErrorCase { index: -1, err })
}

/// Add one write command reply to the running totals.
fn tally(
    kind: OpKind,
    reply: &Document,
    offset: usize,
    result: &mut BulkResult,
    cases: &mut Vec<BulkErrorCase>,
) {
    let n = int_field(reply, "n");
    match kind {
        OpKind::Insert => {}
        OpKind::Update => {
            let upserted = match reply.get("upserted") {
                Some(Bson::Array(items)) => items.len() as u64,
                _ => 0,
            };
            result.matched += n.saturating_sub(upserted);
            result.modified += int_field(reply, "nModified") + upserted;
        }
        OpKind::Delete => {
            result.matched += n;
            result.modified += n;
        }
    }

    if let Ok(errors) = reply.get_array("writeErrors") {
        for error in errors {
            if let Bson::Document(error) = error {
                let index = int_field(error, "index") as i64;
                cases.push(BulkErrorCase {
                    index: offset as i64 + index,
                    err: query_error(error),
                });
            }
        }
    }
    if let Ok(error) = reply.get_document("writeConcernError") {
        cases.push(BulkErrorCase {
            index: -1,
            err: query_error(error),
        });
    }
}

fn query_error(error: &Document) -> QueryError {
    let code = match error.get("code") {
        Some(Bson::Int32(c)) => *c,
        Some(Bson::Int64(c)) => *c as i32,
        _ => 0,
    };
    QueryError::new(code, error.get_str("errmsg").unwrap_or_default())
}

fn int_field(doc: &Document, key: &str) -> u64 {
    match doc.get(key) {
        Some(Bson::Int32(v)) => (*v).max(0) as u64,
        Some(Bson::Int64(v)) => (*v).max(0) as u64,
        Some(Bson::Double(v)) if *v > 0.0 => *v as u64,
        _ => 0,
    }
}
