//! Aggregation pipelines.

use bson::{doc, Document};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::collection::{Collation, Collection};
use crate::convert::{convert_inbound_ordered, to_document};
use crate::deadline::{bounded, SHORT_TIMEOUT};
use crate::decode::decode;
use crate::error::{MgoError, Result};
use crate::iter::Iter;
use crate::legacy::Value;

const DEFAULT_BATCH_SIZE: u32 = 101;

/// An aggregation pipeline. Created by [`Collection::pipe`].
///
/// ```ignore
/// let mut totals: Vec<M> = Vec::new();
/// orders
///     .pipe(&vec![
///         m! { "$match" => m! { "status" => "paid" } },
///         m! { "$group" => m! { "_id" => "$customer", "total" => m! { "$sum" => "$amount" } } },
///     ])
///     .allow_disk_use()
///     .all(&mut totals)
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct Pipe {
    coll: Collection,
    pipeline: Vec<Document>,
    allow_disk_use: bool,
    batch_size: u32,
    max_time: Option<Duration>,
    collation: Option<mongodb::options::Collation>,
    err: Option<MgoError>,
}

impl Pipe {
    pub(crate) fn new<P: Serialize + 'static>(coll: Collection, pipeline: &P) -> Self {
        let (pipeline, err) = match pipeline_from_any(pipeline) {
            Ok(stages) => (stages, None),
            Err(err) => (Vec::new(), Some(err)),
        };
        Self {
            coll,
            pipeline,
            allow_disk_use: false,
            batch_size: DEFAULT_BATCH_SIZE,
            max_time: None,
            collation: None,
            err,
        }
    }

    /// Let stages spill to temporary files on the server.
    pub fn allow_disk_use(mut self) -> Self {
        self.allow_disk_use = true;
        self
    }

    pub fn batch(mut self, n: u32) -> Self {
        self.batch_size = n;
        self
    }

    /// Server-side execution time limit.
    pub fn set_max_time(mut self, d: Duration) -> Self {
        self.max_time = Some(d);
        self
    }

    pub fn collation(mut self, collation: &Collation) -> Self {
        match collation.to_modern() {
            Ok(c) => self.collation = Some(c),
            Err(err) => {
                self.err.get_or_insert(err);
            }
        }
        self
    }

    /// Run the pipeline and iterate over its output.
    pub async fn iter(&self) -> Iter {
        if let Some(err) = &self.err {
            return Iter::failed(err.clone());
        }
        debug!(ns = %self.coll.full_name(), stages = self.pipeline.len(), "aggregate");
        let mut action = self.coll.inner().aggregate(self.pipeline.clone());
        if self.allow_disk_use {
            action = action.allow_disk_use(true);
        }
        if self.batch_size > 0 {
            action = action.batch_size(self.batch_size);
        }
        if let Some(max_time) = self.max_time {
            action = action.max_time(max_time);
        }
        if let Some(collation) = &self.collation {
            action = action.collation(collation.clone());
        }
        match bounded(SHORT_TIMEOUT, action).await {
            Ok(cursor) => Iter::new(cursor),
            Err(err) => Iter::failed(err),
        }
    }

    pub async fn all<R>(&self, result: &mut Vec<R>) -> Result<()>
    where
        R: DeserializeOwned + 'static,
    {
        self.iter().await.all(result).await
    }

    /// Decode the first output document; `NotFound` when there is none.
    pub async fn one<R>(&self, result: &mut R) -> Result<()>
    where
        R: DeserializeOwned + 'static,
    {
        let mut iter = self.iter().await;
        if iter.next(result).await {
            return iter.close();
        }
        iter.close()?;
        Err(MgoError::NotFound)
    }

    /// Decode the server's execution plan for the pipeline into `result`.
    pub async fn explain<R>(&self, result: &mut R) -> Result<()>
    where
        R: DeserializeOwned + 'static,
    {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        let command = doc! {
            "aggregate": self.coll.name(),
            "pipeline": self.pipeline.clone(),
            "explain": true,
        };
        let reply = bounded(SHORT_TIMEOUT, self.coll.db().run_command(command)).await?;
        decode(Value::D(convert_inbound_ordered(reply)), result)
    }
}

/// A list of stages, or a single stage on its own.
fn pipeline_from_any<P: Serialize + 'static>(pipeline: &P) -> Result<Vec<Document>> {
    match Value::from_any(pipeline)? {
        Value::Array(stages) => stages.iter().map(to_document).collect(),
        Value::Null => Ok(Vec::new()),
        stage => Ok(vec![to_document(&stage)?]),
    }
}
