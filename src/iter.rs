//! Server-side cursor iteration with sticky errors.

use bson::{Bson, Document};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::convert::convert_inbound;
use crate::deadline::{bounded, SHORT_TIMEOUT};
use crate::decode::{decode, decode_slice};
use crate::error::{MgoError, Result};
use crate::legacy::Value;

type DocumentStream = BoxStream<'static, mongodb::error::Result<Document>>;

/// Iterator over the documents of a query or aggregation.
///
/// Once an error is recorded every later [`Iter::next`] returns `false`
/// without touching the server, and [`Iter::close`] reports it. Reaching the
/// end of the results is not an error.
///
/// # Example
///
/// ```ignore
/// let mut iter = people.find(&m! {}).iter().await;
/// let mut person = M::new();
/// while iter.next(&mut person).await {
///     println!("{person:?}");
/// }
/// iter.close()?;
/// ```
pub struct Iter {
    stream: Option<DocumentStream>,
    err: Option<MgoError>,
    done: bool,
}

impl std::fmt::Debug for Iter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Iter")
            .field("open", &self.stream.is_some())
            .field("err", &self.err)
            .field("done", &self.done)
            .finish()
    }
}

impl Iter {
    pub(crate) fn new(cursor: mongodb::Cursor<Document>) -> Self {
        Self::from_stream(cursor.boxed())
    }

    pub(crate) fn from_stream(stream: DocumentStream) -> Self {
        Self {
            stream: Some(stream),
            err: None,
            done: false,
        }
    }

    /// An iterator that failed before it could open.
    pub(crate) fn failed(err: MgoError) -> Self {
        Self {
            stream: None,
            err: Some(err),
            done: true,
        }
    }

    /// Decode the next document into `result`.
    ///
    /// Returns `false` at the end of the results or on error; check
    /// [`Iter::err`] or [`Iter::close`] to tell them apart.
    pub async fn next<R>(&mut self, result: &mut R) -> bool
    where
        R: DeserializeOwned + 'static,
    {
        let Some(doc) = self.next_value().await else {
            return false;
        };
        match decode(doc, result) {
            Ok(()) => true,
            Err(err) => {
                self.err = Some(err);
                false
            }
        }
    }

    /// Advance and return the next document as a legacy value.
    pub(crate) async fn next_value(&mut self) -> Option<Value> {
        if self.err.is_some() || self.done {
            return None;
        }
        let Some(stream) = self.stream.as_mut() else {
            self.done = true;
            return None;
        };
        match bounded(SHORT_TIMEOUT, stream.try_next()).await {
            Ok(Some(doc)) => Some(convert_inbound(Bson::Document(doc))),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                debug!(error = %err, "cursor advance failed");
                self.err = Some(err);
                None
            }
        }
    }

    /// Drain the remaining documents into `result`, then close.
    pub async fn all<R>(&mut self, result: &mut Vec<R>) -> Result<()>
    where
        R: DeserializeOwned + 'static,
    {
        let mut docs = Vec::new();
        while let Some(doc) = self.next_value().await {
            docs.push(doc);
        }
        self.close()?;
        decode_slice(docs, result)
    }

    /// Release the server cursor. Safe to call more than once; returns the
    /// recorded error, if any.
    pub fn close(&mut self) -> Result<()> {
        if self.stream.take().is_some() {
            debug!("cursor closed");
        }
        self.done = true;
        match &self.err {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// The recorded error, if any.
    pub fn err(&self) -> Option<&MgoError> {
        self.err.as_ref()
    }

    /// Whether a following `next` is guaranteed to return `false`.
    pub fn done(&self) -> bool {
        self.done || self.err.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::legacy::M;
    use bson::doc;
    use futures::stream;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn reset() -> mongodb::error::Error {
        std::io::ErrorKind::ConnectionReset.into()
    }

    fn iter_over(items: Vec<mongodb::error::Result<Document>>) -> Iter {
        Iter::from_stream(stream::iter(items).boxed())
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Row {
        n: i32,
    }

    #[tokio::test]
    async fn test_exhaustion_is_not_an_error() {
        let mut iter = iter_over(vec![Ok(doc! { "n": 1 }), Ok(doc! { "n": 2 })]);
        let mut row = M::new();
        assert!(iter.next(&mut row).await);
        assert!(iter.next(&mut row).await);
        assert_eq!(row["n"], Value::Int32(2));
        assert!(!iter.next(&mut row).await);
        assert!(!iter.next(&mut row).await);
        assert!(iter.done());
        assert!(iter.err().is_none());
        assert!(iter.close().is_ok());
    }

    #[tokio::test]
    async fn test_error_is_sticky() {
        let polled = Arc::new(AtomicUsize::new(0));
        let counter = polled.clone();
        let items = vec![Ok(doc! { "n": 1 }), Err(reset()), Ok(doc! { "n": 3 })];
        let stream = stream::iter(items).inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut iter = Iter::from_stream(stream.boxed());

        let mut row = M::new();
        assert!(iter.next(&mut row).await);
        assert!(!iter.next(&mut row).await);
        assert!(!iter.next(&mut row).await);
        assert!(!iter.next(&mut row).await);
        assert_eq!(polled.load(Ordering::SeqCst), 2);

        assert!(matches!(iter.err(), Some(MgoError::Transport(_))));
        assert!(iter.close().is_err());
        assert!(iter.close().is_err());
    }

    #[tokio::test]
    async fn test_decode_failure_is_recorded() {
        let mut iter = iter_over(vec![Ok(doc! { "n": "one" }), Ok(doc! { "n": 2 })]);
        let mut row = Row { n: 0 };
        assert!(!iter.next(&mut row).await);
        assert!(matches!(iter.err(), Some(MgoError::Decode(_))));
        assert!(!iter.next(&mut row).await);
    }

    #[tokio::test]
    async fn test_all_decodes_every_document() {
        let mut iter = iter_over(vec![Ok(doc! { "n": 1 }), Ok(doc! { "n": 2 })]);
        let mut rows: Vec<Row> = Vec::new();
        iter.all(&mut rows).await.unwrap();
        assert_eq!(rows, vec![Row { n: 1 }, Row { n: 2 }]);
        assert!(iter.done());
    }

    #[tokio::test]
    async fn test_all_surfaces_transport_error() {
        let mut iter = iter_over(vec![Ok(doc! { "n": 1 }), Err(reset())]);
        let mut rows: Vec<Row> = Vec::new();
        assert!(iter.all(&mut rows).await.is_err());
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_failed_iter() {
        let mut iter = Iter::failed(MgoError::invalid_argument("bad sort key"));
        let mut row = M::new();
        assert!(iter.done());
        assert!(!iter.next(&mut row).await);
        assert!(matches!(iter.close(), Err(MgoError::InvalidArgument(_))));
    }
}
