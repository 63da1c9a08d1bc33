//! Chunked blob storage in a `files` and a `chunks` collection.

use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::collection::{Collection, Index};
use crate::convert::convert_outbound;
use crate::database::Database;
use crate::deadline::{bounded, LONG_TIMEOUT};
use crate::decode::decode;
use crate::error::{MgoError, Result};
use crate::iter::Iter;
use crate::legacy::{ObjectId, Value};
use crate::query::Query;

/// Default size of one chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 255 * 1024;

/// A blob store. Created by [`Database::gridfs`].
///
/// ```ignore
/// let fs = session.db("media").gridfs("fs");
/// let mut file = fs.create("report.pdf");
/// file.set_content_type("application/pdf");
/// file.write(&bytes)?;
/// file.close().await?;
///
/// let mut file = fs.open("report.pdf").await?;
/// let data = file.read_to_end().await?;
/// ```
#[derive(Debug, Clone)]
pub struct GridFs {
    files: Collection,
    chunks: Collection,
}

impl GridFs {
    pub(crate) fn new(db: &Database, prefix: &str) -> Self {
        Self {
            files: db.c(&format!("{prefix}.files")),
            chunks: db.c(&format!("{prefix}.chunks")),
        }
    }

    /// The file metadata collection.
    pub fn files(&self) -> &Collection {
        &self.files
    }

    /// The chunk collection.
    pub fn chunks(&self) -> &Collection {
        &self.chunks
    }

    /// A new file open for writing. Nothing is stored until it is closed.
    pub fn create(&self, name: &str) -> GridFile {
        GridFile {
            gfs: self.clone(),
            mode: FileMode::Write,
            id: Value::ObjectId(ObjectId::new()),
            name: name.to_string(),
            content_type: String::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            length: 0,
            upload_date: Utc::now(),
            md5: String::new(),
            metadata: None,
            chunks: Vec::new(),
            chunk_ids: Vec::new(),
            chunks_stored: false,
            loaded: false,
            pos: ReadPos::default(),
            err: None,
            closed: false,
        }
    }

    /// Open the most recently uploaded file with this name.
    pub async fn open(&self, name: &str) -> Result<GridFile> {
        let mut doc = Value::Null;
        self.files
            .find(&doc! { "filename": name })
            .sort(&["-uploadDate"])
            .one(&mut doc)
            .await?;
        Ok(GridFile::from_files_doc(self.clone(), &doc))
    }

    pub async fn open_id<I: Serialize + 'static>(&self, id: &I) -> Result<GridFile> {
        let mut doc = Value::Null;
        self.files.find_id(id).one(&mut doc).await?;
        Ok(GridFile::from_files_doc(self.clone(), &doc))
    }

    /// Query the files collection.
    pub fn find<S: Serialize + 'static>(&self, selector: &S) -> Query {
        self.files.find(selector)
    }

    /// Close `file` if set, then open the next file described by `iter`.
    /// Returns `false` and leaves `file` empty when `iter` has no more files.
    pub async fn open_next(&self, iter: &mut Iter, file: &mut Option<GridFile>) -> bool {
        if let Some(mut previous) = file.take() {
            if let Err(err) = previous.close().await {
                warn!(file = %previous.name, error = %err, "closing previous file failed");
            }
        }
        match iter.next_value().await {
            Some(doc) => {
                *file = Some(GridFile::from_files_doc(self.clone(), &doc));
                true
            }
            None => false,
        }
    }

    /// Remove every file with this name, with their chunks.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let mut found: Vec<Value> = Vec::new();
        self.files
            .find(&doc! { "filename": name })
            .select(&doc! { "_id": 1 })
            .all(&mut found)
            .await?;
        let ids: Vec<Bson> = found
            .iter()
            .filter_map(|doc| doc.get("_id"))
            .map(convert_outbound)
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        debug!(file = name, versions = ids.len(), "remove file");
        self.files.remove_all(&doc! { "_id": { "$in": ids.clone() } }).await?;
        self.chunks.remove_all(&doc! { "files_id": { "$in": ids } }).await?;
        Ok(())
    }

    pub async fn remove_id<I: Serialize + 'static>(&self, id: &I) -> Result<()> {
        let id = convert_outbound(&Value::from_any(id)?);
        self.files.remove_all(&doc! { "_id": id.clone() }).await?;
        self.chunks.remove_all(&doc! { "files_id": id }).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileMode {
    Read,
    Write,
}

/// Position of the next read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ReadPos {
    chunk: usize,
    offset: usize,
    consumed: u64,
}

/// A stored file, open either for writing (from [`GridFs::create`]) or for
/// reading (from [`GridFs::open`] and friends).
#[derive(Debug)]
pub struct GridFile {
    gfs: GridFs,
    mode: FileMode,
    id: Value,
    name: String,
    content_type: String,
    chunk_size: usize,
    length: u64,
    upload_date: DateTime<Utc>,
    md5: String,
    metadata: Option<Value>,
    chunks: Vec<Vec<u8>>,
    /// Chunk document ids, fixed on the first store attempt.
    chunk_ids: Vec<bson::oid::ObjectId>,
    chunks_stored: bool,
    loaded: bool,
    pos: ReadPos,
    /// First argument error from a setter, reported by `write` and `close`.
    err: Option<MgoError>,
    closed: bool,
}

impl GridFile {
    fn from_files_doc(gfs: GridFs, doc: &Value) -> Self {
        let int = |key: &str| doc.get(key).and_then(Value::as_i64).unwrap_or(0);
        let text = |key: &str| doc.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
        let chunk_size = usize::try_from(int("chunkSize"))
            .ok()
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_CHUNK_SIZE);
        Self {
            gfs,
            mode: FileMode::Read,
            id: doc.get("_id").cloned().unwrap_or_default(),
            name: text("filename"),
            content_type: text("contentType"),
            chunk_size,
            length: u64::try_from(int("length")).unwrap_or(0),
            upload_date: doc
                .get("uploadDate")
                .and_then(Value::as_time)
                .unwrap_or_default(),
            md5: text("md5"),
            metadata: doc.get("metadata").filter(|m| !m.is_null()).cloned(),
            chunks: Vec::new(),
            chunk_ids: Vec::new(),
            chunks_stored: false,
            loaded: false,
            pos: ReadPos::default(),
            err: None,
            closed: false,
        }
    }

    pub fn id(&self) -> &Value {
        &self.id
    }

    pub fn set_id<I: Serialize + 'static>(&mut self, id: &I) {
        match Value::from_any(id) {
            Ok(id) => self.id = id,
            Err(err) => self.fail(err),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.content_type = content_type.to_string();
    }

    /// Length in bytes.
    pub fn size(&self) -> u64 {
        self.length
    }

    /// Lowercase hex MD5 of the content; empty until a written file is closed.
    pub fn md5(&self) -> &str {
        &self.md5
    }

    pub fn upload_date(&self) -> DateTime<Utc> {
        self.upload_date
    }

    pub fn set_upload_date(&mut self, t: DateTime<Utc>) {
        self.upload_date = t;
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Change the chunk size. Only honoured before the first write.
    pub fn set_chunk_size(&mut self, size: usize) {
        if self.mode == FileMode::Write && self.length == 0 && size > 0 {
            self.chunk_size = size;
        }
    }

    /// Decode the stored metadata into `result`. Leaves `result` untouched
    /// when the file has none.
    pub fn get_meta<R: DeserializeOwned + 'static>(&self, result: &mut R) -> Result<()> {
        match &self.metadata {
            Some(meta) => decode(meta.clone(), result),
            None => Ok(()),
        }
    }

    pub fn set_meta<T: Serialize + 'static>(&mut self, meta: &T) {
        match Value::from_any(meta) {
            Ok(meta) => self.metadata = Some(meta).filter(|m| !m.is_null()),
            Err(err) => self.fail(err),
        }
    }

    fn fail(&mut self, err: MgoError) {
        if self.err.is_none() {
            self.err = Some(err);
        }
    }

    /// Append `data` to a file open for writing.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(MgoError::FileClosed);
        }
        if self.mode != FileMode::Write {
            return Err(MgoError::invalid_argument("file is open for reading"));
        }
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        append_chunked(&mut self.chunks, self.chunk_size, data);
        self.length += data.len() as u64;
        Ok(data.len())
    }

    /// Read into `buf`, continuing where the last read stopped. Returns 0 at
    /// the end of the file.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Err(MgoError::FileClosed);
        }
        if self.mode != FileMode::Read {
            return Err(MgoError::invalid_argument("file is open for writing"));
        }
        if !self.loaded {
            self.load_chunks().await?;
        }
        Ok(copy_from_chunks(&self.chunks, &mut self.pos, self.length, buf))
    }

    /// Read everything from the current position to the end.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let remaining = self.length.saturating_sub(self.pos.consumed);
        let mut out = vec![0u8; usize::try_from(remaining).unwrap_or(0)];
        let mut filled = 0;
        while filled < out.len() {
            let n = self.read(&mut out[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        out.truncate(filled);
        Ok(out)
    }

    async fn load_chunks(&mut self) -> Result<()> {
        let filter = doc! { "files_id": convert_outbound(&self.id) };
        let mut iter = self.gfs.chunks.find(&filter).sort(&["n"]).iter().await;
        let mut chunks = Vec::new();
        while let Some(chunk) = iter.next_value().await {
            let data = chunk.get("data").cloned().unwrap_or_default();
            chunks.push(chunk_bytes(&data)?);
        }
        iter.close()?;
        debug!(file = %self.name, chunks = chunks.len(), "chunks loaded");
        self.chunks = chunks;
        self.loaded = true;
        Ok(())
    }

    /// Finish the file. For a written file with content this stores the
    /// chunks and then the file document, so readers never see a file whose
    /// chunks are missing. A failed store leaves the file open and `close`
    /// can be called again. Closing a closed file does nothing.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if let Some(err) = self.err.take() {
            self.chunks = Vec::new();
            self.closed = true;
            return Err(err);
        }
        if self.mode == FileMode::Write && self.length > 0 {
            self.persist().await?;
        }
        self.chunks = Vec::new();
        self.closed = true;
        Ok(())
    }

    async fn persist(&mut self) -> Result<()> {
        let id = convert_outbound(&self.id);
        if !self.chunks_stored {
            let retry = !self.chunk_ids.is_empty();
            if !retry {
                self.md5 = checksum(&self.chunks);
                self.chunk_ids = self.chunks.iter().map(|_| bson::oid::ObjectId::new()).collect();
            }
            self.gfs
                .chunks
                .ensure_index(&Index {
                    key: vec!["files_id".into(), "n".into()],
                    unique: true,
                    ..Index::default()
                })
                .await?;
            if retry {
                // Partial leftovers of the failed attempt.
                self.gfs
                    .chunks
                    .remove_all(&doc! { "_id": { "$in": self.chunk_ids.clone() } })
                    .await?;
            }
            let chunks = chunk_documents(&id, &self.chunk_ids, &self.chunks);
            debug!(file = %self.name, length = self.length, chunks = chunks.len(), retry, "storing chunks");
            bounded(LONG_TIMEOUT, self.gfs.chunks.inner().insert_many(chunks)).await?;
            self.chunks_stored = true;
        }

        let file = self.files_document(id);
        bounded(LONG_TIMEOUT, self.gfs.files.inner().insert_one(file)).await?;
        Ok(())
    }

    fn files_document(&self, id: Bson) -> Document {
        let mut file = doc! {
            "_id": id,
            "filename": self.name.as_str(),
            "contentType": self.content_type.as_str(),
            "length": self.length as i64,
            "chunkSize": i32::try_from(self.chunk_size).unwrap_or(i32::MAX),
            "uploadDate": bson::DateTime::from_chrono(self.upload_date),
            "md5": self.md5.as_str(),
        };
        if let Some(meta) = &self.metadata {
            file.insert("metadata", convert_outbound(meta));
        }
        file
    }
}

fn chunk_documents(files_id: &Bson, ids: &[bson::oid::ObjectId], chunks: &[Vec<u8>]) -> Vec<Document> {
    ids.iter()
        .zip(chunks)
        .enumerate()
        .map(|(n, (chunk_id, data))| {
            doc! {
                "_id": *chunk_id,
                "files_id": files_id.clone(),
                "n": n as i32,
                "data": bson::Binary {
                    subtype: bson::spec::BinarySubtype::Generic,
                    bytes: data.clone(),
                },
            }
        })
        .collect()
}

/// Append `data`, starting a new chunk whenever the last one is full.
fn append_chunked(chunks: &mut Vec<Vec<u8>>, chunk_size: usize, mut data: &[u8]) {
    while !data.is_empty() {
        if chunks.last().map_or(true, |last| last.len() >= chunk_size) {
            chunks.push(Vec::with_capacity(chunk_size.min(data.len())));
        }
        let last = chunks.len() - 1;
        let current = &mut chunks[last];
        let n = (chunk_size - current.len()).min(data.len());
        current.extend_from_slice(&data[..n]);
        data = &data[n..];
    }
}

/// Copy from `pos` into `buf`, never past `length` bytes in total.
fn copy_from_chunks(chunks: &[Vec<u8>], pos: &mut ReadPos, length: u64, buf: &mut [u8]) -> usize {
    let mut written = 0;
    while written < buf.len() && pos.consumed < length && pos.chunk < chunks.len() {
        let chunk = &chunks[pos.chunk];
        if pos.offset >= chunk.len() {
            pos.chunk += 1;
            pos.offset = 0;
            continue;
        }
        let left_in_file = usize::try_from(length - pos.consumed).unwrap_or(usize::MAX);
        let n = (chunk.len() - pos.offset)
            .min(buf.len() - written)
            .min(left_in_file);
        buf[written..written + n].copy_from_slice(&chunk[pos.offset..pos.offset + n]);
        written += n;
        pos.offset += n;
        pos.consumed += n as u64;
    }
    written
}

/// Payload of a chunk document. Older writers stored plain integer arrays.
fn chunk_bytes(data: &Value) -> Result<Vec<u8>> {
    match data {
        Value::Binary(bytes) => Ok(bytes.clone()),
        Value::Other(Bson::Binary(bin)) => Ok(bin.bytes.clone()),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_i64()
                    .and_then(|b| u8::try_from(b).ok())
                    .ok_or_else(|| MgoError::decode(format!("invalid chunk byte {item:?}")))
            })
            .collect(),
        other => Err(MgoError::decode(format!("invalid chunk data {other:?}"))),
    }
}

fn checksum(chunks: &[Vec<u8>]) -> String {
    let mut hasher = Md5::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hex::encode(hasher.finalize())
}
