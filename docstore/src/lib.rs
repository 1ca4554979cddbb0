mod memory;

pub use memory::MemoryDb;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::pin::Pin;
use thiserror::Error;

/// The largest number of writes the backend will accept in one atomic
/// commit. Callers that need to write more documents must split their work
/// into multiple commits and accept that the split is not atomic.
pub const MAX_DOCS_PER_TXN: usize = 500;

#[derive(Debug, Error)]
pub enum DocError {
    #[error("batch of {0} writes exceeds the {MAX_DOCS_PER_TXN} write commit limit")]
    BatchTooLarge(usize),

    #[error("snapshot stream broke and must be recreated")]
    WatchInterrupted,

    #[error("error deserializing document {id}")]
    Decode {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("error serializing document payload")]
    Encode(#[source] serde_json::Error),
}

/// One stored document. `update_time` is assigned by the backend on every
/// write and is the only ordering signal snapshot consumers get.
#[derive(Debug, Clone, PartialEq)]
pub struct Doc {
    pub id: String,
    pub data: serde_json::Value,
    pub update_time: DateTime<Utc>,
}

impl Doc {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, DocError> {
        serde_json::from_value(self.data.clone()).map_err(|source| DocError::Decode {
            id: self.id.clone(),
            source,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A single field comparison. Strings compare lexicographically, which is
/// equivalent to numeric comparison for the fixed-width lowercase hex values
/// this crate's consumers filter on.
#[derive(Debug, Clone)]
pub struct FieldFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: serde_json::Value,
}

impl FieldFilter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<serde_json::Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<FieldFilter>,
    pub order_by: Vec<(String, Direction)>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: Vec::new(),
            offset: 0,
            limit: None,
        }
    }

    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<serde_json::Value>) -> Self {
        self.filters.push(FieldFilter::new(field, op, value));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by.push((field.into(), direction));
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One write in a commit batch.
#[derive(Debug, Clone)]
pub enum Write {
    /// Replace the whole document, creating it if absent.
    Set {
        collection: String,
        id: String,
        data: serde_json::Value,
    },
    /// Shallow-merge the given fields into the document, creating it if
    /// absent.
    Merge {
        collection: String,
        id: String,
        fields: serde_json::Value,
    },
    Delete {
        collection: String,
        id: String,
    },
}

impl Write {
    pub fn set<T: Serialize>(
        collection: impl Into<String>,
        id: impl Into<String>,
        value: &T,
    ) -> Result<Self, DocError> {
        Ok(Write::Set {
            collection: collection.into(),
            id: id.into(),
            data: serde_json::to_value(value).map_err(DocError::Encode)?,
        })
    }

    pub fn merge<T: Serialize>(
        collection: impl Into<String>,
        id: impl Into<String>,
        fields: &T,
    ) -> Result<Self, DocError> {
        Ok(Write::Merge {
            collection: collection.into(),
            id: id.into(),
            fields: serde_json::to_value(fields).map_err(DocError::Encode)?,
        })
    }
}

/// A change-stream over one query. The first item yields every document
/// currently matching the query; each subsequent item yields only the
/// matching documents whose `update_time` changed since the previous item.
/// Deletions are not surfaced; consumers treat the stream as merge-only.
///
/// After `next` returns `Err` the stream is dead and the consumer must open
/// a fresh watch.
pub struct SnapshotStream {
    inner: Pin<Box<dyn Stream<Item = Result<Vec<Doc>, DocError>> + Send>>,
}

impl SnapshotStream {
    pub fn new(inner: Pin<Box<dyn Stream<Item = Result<Vec<Doc>, DocError>> + Send>>) -> Self {
        Self { inner }
    }

    /// Waits for the next snapshot. `None` means the backend shut down.
    /// Cancel-safe.
    pub async fn next(&mut self) -> Option<Result<Vec<Doc>, DocError>> {
        futures::StreamExt::next(&mut self.inner).await
    }
}

/// The narrow surface the document database offers: point reads, filtered
/// queries, atomic write batches, and per-query snapshot streams. There are
/// no multi-document transactions beyond the one-batch commit.
#[async_trait]
pub trait DocumentDb: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Doc>, DocError>;

    async fn run_query(&self, query: &Query) -> Result<Vec<Doc>, DocError>;

    /// Applies the batch atomically. Fails without side effects if the batch
    /// exceeds [`MAX_DOCS_PER_TXN`].
    async fn commit(&self, writes: Vec<Write>) -> Result<(), DocError>;

    fn watch(&self, query: Query) -> SnapshotStream;
}
