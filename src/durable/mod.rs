//! Per-shard durable document log
//!
//! Coordinator documents and range deletion tasks are written here. A write
//! returns only once it is durable (visible to any later process that opens
//! the same log), so anything a caller observes as persisted survives a crash.

mod object_store;

pub use self::object_store::ObjectStoreLog;

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Document families kept in a shard's durable log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    /// Migration coordinator documents (donor side)
    Migrations,
    /// Range deletion tasks, including reservations
    RangeDeletions,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Migrations => "migrations",
            DocumentKind::RangeDeletions => "range_deletions",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monotonic position of an acknowledged write
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogPosition(pub i64);

/// Raw document read back from the log
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub key: String,
    pub document: Bytes,
}

/// Durable key/document log scoped to one shard
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Insert or replace `key`; returns after the write is durable
    async fn append_durable(&self, kind: DocumentKind, key: &str, document: Bytes)
        -> Result<LogPosition>;

    /// Read one document
    async fn read(&self, kind: DocumentKind, key: &str) -> Result<Option<Bytes>>;

    /// All documents of a kind, ordered by key
    async fn read_all_pending(&self, kind: DocumentKind) -> Result<Vec<LogEntry>>;

    /// Remove `key`; removing a missing key succeeds
    async fn remove_durable(&self, kind: DocumentKind, key: &str) -> Result<LogPosition>;
}

/// Typed view over one document kind of a [`DurableLog`]
pub struct DocumentCollection<T> {
    log: Arc<dyn DurableLog>,
    kind: DocumentKind,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for DocumentCollection<T> {
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
            kind: self.kind,
            _marker: PhantomData,
        }
    }
}

impl<T> DocumentCollection<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(log: Arc<dyn DurableLog>, kind: DocumentKind) -> Self {
        Self {
            log,
            kind,
            _marker: PhantomData,
        }
    }

    pub async fn put(&self, key: &str, document: &T) -> Result<LogPosition> {
        let bytes = serde_json::to_vec(document)?;
        self.log
            .append_durable(self.kind, key, Bytes::from(bytes))
            .await
    }

    pub async fn get(&self, key: &str) -> Result<Option<T>> {
        match self.log.read(self.kind, key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self) -> Result<Vec<T>> {
        self.log
            .read_all_pending(self.kind)
            .await?
            .into_iter()
            .map(|entry| serde_json::from_slice(&entry.document).map_err(Into::into))
            .collect()
    }

    pub async fn remove(&self, key: &str) -> Result<LogPosition> {
        self.log.remove_durable(self.kind, key).await
    }
}
