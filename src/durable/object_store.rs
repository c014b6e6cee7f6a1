//! `DurableLog` backed by an object store
//!
//! Each document is one object at `{prefix}/{kind}/{key}.json`. Object store
//! puts are acknowledged only once durable, which is the guarantee the
//! migration protocol needs from its local log.

use super::{DocumentKind, DurableLog, LogEntry, LogPosition};
use crate::clock::BoundedClock;
use crate::{Error, Result};

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::ObjectStore;
use std::sync::Arc;
use tracing::debug;

pub struct ObjectStoreLog {
    object_store: Arc<dyn ObjectStore>,
    prefix: String,
    clock: Arc<BoundedClock>,
}

impl ObjectStoreLog {
    /// Log rooted at `shards/{shard_id}` in the given store
    pub fn for_shard(
        object_store: Arc<dyn ObjectStore>,
        shard_id: &str,
        clock: Arc<BoundedClock>,
    ) -> Self {
        Self::new(object_store, format!("shards/{}", shard_id), clock)
    }

    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        clock: Arc<BoundedClock>,
    ) -> Self {
        Self {
            object_store,
            prefix: prefix.into(),
            clock,
        }
    }

    fn kind_prefix(&self, kind: DocumentKind) -> Path {
        Path::from(self.prefix.as_str()).child(kind.as_str())
    }

    fn document_path(&self, kind: DocumentKind, key: &str) -> Path {
        self.kind_prefix(kind).child(format!("{}.json", key))
    }
}

#[async_trait]
impl DurableLog for ObjectStoreLog {
    async fn append_durable(
        &self,
        kind: DocumentKind,
        key: &str,
        document: Bytes,
    ) -> Result<LogPosition> {
        let path = self.document_path(kind, key);
        self.object_store.put(&path, document.into()).await?;
        let position = LogPosition(self.clock.now_nanos());
        debug!(%path, position = position.0, "Durable write acknowledged");
        Ok(position)
    }

    async fn read(&self, kind: DocumentKind, key: &str) -> Result<Option<Bytes>> {
        let path = self.document_path(kind, key);
        match self.object_store.get(&path).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(Error::ObjectStore(e)),
        }
    }

    async fn read_all_pending(&self, kind: DocumentKind) -> Result<Vec<LogEntry>> {
        let prefix = self.kind_prefix(kind);
        let mut objects: Vec<_> = self
            .object_store
            .list(Some(&prefix))
            .try_collect()
            .await?;
        objects.sort_by(|a, b| a.location.cmp(&b.location));

        let mut entries = Vec::with_capacity(objects.len());
        for meta in objects {
            let Some(key) = meta
                .location
                .filename()
                .and_then(|name| name.strip_suffix(".json"))
                .map(str::to_string)
            else {
                continue;
            };
            // removed between list and get
            match self.object_store.get(&meta.location).await {
                Ok(result) => entries.push(LogEntry {
                    key,
                    document: result.bytes().await?,
                }),
                Err(object_store::Error::NotFound { .. }) => continue,
                Err(e) => return Err(Error::ObjectStore(e)),
            }
        }
        Ok(entries)
    }

    async fn remove_durable(&self, kind: DocumentKind, key: &str) -> Result<LogPosition> {
        let path = self.document_path(kind, key);
        match self.object_store.delete(&path).await {
            Ok(_) | Err(object_store::Error::NotFound { .. }) => {
                Ok(LogPosition(self.clock.now_nanos()))
            }
            Err(e) => Err(Error::ObjectStore(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::DocumentCollection;
    use object_store::memory::InMemory;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        body: String,
    }

    fn log(store: Arc<dyn ObjectStore>, shard: &str) -> Arc<dyn DurableLog> {
        Arc::new(ObjectStoreLog::for_shard(
            store,
            shard,
            Arc::new(BoundedClock::default()),
        ))
    }

    #[tokio::test]
    async fn test_documents_survive_reopen() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let notes =
            DocumentCollection::<Note>::new(log(store.clone(), "a"), DocumentKind::Migrations);
        let note = Note {
            id: "m1".to_string(),
            body: "cloning".to_string(),
        };
        let first = notes.put("m1", &note).await.unwrap();

        let reopened = DocumentCollection::<Note>::new(log(store, "a"), DocumentKind::Migrations);
        assert_eq!(reopened.get("m1").await.unwrap(), Some(note.clone()));
        assert_eq!(reopened.list().await.unwrap(), vec![note]);

        let removed = reopened.remove("m1").await.unwrap();
        assert!(removed > first, "log positions must advance");
        assert!(reopened.get("m1").await.unwrap().is_none());
        // removing twice is fine
        reopened.remove("m1").await.unwrap();
    }

    #[tokio::test]
    async fn test_kinds_and_shards_are_isolated() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let a = log(store.clone(), "a");
        let b = log(store, "b");

        a.append_durable(DocumentKind::Migrations, "x", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        assert_eq!(a.read_all_pending(DocumentKind::Migrations).await.unwrap().len(), 1);
        assert!(a.read_all_pending(DocumentKind::RangeDeletions).await.unwrap().is_empty());
        assert!(b.read_all_pending(DocumentKind::Migrations).await.unwrap().is_empty());
    }
}
