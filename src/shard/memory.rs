//! In-memory storage engine with a change log

use super::{ChangeOp, ChangeRecord, Document, ShardStore};
use crate::routing::{KeyRange, ShardKey};
use crate::{Error, Result};

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use uuid::Uuid;

#[derive(Debug)]
struct Collection {
    uuid: Uuid,
    documents: BTreeMap<ShardKey, serde_json::Value>,
}

#[derive(Debug)]
struct Inner {
    collections: HashMap<String, Collection>,
    /// Ordered by `seq`, at most `change_log_capacity` long
    changes: VecDeque<ChangeRecord>,
    change_log_capacity: usize,
    /// Highest sequence number dropped from the front of the log
    truncated_through: u64,
    last_seq: u64,
}

impl Inner {
    fn collection_mut(&mut self, namespace: &str) -> Result<&mut Collection> {
        self.collections
            .get_mut(namespace)
            .ok_or_else(|| Error::NamespaceNotFound(namespace.to_string()))
    }

    fn apply(&mut self, namespace: &str, key: ShardKey, op: ChangeOp) -> Result<u64> {
        let collection = self.collection_mut(namespace)?;
        match &op {
            ChangeOp::Upsert(body) => {
                collection.documents.insert(key.clone(), body.clone());
            }
            ChangeOp::Delete => {
                collection.documents.remove(&key);
            }
        }
        self.last_seq += 1;
        let seq = self.last_seq;
        self.changes.push_back(ChangeRecord {
            seq,
            namespace: namespace.to_string(),
            key,
            op,
        });
        while self.changes.len() > self.change_log_capacity {
            if let Some(dropped) = self.changes.pop_front() {
                self.truncated_through = dropped.seq;
            }
        }
        Ok(seq)
    }

    fn pending_changes<'a>(
        &'a self,
        namespace: &'a str,
        range: &'a KeyRange,
        since: u64,
    ) -> Result<impl Iterator<Item = &'a ChangeRecord> + 'a> {
        if !self.collections.contains_key(namespace) {
            return Err(Error::NamespaceNotFound(namespace.to_string()));
        }
        if since < self.truncated_through {
            return Err(Error::ChangeLogTruncated {
                since,
                oldest: self.truncated_through + 1,
            });
        }
        let start = self.changes.partition_point(|c| c.seq <= since);
        Ok(self
            .changes
            .range(start..)
            .filter(move |c| c.namespace == namespace && range.contains(&c.key)))
    }
}

/// Ordered in-memory document store
///
/// Every write is appended to a change log keyed by a shard-wide sequence
/// number so cloners can catch up on writes made during a bulk copy. The
/// log keeps only the newest `change_log_capacity` entries; a cloner whose
/// position fell off the front gets `ChangeLogTruncated` and must start over.
#[derive(Debug)]
pub struct MemoryShardStore {
    inner: RwLock<Inner>,
}

impl MemoryShardStore {
    pub const DEFAULT_CHANGE_LOG_CAPACITY: usize = 1_000_000;

    pub fn new() -> Self {
        Self::with_change_log_capacity(Self::DEFAULT_CHANGE_LOG_CAPACITY)
    }

    pub fn with_change_log_capacity(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                collections: HashMap::new(),
                changes: VecDeque::new(),
                change_log_capacity: capacity.max(1),
                truncated_through: 0,
                last_seq: 0,
            }),
        }
    }
}

impl Default for MemoryShardStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShardStore for MemoryShardStore {
    async fn create_collection(&self, namespace: &str, collection_uuid: Uuid) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.collections.get(namespace) {
            Some(existing) if existing.uuid == collection_uuid => Ok(()),
            Some(existing) => Err(Error::CollectionUuidMismatch {
                namespace: namespace.to_string(),
                expected: collection_uuid,
                actual: existing.uuid,
            }),
            None => {
                inner.collections.insert(
                    namespace.to_string(),
                    Collection {
                        uuid: collection_uuid,
                        documents: BTreeMap::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn drop_collection(&self, namespace: &str) -> Result<()> {
        let mut inner = self.inner.write();
        inner.collections.remove(namespace);
        inner.changes.retain(|c| c.namespace != namespace);
        Ok(())
    }

    async fn collection_uuid(&self, namespace: &str) -> Result<Option<Uuid>> {
        Ok(self.inner.read().collections.get(namespace).map(|c| c.uuid))
    }

    async fn upsert(&self, namespace: &str, document: Document) -> Result<u64> {
        self.inner
            .write()
            .apply(namespace, document.key, ChangeOp::Upsert(document.body))
    }

    async fn upsert_batch(&self, namespace: &str, documents: Vec<Document>) -> Result<u64> {
        let mut inner = self.inner.write();
        let mut written = 0;
        for document in documents {
            inner.apply(namespace, document.key, ChangeOp::Upsert(document.body))?;
            written += 1;
        }
        Ok(written)
    }

    async fn delete(&self, namespace: &str, key: &ShardKey) -> Result<u64> {
        self.inner
            .write()
            .apply(namespace, key.clone(), ChangeOp::Delete)
    }

    async fn get(&self, namespace: &str, key: &ShardKey) -> Result<Option<Document>> {
        let inner = self.inner.read();
        let collection = inner
            .collections
            .get(namespace)
            .ok_or_else(|| Error::NamespaceNotFound(namespace.to_string()))?;
        Ok(collection.documents.get(key).map(|body| Document {
            key: key.clone(),
            body: body.clone(),
        }))
    }

    async fn scan_range(
        &self,
        namespace: &str,
        range: &KeyRange,
        after: Option<&ShardKey>,
        limit: usize,
    ) -> Result<Vec<Document>> {
        let inner = self.inner.read();
        let collection = inner
            .collections
            .get(namespace)
            .ok_or_else(|| Error::NamespaceNotFound(namespace.to_string()))?;

        if range.is_empty() || after.is_some_and(|k| k >= &range.max) {
            return Ok(Vec::new());
        }
        let lower = match after {
            Some(key) if key >= &range.min => Bound::Excluded(key.clone()),
            _ => Bound::Included(range.min.clone()),
        };
        Ok(collection
            .documents
            .range((lower, Bound::Excluded(range.max.clone())))
            .take(limit)
            .map(|(key, body)| Document {
                key: key.clone(),
                body: body.clone(),
            })
            .collect())
    }

    async fn latest_seq(&self) -> Result<u64> {
        Ok(self.inner.read().last_seq)
    }

    async fn changes_since(
        &self,
        namespace: &str,
        range: &KeyRange,
        since: u64,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>> {
        let inner = self.inner.read();
        let changes = inner
            .pending_changes(namespace, range, since)?
            .take(limit)
            .cloned()
            .collect();
        Ok(changes)
    }

    async fn count_changes_since(
        &self,
        namespace: &str,
        range: &KeyRange,
        since: u64,
    ) -> Result<u64> {
        let inner = self.inner.read();
        let count = inner.pending_changes(namespace, range, since)?.count() as u64;
        Ok(count)
    }

    async fn apply_changes(&self, namespace: &str, changes: Vec<ChangeRecord>) -> Result<u64> {
        let mut inner = self.inner.write();
        let mut applied = 0;
        for change in changes {
            inner.apply(namespace, change.key, change.op)?;
            applied += 1;
        }
        Ok(applied)
    }

    async fn delete_range_batch(
        &self,
        namespace: &str,
        collection_uuid: Uuid,
        range: &KeyRange,
        limit: usize,
    ) -> Result<u64> {
        let mut inner = self.inner.write();
        let collection = inner.collection_mut(namespace)?;
        if collection.uuid != collection_uuid {
            return Err(Error::CollectionUuidMismatch {
                namespace: namespace.to_string(),
                expected: collection_uuid,
                actual: collection.uuid,
            });
        }
        if range.is_empty() {
            return Ok(0);
        }

        // orphan cleanup is not a user write, so it stays out of the change log
        let victims: Vec<ShardKey> = collection
            .documents
            .range(range.min.clone()..range.max.clone())
            .take(limit)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &victims {
            collection.documents.remove(key);
        }
        Ok(victims.len() as u64)
    }

    async fn count_in_range(&self, namespace: &str, range: &KeyRange) -> Result<u64> {
        let inner = self.inner.read();
        let collection = inner
            .collections
            .get(namespace)
            .ok_or_else(|| Error::NamespaceNotFound(namespace.to_string()))?;
        if range.is_empty() {
            return Ok(0);
        }
        Ok(collection
            .documents
            .range(range.min.clone()..range.max.clone())
            .count() as u64)
    }
}
