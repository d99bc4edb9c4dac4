//! Durable FIFO queue of writes awaiting replay against the remote store.
//!
//! The queue is the only state shared between the CRUD hot path and a
//! running sync pass. All access goes through an internal mutex, and each
//! mutation is persisted before the lock is released, so a concurrent
//! enqueue during a drain is neither lost nor replayed twice.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use tandem_common::{EntityType, Error, OperationKind, Record, Result};

use crate::state::write_atomic;

/// A queued, not yet confirmed write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub kind: OperationKind,
    /// When the write was made, not when it was last attempted.
    pub timestamp: DateTime<Utc>,
    /// Record to send. `None` for deletes.
    pub payload: Option<Record>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Enqueue order, breaks timestamp ties.
    #[serde(default)]
    sequence: u64,
}

impl PendingOperation {
    pub fn new(
        kind: OperationKind,
        entity_type: EntityType,
        entity_id: Uuid,
        payload: Option<Record>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_type,
            entity_id,
            kind,
            timestamp: Utc::now(),
            payload,
            retry_count: 0,
            last_error: None,
            sequence: 0,
        }
    }

    /// Queue entry for pushing `record` with the given kind.
    pub fn for_record(kind: OperationKind, record: &Record) -> Self {
        Self::new(kind, record.entity_type().clone(), record.id(), Some(record.clone()))
    }

    pub fn delete(entity_type: EntityType, entity_id: Uuid) -> Self {
        Self::new(OperationKind::Delete, entity_type, entity_id, None)
    }

    /// Whether this entry has used up its automatic replays.
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }

    fn same_write(&self, other: &PendingOperation) -> bool {
        self.entity_type == other.entity_type
            && self.entity_id == other.entity_id
            && self.kind == other.kind
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    ops: Vec<PendingOperation>,
    next_sequence: u64,
}

impl QueueInner {
    fn position(&self, id: Uuid) -> Option<usize> {
        self.ops.iter().position(|op| op.id == id)
    }
}

/// Append-only pending operation log.
pub struct PendingQueue {
    inner: Mutex<QueueInner>,
    path: Option<PathBuf>,
}

impl PendingQueue {
    pub const FILE_NAME: &'static str = "pending_queue.json";

    /// A queue that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            path: None,
        }
    }

    /// Open (or create) the queue persisted at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let ops: Vec<PendingOperation> = match tokio::fs::read_to_string(&path).await {
            Ok(json) => serde_json::from_str(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let next_sequence = ops.iter().map(|op| op.sequence + 1).max().unwrap_or(0);
        debug!("Loaded {} pending operations from {}", ops.len(), path.display());

        Ok(Self {
            inner: Mutex::new(QueueInner { ops, next_sequence }),
            path: Some(path),
        })
    }

    /// Queue file inside `state_dir`.
    pub async fn open_in_dir(state_dir: impl AsRef<Path>) -> Result<Self> {
        Self::open(state_dir.as_ref().join(Self::FILE_NAME)).await
    }

    async fn persist(&self, inner: &QueueInner) -> Result<()> {
        match &self.path {
            Some(path) => {
                let json = serde_json::to_vec_pretty(&inner.ops)?;
                write_atomic(path, &json).await
            }
            None => Ok(()),
        }
    }

    /// Append an operation. Returns its id.
    pub async fn enqueue(&self, op: PendingOperation) -> Result<Uuid> {
        let mut inner = self.inner.lock().await;
        self.push_locked(&mut inner, op).await
    }

    /// Append unless a write of the same kind for the same record is
    /// already queued. Returns the id of the new entry, if any.
    pub async fn enqueue_unique(&self, op: PendingOperation) -> Result<Option<Uuid>> {
        let mut inner = self.inner.lock().await;
        if inner.ops.iter().any(|queued| queued.same_write(&op)) {
            debug!("{} {}/{} already queued", op.kind, op.entity_type, op.entity_id);
            return Ok(None);
        }
        self.push_locked(&mut inner, op).await.map(Some)
    }

    async fn push_locked(&self, inner: &mut QueueInner, mut op: PendingOperation) -> Result<Uuid> {
        op.sequence = inner.next_sequence;
        let id = op.id;
        debug!("Queueing {} {}/{} as {}", op.kind, op.entity_type, op.entity_id, id);

        inner.ops.push(op);
        if let Err(e) = self.persist(inner).await {
            inner.ops.pop();
            return Err(e);
        }
        inner.next_sequence += 1;
        Ok(id)
    }

    /// All queued operations, oldest first.
    pub async fn get_pending(&self) -> Vec<PendingOperation> {
        let inner = self.inner.lock().await;
        let mut ops = inner.ops.clone();
        ops.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.sequence.cmp(&b.sequence))
        });
        ops
    }

    /// Remove a confirmed operation. Returns `false` if it was not queued.
    pub async fn remove(&self, id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(index) = inner.position(id) else {
            return Ok(false);
        };
        let removed = inner.ops.remove(index);
        if let Err(e) = self.persist(&inner).await {
            inner.ops.insert(index, removed);
            return Err(e);
        }
        Ok(true)
    }

    /// Count a failed replay. Returns the new retry count.
    pub async fn record_failure(&self, id: Uuid, error: &str) -> Result<u32> {
        let mut inner = self.inner.lock().await;
        let Some(index) = inner.position(id) else {
            return Err(Error::NotFound(format!("Pending operation {}", id)));
        };

        let before = inner.ops[index].clone();
        let op = &mut inner.ops[index];
        op.retry_count += 1;
        op.last_error = Some(error.to_string());
        let count = op.retry_count;

        if let Err(e) = self.persist(&inner).await {
            inner.ops[index] = before;
            return Err(e);
        }
        Ok(count)
    }

    /// Re-arm an operation for automatic replay.
    pub async fn reset_retries(&self, id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(index) = inner.position(id) else {
            return Ok(false);
        };

        let before = inner.ops[index].clone();
        let op = &mut inner.ops[index];
        op.retry_count = 0;
        op.last_error = None;

        if let Err(e) = self.persist(&inner).await {
            inner.ops[index] = before;
            return Err(e);
        }
        Ok(true)
    }

    /// Whether any write for the record is queued.
    pub async fn contains_entity(&self, entity_type: &EntityType, entity_id: Uuid) -> bool {
        let inner = self.inner.lock().await;
        inner
            .ops
            .iter()
            .any(|op| &op.entity_type == entity_type && op.entity_id == entity_id)
    }

    /// When the newest queued write for the record was made.
    pub async fn latest_write(&self, entity_type: &EntityType, entity_id: Uuid) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().await;
        inner
            .ops
            .iter()
            .filter(|op| &op.entity_type == entity_type && op.entity_id == entity_id)
            .map(|op| op.timestamp)
            .max()
    }

    /// Drop every queued write for one record. Returns how many were dropped.
    pub async fn remove_entity(&self, entity_type: &EntityType, entity_id: Uuid) -> Result<usize> {
        self.remove_where(|op| &op.entity_type == entity_type && op.entity_id == entity_id)
            .await
    }

    /// Drop the record's queued writes made at or before `until`. Later
    /// writes stay queued.
    pub async fn remove_entity_until(
        &self,
        entity_type: &EntityType,
        entity_id: Uuid,
        until: DateTime<Utc>,
    ) -> Result<usize> {
        self.remove_where(|op| {
            &op.entity_type == entity_type && op.entity_id == entity_id && op.timestamp <= until
        })
        .await
    }

    async fn remove_where<F>(&self, matches: F) -> Result<usize>
    where
        F: Fn(&PendingOperation) -> bool,
    {
        let mut inner = self.inner.lock().await;
        let before = inner.ops.clone();
        inner.ops.retain(|op| !matches(op));
        let dropped = before.len() - inner.ops.len();
        if dropped == 0 {
            return Ok(0);
        }
        if let Err(e) = self.persist(&inner).await {
            inner.ops = before;
            return Err(e);
        }
        Ok(dropped)
    }

    /// Drop everything. Returns the number of removed operations.
    pub async fn clear(&self) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let removed = std::mem::take(&mut inner.ops);
        if let Err(e) = self.persist(&inner).await {
            warn!("Failed to persist cleared queue: {}", e);
            inner.ops = removed;
            return Err(e);
        }
        Ok(removed.len())
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.ops.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn task() -> EntityType {
        EntityType::new("task").unwrap()
    }

    fn update_op(record: &Record) -> PendingOperation {
        PendingOperation::for_record(OperationKind::Update, record)
    }

    #[tokio::test]
    async fn test_fifo_order_for_same_entity() {
        let queue = PendingQueue::in_memory();
        let mut record = Record::new(task(), serde_json::json!({ "step": 0 }));

        let mut ids = Vec::new();
        for step in 1..=3 {
            record.data = serde_json::json!({ "step": step });
            record.touch();
            ids.push(queue.enqueue(update_op(&record)).await.unwrap());
        }

        let pending: Vec<Uuid> = queue.get_pending().await.iter().map(|op| op.id).collect();
        assert_eq!(pending, ids);
    }

    #[tokio::test]
    async fn test_equal_timestamps_keep_enqueue_order() {
        let queue = PendingQueue::in_memory();
        let record = Record::new(task(), serde_json::json!({}));
        let stamp = Utc::now();

        let mut ids = Vec::new();
        for _ in 0..5 {
            let mut op = update_op(&record);
            op.timestamp = stamp;
            ids.push(queue.enqueue(op).await.unwrap());
        }

        let pending: Vec<Uuid> = queue.get_pending().await.iter().map(|op| op.id).collect();
        assert_eq!(pending, ids);
    }

    #[tokio::test]
    async fn test_enqueue_unique() {
        let queue = PendingQueue::in_memory();
        let record = Record::new(task(), serde_json::json!({}));

        let create = PendingOperation::for_record(OperationKind::Create, &record);
        assert!(queue.enqueue_unique(create.clone()).await.unwrap().is_some());
        assert!(queue
            .enqueue_unique(PendingOperation::for_record(OperationKind::Create, &record))
            .await
            .unwrap()
            .is_none());
        assert!(queue.enqueue_unique(update_op(&record)).await.unwrap().is_some());
        assert_eq!(queue.len().await, 2);
        assert!(queue.contains_entity(&task(), record.id()).await);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let queue = PendingQueue::in_memory();
        let record = Record::new(task(), serde_json::json!({}));

        let id = queue.enqueue(update_op(&record)).await.unwrap();
        queue.enqueue(PendingOperation::delete(task(), record.id())).await.unwrap();

        assert!(queue.remove(id).await.unwrap());
        assert!(!queue.remove(id).await.unwrap());
        assert_eq!(queue.len().await, 1);

        assert_eq!(queue.clear().await.unwrap(), 1);
        assert!(queue.is_empty().await);

        queue.enqueue(update_op(&record)).await.unwrap();
        queue.enqueue(PendingOperation::delete(task(), record.id())).await.unwrap();
        let other = Record::new(task(), serde_json::json!({}));
        queue.enqueue(update_op(&other)).await.unwrap();
        assert_eq!(queue.remove_entity(&task(), record.id()).await.unwrap(), 2);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_failures_and_exhaustion() {
        let queue = PendingQueue::in_memory();
        let record = Record::new(task(), serde_json::json!({}));
        let id = queue.enqueue(update_op(&record)).await.unwrap();

        for expected in 1..=3 {
            assert_eq!(queue.record_failure(id, "boom").await.unwrap(), expected);
        }
        let held = queue.get_pending().await.remove(0);
        assert!(held.is_exhausted(3));
        assert_eq!(held.last_error.as_deref(), Some("boom"));

        assert!(queue.reset_retries(id).await.unwrap());
        assert!(!queue.get_pending().await[0].is_exhausted(3));
        assert!(queue.record_failure(Uuid::new_v4(), "gone").await.is_err());
    }

    #[tokio::test]
    async fn test_remove_entity_until_keeps_later_writes() {
        let queue = PendingQueue::in_memory();
        let record = Record::new(task(), serde_json::json!({}));
        let cutoff = Utc::now();

        let mut early = update_op(&record);
        early.timestamp = cutoff - chrono::Duration::minutes(5);
        queue.enqueue(early).await.unwrap();
        let mut late = PendingOperation::delete(task(), record.id());
        late.timestamp = cutoff + chrono::Duration::minutes(5);
        let late_id = queue.enqueue(late.clone()).await.unwrap();

        assert_eq!(queue.latest_write(&task(), record.id()).await, Some(late.timestamp));
        assert_eq!(queue.remove_entity_until(&task(), record.id(), cutoff).await.unwrap(), 1);

        let pending = queue.get_pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, late_id);
        assert_eq!(queue.latest_write(&task(), Uuid::new_v4()).await, None);
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_retry_count_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PendingQueue::FILE_NAME);
        let queue = PendingQueue::open(&path).await.unwrap();
        let record = Record::new(task(), serde_json::json!({}));
        let id = queue.enqueue(update_op(&record)).await.unwrap();

        // A directory in place of the queue file makes every write fail.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(queue.record_failure(id, "boom").await.is_err());
        let op = queue.get_pending().await.remove(0);
        assert_eq!(op.retry_count, 0);
        assert_eq!(op.last_error, None);
    }

    #[tokio::test]
    async fn test_persistence_keeps_order_and_retry_counts() {
        let dir = TempDir::new().unwrap();
        let record = Record::new(task(), serde_json::json!({}));

        let (first, second) = {
            let queue = PendingQueue::open_in_dir(dir.path()).await.unwrap();
            let first = queue.enqueue(update_op(&record)).await.unwrap();
            let second = queue
                .enqueue(PendingOperation::delete(task(), record.id()))
                .await
                .unwrap();
            queue.record_failure(first, "timeout").await.unwrap();
            (first, second)
        };

        let reopened = PendingQueue::open_in_dir(dir.path()).await.unwrap();
        let pending = reopened.get_pending().await;
        assert_eq!(pending.iter().map(|op| op.id).collect::<Vec<_>>(), vec![first, second]);
        assert_eq!(pending[0].retry_count, 1);

        let third = reopened.enqueue(update_op(&record)).await.unwrap();
        assert_eq!(reopened.get_pending().await.last().map(|op| op.id), Some(third));
    }

    #[tokio::test]
    async fn test_concurrent_enqueue_is_not_lost() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(PendingQueue::open_in_dir(dir.path()).await.unwrap());

        let mut handles = Vec::new();
        for n in 0..20 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let record = Record::new(task(), serde_json::json!({ "n": n }));
                queue.enqueue(update_op(&record)).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(queue.len().await, 20);
        let reopened = PendingQueue::open_in_dir(dir.path()).await.unwrap();
        assert_eq!(reopened.len().await, 20);
    }
}
