//! In-memory stores for tests and development.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use tandem_common::{EntityType, Error, OperationKind, Record, Result};

use crate::local::LocalStore;
use crate::remote::{BatchConflict, BatchOutcome, RemoteChange, RemoteStore};

type Table = HashMap<EntityType, HashMap<Uuid, Record>>;

/// In-memory local store.
///
/// All data is lost on drop.
#[derive(Default)]
pub struct MemoryLocalStore {
    tables: RwLock<Table>,
}

impl MemoryLocalStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, entity_type: &EntityType, id: Uuid) -> Result<Option<Record>> {
        let tables = self.tables.read().await;
        Ok(tables.get(entity_type).and_then(|t| t.get(&id)).cloned())
    }

    async fn get_all(&self, entity_type: &EntityType) -> Result<Vec<Record>> {
        let tables = self.tables.read().await;
        let mut records: Vec<Record> = tables
            .get(entity_type)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by_key(|r| r.created_at());
        Ok(records)
    }

    async fn put(&self, record: &Record) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables
            .entry(record.entity_type().clone())
            .or_default()
            .insert(record.id(), record.clone());
        Ok(())
    }

    async fn add(&self, record: &Record) -> Result<()> {
        let mut tables = self.tables.write().await;
        let table = tables.entry(record.entity_type().clone()).or_default();
        if table.contains_key(&record.id()) {
            return Err(Error::AlreadyExists(format!(
                "{} {} already stored locally",
                record.entity_type(),
                record.id()
            )));
        }
        table.insert(record.id(), record.clone());
        Ok(())
    }

    async fn delete(&self, entity_type: &EntityType, id: Uuid) -> Result<bool> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .get_mut(entity_type)
            .map(|t| t.remove(&id).is_some())
            .unwrap_or(false))
    }

    async fn count(&self, entity_type: &EntityType) -> Result<usize> {
        let tables = self.tables.read().await;
        Ok(tables.get(entity_type).map(|t| t.len()).unwrap_or(0))
    }
}

#[derive(Default)]
struct RemoteState {
    records: Table,
    changes: Vec<RemoteChange>,
}

impl RemoteState {
    /// Server acceptance time, strictly increasing across the feed.
    fn next_changed_at(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.changes.last() {
            Some(last) if last.changed_at >= now => last.changed_at + Duration::microseconds(1),
            _ => now,
        }
    }

    fn log(&mut self, operation: OperationKind, entity_type: &EntityType, id: Uuid, record: Option<Record>) {
        let changed_at = self.next_changed_at();
        let modified_at = record.as_ref().map(|r| r.modified_at()).unwrap_or(changed_at);
        self.changes.push(RemoteChange {
            entity_type: entity_type.clone(),
            entity_id: id,
            operation,
            modified_at,
            changed_at,
            record,
        });
    }

    fn upsert(&mut self, record: &Record) {
        let table = self.records.entry(record.entity_type().clone()).or_default();
        let operation = if table.contains_key(&record.id()) {
            OperationKind::Update
        } else {
            OperationKind::Create
        };
        table.insert(record.id(), record.clone());
        self.log(operation, record.entity_type(), record.id(), Some(record.clone()));
    }
}

/// In-memory emulation of the authoritative server.
///
/// Every accepted write lands in a change feed, so pulls behave like the
/// real sync endpoint. Fault injection switches let tests take the server
/// offline, fail writes for particular records, or return garbage.
#[derive(Default)]
pub struct MemoryRemoteStore {
    state: RwLock<RemoteState>,
    unreachable: AtomicBool,
    corrupt_reads: AtomicBool,
    failing_ids: RwLock<HashSet<Uuid>>,
    write_calls: AtomicUsize,
}

impl MemoryRemoteStore {
    /// Create a new empty, reachable server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing or regaining the network.
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Make reads answer with a malformed payload.
    pub fn set_corrupt_reads(&self, corrupt: bool) {
        self.corrupt_reads.store(corrupt, Ordering::SeqCst);
    }

    /// Fail every write touching `id` until [`Self::clear_failures`].
    pub async fn fail_writes_for(&self, id: Uuid) {
        self.failing_ids.write().await.insert(id);
    }

    /// Stop injecting per-record write failures.
    pub async fn clear_failures(&self) {
        self.failing_ids.write().await.clear();
    }

    /// Number of create/update/delete calls that reached the server.
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Store a record as if another device had written it.
    pub async fn apply_external(&self, record: Record) {
        self.state.write().await.upsert(&record);
    }

    /// Delete a record as if another device had removed it.
    pub async fn delete_external(&self, entity_type: &EntityType, id: Uuid) {
        let mut state = self.state.write().await;
        let removed = state
            .records
            .get_mut(entity_type)
            .map(|t| t.remove(&id).is_some())
            .unwrap_or(false);
        if removed {
            state.log(OperationKind::Delete, entity_type, id, None);
        }
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Network("Remote store unreachable".to_string()));
        }
        Ok(())
    }

    fn check_readable(&self) -> Result<()> {
        self.check_reachable()?;
        if self.corrupt_reads.load(Ordering::SeqCst) {
            return Err(Error::Serialization(
                "Failed to parse response: expected value at line 1 column 1".to_string(),
            ));
        }
        Ok(())
    }

    async fn check_writable(&self, id: Uuid) -> Result<()> {
        self.check_reachable()?;
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_ids.read().await.contains(&id) {
            return Err(Error::Network(format!("Injected failure for {}", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn health(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn get(&self, entity_type: &EntityType, id: Uuid) -> Result<Option<Record>> {
        self.check_readable()?;
        let state = self.state.read().await;
        Ok(state.records.get(entity_type).and_then(|t| t.get(&id)).cloned())
    }

    async fn get_all(&self, entity_type: &EntityType) -> Result<Vec<Record>> {
        self.check_readable()?;
        let state = self.state.read().await;
        let mut records: Vec<Record> = state
            .records
            .get(entity_type)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by_key(|r| r.created_at());
        Ok(records)
    }

    async fn create(&self, record: &Record) -> Result<Record> {
        self.check_writable(record.id()).await?;
        let mut state = self.state.write().await;
        let exists = state
            .records
            .get(record.entity_type())
            .map(|t| t.contains_key(&record.id()))
            .unwrap_or(false);
        if exists {
            return Err(Error::AlreadyExists(format!(
                "{} {} already exists",
                record.entity_type(),
                record.id()
            )));
        }
        state.upsert(record);
        Ok(record.clone())
    }

    async fn update(&self, record: &Record) -> Result<Record> {
        self.check_writable(record.id()).await?;
        let mut state = self.state.write().await;
        let exists = state
            .records
            .get(record.entity_type())
            .map(|t| t.contains_key(&record.id()))
            .unwrap_or(false);
        if !exists {
            return Err(Error::NotFound(format!(
                "{} {} not found",
                record.entity_type(),
                record.id()
            )));
        }
        state.upsert(record);
        Ok(record.clone())
    }

    async fn delete(&self, entity_type: &EntityType, id: Uuid) -> Result<()> {
        self.check_writable(id).await?;
        let mut state = self.state.write().await;
        let removed = state
            .records
            .get_mut(entity_type)
            .map(|t| t.remove(&id).is_some())
            .unwrap_or(false);
        if !removed {
            return Err(Error::NotFound(format!("{} {} not found", entity_type, id)));
        }
        state.log(OperationKind::Delete, entity_type, id, None);
        Ok(())
    }

    async fn count(&self, entity_type: &EntityType) -> Result<usize> {
        self.check_readable()?;
        let state = self.state.read().await;
        Ok(state.records.get(entity_type).map(|t| t.len()).unwrap_or(0))
    }

    async fn batch_upload(&self, entity_type: &EntityType, items: &[Record]) -> Result<BatchOutcome> {
        self.check_reachable()?;
        let mut state = self.state.write().await;
        let mut outcome = BatchOutcome::default();

        for item in items {
            if item.entity_type() != entity_type {
                return Err(Error::InvalidInput(format!(
                    "Batch for {} contains a {} record",
                    entity_type,
                    item.entity_type()
                )));
            }

            let stored = state
                .records
                .get(entity_type)
                .and_then(|t| t.get(&item.id()))
                .cloned();

            match stored {
                Some(server) if server.modified_at() > item.modified_at() => {
                    outcome.conflicts.push(BatchConflict {
                        entity_id: item.id(),
                        server_record: server,
                    });
                }
                // Re-upload of the exact stored version: confirm without a new feed entry.
                Some(server) if server == *item => outcome.accepted += 1,
                _ => {
                    state.upsert(item);
                    outcome.accepted += 1;
                }
            }
        }

        Ok(outcome)
    }

    async fn changes_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteChange>> {
        self.check_readable()?;
        let state = self.state.read().await;
        Ok(state
            .changes
            .iter()
            .filter(|c| since.map(|s| c.changed_at > s).unwrap_or(true))
            .cloned()
            .collect())
    }
}
