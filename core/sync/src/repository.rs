//! Per-entity-type repository routing between the local and remote stores.
//!
//! The local store is always written first. The remote store is then tried
//! when the engine believes it is reachable; any failure there turns into
//! a queued operation instead of an error for the caller. The only errors
//! a caller sees are local-store failures and invalid arguments.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

use tandem_common::{EntityType, Error, OperationKind, Record, Result};
use tandem_store::{LocalStore, RemoteStore};

use crate::connectivity::Connectivity;
use crate::notify::ChangeNotifier;
use crate::push::RemoteWriter;
use crate::queue::{PendingOperation, PendingQueue};
use crate::retry::within;
use crate::status::StatusTracker;

pub(crate) type NotifierSlot = Arc<RwLock<Option<ChangeNotifier>>>;

/// Collaborators shared by every repository an engine hands out.
#[derive(Clone)]
pub(crate) struct RepositoryContext {
    pub local: Arc<dyn LocalStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub writer: RemoteWriter,
    pub queue: Arc<PendingQueue>,
    pub connectivity: Arc<Connectivity>,
    pub status: StatusTracker,
    pub notifier: NotifierSlot,
}

/// Sync-agnostic CRUD over one entity type.
///
/// Obtained from [`crate::SyncEngine::repository`]. Cheap to clone; clones
/// share the same stores and queue.
#[derive(Clone)]
pub struct HybridRepository {
    entity_type: EntityType,
    ctx: RepositoryContext,
}

impl HybridRepository {
    pub(crate) fn new(entity_type: EntityType, ctx: RepositoryContext) -> Self {
        Self { entity_type, ctx }
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    fn timeout(&self) -> Duration {
        self.ctx.writer.timeout()
    }

    fn check_type(&self, record: &Record) -> Result<()> {
        if record.entity_type() != &self.entity_type {
            return Err(Error::InvalidInput(format!(
                "{} repository cannot store a {} record",
                self.entity_type,
                record.entity_type()
            )));
        }
        Ok(())
    }

    fn remote_failed(&self, what: &str, err: &Error) {
        if err.is_connectivity() {
            self.ctx.connectivity.mark_unreachable(&err.to_string());
        }
        warn!("Remote {} for {} failed, using local data: {}", what, self.entity_type, err);
    }

    /// Fetch one record.
    ///
    /// Online, the server copy wins and is cached locally unless local has
    /// writes still waiting to be pushed for that record.
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<Record>> {
        if !self.ctx.connectivity.is_online().await
            || self.ctx.queue.contains_entity(&self.entity_type, id).await
        {
            return self.ctx.local.get(&self.entity_type, id).await;
        }

        let fetched = within(self.timeout(), "get", self.ctx.remote.get(&self.entity_type, id)).await;
        match fetched {
            Ok(Some(server)) => self.cache_fill(server).await,
            Ok(None) => self.ctx.local.get(&self.entity_type, id).await,
            Err(e) => {
                self.remote_failed("get", &e);
                self.ctx.local.get(&self.entity_type, id).await
            }
        }
    }

    /// Write the server copy through to local, unless local is newer.
    /// Returns whichever copy is kept.
    async fn cache_fill(&self, server: Record) -> Result<Option<Record>> {
        let local = self.ctx.local.get(&self.entity_type, server.id()).await?;
        match local {
            Some(local) if local.modified_at() > server.modified_at() => Ok(Some(local)),
            Some(local) if local == server => Ok(Some(local)),
            _ => {
                self.ctx.local.put(&server).await?;
                Ok(Some(server))
            }
        }
    }

    /// All records of this type, oldest first.
    ///
    /// Online, local-only records are queued for creation and included in
    /// the result; server records refresh the local cache.
    pub async fn get_all(&self) -> Result<Vec<Record>> {
        if !self.ctx.connectivity.is_online().await {
            return self.ctx.local.get_all(&self.entity_type).await;
        }

        let (remote, local) = futures::join!(
            within(self.timeout(), "get all", self.ctx.remote.get_all(&self.entity_type)),
            self.ctx.local.get_all(&self.entity_type),
        );
        let local = local?;
        let remote = match remote {
            Ok(records) => records,
            Err(e) => {
                self.remote_failed("get all", &e);
                return Ok(local);
            }
        };

        let mut local_by_id: HashMap<Uuid, Record> =
            local.into_iter().map(|r| (r.id(), r)).collect();
        let mut merged = Vec::with_capacity(remote.len() + local_by_id.len());

        for server in remote {
            let id = server.id();
            let queued = self.ctx.queue.contains_entity(&self.entity_type, id).await;
            match local_by_id.remove(&id) {
                Some(local) if queued || local.modified_at() > server.modified_at() => {
                    merged.push(local);
                }
                Some(local) if local == server => merged.push(local),
                // Deleted locally, delete still queued.
                None if queued => {}
                _ => {
                    self.ctx.local.put(&server).await?;
                    merged.push(server);
                }
            }
        }

        let mut queued_any = false;
        for (_, local_only) in local_by_id {
            let op = PendingOperation::for_record(OperationKind::Create, &local_only);
            match self.ctx.queue.enqueue_unique(op).await {
                Ok(Some(_)) => queued_any = true,
                Ok(None) => {}
                Err(e) => error!(
                    "Failed to queue local-only {}/{}: {}",
                    self.entity_type,
                    local_only.id(),
                    e
                ),
            }
            merged.push(local_only);
        }
        if queued_any {
            self.ctx.status.mark_pending_changes();
        }

        merged.sort_by_key(|r| r.created_at());
        Ok(merged)
    }

    /// Insert a new record. Fails with `AlreadyExists` if the id is taken
    /// locally.
    pub async fn add(&self, mut record: Record) -> Result<Record> {
        self.check_type(&record)?;
        record.touch();
        self.ctx.local.add(&record).await?;
        self.write_through(OperationKind::Create, record.id(), Some(record.clone()))
            .await;
        Ok(record)
    }

    /// Replace an existing record. Fails with `NotFound` if it is not in
    /// the local store.
    pub async fn update(&self, record: Record) -> Result<Record> {
        self.check_type(&record)?;
        let existing = self
            .ctx
            .local
            .get(&self.entity_type, record.id())
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("{} {} not found", self.entity_type, record.id()))
            })?;

        let mut record = Record::from_parts(
            record.id(),
            record.entity_type().clone(),
            existing.created_at(),
            existing.modified_at().max(record.modified_at()),
            record.data,
        );
        record.touch();

        self.ctx.local.put(&record).await?;
        self.write_through(OperationKind::Update, record.id(), Some(record.clone()))
            .await;
        Ok(record)
    }

    /// Delete a record. Returns whether it existed locally; the delete is
    /// sent to the server either way.
    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let existed = self.ctx.local.delete(&self.entity_type, id).await?;
        self.write_through(OperationKind::Delete, id, None).await;
        Ok(existed)
    }

    /// Number of records. Remote when online, local otherwise.
    pub async fn count(&self) -> Result<usize> {
        if self.ctx.connectivity.is_online().await {
            match within(self.timeout(), "count", self.ctx.remote.count(&self.entity_type)).await {
                Ok(n) => return Ok(n),
                Err(e) => self.remote_failed("count", &e),
            }
        }
        self.ctx.local.count(&self.entity_type).await
    }

    /// Number of local records matching `predicate`.
    pub async fn count_where<F>(&self, predicate: F) -> Result<usize>
    where
        F: Fn(&Record) -> bool,
    {
        let records = self.ctx.local.get_all(&self.entity_type).await?;
        Ok(records.iter().filter(|r| predicate(r)).count())
    }

    /// Push a write that already landed locally, or queue it.
    ///
    /// A record with writes still queued is always queued behind them so
    /// replay order matches edit order.
    async fn write_through(&self, kind: OperationKind, id: Uuid, payload: Option<Record>) {
        self.notify();

        let online = self.ctx.connectivity.is_online().await;
        if online && !self.ctx.queue.contains_entity(&self.entity_type, id).await {
            match self
                .ctx
                .writer
                .push(kind, &self.entity_type, id, payload.as_ref())
                .await
            {
                Ok(Some(confirmed)) => {
                    if let Err(e) = self.ctx.writer.reconcile(&confirmed).await {
                        warn!("Failed to cache confirmed {}/{}: {}", self.entity_type, id, e);
                    }
                    return;
                }
                Ok(None) => return,
                Err(e) => {
                    if e.is_connectivity() {
                        self.ctx.connectivity.mark_unreachable(&e.to_string());
                    }
                    warn!("Push of {} {}/{} failed, queueing: {}", kind, self.entity_type, id, e);
                }
            }
        } else {
            debug!("Queueing {} {}/{}", kind, self.entity_type, id);
        }

        let op = PendingOperation::new(kind, self.entity_type.clone(), id, payload);
        match self.ctx.queue.enqueue(op).await {
            Ok(_) => self.ctx.status.mark_pending_changes(),
            Err(e) => error!("Failed to queue {} {}/{}: {}", kind, self.entity_type, id, e),
        }
    }

    fn notify(&self) {
        let slot = match self.ctx.notifier.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(notifier) = slot {
            notifier.notify(&self.entity_type);
        }
    }
}
