//! Core sync engine that orchestrates all sync operations.
//!
//! One engine owns the sync status, the last sync time and the conflict
//! list. Passes (`perform_initial_sync`, `sync_changes`, `pull_changes`,
//! `process_offline_queue`) and conflict resolution are serialized by a
//! single mutex around that state. Repository CRUD never takes it; the
//! pending queue is the only thing CRUD and passes share.
//!
//! Every public operation reports through [`SyncResult`] instead of
//! returning an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tandem_common::{EntityType, Error, OperationKind, Record, Result};
use tandem_store::{CredentialProvider, LocalStore, RemoteChange, RemoteStore};

use crate::conflict::{
    ConflictDecision, ConflictResolution, ConflictResolver, ResolutionPlan, SyncConflict,
};
use crate::connectivity::Connectivity;
use crate::notify::ChangeNotifier;
use crate::push::RemoteWriter;
use crate::queue::{PendingOperation, PendingQueue};
use crate::repository::{HybridRepository, NotifierSlot, RepositoryContext};
use crate::retry::{within, RetryConfig, RetryExecutor};
use crate::scheduler::SyncMode;
use crate::state::{StateFile, SyncResult, SyncState};
use crate::status::{ProgressCallback, StatusTracker, SyncProgress, SyncStatus};

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Entity types this engine syncs. Changes for other types are skipped.
    pub entity_types: Vec<EntityType>,
    /// Failed replays after which a queued operation is held for manual
    /// resolution.
    pub max_retries: u32,
    /// Records per batch during initial sync.
    pub batch_size: usize,
    /// Upper bound for any single remote call.
    pub request_timeout_ms: u64,
    /// Transport-level retries for health probes, pulls and batch uploads.
    pub network_retries: u32,
    /// Quiet period before a burst of local writes is reported.
    pub debounce_ms: u64,
    /// When the scheduler runs passes on its own.
    pub sync_mode: SyncMode,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            entity_types: Vec::new(),
            max_retries: 3,
            batch_size: 50,
            request_timeout_ms: 10_000,
            network_retries: 2,
            debounce_ms: 500,
            sync_mode: SyncMode::Manual,
        }
    }
}

impl SyncConfig {
    pub fn new(entity_types: Vec<EntityType>) -> Self {
        Self {
            entity_types,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_network_retries(mut self, retries: u32) -> Self {
        self.network_retries = retries;
        self
    }

    pub fn with_debounce(mut self, window: Duration) -> Self {
        self.debounce_ms = window.as_millis() as u64;
        self
    }

    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.network_retries)
    }

    /// Check the configuration for values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.entity_types.is_empty() {
            return Err(Error::InvalidInput("No entity types configured".to_string()));
        }
        let unique: HashSet<&EntityType> = self.entity_types.iter().collect();
        if unique.len() != self.entity_types.len() {
            return Err(Error::InvalidInput("Entity types must be unique".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidInput("batch_size must be at least 1".to_string()));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::InvalidInput(
                "request_timeout_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// What applying one feed entry did.
enum Applied {
    Written,
    Unchanged,
    /// Carries whether the conflict was new.
    Conflict(bool),
}

/// Main sync engine.
pub struct SyncEngine {
    /// Engine configuration
    config: SyncConfig,
    /// Records as the application sees them
    local: Arc<dyn LocalStore>,
    /// Authoritative server copy
    remote: Arc<dyn RemoteStore>,
    /// Credential and reachability, shared with the repositories
    connectivity: Arc<Connectivity>,
    /// Writes awaiting replay, shared with the repositories
    queue: Arc<PendingQueue>,
    /// Push path for single writes and queue replay
    writer: RemoteWriter,
    /// Conflict detector
    resolver: ConflictResolver,
    /// Backoff for probe, pull and batch upload
    retry: RetryExecutor,
    /// Sync-pass gate. Holds the last sync time and the conflict list.
    state: Mutex<SyncState>,
    /// Where `state` is saved, if anywhere
    state_file: Option<StateFile>,
    /// Current status and its subscribers
    status: StatusTracker,
    /// Progress callback for long passes
    progress: RwLock<Option<ProgressCallback>>,
    /// Debounced change notifications from the repositories
    notifier: NotifierSlot,
}

impl SyncEngine {
    /// Create an engine whose queue and state live in memory only.
    pub fn new(
        config: SyncConfig,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        Self::build(
            config,
            local,
            remote,
            credentials,
            PendingQueue::in_memory(),
            SyncState::new(),
            None,
        )
    }

    /// Create an engine persisting its queue and state under `state_dir`.
    pub async fn open(
        config: SyncConfig,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        credentials: Arc<dyn CredentialProvider>,
        state_dir: impl AsRef<Path>,
    ) -> Result<Self> {
        let state_dir = state_dir.as_ref();
        tokio::fs::create_dir_all(state_dir).await?;

        let state_file = StateFile::in_dir(state_dir);
        let state = state_file.load().await?;
        let queue = PendingQueue::open_in_dir(state_dir).await?;

        info!(
            "Opened sync state in {}: {} pending operations, {} conflicts",
            state_dir.display(),
            queue.len().await,
            state.conflicts().len()
        );

        let engine = Self::build(config, local, remote, credentials, queue, state, Some(state_file))?;
        if !engine.queue.is_empty().await {
            engine.status.mark_pending_changes();
        }
        Ok(engine)
    }

    fn build(
        config: SyncConfig,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        credentials: Arc<dyn CredentialProvider>,
        queue: PendingQueue,
        state: SyncState,
        state_file: Option<StateFile>,
    ) -> Result<Self> {
        config.validate()?;

        let writer = RemoteWriter::new(remote.clone(), local.clone(), config.request_timeout());
        let retry = RetryExecutor::new(config.retry_config());

        Ok(Self {
            local,
            remote,
            connectivity: Arc::new(Connectivity::new(credentials)),
            queue: Arc::new(queue),
            writer,
            resolver: ConflictResolver::new(),
            retry,
            state: Mutex::new(state),
            state_file,
            status: StatusTracker::new(),
            progress: RwLock::new(None),
            notifier: Arc::new(RwLock::new(None)),
            config,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Repository for one of the configured entity types.
    ///
    /// # Errors
    /// - `InvalidInput` if the type is not configured
    pub fn repository(&self, entity_type: &EntityType) -> Result<HybridRepository> {
        if !self.config.entity_types.contains(entity_type) {
            return Err(Error::InvalidInput(format!(
                "Entity type '{}' is not synced by this engine",
                entity_type
            )));
        }
        let ctx = RepositoryContext {
            local: self.local.clone(),
            remote: self.remote.clone(),
            writer: self.writer.clone(),
            queue: self.queue.clone(),
            connectivity: self.connectivity.clone(),
            status: self.status.clone(),
            notifier: self.notifier.clone(),
        };
        Ok(HybridRepository::new(entity_type.clone(), ctx))
    }

    /// Current sync status.
    pub fn status(&self) -> SyncStatus {
        self.status.current()
    }

    /// Subscribe to status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Install the progress callback, replacing any previous one.
    pub fn on_progress(&self, callback: ProgressCallback) {
        match self.progress.write() {
            Ok(mut guard) => *guard = Some(callback),
            Err(poisoned) => *poisoned.into_inner() = Some(callback),
        }
    }

    /// Report local writes from every repository to `notifier`.
    pub fn set_notifier(&self, notifier: ChangeNotifier) {
        match self.notifier.write() {
            Ok(mut guard) => *guard = Some(notifier),
            Err(poisoned) => *poisoned.into_inner() = Some(notifier),
        }
    }

    fn report(&self, total_items: usize, processed_items: usize, message: impl Into<String>) {
        let callback = match self.progress.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(callback) = callback {
            callback(&SyncProgress {
                total_items,
                processed_items,
                message: message.into(),
            });
        }
    }

    /// Credential present and the health probe answers. Leaves the status
    /// alone.
    async fn probe(&self) -> bool {
        if !self.connectivity.has_credential().await {
            debug!("No credential, sync unavailable");
            return false;
        }

        let timeout = self.config.request_timeout();
        match self.retry.run("health probe", timeout, || self.remote.health()).await {
            Ok(()) => {
                self.connectivity.mark_reachable();
                true
            }
            Err(e) => {
                self.connectivity.mark_unreachable(&e.to_string());
                info!("Remote store unavailable: {}", e);
                false
            }
        }
    }

    /// Whether a valid credential exists and the remote answers its health
    /// probe. Moves the status through `Checking` to `Connected` or
    /// `Offline`; never fails.
    pub async fn is_sync_available(&self) -> bool {
        self.status.set(SyncStatus::Checking);
        let available = self.probe().await;
        self.status
            .set(if available { SyncStatus::Connected } else { SyncStatus::Offline });
        available
    }

    /// Refuse a pass. Queued writes keep the status at `PendingChanges`.
    async fn unavailable(&self, what: &str) -> SyncResult {
        info!("Skipping {}: remote store unavailable", what);
        if !self.queue.is_empty().await {
            self.status.mark_pending_changes();
        }
        SyncResult::failed(format!(
            "{} skipped: remote store unavailable or not signed in",
            what
        ))
    }

    /// Persist state, settle the status and log the outcome of a pass.
    async fn finish(&self, state: &SyncState, mut result: SyncResult, what: &str) -> SyncResult {
        if let Some(file) = &self.state_file {
            if let Err(e) = file.save(state).await {
                error!("Failed to persist sync state: {}", e);
                result.fail(format!("Failed to persist sync state: {}", e));
            }
        }

        let status = if !result.success {
            SyncStatus::Error
        } else if state.has_conflicts() {
            SyncStatus::HasConflicts
        } else if !self.queue.is_empty().await {
            SyncStatus::PendingChanges
        } else {
            SyncStatus::Synced
        };
        self.status.set(status);

        if result.success {
            info!(
                "{} completed: {} synced, {} conflicts",
                what, result.items_synced, result.conflicts
            );
        } else {
            warn!(
                "{} failed: {}",
                what,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
        result.sync_time = Utc::now();
        result
    }

    /// Upload every local record of every configured type to a fresh
    /// remote account.
    ///
    /// Safe to re-run: the server confirms records it already holds, so a
    /// second run reports re-confirmations and no new conflicts.
    pub async fn perform_initial_sync(&self) -> SyncResult {
        let mut state = self.state.lock().await;
        if !self.is_sync_available().await {
            return self.unavailable("Initial sync").await;
        }

        self.status.set(SyncStatus::Syncing);
        info!("Starting initial sync");
        let result = self.initial_pass(&mut state).await;
        self.finish(&state, result, "Initial sync").await
    }

    async fn initial_pass(&self, state: &mut SyncState) -> SyncResult {
        let mut result = SyncResult::ok();

        let mut sets = Vec::with_capacity(self.config.entity_types.len());
        for entity_type in &self.config.entity_types {
            match self.local.get_all(entity_type).await {
                Ok(records) => sets.push((entity_type, records)),
                Err(e) => {
                    error!("Failed to read local {} records: {}", entity_type, e);
                    return SyncResult::failed(format!(
                        "Failed to read local {} records: {}",
                        entity_type, e
                    ));
                }
            }
        }

        let total: usize = sets.iter().map(|(_, records)| records.len()).sum();
        self.report(total, 0, format!("Uploading {} records", total));

        let timeout = self.config.request_timeout();
        let mut processed = 0;
        let mut batches = 0;
        let mut failed_batches = 0;

        for (entity_type, records) in &sets {
            for chunk in records.chunks(self.config.batch_size) {
                batches += 1;
                let uploaded = self
                    .retry
                    .run("batch upload", timeout, || self.remote.batch_upload(entity_type, chunk))
                    .await;

                match uploaded {
                    Ok(outcome) => {
                        result.items_synced += outcome.accepted;
                        for rejected in &outcome.conflicts {
                            match chunk.iter().find(|r| r.id() == rejected.entity_id) {
                                Some(local) => {
                                    if state.add_conflict(SyncConflict::from_batch(local, rejected)) {
                                        result.conflicts += 1;
                                    }
                                }
                                None => warn!(
                                    "Server reported a conflict for {}/{} outside the batch",
                                    entity_type, rejected.entity_id
                                ),
                            }
                        }
                    }
                    Err(e) => {
                        failed_batches += 1;
                        if e.is_connectivity() && !self.remote_alive().await {
                            self.connectivity.mark_unreachable(&e.to_string());
                            result.fail(format!("Connection lost during initial sync: {}", e));
                            return result;
                        }
                        warn!("Batch of {} {} records failed: {}", chunk.len(), entity_type, e);
                        result.message(format!(
                            "Batch of {} {} records failed: {}",
                            chunk.len(),
                            entity_type,
                            e
                        ));
                    }
                }

                processed += chunk.len();
                self.report(total, processed, format!("Uploaded {} of {} records", processed, total));
            }
        }

        if failed_batches == 0 {
            state.metadata.last_sync_time = Some(Utc::now());
        } else {
            result.fail(format!("{} of {} batches failed", failed_batches, batches));
        }
        result
    }

    /// Incremental pass: replay the pending queue, then pull remote
    /// changes since the last sync.
    ///
    /// Pushing first keeps a stale server copy from being pulled over a
    /// local edit that is about to be sent.
    pub async fn sync_changes(&self) -> SyncResult {
        let mut state = self.state.lock().await;
        if !self.is_sync_available().await {
            return self.unavailable("Sync").await;
        }

        self.status.set(SyncStatus::Syncing);
        info!("Starting incremental sync");

        let mut result = self.replay_queue().await;
        if !result.success {
            return self.finish(&state, result, "Sync").await;
        }

        let pull_started = Utc::now();
        let since = state.metadata.last_sync_time;
        let pulled = self.pull_pass(&mut state, since).await;
        if pulled.success {
            state.metadata.last_sync_time = Some(pull_started);
        }
        result.merge(pulled);

        self.finish(&state, result, "Sync").await
    }

    /// Pull the server's change feed and apply it locally.
    ///
    /// `since` defaults to the last sync time. Only a pull from the last
    /// sync time advances it.
    pub async fn pull_changes(&self, since: Option<DateTime<Utc>>) -> SyncResult {
        let mut state = self.state.lock().await;
        if !self.is_sync_available().await {
            return self.unavailable("Pull").await;
        }

        self.status.set(SyncStatus::Syncing);
        let started = Utc::now();
        let from = since.or(state.metadata.last_sync_time);
        let result = self.pull_pass(&mut state, from).await;
        if result.success && since.is_none() {
            state.metadata.last_sync_time = Some(started);
        }

        self.finish(&state, result, "Pull").await
    }

    async fn pull_pass(&self, state: &mut SyncState, since: Option<DateTime<Utc>>) -> SyncResult {
        let timeout = self.config.request_timeout();
        let feed = self
            .retry
            .run("change pull", timeout, || self.remote.changes_since(since))
            .await;
        let changes = match feed {
            Ok(changes) => latest_per_record(changes),
            Err(e) => {
                if e.is_connectivity() {
                    self.connectivity.mark_unreachable(&e.to_string());
                }
                return SyncResult::failed(format!("Failed to pull changes: {}", e));
            }
        };

        let mut result = SyncResult::ok();
        let total = changes.len();
        self.report(total, 0, format!("Applying {} remote changes", total));
        debug!("Pulled {} changes since {:?}", total, since);

        let mut failures = 0;
        for (index, change) in changes.iter().enumerate() {
            if !self.config.entity_types.contains(&change.entity_type) {
                result.message(format!(
                    "Skipped change for unknown entity type {}",
                    change.entity_type
                ));
            } else {
                match self.apply_change(state, change).await {
                    Ok(Applied::Written) => result.items_synced += 1,
                    Ok(Applied::Unchanged) => {}
                    Ok(Applied::Conflict(is_new)) => {
                        if is_new {
                            result.conflicts += 1;
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(
                            "Could not apply {} of {}/{}: {}",
                            change.operation, change.entity_type, change.entity_id, e
                        );
                        result.message(format!(
                            "Could not apply {} of {}/{}: {}",
                            change.operation, change.entity_type, change.entity_id, e
                        ));
                    }
                }
            }
            self.report(total, index + 1, format!("Applied {} of {} changes", index + 1, total));
        }

        if failures > 0 {
            result.fail(format!("{} of {} changes could not be applied", failures, total));
        }
        result
    }

    async fn apply_change(&self, state: &mut SyncState, change: &RemoteChange) -> Result<Applied> {
        let entity_type = &change.entity_type;
        let id = change.entity_id;
        let local = self.local.get(entity_type, id).await?;
        let queued_at = self.queue.latest_write(entity_type, id).await;
        let last_sync = state.metadata.last_sync_time;

        let decision = if state.conflict_for(entity_type, id).is_some() {
            // Unresolved records stay untouched; the conflict follows the server.
            ConflictDecision::Conflict
        } else if let Some(written_at) = queued_at.filter(|at| *at > change.modified_at) {
            // A queued local write is newer than this change. A queued delete
            // or a change an earlier pass already saw is simply outrun.
            let seen = last_sync.is_some_and(|synced| change.modified_at <= synced);
            if seen || local.is_none() {
                debug!(
                    "Queued write to {}/{} from {} outruns the {} at {}",
                    entity_type, id, written_at, change.operation, change.modified_at
                );
                return Ok(Applied::Unchanged);
            }
            ConflictDecision::Conflict
        } else if queued_at.is_some() {
            // Unconfirmed local writes are judged on timestamps alone.
            self.resolver.decide(local.as_ref(), change, None)
        } else {
            self.resolver.decide(local.as_ref(), change, last_sync)
        };
        if let (ConflictDecision::Conflict, Some(local)) = (decision, local.as_ref()) {
            debug!("Conflict on {}/{}", entity_type, id);
            let is_new = state.add_conflict(SyncConflict::from_change(local, change));
            return Ok(Applied::Conflict(is_new));
        }

        let applied = match change.operation {
            OperationKind::Delete => {
                if self.local.delete(entity_type, id).await? {
                    Applied::Written
                } else {
                    Applied::Unchanged
                }
            }
            OperationKind::Create | OperationKind::Update => {
                let record = change.record.as_ref().ok_or_else(|| {
                    Error::Serialization(format!("{} of {}/{} carries no record", change.operation, entity_type, id))
                })?;
                if record.entity_type() != entity_type || record.id() != id {
                    return Err(Error::Serialization(format!(
                        "Change for {}/{} carries record {}/{}",
                        entity_type,
                        id,
                        record.entity_type(),
                        record.id()
                    )));
                }
                if local.as_ref() == Some(record) {
                    Applied::Unchanged
                } else {
                    self.local.put(record).await?;
                    Applied::Written
                }
            }
        };

        // Writes queued after the change was made still replay.
        if queued_at.is_some() {
            let dropped = self
                .queue
                .remove_entity_until(entity_type, id, change.modified_at)
                .await?;
            debug!("Dropped {} superseded queued writes for {}/{}", dropped, entity_type, id);
        }
        Ok(applied)
    }

    /// Push one record's current local state, or queue it.
    ///
    /// Returns success when the remote confirmed the write or, with the
    /// remote unavailable, when the write was queued. A push that fails
    /// is queued as well but reported as a failure.
    pub async fn push_entity_change(
        &self,
        entity_type: &EntityType,
        entity_id: Uuid,
        operation: OperationKind,
    ) -> SyncResult {
        if !self.config.entity_types.contains(entity_type) {
            return SyncResult::failed(format!("Entity type '{}' is not synced", entity_type));
        }

        let payload = match operation {
            OperationKind::Delete => None,
            OperationKind::Create | OperationKind::Update => {
                match self.local.get(entity_type, entity_id).await {
                    Ok(Some(record)) => Some(record),
                    Ok(None) => {
                        return SyncResult::failed(format!(
                            "{}/{} not found locally",
                            entity_type, entity_id
                        ))
                    }
                    Err(e) => {
                        return SyncResult::failed(format!(
                            "Failed to read {}/{}: {}",
                            entity_type, entity_id, e
                        ))
                    }
                }
            }
        };

        let mut result = SyncResult::ok();
        let behind_queue = self.queue.contains_entity(entity_type, entity_id).await;
        if behind_queue || !self.probe().await {
            return match self.enqueue(operation, entity_type, entity_id, payload).await {
                Ok(()) => {
                    result.message(format!(
                        "{} {}/{} queued for later sync",
                        operation, entity_type, entity_id
                    ));
                    result
                }
                Err(e) => SyncResult::failed(format!(
                    "Failed to queue {} {}/{}: {}",
                    operation, entity_type, entity_id, e
                )),
            };
        }

        match self
            .writer
            .push(operation, entity_type, entity_id, payload.as_ref())
            .await
        {
            Ok(confirmed) => {
                if let Some(confirmed) = confirmed {
                    if let Err(e) = self.writer.reconcile(&confirmed).await {
                        warn!("Failed to cache confirmed {}/{}: {}", entity_type, entity_id, e);
                    }
                }
                result.items_synced = 1;
                result
            }
            Err(e) => {
                if e.is_connectivity() {
                    self.connectivity.mark_unreachable(&e.to_string());
                }
                warn!("Push of {} {}/{} failed: {}", operation, entity_type, entity_id, e);
                let mut failed = SyncResult::failed(format!(
                    "Push of {} {}/{} failed: {}",
                    operation, entity_type, entity_id, e
                ));
                match self.enqueue(operation, entity_type, entity_id, payload).await {
                    Ok(()) => failed.message("Queued for later sync"),
                    Err(qe) => failed.message(format!("Could not queue it either: {}", qe)),
                }
                failed
            }
        }
    }

    async fn enqueue(
        &self,
        kind: OperationKind,
        entity_type: &EntityType,
        entity_id: Uuid,
        payload: Option<Record>,
    ) -> Result<()> {
        let op = PendingOperation::new(kind, entity_type.clone(), entity_id, payload);
        self.queue.enqueue(op).await?;
        self.status.mark_pending_changes();
        Ok(())
    }

    /// Replay pending operations oldest first.
    pub async fn process_offline_queue(&self) -> SyncResult {
        let state = self.state.lock().await;
        if !self.is_sync_available().await {
            return self.unavailable("Queue replay").await;
        }

        self.status.set(SyncStatus::Syncing);
        let result = self.replay_queue().await;
        self.finish(&state, result, "Queue replay").await
    }

    /// Item failures are counted, reported and skipped. Losing the remote
    /// altogether stops the replay and fails the result.
    async fn replay_queue(&self) -> SyncResult {
        let max_retries = self.config.max_retries;
        let (held, ready): (Vec<_>, Vec<_>) = self
            .queue
            .get_pending()
            .await
            .into_iter()
            .partition(|op| op.is_exhausted(max_retries));

        let mut result = SyncResult::ok();
        // Records with an unconfirmed earlier write; later writes wait.
        let mut blocked: HashSet<(EntityType, Uuid)> = HashSet::new();
        for op in &held {
            blocked.insert((op.entity_type.clone(), op.entity_id));
            result.message(format!(
                "{} {}/{} held for manual resolution after {} failed attempts: {}",
                op.kind,
                op.entity_type,
                op.entity_id,
                op.retry_count,
                op.last_error.as_deref().unwrap_or("unknown error")
            ));
        }

        let total = ready.len();
        self.report(total, 0, format!("Replaying {} queued operations", total));

        for (index, op) in ready.iter().enumerate() {
            let key = (op.entity_type.clone(), op.entity_id);
            if blocked.contains(&key) {
                debug!("{} waits behind an unconfirmed write to {}/{}", op.id, op.entity_type, op.entity_id);
                self.report(total, index + 1, format!("Skipped {}", op.id));
                continue;
            }

            match self.writer.push_operation(op).await {
                Ok(confirmed) => {
                    if let Some(confirmed) = confirmed {
                        if let Err(e) = self.writer.reconcile(&confirmed).await {
                            warn!("Failed to cache confirmed {}/{}: {}", op.entity_type, op.entity_id, e);
                        }
                    }
                    match self.queue.remove(op.id).await {
                        Ok(_) => result.items_synced += 1,
                        Err(e) => {
                            error!("Replayed {} but could not dequeue it: {}", op.id, e);
                            blocked.insert(key);
                            result.message(format!("Replayed {} but could not dequeue it: {}", op.id, e));
                        }
                    }
                }
                Err(e) => {
                    blocked.insert(key);
                    let attempts = match self.queue.record_failure(op.id, &e.to_string()).await {
                        Ok(attempts) => attempts,
                        Err(qe) => {
                            error!("Failed to record replay failure of {}: {}", op.id, qe);
                            op.retry_count + 1
                        }
                    };

                    if attempts >= max_retries {
                        result.message(format!(
                            "{} {}/{} failed {} times and is held for manual resolution: {}",
                            op.kind, op.entity_type, op.entity_id, attempts, e
                        ));
                    } else {
                        result.message(format!(
                            "{} {}/{} failed (attempt {} of {}): {}",
                            op.kind, op.entity_type, op.entity_id, attempts, max_retries, e
                        ));
                    }

                    if e.is_connectivity() && !self.remote_alive().await {
                        self.connectivity.mark_unreachable(&e.to_string());
                        result.fail(format!("Connection lost during queue replay: {}", e));
                        break;
                    }
                }
            }

            self.report(total, index + 1, format!("Replayed {} of {} operations", index + 1, total));
        }

        result
    }

    /// Single health probe without retries.
    async fn remote_alive(&self) -> bool {
        within(self.config.request_timeout(), "health probe", self.remote.health())
            .await
            .is_ok()
    }

    /// Settle an outstanding conflict.
    pub async fn resolve_conflict(
        &self,
        conflict_id: Uuid,
        resolution: ConflictResolution,
    ) -> SyncResult {
        let mut state = self.state.lock().await;
        let Some(conflict) = state.conflict(conflict_id).cloned() else {
            return SyncResult::failed(format!("No conflict with id {}", conflict_id));
        };

        info!(
            "Resolving conflict {} on {}/{} with {:?}",
            conflict_id, conflict.entity_type, conflict.entity_id, resolution
        );
        let result = match self.resolver.plan(&conflict, resolution) {
            ResolutionPlan::PushLocal => self.keep_local(&conflict).await,
            ResolutionPlan::ApplyServer(server) => self.keep_server(&conflict, server).await,
        };

        if result.success {
            state.remove_conflict(conflict_id);
        }
        self.finish(&state, result, "Conflict resolution").await
    }

    /// Re-push the current local version, or its absence.
    async fn keep_local(&self, conflict: &SyncConflict) -> SyncResult {
        let entity_type = &conflict.entity_type;
        let id = conflict.entity_id;

        let current = match self.local.get(entity_type, id).await {
            Ok(current) => current,
            Err(e) => return SyncResult::failed(format!("Failed to read {}/{}: {}", entity_type, id, e)),
        };
        let (kind, payload) = match current {
            Some(mut record) => {
                // Newer than the server copy, so the next pull does not
                // report the same conflict again.
                record.touch();
                if let Err(e) = self.local.put(&record).await {
                    return SyncResult::failed(format!("Failed to store {}/{}: {}", entity_type, id, e));
                }
                (OperationKind::Update, Some(record))
            }
            None => (OperationKind::Delete, None),
        };

        // This write carries the final local state.
        if let Err(e) = self.queue.remove_entity(entity_type, id).await {
            return SyncResult::failed(format!("Failed to update queue for {}/{}: {}", entity_type, id, e));
        }

        let mut result = SyncResult::ok();
        if self.probe().await {
            match self.writer.push(kind, entity_type, id, payload.as_ref()).await {
                Ok(confirmed) => {
                    if let Some(confirmed) = confirmed {
                        if let Err(e) = self.writer.reconcile(&confirmed).await {
                            warn!("Failed to cache confirmed {}/{}: {}", entity_type, id, e);
                        }
                    }
                    result.items_synced = 1;
                    return result;
                }
                Err(e) => {
                    if e.is_connectivity() {
                        self.connectivity.mark_unreachable(&e.to_string());
                    }
                    result.message(format!("Push failed, local version queued: {}", e));
                }
            }
        } else {
            result.message("Remote unavailable, local version queued");
        }

        match self.enqueue(kind, entity_type, id, payload).await {
            Ok(()) => result,
            Err(e) => SyncResult::failed(format!("Failed to queue {}/{}: {}", entity_type, id, e)),
        }
    }

    /// Overwrite local with the server version, or delete it locally.
    async fn keep_server(&self, conflict: &SyncConflict, server: Option<Record>) -> SyncResult {
        let entity_type = &conflict.entity_type;
        let id = conflict.entity_id;

        let written = match &server {
            Some(record) => self.local.put(record).await,
            None => self.local.delete(entity_type, id).await.map(|_| ()),
        };
        if let Err(e) = written {
            return SyncResult::failed(format!("Failed to apply server version of {}/{}: {}", entity_type, id, e));
        }

        let mut result = SyncResult::ok();
        result.items_synced = 1;
        match self.queue.remove_entity(entity_type, id).await {
            Ok(0) => {}
            Ok(dropped) => result.message(format!("Dropped {} queued local writes", dropped)),
            Err(e) => result.fail(format!("Failed to drop queued writes for {}/{}: {}", entity_type, id, e)),
        }
        result
    }

    /// Outstanding conflicts, oldest first.
    pub async fn get_conflicts(&self) -> Vec<SyncConflict> {
        self.state.lock().await.conflicts().to_vec()
    }

    pub async fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.metadata.last_sync_time
    }

    /// Queued operations in replay order.
    pub async fn pending_operations(&self) -> Vec<PendingOperation> {
        self.queue.get_pending().await
    }

    /// Re-arm a held operation for automatic replay on the next pass.
    pub async fn retry_operation(&self, id: Uuid) -> SyncResult {
        match self.queue.reset_retries(id).await {
            Ok(true) => {
                let mut result = SyncResult::ok();
                result.message(format!("Operation {} re-armed", id));
                result
            }
            Ok(false) => SyncResult::failed(format!("No pending operation with id {}", id)),
            Err(e) => SyncResult::failed(format!("Failed to re-arm {}: {}", id, e)),
        }
    }

    /// Drop a queued operation without sending it.
    pub async fn discard_operation(&self, id: Uuid) -> SyncResult {
        match self.queue.remove(id).await {
            Ok(true) => {
                warn!("Discarded pending operation {}", id);
                self.settle_if_queue_drained().await;
                let mut result = SyncResult::ok();
                result.message(format!("Operation {} discarded", id));
                result
            }
            Ok(false) => SyncResult::failed(format!("No pending operation with id {}", id)),
            Err(e) => SyncResult::failed(format!("Failed to discard {}: {}", id, e)),
        }
    }

    /// Drop every queued operation.
    pub async fn clear_queue(&self) -> SyncResult {
        match self.queue.clear().await {
            Ok(dropped) => {
                warn!("Discarded {} pending operations", dropped);
                self.settle_if_queue_drained().await;
                let mut result = SyncResult::ok();
                result.message(format!("{} operations discarded", dropped));
                result
            }
            Err(e) => SyncResult::failed(format!("Failed to clear queue: {}", e)),
        }
    }

    async fn settle_if_queue_drained(&self) {
        if self.status.current() != SyncStatus::PendingChanges || !self.queue.is_empty().await {
            return;
        }
        // A running pass settles the status itself.
        if let Ok(state) = self.state.try_lock() {
            self.status.set(if state.has_conflicts() {
                SyncStatus::HasConflicts
            } else {
                SyncStatus::Synced
            });
        }
    }
}

/// Keep only the newest feed entry per record; earlier ones are superseded.
fn latest_per_record(changes: Vec<RemoteChange>) -> Vec<RemoteChange> {
    let mut last_index: HashMap<(EntityType, Uuid), usize> = HashMap::new();
    for (index, change) in changes.iter().enumerate() {
        last_index.insert((change.entity_type.clone(), change.entity_id), index);
    }
    changes
        .into_iter()
        .enumerate()
        .filter(|(index, change)| {
            last_index.get(&(change.entity_type.clone(), change.entity_id)) == Some(index)
        })
        .map(|(_, change)| change)
        .collect()
}
