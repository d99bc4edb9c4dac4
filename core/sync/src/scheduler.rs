//! Sync scheduling - manual, on-demand and periodic modes.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use tandem_common::{Error, Result};

use crate::notify::ChangeBatch;
use crate::state::SyncResult;

/// When the scheduler starts passes on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SyncMode {
    /// Only explicit requests.
    #[default]
    Manual,
    /// An incremental pass after each debounced burst of local writes.
    OnDemand,
    /// An incremental pass every `interval_secs`.
    Periodic { interval_secs: u64 },
    /// Both on-demand and periodic.
    Hybrid { interval_secs: u64 },
}

impl SyncMode {
    pub fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Periodic { interval_secs } | SyncMode::Hybrid { interval_secs } => {
                Some(Duration::from_secs((*interval_secs).max(1)))
            }
            _ => None,
        }
    }

    pub fn reacts_to_changes(&self) -> bool {
        matches!(self, SyncMode::OnDemand | SyncMode::Hybrid { .. })
    }
}

/// Sync request types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequest {
    /// Bulk upload of all local data.
    Initial,
    /// Push queued writes, then pull.
    Incremental,
    /// Replay the pending queue only.
    OfflineQueue,
    /// Stop the scheduler.
    Shutdown,
}

type Envelope = (SyncRequest, oneshot::Sender<SyncResult>);

/// Client side of the scheduler: request passes and change the mode.
#[derive(Clone)]
pub struct SyncScheduler {
    mode: Arc<watch::Sender<SyncMode>>,
    request_tx: mpsc::Sender<Envelope>,
}

impl SyncScheduler {
    /// Create a new scheduler with the given mode. Spawn
    /// [`SyncSchedulerHandle::run`] to start serving requests.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(32);
        let (mode_tx, mode_rx) = watch::channel(mode);

        let scheduler = Self {
            mode: Arc::new(mode_tx),
            request_tx,
        };
        let handle = SyncSchedulerHandle {
            mode: mode_rx,
            request_rx,
        };

        (scheduler, handle)
    }

    pub async fn request_initial(&self) -> Result<SyncResult> {
        self.request(SyncRequest::Initial).await
    }

    pub async fn request_incremental(&self) -> Result<SyncResult> {
        self.request(SyncRequest::Incremental).await
    }

    pub async fn request_offline_queue(&self) -> Result<SyncResult> {
        self.request(SyncRequest::OfflineQueue).await
    }

    async fn request(&self, request: SyncRequest) -> Result<SyncResult> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((request, response_tx))
            .await
            .map_err(|_| Error::Storage("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Storage("Scheduler stopped before replying".to_string()))
    }

    /// Change the sync mode. Takes effect on the running loop at once.
    pub fn set_mode(&self, mode: SyncMode) {
        info!("Sync mode set to {:?}", mode);
        self.mode.send_replace(mode);
    }

    pub fn mode(&self) -> SyncMode {
        self.mode.borrow().clone()
    }

    /// Ask the loop to stop after the pass in progress, if any.
    pub async fn shutdown(&self) {
        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((SyncRequest::Shutdown, response_tx))
            .await;
    }
}

/// Runner side of the scheduler.
pub struct SyncSchedulerHandle {
    mode: watch::Receiver<SyncMode>,
    request_rx: mpsc::Receiver<Envelope>,
}

impl SyncSchedulerHandle {
    /// Serve requests until shutdown or until every [`SyncScheduler`] is
    /// dropped.
    ///
    /// `sync_fn` runs one pass per request; passes never overlap. With
    /// `changes` supplied, debounced change batches trigger incremental
    /// passes in on-demand and hybrid mode.
    pub async fn run<F, Fut>(mut self, sync_fn: F, mut changes: Option<mpsc::Receiver<ChangeBatch>>)
    where
        F: Fn(SyncRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult> + Send,
    {
        let mut periodic = Self::make_interval(&self.mode.borrow_and_update());

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                biased;

                changed = self.mode.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    periodic = Self::make_interval(&self.mode.borrow_and_update());
                }

                batch = Self::next_batch(&mut changes) => {
                    match batch {
                        Some(batch) if self.mode.borrow().reacts_to_changes() => {
                            debug!(
                                "Triggering on-demand sync for {} writes to {:?}",
                                batch.events, batch.entity_types
                            );
                            Self::log_outcome("On-demand", &sync_fn(SyncRequest::Incremental).await);
                        }
                        Some(_) => debug!("Change batch ignored (mode: {:?})", *self.mode.borrow()),
                        None => changes = None,
                    }
                }

                envelope = self.request_rx.recv() => {
                    let Some((request, response_tx)) = envelope else {
                        debug!("All scheduler clients dropped");
                        break;
                    };
                    if request == SyncRequest::Shutdown {
                        info!("Received shutdown request");
                        break;
                    }
                    debug!("Processing sync request: {:?}", request);
                    let result = sync_fn(request).await;
                    let _ = response_tx.send(result);
                }

                _ = Self::tick(&mut periodic) => {
                    debug!("Triggering periodic sync");
                    Self::log_outcome("Periodic", &sync_fn(SyncRequest::Incremental).await);
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    fn make_interval(mode: &SyncMode) -> Option<Interval> {
        mode.interval().map(|period| {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        })
    }

    async fn tick(periodic: &mut Option<Interval>) {
        match periodic {
            Some(timer) => {
                timer.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    async fn next_batch(changes: &mut Option<mpsc::Receiver<ChangeBatch>>) -> Option<ChangeBatch> {
        match changes {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    fn log_outcome(trigger: &str, result: &SyncResult) {
        if result.success {
            info!(
                "{} sync completed: {} synced, {} conflicts",
                trigger, result.items_synced, result.conflicts
            );
        } else {
            warn!(
                "{} sync failed: {}",
                trigger,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tandem_common::EntityType;

    fn counting_sync(
        calls: Arc<Mutex<Vec<SyncRequest>>>,
    ) -> impl Fn(SyncRequest) -> std::future::Ready<SyncResult> + Send + Sync + 'static {
        move |request| {
            calls.lock().unwrap().push(request);
            let mut result = SyncResult::ok();
            result.items_synced = 1;
            std::future::ready(result)
        }
    }

    #[tokio::test]
    async fn test_mode_change() {
        let (scheduler, _handle) = SyncScheduler::new(SyncMode::Manual);
        assert_eq!(scheduler.mode(), SyncMode::Manual);

        scheduler.set_mode(SyncMode::Periodic { interval_secs: 60 });
        assert_eq!(scheduler.mode().interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_mode_serialization() {
        let json = serde_json::to_string(&SyncMode::Hybrid { interval_secs: 300 }).unwrap();
        assert_eq!(json, r#"{"mode":"hybrid","interval_secs":300}"#);

        let manual: SyncMode = serde_json::from_str(r#"{"mode":"manual"}"#).unwrap();
        assert_eq!(manual, SyncMode::Manual);
    }

    #[tokio::test]
    async fn test_requests_are_served_in_order() {
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Manual);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(handle.run(counting_sync(calls.clone()), None));

        assert_eq!(scheduler.request_initial().await.unwrap().items_synced, 1);
        scheduler.request_offline_queue().await.unwrap();
        scheduler.request_incremental().await.unwrap();

        scheduler.shutdown().await;
        task.await.unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            vec![SyncRequest::Initial, SyncRequest::OfflineQueue, SyncRequest::Incremental]
        );
        assert!(scheduler.request_incremental().await.is_err());
    }

    #[tokio::test]
    async fn test_change_batches_trigger_only_in_on_demand_modes() {
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Manual);
        let (batch_tx, batch_rx) = mpsc::channel(4);
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();

        let task = tokio::spawn(handle.run(
            move |_request| {
                counter.fetch_add(1, Ordering::SeqCst);
                std::future::ready(SyncResult::ok())
            },
            Some(batch_rx),
        ));

        let batch = ChangeBatch {
            entity_types: [EntityType::new("task").unwrap()].into_iter().collect(),
            events: 3,
        };

        batch_tx.send(batch.clone()).await.unwrap();
        // Round-trip a request so the batch above has been handled.
        scheduler.request_offline_queue().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        scheduler.set_mode(SyncMode::OnDemand);
        batch_tx.send(batch).await.unwrap();
        scheduler.request_offline_queue().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_periodic_mode_runs_on_its_own() {
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Periodic { interval_secs: 1 });
        let calls = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(handle.run(counting_sync(calls.clone()), None));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        scheduler.shutdown().await;
        task.await.unwrap();

        let calls = calls.lock().unwrap();
        assert!(!calls.is_empty());
        assert!(calls.iter().all(|r| *r == SyncRequest::Incremental));
    }
}
