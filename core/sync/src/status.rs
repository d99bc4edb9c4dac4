//! Sync status state machine and progress reporting.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Engine-wide sync status.
///
/// Normal flow is `Offline -> Checking -> Connected -> Syncing` and then one
/// of `Synced`, `HasConflicts` or `Error`. `PendingChanges` can be entered
/// from any state when a write is queued for later replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    Offline,
    Checking,
    Connected,
    Syncing,
    Synced,
    HasConflicts,
    Error,
    PendingChanges,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SyncStatus::Offline => "offline",
            SyncStatus::Checking => "checking",
            SyncStatus::Connected => "connected",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::HasConflicts => "has conflicts",
            SyncStatus::Error => "error",
            SyncStatus::PendingChanges => "pending changes",
        };
        f.write_str(label)
    }
}

/// Owner of the current [`SyncStatus`].
///
/// Observers subscribe to a watch channel instead of polling. Clones share
/// the same underlying value; only the engine and its repositories hold
/// clones, and they change the value through the transition methods here.
#[derive(Clone)]
pub struct StatusTracker {
    tx: Arc<watch::Sender<SyncStatus>>,
}

impl StatusTracker {
    /// Create a tracker starting `Offline`.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SyncStatus::Offline);
        Self { tx: Arc::new(tx) }
    }

    /// Current status.
    pub fn current(&self) -> SyncStatus {
        *self.tx.borrow()
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    pub(crate) fn set(&self, status: SyncStatus) {
        self.tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            debug!("Sync status: {} -> {}", current, status);
            *current = status;
            true
        });
    }

    /// A write was queued. Leaves `Syncing` alone: the running pass settles
    /// the final status itself and will see the queued entry.
    pub(crate) fn mark_pending_changes(&self) {
        self.tx.send_if_modified(|current| {
            if matches!(*current, SyncStatus::PendingChanges | SyncStatus::Syncing) {
                return false;
            }
            debug!("Sync status: {} -> {}", current, SyncStatus::PendingChanges);
            *current = SyncStatus::PendingChanges;
            true
        });
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress of a running pass. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncProgress {
    pub total_items: usize,
    pub processed_items: usize,
    pub message: String,
}

/// Callback receiving progress updates.
pub type ProgressCallback = Arc<dyn Fn(&SyncProgress) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_status() {
        let tracker = StatusTracker::new();
        assert_eq!(tracker.current(), SyncStatus::Offline);
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let tracker = StatusTracker::new();
        let mut rx = tracker.subscribe();

        tracker.set(SyncStatus::Checking);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), SyncStatus::Checking);

        tracker.set(SyncStatus::Connected);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), SyncStatus::Connected);
    }

    #[test]
    fn test_repeated_status_does_not_notify() {
        let tracker = StatusTracker::new();
        let mut rx = tracker.subscribe();

        tracker.set(SyncStatus::Offline);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_pending_changes_from_any_settled_state() {
        let tracker = StatusTracker::new();
        for start in [SyncStatus::Offline, SyncStatus::Synced, SyncStatus::Error, SyncStatus::HasConflicts] {
            tracker.set(start);
            tracker.mark_pending_changes();
            assert_eq!(tracker.current(), SyncStatus::PendingChanges);
        }
    }

    #[test]
    fn test_pending_changes_does_not_interrupt_syncing() {
        let tracker = StatusTracker::new();
        tracker.set(SyncStatus::Syncing);
        tracker.mark_pending_changes();
        assert_eq!(tracker.current(), SyncStatus::Syncing);
    }
}
