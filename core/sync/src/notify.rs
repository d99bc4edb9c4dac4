//! Debounced local-change notifications.
//!
//! Repositories report every local write here. A single actor task folds
//! bursts of writes into one [`ChangeBatch`], emitted once no new write has
//! arrived for the debounce window. Each write replaces the pending
//! deadline, so a steady stream of edits yields one batch at the end.

use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use tandem_common::EntityType;

/// Coalesced burst of local writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    pub entity_types: BTreeSet<EntityType>,
    /// Number of writes folded into this batch.
    pub events: usize,
}

/// Cheap, cloneable sender side of the debouncer.
///
/// The actor flushes what it holds and exits once every clone is dropped.
#[derive(Clone, Debug)]
pub struct ChangeNotifier {
    tx: mpsc::UnboundedSender<EntityType>,
}

impl ChangeNotifier {
    /// Start the debounce actor on the current runtime.
    pub fn spawn(window: Duration) -> (Self, mpsc::Receiver<ChangeBatch>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(16);
        let task = tokio::spawn(debounce(rx, out_tx, window));
        (Self { tx }, out_rx, task)
    }

    /// Report a local write. Never blocks; a stopped actor is ignored.
    pub fn notify(&self, entity_type: &EntityType) {
        if self.tx.send(entity_type.clone()).is_err() {
            debug!("Change notifier stopped, dropping event for {}", entity_type);
        }
    }
}

async fn debounce(
    mut rx: mpsc::UnboundedReceiver<EntityType>,
    out: mpsc::Sender<ChangeBatch>,
    window: Duration,
) {
    let mut pending: Option<ChangeBatch> = None;
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(entity_type) => {
                    let batch = pending.get_or_insert_with(ChangeBatch::default);
                    batch.entity_types.insert(entity_type);
                    batch.events += 1;
                    deadline.as_mut().reset(Instant::now() + window);
                }
                None => {
                    if let Some(batch) = pending.take() {
                        let _ = out.send(batch).await;
                    }
                    break;
                }
            },
            () = &mut deadline, if pending.is_some() => {
                if let Some(batch) = pending.take() {
                    debug!("Emitting change batch of {} writes", batch.events);
                    if out.send(batch).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    debug!("Change notifier stopped");
}
