//! The single push path shared by repositories, direct pushes and queue
//! replay.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use tandem_common::{EntityType, Error, OperationKind, Record, Result};
use tandem_store::{LocalStore, RemoteStore};

use crate::queue::PendingOperation;
use crate::retry::within;

/// Sends one write to the remote store and folds the confirmed version
/// back into the local cache.
///
/// Replays are idempotent: a create for a record the server already has
/// becomes an update, an update for a record it lacks becomes a create,
/// and deleting something already gone counts as done.
#[derive(Clone)]
pub struct RemoteWriter {
    remote: Arc<dyn RemoteStore>,
    local: Arc<dyn LocalStore>,
    timeout: Duration,
}

impl RemoteWriter {
    pub fn new(remote: Arc<dyn RemoteStore>, local: Arc<dyn LocalStore>, timeout: Duration) -> Self {
        Self {
            remote,
            local,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Push a write. Returns the server-confirmed record for creates and
    /// updates, `None` for deletes.
    pub async fn push(
        &self,
        kind: OperationKind,
        entity_type: &EntityType,
        entity_id: Uuid,
        payload: Option<&Record>,
    ) -> Result<Option<Record>> {
        match kind {
            OperationKind::Create => {
                let record = require_payload(kind, entity_type, entity_id, payload)?;
                match within(self.timeout, "create", self.remote.create(record)).await {
                    Err(Error::AlreadyExists(_)) => {
                        debug!("{}/{} already on server, updating instead", entity_type, entity_id);
                        within(self.timeout, "update", self.remote.update(record)).await.map(Some)
                    }
                    other => other.map(Some),
                }
            }
            OperationKind::Update => {
                let record = require_payload(kind, entity_type, entity_id, payload)?;
                match within(self.timeout, "update", self.remote.update(record)).await {
                    Err(Error::NotFound(_)) => {
                        debug!("{}/{} missing on server, creating instead", entity_type, entity_id);
                        within(self.timeout, "create", self.remote.create(record)).await.map(Some)
                    }
                    other => other.map(Some),
                }
            }
            OperationKind::Delete => {
                match within(self.timeout, "delete", self.remote.delete(entity_type, entity_id)).await {
                    Ok(()) => Ok(None),
                    Err(Error::NotFound(_)) => {
                        debug!("{}/{} already gone on server", entity_type, entity_id);
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Replay a queued operation.
    pub async fn push_operation(&self, op: &PendingOperation) -> Result<Option<Record>> {
        self.push(op.kind, &op.entity_type, op.entity_id, op.payload.as_ref())
            .await
    }

    /// Store the server's version locally unless the local copy has moved
    /// on since, or has been deleted.
    pub async fn reconcile(&self, confirmed: &Record) -> Result<()> {
        match self.local.get(confirmed.entity_type(), confirmed.id()).await? {
            Some(local) if local.modified_at() > confirmed.modified_at() => {
                debug!(
                    "Keeping newer local copy of {}/{}",
                    confirmed.entity_type(),
                    confirmed.id()
                );
                Ok(())
            }
            Some(local) if local == *confirmed => Ok(()),
            Some(_) => self.local.put(confirmed).await,
            None => Ok(()),
        }
    }
}

fn require_payload<'a>(
    kind: OperationKind,
    entity_type: &EntityType,
    entity_id: Uuid,
    payload: Option<&'a Record>,
) -> Result<&'a Record> {
    payload.ok_or_else(|| {
        Error::InvalidInput(format!(
            "{} of {}/{} has no record to send",
            kind, entity_type, entity_id
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_store::{MemoryLocalStore, MemoryRemoteStore};

    fn task() -> EntityType {
        EntityType::new("task").unwrap()
    }

    fn setup() -> (Arc<MemoryRemoteStore>, Arc<MemoryLocalStore>, RemoteWriter) {
        let remote = Arc::new(MemoryRemoteStore::new());
        let local = Arc::new(MemoryLocalStore::new());
        let writer = RemoteWriter::new(remote.clone(), local.clone(), Duration::from_secs(1));
        (remote, local, writer)
    }

    #[tokio::test]
    async fn test_create_replay_degrades_to_update() {
        let (remote, _local, writer) = setup();
        let mut record = Record::new(task(), serde_json::json!({ "title": "A" }));

        writer
            .push(OperationKind::Create, &task(), record.id(), Some(&record))
            .await
            .unwrap();

        record.data = serde_json::json!({ "title": "B" });
        record.touch();
        writer
            .push(OperationKind::Create, &task(), record.id(), Some(&record))
            .await
            .unwrap();

        assert_eq!(remote.count(&task()).await.unwrap(), 1);
        let stored = remote.get(&task(), record.id()).await.unwrap().unwrap();
        assert_eq!(stored.data["title"], "B");
    }

    #[tokio::test]
    async fn test_update_of_missing_record_creates() {
        let (remote, _local, writer) = setup();
        let record = Record::new(task(), serde_json::json!({ "title": "A" }));

        writer
            .push(OperationKind::Update, &task(), record.id(), Some(&record))
            .await
            .unwrap();

        assert!(remote.get(&task(), record.id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_of_missing_record_is_ok() {
        let (_remote, _local, writer) = setup();
        let result = writer
            .push(OperationKind::Delete, &task(), Uuid::new_v4(), None)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_create_without_payload_is_invalid() {
        let (_remote, _local, writer) = setup();
        let result = writer
            .push(OperationKind::Create, &task(), Uuid::new_v4(), None)
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_network_failure_surfaces() {
        let (remote, _local, writer) = setup();
        remote.set_reachable(false);
        let record = Record::new(task(), serde_json::json!({}));

        let result = writer
            .push(OperationKind::Create, &task(), record.id(), Some(&record))
            .await;
        assert!(result.unwrap_err().is_connectivity());
    }

    #[tokio::test]
    async fn test_reconcile_keeps_newer_local() {
        let (_remote, local, writer) = setup();
        let confirmed = Record::new(task(), serde_json::json!({ "title": "server" }));

        let mut newer = confirmed.clone();
        newer.data = serde_json::json!({ "title": "local" });
        newer.touch();
        local.put(&newer).await.unwrap();

        writer.reconcile(&confirmed).await.unwrap();
        let stored = local.get(&task(), confirmed.id()).await.unwrap().unwrap();
        assert_eq!(stored.data["title"], "local");

        let mut server_newer = newer.clone();
        server_newer.data = serde_json::json!({ "title": "server v2" });
        server_newer.touch();
        writer.reconcile(&server_newer).await.unwrap();
        let stored = local.get(&task(), confirmed.id()).await.unwrap().unwrap();
        assert_eq!(stored.data["title"], "server v2");
    }
}
