//! Remote store trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tandem_common::{EntityType, OperationKind, Record, Result};

/// One entry of the server's change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub operation: OperationKind,
    /// Modification time of the record version this change carries (for
    /// deletes, the time of deletion).
    pub modified_at: DateTime<Utc>,
    /// When the server accepted the change. The feed is filtered on this.
    pub changed_at: DateTime<Utc>,
    /// Full record for creates and updates, absent for deletes.
    #[serde(default)]
    pub record: Option<Record>,
}

/// A record the server refused during batch upload because it holds a
/// newer copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchConflict {
    pub entity_id: Uuid,
    pub server_record: Record,
}

/// Server response to a batch upload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    /// Items stored or re-confirmed.
    pub accepted: usize,
    #[serde(default)]
    pub conflicts: Vec<BatchConflict>,
}

/// Remote, authoritative store.
///
/// Implementations must handle their own authentication. Every method may
/// fail with a connectivity error (`Network`, `Timeout`, `Authentication`,
/// `Serialization`), which callers treat as "remote unavailable".
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Get the backend name (e.g. "memory", "http").
    fn name(&self) -> &str;

    /// Lightweight reachability probe.
    async fn health(&self) -> Result<()>;

    /// Fetch one record. A missing record is `Ok(None)`, not an error.
    async fn get(&self, entity_type: &EntityType, id: Uuid) -> Result<Option<Record>>;

    /// Fetch every record of a type.
    async fn get_all(&self, entity_type: &EntityType) -> Result<Vec<Record>>;

    /// Create a record.
    ///
    /// # Errors
    /// - `AlreadyExists` if the id is already stored
    async fn create(&self, record: &Record) -> Result<Record>;

    /// Replace a stored record.
    ///
    /// # Errors
    /// - `NotFound` if the id is not stored
    async fn update(&self, record: &Record) -> Result<Record>;

    /// Delete a record.
    ///
    /// # Errors
    /// - `NotFound` if the id is not stored
    async fn delete(&self, entity_type: &EntityType, id: Uuid) -> Result<()>;

    /// Number of stored records of a type.
    async fn count(&self, entity_type: &EntityType) -> Result<usize>;

    /// Upload many records at once; the server upserts every item that is
    /// not older than its own copy and reports the rest as conflicts.
    async fn batch_upload(&self, entity_type: &EntityType, items: &[Record]) -> Result<BatchOutcome>;

    /// Change feed, oldest first, optionally bounded to changes accepted
    /// after `since`.
    async fn changes_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RemoteChange>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_serialization() {
        let entity_type = EntityType::new("task").unwrap();
        let record = Record::new(entity_type.clone(), serde_json::json!({"title": "a"}));
        let change = RemoteChange {
            entity_type,
            entity_id: record.id(),
            operation: OperationKind::Update,
            modified_at: record.modified_at(),
            changed_at: Utc::now(),
            record: Some(record.clone()),
        };

        let json = serde_json::to_string(&change).unwrap();
        assert!(json.contains("\"operation\":\"update\""));
        let restored: RemoteChange = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.record, Some(record));
    }

    #[test]
    fn test_delete_change_without_record() {
        let json = serde_json::json!({
            "entityType": "project",
            "entityId": "6f1c2b4e-8d3a-4f5b-9c7d-1e2f3a4b5c6d",
            "operation": "delete",
            "modifiedAt": "2026-01-01T09:00:00Z",
            "changedAt": "2026-01-01T09:00:01Z"
        });
        let change: RemoteChange = serde_json::from_value(json).unwrap();
        assert_eq!(change.operation, OperationKind::Delete);
        assert!(change.record.is_none());
    }
}
