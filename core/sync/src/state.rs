//! Sync state tracking and persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use tandem_common::{EntityType, Error, Result};

use crate::conflict::SyncConflict;

/// Bookkeeping for incremental sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    /// End of the last successful pass. `None` until the first one.
    pub last_sync_time: Option<DateTime<Utc>>,
}

/// Everything the engine owns across passes: the last sync time and the
/// outstanding conflicts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub metadata: SyncMetadata,
    conflicts: Vec<SyncConflict>,
}

impl SyncState {
    /// Create a new empty sync state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Outstanding conflicts, oldest first.
    pub fn conflicts(&self) -> &[SyncConflict] {
        &self.conflicts
    }

    pub fn conflict(&self, id: Uuid) -> Option<&SyncConflict> {
        self.conflicts.iter().find(|c| c.id == id)
    }

    /// Outstanding conflict on a record, if any.
    pub fn conflict_for(&self, entity_type: &EntityType, entity_id: Uuid) -> Option<&SyncConflict> {
        self.conflicts
            .iter()
            .find(|c| &c.entity_type == entity_type && c.entity_id == entity_id)
    }

    /// Record a conflict, keeping at most one per record.
    ///
    /// Returns `true` if the conflict is new or replaces one with different
    /// versions. A repeat of an already-known divergence returns `false`
    /// and keeps the existing id.
    pub fn add_conflict(&mut self, conflict: SyncConflict) -> bool {
        let existing = self.conflicts.iter_mut().find(|c| {
            c.entity_type == conflict.entity_type && c.entity_id == conflict.entity_id
        });

        match existing {
            Some(current) if current.same_versions(&conflict) => false,
            Some(current) => {
                debug!(
                    "Replacing conflict {} for {}/{}",
                    current.id, conflict.entity_type, conflict.entity_id
                );
                *current = conflict;
                true
            }
            None => {
                self.conflicts.push(conflict);
                true
            }
        }
    }

    /// Remove a conflict by id.
    pub fn remove_conflict(&mut self, id: Uuid) -> Option<SyncConflict> {
        let index = self.conflicts.iter().position(|c| c.id == id)?;
        Some(self.conflicts.remove(index))
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// On-disk home of a [`SyncState`].
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub const FILE_NAME: &'static str = "sync_state.json";

    /// State file inside `state_dir`.
    pub fn in_dir(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join(Self::FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state, or an empty one if the file does not exist yet.
    pub async fn load(&self) -> Result<SyncState> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => SyncState::from_json(&json),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No sync state at {}, starting fresh", self.path.display());
                Ok(SyncState::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, state: &SyncState) -> Result<()> {
        write_atomic(&self.path, state.to_json()?.as_bytes()).await
    }
}

/// Replace `path` with `contents` via a sibling temp file and a rename.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidInput(format!("Not a file path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

    tokio::fs::write(&tmp, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
            warn!("Failed to remove {}: {}", tmp.display(), cleanup);
        }
        return Err(e.into());
    }
    Ok(())
}

/// Outcome of every engine operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub error: Option<String>,
    pub items_synced: usize,
    pub conflicts: usize,
    pub sync_time: DateTime<Utc>,
    pub messages: Vec<String>,
}

impl SyncResult {
    /// An empty successful result stamped now.
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            items_synced: 0,
            conflicts: 0,
            sync_time: Utc::now(),
            messages: Vec::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::ok()
        }
    }

    /// Mark as failed, keeping counts and messages gathered so far.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.success = false;
        self.error = Some(error.into());
    }

    pub fn message(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    /// Fold a sub-pass into this result.
    pub fn merge(&mut self, other: SyncResult) {
        self.items_synced += other.items_synced;
        self.conflicts += other.conflicts;
        self.messages.extend(other.messages);
        if !other.success {
            self.success = false;
            if self.error.is_none() {
                self.error = other.error;
            }
        }
        self.sync_time = self.sync_time.max(other.sync_time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_common::{EntityType, Record};
    use tempfile::TempDir;

    fn conflict_for(record: &Record, server_title: &str) -> SyncConflict {
        let mut server = record.clone();
        server.data = serde_json::json!({ "title": server_title });
        SyncConflict {
            id: Uuid::new_v4(),
            entity_type: record.entity_type().clone(),
            entity_id: record.id(),
            local_version: Some(record.clone()),
            server_version: Some(server),
            local_modified_at: record.modified_at(),
            server_modified_at: record.modified_at(),
            detected_at: Utc::now(),
        }
    }

    fn task_record() -> Record {
        Record::new(EntityType::new("task").unwrap(), serde_json::json!({ "title": "A" }))
    }

    #[test]
    fn test_add_conflict_dedupes_by_record() {
        let mut state = SyncState::new();
        let record = task_record();

        let first = conflict_for(&record, "server");
        let first_id = first.id;
        assert!(state.add_conflict(first));
        assert!(!state.add_conflict(conflict_for(&record, "server")));
        assert_eq!(state.conflicts().len(), 1);
        assert_eq!(state.conflicts()[0].id, first_id);

        assert!(state.add_conflict(conflict_for(&record, "server v2")));
        assert_eq!(state.conflicts().len(), 1);
        assert_ne!(state.conflicts()[0].id, first_id);
    }

    #[test]
    fn test_remove_conflict() {
        let mut state = SyncState::new();
        let conflict = conflict_for(&task_record(), "server");
        let id = conflict.id;
        state.add_conflict(conflict);

        assert!(state.conflict(id).is_some());
        assert!(state.remove_conflict(id).is_some());
        assert!(state.remove_conflict(id).is_none());
        assert!(!state.has_conflicts());
    }

    #[test]
    fn test_state_serialization() {
        let mut state = SyncState::new();
        state.metadata.last_sync_time = Some(Utc::now());
        state.add_conflict(conflict_for(&task_record(), "server"));

        let json = state.to_json().unwrap();
        assert!(json.contains("lastSyncTime"));
        let restored = SyncState::from_json(&json).unwrap();

        assert_eq!(restored.metadata, state.metadata);
        assert_eq!(restored.conflicts(), state.conflicts());
    }

    #[tokio::test]
    async fn test_state_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let file = StateFile::in_dir(dir.path().join("state"));

        let empty = file.load().await.unwrap();
        assert!(empty.metadata.last_sync_time.is_none());

        let mut state = SyncState::new();
        state.metadata.last_sync_time = Some(Utc::now());
        state.add_conflict(conflict_for(&task_record(), "server"));
        file.save(&state).await.unwrap();

        let loaded = file.load().await.unwrap();
        assert_eq!(loaded.metadata, state.metadata);
        assert_eq!(loaded.conflicts().len(), 1);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("state"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_state_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let file = StateFile::in_dir(dir.path());
        std::fs::write(file.path(), "{not json").unwrap();

        assert!(matches!(file.load().await, Err(Error::Serialization(_))));
    }

    #[test]
    fn test_result_merge() {
        let mut total = SyncResult::ok();
        total.items_synced = 2;

        let mut pull = SyncResult::failed("Network error: down");
        pull.conflicts = 1;
        pull.message("skipped note/1");

        total.merge(pull);
        assert!(!total.success);
        assert_eq!(total.items_synced, 2);
        assert_eq!(total.conflicts, 1);
        assert_eq!(total.messages, vec!["skipped note/1".to_string()]);
        assert_eq!(total.error.as_deref(), Some("Network error: down"));
    }
}
