//! Conflict detection and resolution planning.
//!
//! Everything here is pure: the resolver looks at records and timestamps
//! and says what should happen. The engine performs the resulting I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tandem_common::{EntityType, OperationKind, Record};
use tandem_store::{BatchConflict, RemoteChange};

/// How the user wants a conflict settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictResolution {
    /// Push the local version over the server's.
    KeepLocal,
    /// Overwrite local with the server's version.
    KeepServer,
    /// Whole-record last-write-wins on the two modification times.
    Merge,
}

/// A divergence between the local and server copies of one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub local_version: Option<Record>,
    /// `None` when the server side deleted the record.
    pub server_version: Option<Record>,
    pub local_modified_at: DateTime<Utc>,
    pub server_modified_at: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
}

impl SyncConflict {
    /// Conflict between a local record and an incoming feed change.
    pub fn from_change(local: &Record, change: &RemoteChange) -> Self {
        let server_version = match change.operation {
            OperationKind::Delete => None,
            _ => change.record.clone(),
        };
        Self {
            id: Uuid::new_v4(),
            entity_type: change.entity_type.clone(),
            entity_id: change.entity_id,
            local_version: Some(local.clone()),
            server_version,
            local_modified_at: local.modified_at(),
            server_modified_at: change.modified_at,
            detected_at: Utc::now(),
        }
    }

    /// Conflict reported by the server during a batch upload.
    pub fn from_batch(local: &Record, rejected: &BatchConflict) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_type: local.entity_type().clone(),
            entity_id: local.id(),
            local_version: Some(local.clone()),
            server_version: Some(rejected.server_record.clone()),
            local_modified_at: local.modified_at(),
            server_modified_at: rejected.server_record.modified_at(),
            detected_at: Utc::now(),
        }
    }

    /// Whether both conflicts describe the same pair of versions.
    pub fn same_versions(&self, other: &SyncConflict) -> bool {
        self.entity_type == other.entity_type
            && self.entity_id == other.entity_id
            && self.local_version == other.local_version
            && self.server_version == other.server_version
    }
}

/// Outcome of checking an incoming change against local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    /// Write the change through to the local store.
    Apply,
    /// Record a conflict and leave local untouched.
    Conflict,
}

/// What executing a resolution amounts to.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionPlan {
    /// Push the local version (a delete if there is none).
    PushLocal,
    /// Store the server version locally (delete locally if there is none).
    ApplyServer(Option<Record>),
}

/// Conflict detector and resolution planner.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// Decide whether an incoming server change may be applied.
    ///
    /// - No local copy, or a local copy not modified since `last_sync`:
    ///   apply.
    /// - Local copy newer than the change and the change is an update or a
    ///   delete: conflict. A server create for a record that already
    ///   exists locally is judged as an update.
    /// - Otherwise: apply.
    pub fn decide(
        &self,
        local: Option<&Record>,
        change: &RemoteChange,
        last_sync: Option<DateTime<Utc>>,
    ) -> ConflictDecision {
        let Some(local) = local else {
            return ConflictDecision::Apply;
        };

        if let Some(last_sync) = last_sync {
            if local.modified_at() <= last_sync {
                return ConflictDecision::Apply;
            }
        }

        if local.modified_at() > change.modified_at {
            ConflictDecision::Conflict
        } else {
            ConflictDecision::Apply
        }
    }

    /// Turn a user choice into a concrete plan.
    ///
    /// `Merge` keeps whichever side was modified last; ties go to the server.
    pub fn plan(&self, conflict: &SyncConflict, resolution: ConflictResolution) -> ResolutionPlan {
        match resolution {
            ConflictResolution::KeepLocal => ResolutionPlan::PushLocal,
            ConflictResolution::KeepServer => {
                ResolutionPlan::ApplyServer(conflict.server_version.clone())
            }
            ConflictResolution::Merge => {
                if conflict.local_modified_at > conflict.server_modified_at {
                    ResolutionPlan::PushLocal
                } else {
                    ResolutionPlan::ApplyServer(conflict.server_version.clone())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn task() -> EntityType {
        EntityType::new("task").unwrap()
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn record_at(id: Uuid, minutes: i64, title: &str) -> Record {
        Record::from_parts(id, task(), at(0), at(minutes), serde_json::json!({ "title": title }))
    }

    fn change(record: &Record, operation: OperationKind) -> RemoteChange {
        RemoteChange {
            entity_type: task(),
            entity_id: record.id(),
            operation,
            modified_at: record.modified_at(),
            changed_at: record.modified_at(),
            record: match operation {
                OperationKind::Delete => None,
                _ => Some(record.clone()),
            },
        }
    }

    #[test]
    fn test_no_local_record_applies() {
        let resolver = ConflictResolver::new();
        let server = record_at(Uuid::new_v4(), 0, "server");
        for op in [OperationKind::Create, OperationKind::Update, OperationKind::Delete] {
            assert_eq!(resolver.decide(None, &change(&server, op), None), ConflictDecision::Apply);
        }
    }

    #[test]
    fn test_newer_local_edit_conflicts() {
        let resolver = ConflictResolver::new();
        let id = Uuid::new_v4();
        let server = record_at(id, 0, "server");
        let local = record_at(id, 30, "local");

        let decision = resolver.decide(Some(&local), &change(&server, OperationKind::Update), None);
        assert_eq!(decision, ConflictDecision::Conflict);
    }

    #[test]
    fn test_server_delete_over_newer_local_conflicts() {
        let resolver = ConflictResolver::new();
        let id = Uuid::new_v4();
        let server = record_at(id, 0, "server");
        let local = record_at(id, 30, "local");

        let incoming = change(&server, OperationKind::Delete);
        assert_eq!(resolver.decide(Some(&local), &incoming, None), ConflictDecision::Conflict);

        let conflict = SyncConflict::from_change(&local, &incoming);
        assert!(conflict.server_version.is_none());
        assert_eq!(conflict.local_modified_at, at(30));
        assert_eq!(conflict.server_modified_at, at(0));
    }

    #[test]
    fn test_server_create_for_existing_local_is_judged_as_update() {
        let resolver = ConflictResolver::new();
        let id = Uuid::new_v4();
        let server = record_at(id, 0, "server");
        let local = record_at(id, 30, "local");

        let decision = resolver.decide(Some(&local), &change(&server, OperationKind::Create), None);
        assert_eq!(decision, ConflictDecision::Conflict);
    }

    #[test]
    fn test_local_unmodified_since_last_sync_applies() {
        let resolver = ConflictResolver::new();
        let id = Uuid::new_v4();
        let server = record_at(id, 0, "server");
        let local = record_at(id, 30, "local");

        let decision = resolver.decide(
            Some(&local),
            &change(&server, OperationKind::Update),
            Some(at(45)),
        );
        assert_eq!(decision, ConflictDecision::Apply);
    }

    #[test]
    fn test_merge_is_last_write_wins() {
        let resolver = ConflictResolver::new();
        let id = Uuid::new_v4();
        let server = record_at(id, 10, "server");
        let local = record_at(id, 30, "local");

        let local_newer = SyncConflict::from_change(&local, &change(&server, OperationKind::Update));
        assert_eq!(resolver.plan(&local_newer, ConflictResolution::Merge), ResolutionPlan::PushLocal);

        let older_local = record_at(id, 5, "local");
        let server_newer =
            SyncConflict::from_change(&older_local, &change(&server, OperationKind::Update));
        assert_eq!(
            resolver.plan(&server_newer, ConflictResolution::Merge),
            ResolutionPlan::ApplyServer(Some(server.clone()))
        );
    }

    #[test]
    fn test_explicit_plans() {
        let resolver = ConflictResolver::new();
        let id = Uuid::new_v4();
        let server = record_at(id, 10, "server");
        let local = record_at(id, 30, "local");
        let conflict = SyncConflict::from_change(&local, &change(&server, OperationKind::Delete));

        assert_eq!(resolver.plan(&conflict, ConflictResolution::KeepLocal), ResolutionPlan::PushLocal);
        assert_eq!(
            resolver.plan(&conflict, ConflictResolution::KeepServer),
            ResolutionPlan::ApplyServer(None)
        );
    }

    proptest! {
        /// Conflict iff local is strictly newer and the server op is an update or delete.
        #[test]
        fn test_conflict_detection_symmetry(
            local_min in 0i64..600,
            server_min in 0i64..600,
            is_delete in any::<bool>(),
        ) {
            let resolver = ConflictResolver::new();
            let id = Uuid::new_v4();
            let local = record_at(id, local_min, "local");
            let server = record_at(id, server_min, "server");
            let op = if is_delete { OperationKind::Delete } else { OperationKind::Update };

            let decision = resolver.decide(Some(&local), &change(&server, op), None);
            let expected = if local_min > server_min {
                ConflictDecision::Conflict
            } else {
                ConflictDecision::Apply
            };
            prop_assert_eq!(decision, expected);
        }
    }
}
