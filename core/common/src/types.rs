//! Common types used throughout tandem.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Tag selecting the logical collection a record belongs to ("task", "project", ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityType(String);

impl EntityType {
    /// Create a new entity type tag.
    ///
    /// # Preconditions
    /// - `name` must be non-empty
    /// - `name` may only contain ASCII lowercase letters, digits, `_` and `-`
    ///
    /// # Errors
    /// - Returns error if the name is empty or contains other characters,
    ///   since the tag becomes a directory name and a URL segment
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Entity type cannot be empty".to_string(),
            ));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            return Err(crate::Error::InvalidInput(format!(
                "Invalid entity type '{}': use lowercase letters, digits, '_' or '-'",
                name
            )));
        }
        Ok(Self(name))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EntityType {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<EntityType> for String {
    fn from(value: EntityType) -> Self {
        value.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of write carried by a pending operation or a remote change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// An opaque entity record as seen by the sync layer.
///
/// The payload is domain data the sync engine never interprets. The
/// modification timestamp is owned by the repository layer: callers build
/// records with [`Record::new`] and every repository write advances it
/// through [`Record::touch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    id: Uuid,
    entity_type: EntityType,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
    /// Domain payload.
    pub data: serde_json::Value,
}

impl Record {
    /// Create a fresh record with a writer-generated id.
    pub fn new(entity_type: EntityType, data: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            entity_type,
            created_at: now,
            modified_at: now,
            data,
        }
    }

    /// Rebuild a record with known identity and timestamps, e.g. from a
    /// storage backend or a fixture.
    pub fn from_parts(
        id: Uuid,
        entity_type: EntityType,
        created_at: DateTime<Utc>,
        modified_at: DateTime<Utc>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id,
            entity_type,
            created_at,
            modified_at,
            data,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    /// Advance the modification timestamp for a new write.
    ///
    /// The result is strictly greater than the previous value even when the
    /// wall clock has not moved (or moved backwards).
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.modified_at = if now > self.modified_at {
            now
        } else {
            self.modified_at + Duration::milliseconds(1)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_entity_type_validation() {
        assert!(EntityType::new("task").is_ok());
        assert!(EntityType::new("habit_log-2").is_ok());
        assert!(EntityType::new("").is_err());
        assert!(EntityType::new("Task").is_err());
        assert!(EntityType::new("../etc").is_err());
    }

    #[test]
    fn test_entity_type_deserialize_rejects_invalid() {
        let ok: EntityType = serde_json::from_str("\"goal\"").unwrap();
        assert_eq!(ok.as_str(), "goal");
        assert!(serde_json::from_str::<EntityType>("\"a/b\"").is_err());
    }

    #[test]
    fn test_record_wire_format() {
        let record = Record::new(
            EntityType::new("task").unwrap(),
            serde_json::json!({"title": "write report"}),
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["entityType"], "task");
        assert_eq!(json["data"]["title"], "write report");
        assert!(json.get("modifiedAt").is_some());
    }

    #[test]
    fn test_touch_after_future_timestamp() {
        let future = Utc::now() + Duration::hours(1);
        let mut record = Record::from_parts(
            Uuid::new_v4(),
            EntityType::new("task").unwrap(),
            future,
            future,
            serde_json::Value::Null,
        );
        record.touch();
        assert_eq!(record.modified_at(), future + Duration::milliseconds(1));
        assert_eq!(record.created_at(), future);
    }

    proptest! {
        #[test]
        fn test_touch_is_strictly_monotonic(offset_ms in -10_000i64..10_000) {
            let start = Utc::now() + Duration::milliseconds(offset_ms);
            let mut record = Record::from_parts(
                Uuid::new_v4(),
                EntityType::new("task").unwrap(),
                start,
                start,
                serde_json::Value::Null,
            );
            record.touch();
            prop_assert!(record.modified_at() > start);
        }
    }
}
