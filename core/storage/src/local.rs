//! Local record store: trait and file-backed implementation.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

use tandem_common::{EntityType, Error, Record, Result};

/// Local, always-available record store.
///
/// One logical store per entity type. Implementations must be safe for
/// concurrent calls from many repositories at once.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Get the backend name (e.g. "memory", "file").
    fn name(&self) -> &str;

    /// Fetch one record.
    async fn get(&self, entity_type: &EntityType, id: Uuid) -> Result<Option<Record>>;

    /// Fetch every record of a type.
    async fn get_all(&self, entity_type: &EntityType) -> Result<Vec<Record>>;

    /// Insert or replace a record.
    async fn put(&self, record: &Record) -> Result<()>;

    /// Insert a new record.
    ///
    /// # Errors
    /// - `AlreadyExists` if the id is already stored
    async fn add(&self, record: &Record) -> Result<()>;

    /// Remove a record. Returns whether anything was removed.
    async fn delete(&self, entity_type: &EntityType, id: Uuid) -> Result<bool>;

    /// Number of stored records of a type.
    async fn count(&self, entity_type: &EntityType) -> Result<usize>;
}

/// File-backed local store.
///
/// Layout: `<root>/<entity_type>/<id>.json`. Writes go to a temporary file
/// first and are moved into place, so a reader never sees a torn record.
pub struct FileLocalStore {
    root: PathBuf,
}

impl FileLocalStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    /// - Permission denied or invalid path
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn type_dir(&self, entity_type: &EntityType) -> PathBuf {
        self.root.join(entity_type.as_str())
    }

    fn record_path(&self, entity_type: &EntityType, id: Uuid) -> PathBuf {
        self.type_dir(entity_type).join(format!("{}.json", id))
    }

    /// Serialize a record into a fresh temp file next to its final location.
    async fn write_temp(&self, record: &Record) -> Result<PathBuf> {
        let dir = self.type_dir(record.entity_type());
        fs::create_dir_all(&dir).await?;

        let tmp = dir.join(format!(".{}.{}.tmp", record.id(), Uuid::new_v4()));
        let json = serde_json::to_vec_pretty(record)?;
        fs::write(&tmp, json).await?;
        Ok(tmp)
    }

    async fn read_record(path: &Path) -> Result<Option<Record>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Record files of a type; temp files and foreign files are skipped.
    async fn record_files(&self, entity_type: &EntityType) -> Result<Vec<PathBuf>> {
        let dir = self.type_dir(entity_type);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_record = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(".json") && !n.starts_with('.'))
                .unwrap_or(false);
            if is_record {
                files.push(path);
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl LocalStore for FileLocalStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn get(&self, entity_type: &EntityType, id: Uuid) -> Result<Option<Record>> {
        Self::read_record(&self.record_path(entity_type, id)).await
    }

    async fn get_all(&self, entity_type: &EntityType) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        for path in self.record_files(entity_type).await? {
            // A concurrent delete may remove the file between listing and reading.
            if let Some(record) = Self::read_record(&path).await? {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.created_at());
        Ok(records)
    }

    async fn put(&self, record: &Record) -> Result<()> {
        let tmp = self.write_temp(record).await?;
        let target = self.record_path(record.entity_type(), record.id());
        if let Err(e) = fs::rename(&tmp, &target).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(Error::Io(e));
        }
        Ok(())
    }

    async fn add(&self, record: &Record) -> Result<()> {
        let tmp = self.write_temp(record).await?;
        let target = self.record_path(record.entity_type(), record.id());

        // hard_link refuses to replace an existing file, which makes the
        // existence check and the insert a single step.
        let linked = fs::hard_link(&tmp, &target).await;
        let _ = fs::remove_file(&tmp).await;

        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(Error::AlreadyExists(format!(
                "{} {} already stored locally",
                record.entity_type(),
                record.id()
            ))),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn delete(&self, entity_type: &EntityType, id: Uuid) -> Result<bool> {
        match fs::remove_file(self.record_path(entity_type, id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn count(&self, entity_type: &EntityType) -> Result<usize> {
        Ok(self.record_files(entity_type).await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn task() -> EntityType {
        EntityType::new("task").unwrap()
    }

    #[tokio::test]
    async fn test_file_put_get() {
        let temp = TempDir::new().unwrap();
        let store = FileLocalStore::new(temp.path()).unwrap();
        let record = Record::new(task(), serde_json::json!({"title": "Hello, Local!"}));

        store.put(&record).await.unwrap();
        let loaded = store.get(&task(), record.id()).await.unwrap();

        assert_eq!(loaded, Some(record));
    }

    #[tokio::test]
    async fn test_file_get_missing() {
        let temp = TempDir::new().unwrap();
        let store = FileLocalStore::new(temp.path()).unwrap();

        assert!(store.get(&task(), Uuid::new_v4()).await.unwrap().is_none());
        assert!(store.get_all(&task()).await.unwrap().is_empty());
        assert_eq!(store.count(&task()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_file_add_rejects_duplicate() {
        let temp = TempDir::new().unwrap();
        let store = FileLocalStore::new(temp.path()).unwrap();
        let record = Record::new(task(), serde_json::json!({}));

        store.add(&record).await.unwrap();
        let second = store.add(&record).await;

        assert!(matches!(second, Err(Error::AlreadyExists(_))));
        assert_eq!(store.count(&task()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_file_delete() {
        let temp = TempDir::new().unwrap();
        let store = FileLocalStore::new(temp.path()).unwrap();
        let record = Record::new(task(), serde_json::json!({}));
        store.put(&record).await.unwrap();

        assert!(store.delete(&task(), record.id()).await.unwrap());
        assert!(!store.delete(&task(), record.id()).await.unwrap());
        assert_eq!(store.count(&task()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_file_types_are_isolated() {
        let temp = TempDir::new().unwrap();
        let store = FileLocalStore::new(temp.path()).unwrap();
        let project = EntityType::new("project").unwrap();

        store.put(&Record::new(task(), serde_json::json!({}))).await.unwrap();
        store.put(&Record::new(project.clone(), serde_json::json!({}))).await.unwrap();
        store.put(&Record::new(project.clone(), serde_json::json!({}))).await.unwrap();

        assert_eq!(store.count(&task()).await.unwrap(), 1);
        assert_eq!(store.get_all(&project).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_file_concurrent_puts() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(FileLocalStore::new(temp.path()).unwrap());

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let record = Record::new(task(), serde_json::json!({ "n": i }));
                store.put(&record).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.count(&task()).await.unwrap(), 16);
    }
}
