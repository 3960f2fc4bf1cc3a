//! Task Record Persistence
//!
//! `TaskStore` is the port the engine persists records through. Records are
//! retained after completion; the engine never deletes them.

use crate::error::{Error, Result};
use crate::task::record::{TaskId, TaskRecord};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Port for task record persistence
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or replace a record
    async fn save(&self, record: &TaskRecord) -> Result<()>;

    async fn load(&self, id: &TaskId) -> Result<Option<TaskRecord>>;

    async fn list(&self) -> Result<Vec<TaskRecord>>;

    /// Records not yet `Complete` or `Failed`
    async fn list_unfinished(&self) -> Result<Vec<TaskRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| !r.is_terminal())
            .collect())
    }
}

pub type TaskStoreRef = Arc<dyn TaskStore>;

// =============================================================================
// Memory Store
// =============================================================================

/// In-memory task store
#[derive(Default)]
pub struct MemoryTaskStore {
    records: RwLock<BTreeMap<TaskId, TaskRecord>>,
}

impl MemoryTaskStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn save(&self, record: &TaskRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, id: &TaskId) -> Result<Option<TaskRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<TaskRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

// =============================================================================
// File Store
// =============================================================================

/// One JSON document per task under a state directory
pub struct FileTaskStore {
    dir: PathBuf,
    tmp_seq: AtomicU64,
}

impl FileTaskStore {
    /// Open (creating if needed) a store rooted at `dir`
    pub async fn open(dir: impl AsRef<Path>) -> Result<Arc<Self>> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        debug!("Task store opened at {}", dir.display());
        Ok(Arc::new(Self {
            dir,
            tmp_seq: AtomicU64::new(0),
        }))
    }

    fn path(&self, id: &TaskId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn save(&self, record: &TaskRecord) -> Result<()> {
        let body = serde_json::to_vec_pretty(record)?;
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = self.dir.join(format!("{}.{}.tmp", record.id, seq));

        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| Error::Persistence(format!("write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, self.path(&record.id))
            .await
            .map_err(|e| Error::Persistence(format!("rename {}: {}", tmp.display(), e)))?;
        Ok(())
    }

    async fn load(&self, id: &TaskId) -> Result<Option<TaskRecord>> {
        match tokio::fs::read(self.path(id)).await {
            Ok(body) => Ok(Some(serde_json::from_slice(&body)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<TaskRecord>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let body = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<TaskRecord>(&body) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable task record {}: {}", path.display(), e),
            }
        }

        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{Credential, ResourceRef};
    use crate::task::record::{NewTask, TaskStatus};

    fn record(workflow: &str) -> TaskRecord {
        let request = NewTask::new(
            workflow,
            ResourceRef::guest("g-1"),
            Credential::new("default", "p1"),
        );
        TaskRecord::new(TaskId::generate(), request, "init")
    }

    #[tokio::test]
    async fn test_file_store_persists_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::open(dir.path()).await.unwrap();

        let mut done = record("GuestCreateTask");
        done.status = TaskStatus::Complete;
        let pending = record("GuestDeleteTask");

        store.save(&done).await.unwrap();
        store.save(&pending).await.unwrap();

        // Reopening sees the same records
        let reopened = FileTaskStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.list().await.unwrap().len(), 2);

        let unfinished = reopened.list_unfinished().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].id, pending.id);

        let loaded = reopened.load(&done.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Complete);
        assert!(reopened
            .load(&TaskId::from("task-missing"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_file_store_skips_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTaskStore::open(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), b"hello")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("broken.json"), b"{")
            .await
            .unwrap();

        store.save(&record("GuestStartTask")).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_overwrites() {
        let store = MemoryTaskStore::new();
        let mut r = record("GuestCreateTask");
        store.save(&r).await.unwrap();

        r.stage = "on_disk_prepared".into();
        store.save(&r).await.unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].stage, "on_disk_prepared");
    }
}
