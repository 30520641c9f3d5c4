//! Durable task records
//!
//! The persistence store keeps one record per task identifier: the source
//! URL, the options supplied at creation, the resource metadata, and the
//! latest status snapshot. Active tasks write through to the store so that
//! an inactive task's last known status is always durable.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::TaskOptions;
use crate::error::{Result, TaskError};
use crate::ident::TaskId;
use crate::state::{TaskInfo, TaskStatus};

/// One durable record, keyed by task identifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub url: String,
    pub options: TaskOptions,
    pub info: TaskInfo,
    pub status: TaskStatus,
}

impl TaskRecord {
    pub fn new(url: impl Into<String>, options: TaskOptions) -> Self {
        let url = url.into();
        let info = TaskInfo::new(&url);
        Self {
            url,
            options,
            info,
            status: TaskStatus::new(),
        }
    }
}

/// Durable keyed storage for task records.
///
/// All lookups fail with the inexistence error kind when the identifier has
/// no record.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create a record in the Created state, deriving the identifier from
    /// the URL. Idempotent: an existing record is left untouched.
    async fn create_task(&self, url: &str, options: &TaskOptions) -> Result<TaskId>;

    async fn contains(&self, id: &TaskId) -> Result<bool>;

    async fn get_url(&self, id: &TaskId) -> Result<String>;

    async fn get_options(&self, id: &TaskId) -> Result<TaskOptions>;

    async fn get_info(&self, id: &TaskId) -> Result<TaskInfo>;

    async fn get_status(&self, id: &TaskId) -> Result<TaskStatus>;

    async fn put_status(&self, id: &TaskId, status: &TaskStatus) -> Result<()>;

    async fn put_info(&self, id: &TaskId, info: &TaskInfo) -> Result<()>;

    /// All known task identifiers, in no particular order.
    async fn list_ids(&self) -> Result<Vec<TaskId>>;
}

/// File-backed store: one JSON document per task under a data directory.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn record_path(&self, id: &TaskId) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }

    async fn read_record(&self, id: &TaskId) -> Result<TaskRecord> {
        match tokio::fs::read(self.record_path(id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(TaskError::task_inexistence(id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_record(&self, id: &TaskId, record: &TaskRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let bytes = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(self.record_path(id), bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for FileStore {
    async fn create_task(&self, url: &str, options: &TaskOptions) -> Result<TaskId> {
        let id = TaskId::derive(url);
        if self.contains(&id).await? {
            return Ok(id);
        }
        let record = TaskRecord::new(url, options.clone());
        self.write_record(&id, &record).await?;
        Ok(id)
    }

    async fn contains(&self, id: &TaskId) -> Result<bool> {
        match tokio::fs::metadata(self.record_path(id)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_url(&self, id: &TaskId) -> Result<String> {
        Ok(self.read_record(id).await?.url)
    }

    async fn get_options(&self, id: &TaskId) -> Result<TaskOptions> {
        Ok(self.read_record(id).await?.options)
    }

    async fn get_info(&self, id: &TaskId) -> Result<TaskInfo> {
        Ok(self.read_record(id).await?.info)
    }

    async fn get_status(&self, id: &TaskId) -> Result<TaskStatus> {
        Ok(self.read_record(id).await?.status)
    }

    async fn put_status(&self, id: &TaskId, status: &TaskStatus) -> Result<()> {
        let mut record = self.read_record(id).await?;
        record.status = status.clone();
        self.write_record(id, &record).await
    }

    async fn put_info(&self, id: &TaskId, info: &TaskInfo) -> Result<()> {
        let mut record = self.read_record(id).await?;
        record.info = info.clone();
        self.write_record(id, &record).await
    }

    async fn list_ids(&self) -> Result<Vec<TaskId>> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".json") {
                if let Ok(id) = TaskId::parse(stem) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("root", &self.root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::state::TaskState;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_create_and_read_back() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());

        let options = TaskOptions::new().with_format("best");
        let id = store
            .create_task("https://example.com/clip.mp4", &options)
            .await
            .unwrap();

        assert!(store.contains(&id).await.unwrap());
        assert_eq!(store.get_url(&id).await.unwrap(), "https://example.com/clip.mp4");
        assert_eq!(store.get_options(&id).await.unwrap(), options);
        assert_eq!(store.get_status(&id).await.unwrap().state, TaskState::Created);
        assert_eq!(
            store.get_info(&id).await.unwrap().file_name.as_deref(),
            Some("clip.mp4")
        );
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());

        let first = TaskOptions::new().with_retries(1);
        let id = store.create_task("https://example.com/a", &first).await.unwrap();

        // a second create with different options must not overwrite
        let second = TaskOptions::new().with_retries(9);
        let again = store.create_task("https://example.com/a", &second).await.unwrap();

        assert_eq!(id, again);
        assert_eq!(store.get_options(&id).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_unknown_id_fails_with_inexistence() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());

        let id = TaskId::derive("https://example.com/never-created");
        let err = store.get_status(&id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TaskInexistence);

        let err = store.put_status(&id, &TaskStatus::new()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TaskInexistence);
    }

    #[tokio::test]
    async fn test_put_status_persists() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());

        let id = store
            .create_task("https://example.com/a", &TaskOptions::new())
            .await
            .unwrap();

        let mut status = store.get_status(&id).await.unwrap();
        status.mark_started();
        status.update_progress(128, Some(256), None);
        status.mark_paused();
        store.put_status(&id, &status).await.unwrap();

        let back = store.get_status(&id).await.unwrap();
        assert_eq!(back.state, TaskState::Paused);
        assert_eq!(back.downloaded_bytes, 128);
    }

    #[tokio::test]
    async fn test_list_ids() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        assert!(store.list_ids().await.unwrap().is_empty());

        let a = store
            .create_task("https://example.com/a", &TaskOptions::new())
            .await
            .unwrap();
        let b = store
            .create_task("https://example.com/b", &TaskOptions::new())
            .await
            .unwrap();

        let mut ids = store.list_ids().await.unwrap();
        ids.sort_by(|x, y| x.as_str().cmp(y.as_str()));
        let mut expect = vec![a, b];
        expect.sort_by(|x, y| x.as_str().cmp(y.as_str()));
        assert_eq!(ids, expect);
    }
}
