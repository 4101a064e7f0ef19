//! File-backed lifecycle store: one MessagePack snapshot per container.

use super::LifecycleStore;
use crate::core::{ContainerId, LifecycleError, Result};
use crate::lifecycle::LifecycleRecord;
use async_trait::async_trait;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const RECORD_EXTENSION: &str = "lifecycle";

// ============================================================================
// Record Files
// ============================================================================

/// Reads and writes single record files. Writes go to a temp file in the same
/// directory and are renamed into place, so a crash never leaves a torn record.
#[derive(Debug, Clone)]
struct RecordFiles {
    dir: PathBuf,
}

impl RecordFiles {
    fn path_for(&self, container_id: &ContainerId) -> PathBuf {
        self.dir
            .join(format!("{}.{}", container_id.as_str(), RECORD_EXTENSION))
    }

    fn write(&self, container_id: &ContainerId, record: &LifecycleRecord) -> Result<()> {
        let serialized = rmp_serde::to_vec_named(record).map_err(|e| {
            LifecycleError::Storage(format!("Failed to serialize record: {}", e))
        })?;
        let temp = NamedTempFile::new_in(&self.dir).map_err(|e| {
            LifecycleError::Storage(format!("Failed to create temp file: {}", e))
        })?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            writer.write_all(&serialized).map_err(|e| {
                LifecycleError::Storage(format!("Failed to write record: {}", e))
            })?;
            writer.flush().map_err(|e| {
                LifecycleError::Storage(format!("Failed to flush record: {}", e))
            })?;
        }
        temp.as_file().sync_all().map_err(|e| {
            LifecycleError::Storage(format!("Failed to sync record: {}", e))
        })?;
        temp.persist(self.path_for(container_id)).map_err(|e| {
            LifecycleError::Storage(format!("Failed to rename record: {}", e.error))
        })?;
        Ok(())
    }

    fn read(&self, container_id: &ContainerId) -> Result<Option<LifecycleRecord>> {
        let path = self.path_for(container_id);
        if !path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&path)
            .map_err(|e| LifecycleError::Storage(format!("Failed to open record: {}", e)))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| LifecycleError::Storage(format!("Failed to read record: {}", e)))?;
        let record: LifecycleRecord = rmp_serde::from_slice(&data).map_err(|e| {
            LifecycleError::Storage(format!(
                "Failed to deserialize record {}: {}",
                path.display(),
                e
            ))
        })?;
        if record.container_id != *container_id {
            return Err(LifecycleError::Storage(format!(
                "Record {} belongs to container '{}'",
                path.display(),
                record.container_id
            )));
        }
        Ok(Some(record))
    }

    fn remove(&self, container_id: &ContainerId) -> Result<()> {
        let path = self.path_for(container_id);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| {
                LifecycleError::Storage(format!("Failed to delete record: {}", e))
            })?;
        }
        Ok(())
    }

    fn scan(&self) -> Result<Vec<ContainerId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                log::warn!("Skipping record file with non UTF-8 name: {}", path.display());
                continue;
            };
            match ContainerId::new(stem) {
                Ok(id) => ids.push(id),
                Err(e) => log::warn!("Skipping record file {}: {}", path.display(), e),
            }
        }
        ids.sort();
        Ok(ids)
    }
}

// ============================================================================
// File Lifecycle Store
// ============================================================================

/// Durable store rooted at a directory, created on first use.
///
/// Blocking file I/O runs on the tokio blocking pool.
#[derive(Debug, Clone)]
pub struct FileLifecycleStore {
    files: RecordFiles,
}

impl FileLifecycleStore {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            LifecycleError::Storage(format!("Failed to create store directory: {}", e))
        })?;
        log::debug!("Opened lifecycle store at {}", dir.display());
        Ok(Self {
            files: RecordFiles { dir },
        })
    }

    pub fn dir(&self) -> &Path {
        &self.files.dir
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(RecordFiles) -> Result<T> + Send + 'static,
    {
        let files = self.files.clone();
        tokio::task::spawn_blocking(move || op(files))
            .await
            .map_err(|e| LifecycleError::Storage(format!("Store task failed: {}", e)))?
    }
}

#[async_trait]
impl LifecycleStore for FileLifecycleStore {
    async fn load(&self, container_id: &ContainerId) -> Result<Option<LifecycleRecord>> {
        let id = container_id.clone();
        self.blocking(move |files| files.read(&id)).await
    }

    async fn save(&self, container_id: &ContainerId, record: &LifecycleRecord) -> Result<()> {
        let id = container_id.clone();
        let record = record.clone();
        self.blocking(move |files| files.write(&id, &record)).await
    }

    async fn delete(&self, container_id: &ContainerId) -> Result<()> {
        let id = container_id.clone();
        self.blocking(move |files| files.remove(&id)).await
    }

    async fn list(&self) -> Result<Vec<ContainerId>> {
        self.blocking(|files| files.scan()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SubscriptionTier;
    use crate::lifecycle::LifecycleConfig;
    use crate::lifecycle::state::{DEFAULT_HISTORY_LIMIT, LifecycleEvent, TransitionGuards};
    use crate::policy::{StaticTierPolicy, TierPolicy};
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(raw: &str) -> LifecycleRecord {
        let id = ContainerId::new(raw).unwrap();
        let mut record = LifecycleRecord::new(
            id.clone(),
            SubscriptionTier::Pro,
            LifecycleConfig::development(),
            &StaticTierPolicy::new().limits(SubscriptionTier::Pro),
            DEFAULT_HISTORY_LIMIT,
            Utc::now(),
        );
        record
            .machine
            .apply(&id, LifecycleEvent::ProvisioningComplete, TransitionGuards::default(), Utc::now())
            .unwrap();
        record.extensions_used = 2;
        record
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileLifecycleStore::open(temp_dir.path()).unwrap();
        let rec = record("ctr-disk");

        store.save(&rec.container_id, &rec).await.unwrap();
        assert!(temp_dir.path().join("ctr-disk.lifecycle").exists());

        let loaded = store.load(&rec.container_id).await.unwrap().unwrap();
        assert_eq!(loaded, rec);
        assert_eq!(loaded.machine.history().count(), 1);
    }

    #[tokio::test]
    async fn test_reopen_lists_records() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = FileLifecycleStore::open(temp_dir.path()).unwrap();
            for raw in ["ctr-b", "ctr-a"] {
                let rec = record(raw);
                store.save(&rec.container_id, &rec).await.unwrap();
            }
        }
        fs::write(temp_dir.path().join("notes.txt"), b"ignored").unwrap();

        let store = FileLifecycleStore::open(temp_dir.path()).unwrap();
        let ids = store.list().await.unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0].as_str(), "ctr-a");
    }

    #[tokio::test]
    async fn test_delete_and_missing() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileLifecycleStore::open(temp_dir.path()).unwrap();
        let rec = record("ctr-gone");
        store.save(&rec.container_id, &rec).await.unwrap();
        store.delete(&rec.container_id).await.unwrap();
        store.delete(&rec.container_id).await.unwrap();
        assert_eq!(store.load(&rec.container_id).await.unwrap(), None);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_a_storage_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileLifecycleStore::open(temp_dir.path()).unwrap();
        fs::write(temp_dir.path().join("ctr-bad.lifecycle"), b"\x00\x01garbage").unwrap();

        let err = store
            .load(&ContainerId::new("ctr-bad").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Storage(_)));
    }
}
