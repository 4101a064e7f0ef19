use super::LifecycleStore;
use crate::core::{ContainerId, Result};
use crate::lifecycle::LifecycleRecord;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Volatile store; records live as long as the process.
#[derive(Default)]
pub struct InMemoryLifecycleStore {
    records: RwLock<HashMap<ContainerId, LifecycleRecord>>,
}

impl InMemoryLifecycleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl LifecycleStore for InMemoryLifecycleStore {
    async fn load(&self, container_id: &ContainerId) -> Result<Option<LifecycleRecord>> {
        Ok(self.records.read().await.get(container_id).cloned())
    }

    async fn save(&self, container_id: &ContainerId, record: &LifecycleRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(container_id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, container_id: &ContainerId) -> Result<()> {
        self.records.write().await.remove(container_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ContainerId>> {
        let mut ids: Vec<_> = self.records.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
