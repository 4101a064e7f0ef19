use crate::core::{ContainerId, Result};
use crate::lifecycle::LifecycleRecord;
use async_trait::async_trait;

/// Storage backend for lifecycle records - allows pluggable durability
#[async_trait]
pub trait LifecycleStore: Send + Sync {
    /// Load the record for a container, if one was saved
    async fn load(&self, container_id: &ContainerId) -> Result<Option<LifecycleRecord>>;

    /// Insert or replace the record for a container
    async fn save(&self, container_id: &ContainerId, record: &LifecycleRecord) -> Result<()>;

    /// Remove the record for a container; missing records are not an error
    async fn delete(&self, container_id: &ContainerId) -> Result<()>;

    /// List every stored container id
    async fn list(&self) -> Result<Vec<ContainerId>>;
}
