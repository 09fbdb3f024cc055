use std::{collections::HashSet, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use data_model::{ContainerHandle, Owner};
use state_store::ContainerStore;

/// The workers that host containers.
#[async_trait]
pub trait WorkerFleet: Send + Sync {
    /// Names of the workers that are currently reachable.
    async fn live_workers(&self) -> Result<HashSet<String>>;

    /// Tears down `handle` on `worker_name`. Destroying a container the
    /// worker no longer has is a success.
    async fn destroy(&self, worker_name: &str, handle: &ContainerHandle) -> Result<()>;
}

/// Answers whether the build, pipeline or resource check a container
/// belongs to still exists.
#[async_trait]
pub trait OwnerCatalog: Send + Sync {
    async fn exists(&self, owner: &Owner) -> Result<bool>;
}

/// Owner catalog backed by the tombstones in the container store. Owners
/// exist until retired through `Registry::retire_owner`.
pub struct StoreOwnerCatalog {
    store: Arc<dyn ContainerStore>,
}

impl StoreOwnerCatalog {
    pub fn new(store: Arc<dyn ContainerStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl OwnerCatalog for StoreOwnerCatalog {
    async fn exists(&self, owner: &Owner) -> Result<bool> {
        Ok(!self.store.is_tombstoned(owner).await?)
    }
}
