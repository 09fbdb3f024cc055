use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;

use crate::{RegistryState, StoreOptions};

pub struct TestStateStore {
    pub registry_state: Arc<RegistryState>,
    // Owns the database directory, dropped with the store.
    temp_dir: TempDir,
}

impl TestStateStore {
    pub async fn new() -> Result<TestStateStore> {
        let temp_dir = tempfile::tempdir()?;
        let registry_state = RegistryState::new(
            temp_dir.path().join("state"),
            StoreOptions {
                // No need to fsync a throwaway database.
                sync_writes: false,
                ..Default::default()
            },
        )
        .await?;
        Ok(TestStateStore {
            registry_state,
            temp_dir,
        })
    }

    /// Closes the database and opens it again from the same directory.
    pub async fn reopen(self) -> Result<TestStateStore> {
        let TestStateStore {
            registry_state,
            temp_dir,
        } = self;
        drop(registry_state);
        let registry_state =
            RegistryState::new(temp_dir.path().join("state"), StoreOptions::default()).await?;
        Ok(TestStateStore {
            registry_state,
            temp_dir,
        })
    }
}
