use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use data_model::{
    ContainerHandle,
    ContainerRecord,
    ContainerState,
    Owner,
    OwnerTombstone,
};
use driver::RocksDBDriver;
use metrics::{StateStoreMetrics, Timer};
use opentelemetry::KeyValue;
use rocksdb::{ColumnFamilyDescriptor, Options};
use scanner::StateReader;
use state_machine::ContainerColumns;
use strum::IntoEnumIterator;
use tracing::info;

pub mod driver;
pub mod error;
pub mod in_memory;
pub mod scanner;
pub mod state_machine;
pub mod test_state_store;

#[cfg(test)]
mod store_tests;

pub use error::StoreError;
pub use in_memory::InMemoryStore;

/// How an insert treats the per-identifier reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// Fails with `IdentifierReserved` if another record already holds the
    /// reservation for the identifier. The new record claims it.
    Exclusive,
    /// Plain insert that neither checks nor claims the reservation.
    /// Used for imports and test fixtures.
    Historical,
}

/// Conditional state change: applied only if the stored record is still in
/// `expected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub expected: ContainerState,
    pub next: ContainerState,
    pub used_at: Option<u64>,
    pub destroy_failed: bool,
    /// Only apply if nobody used the container after this time.
    pub unused_since: Option<u64>,
}

impl Transition {
    pub fn new(expected: ContainerState, next: ContainerState) -> Self {
        Self {
            expected,
            next,
            used_at: None,
            destroy_failed: false,
            unused_since: None,
        }
    }

    pub fn touched(mut self, at: u64) -> Self {
        self.used_at = Some(at);
        self
    }

    /// Guards a transition decided on an older read of the record.
    pub fn if_unused_since(mut self, last_used_at: u64) -> Self {
        self.unused_since = Some(last_used_at);
        self
    }

    pub fn with_failed_destroy(mut self) -> Self {
        self.destroy_failed = true;
        self
    }

    /// Produces the updated record, or the reason the transition can not be
    /// applied to `current`.
    pub fn apply(&self, current: &ContainerRecord) -> Result<ContainerRecord, StoreError> {
        if current.state != self.expected {
            return Err(StoreError::StateConflict {
                handle: current.handle.clone(),
                expected: self.expected,
                actual: current.state,
            });
        }
        if let Some(observed_at) = self.unused_since {
            if current.last_used_at != observed_at {
                return Err(StoreError::UsedSince {
                    handle: current.handle.clone(),
                    observed_at,
                    last_used_at: current.last_used_at,
                });
            }
        }
        if !current.state.can_transition_to(self.next) {
            return Err(StoreError::InvalidTransition {
                handle: current.handle.clone(),
                from: current.state,
                to: self.next,
            });
        }
        let mut updated = current.clone();
        updated.state = self.next;
        if let Some(at) = self.used_at {
            updated.touch(at);
        }
        if self.destroy_failed {
            updated.destroy_attempts = updated.destroy_attempts.saturating_add(1);
        }
        Ok(updated)
    }
}

/// Durable, atomic storage of container records.
///
/// Every method is a single atomic step: concurrent callers never observe
/// a partially applied insert, transition or delete.
#[async_trait]
pub trait ContainerStore: Send + Sync {
    async fn insert(&self, record: ContainerRecord, mode: InsertMode) -> Result<(), StoreError>;

    async fn get_by_handle(
        &self,
        handle: &ContainerHandle,
    ) -> Result<Option<ContainerRecord>, StoreError>;

    /// Records sharing the identifier key, most recently used first.
    async fn find_by_identifier(
        &self,
        identifier_key: &str,
    ) -> Result<Vec<ContainerRecord>, StoreError>;

    /// Compare-and-swap on the record's state. Returns the stored record
    /// after the update.
    async fn update_state(
        &self,
        handle: &ContainerHandle,
        transition: Transition,
    ) -> Result<ContainerRecord, StoreError>;

    async fn delete(&self, handle: &ContainerHandle) -> Result<(), StoreError>;

    async fn list_containers(&self) -> Result<Vec<ContainerRecord>, StoreError>;

    async fn list_by_state(&self, state: ContainerState) -> Result<Vec<ContainerRecord>, StoreError> {
        Ok(self
            .list_containers()
            .await?
            .into_iter()
            .filter(|record| record.state == state)
            .collect())
    }

    /// Marks an owner as deleted. Retiring an owner twice keeps the first
    /// retirement time.
    async fn tombstone_owner(&self, owner: Owner, retired_at: u64) -> Result<(), StoreError>;

    async fn is_tombstoned(&self, owner: &Owner) -> Result<bool, StoreError>;
}

/// Orders records most recently used first, ties broken by the newest
/// creation time and then by handle.
pub fn sort_most_recent_first(records: &mut [ContainerRecord]) {
    records.sort_by(|a, b| {
        b.last_used_at
            .cmp(&a.last_used_at)
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| a.handle.cmp(&b.handle))
    });
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub sync_writes: bool,
    pub lock_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            sync_writes: true,
            lock_timeout: Duration::from_secs(1),
        }
    }
}

/// RocksDB backed container store.
pub struct RegistryState {
    db: Arc<RocksDBDriver>,
    reader: StateReader,
    metrics: Arc<StateStoreMetrics>,
}

impl RegistryState {
    pub async fn new(path: PathBuf, options: StoreOptions) -> Result<Arc<Self>> {
        fs::create_dir_all(path.clone())
            .map_err(|e| anyhow!("failed to create state store dir: {}", e))?;

        let column_families = ContainerColumns::iter()
            .map(|cf| ColumnFamilyDescriptor::new(cf.to_string(), Options::default()))
            .collect();
        let db = Arc::new(
            RocksDBDriver::open(driver::Options {
                path: path.clone(),
                column_families,
                sync_writes: options.sync_writes,
                lock_timeout_ms: options.lock_timeout.as_millis() as i64,
            })
            .map_err(|e| anyhow!("failed to open db: {}", e))?,
        );
        info!(
            path = %path.display(),
            sync_writes = options.sync_writes,
            "initialized container state store"
        );

        Ok(Arc::new(Self {
            reader: StateReader::new(db.clone()),
            db,
            metrics: Arc::new(StateStoreMetrics::new()),
        }))
    }

    pub fn reader(&self) -> &StateReader {
        &self.reader
    }

    // RocksDB calls block, keep them off the async workers.
    #[tracing::instrument(skip(self, f))]
    async fn write<T, F>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&RocksDBDriver) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let labels = [KeyValue::new("op", op)];
        let _timer = Timer::start_with_labels(&self.metrics.state_write, &labels);
        self.metrics.driver_writes.add(1, &labels);
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    async fn read<T, F>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&StateReader) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let labels = [KeyValue::new("op", op)];
        let _timer = Timer::start_with_labels(&self.metrics.state_read, &labels);
        self.metrics.driver_reads.add(1, &labels);
        let reader = self.reader.clone();
        tokio::task::spawn_blocking(move || f(&reader)).await?
    }
}

#[async_trait]
impl ContainerStore for RegistryState {
    async fn insert(&self, record: ContainerRecord, mode: InsertMode) -> Result<(), StoreError> {
        self.write("insert", move |db| {
            state_machine::insert_container(db, &record, mode)
        })
        .await
    }

    async fn get_by_handle(
        &self,
        handle: &ContainerHandle,
    ) -> Result<Option<ContainerRecord>, StoreError> {
        let handle = handle.clone();
        self.read("get_by_handle", move |reader| reader.get_container(&handle))
            .await
    }

    async fn find_by_identifier(
        &self,
        identifier_key: &str,
    ) -> Result<Vec<ContainerRecord>, StoreError> {
        let identifier_key = identifier_key.to_string();
        self.metrics.driver_scans.add(1, &[]);
        let mut records = self
            .read("find_by_identifier", move |reader| {
                reader.containers_for_identifier(&identifier_key)
            })
            .await?;
        sort_most_recent_first(&mut records);
        Ok(records)
    }

    async fn update_state(
        &self,
        handle: &ContainerHandle,
        transition: Transition,
    ) -> Result<ContainerRecord, StoreError> {
        let handle = handle.clone();
        self.write("update_state", move |db| {
            state_machine::update_container_state(db, &handle, &transition)
        })
        .await
    }

    async fn delete(&self, handle: &ContainerHandle) -> Result<(), StoreError> {
        let handle = handle.clone();
        self.metrics.driver_deletes.add(1, &[]);
        self.write("delete", move |db| {
            state_machine::delete_container(db, &handle)
        })
        .await
    }

    async fn list_containers(&self) -> Result<Vec<ContainerRecord>, StoreError> {
        self.metrics.driver_scans.add(1, &[]);
        self.read("list_containers", |reader| reader.all_containers())
            .await
    }

    async fn tombstone_owner(&self, owner: Owner, retired_at: u64) -> Result<(), StoreError> {
        let tombstone = OwnerTombstone { owner, retired_at };
        self.write("tombstone_owner", move |db| {
            state_machine::tombstone_owner(db, &tombstone)
        })
        .await
    }

    async fn is_tombstoned(&self, owner: &Owner) -> Result<bool, StoreError> {
        let owner = *owner;
        self.read("is_tombstoned", move |reader| reader.is_tombstoned(&owner))
            .await
    }
}
