use async_trait::async_trait;
use data_model::{ContainerHandle, ContainerRecord, Owner, OwnerTombstone};
use tokio::sync::RwLock;

use crate::{sort_most_recent_first, ContainerStore, InsertMode, StoreError, Transition};

#[derive(Default, Clone)]
struct Tables {
    // Handle -> ContainerRecord
    containers: im::HashMap<ContainerHandle, ContainerRecord>,

    // IdentifierKey -> Handles
    identifiers: im::HashMap<String, im::OrdSet<ContainerHandle>>,

    // IdentifierKey -> Handle holding the reservation
    reservations: im::HashMap<String, ContainerHandle>,

    // OwnerKey -> OwnerTombstone
    tombstones: im::HashMap<String, OwnerTombstone>,
}

impl Tables {
    fn release_reservation(&mut self, record: &ContainerRecord) {
        let identifier_key = record.identifier.key();
        if self.reservations.get(&identifier_key) == Some(&record.handle) {
            self.reservations.remove(&identifier_key);
        }
    }
}

/// Non-durable container store. Same contract as `RegistryState`, each
/// operation runs under a single write lock.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContainerStore for InMemoryStore {
    async fn insert(&self, record: ContainerRecord, mode: InsertMode) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.containers.contains_key(&record.handle) {
            return Err(StoreError::DuplicateHandle {
                handle: record.handle.clone(),
            });
        }
        let identifier_key = record.identifier.key();
        if mode == InsertMode::Exclusive && record.state.holds_reservation() {
            if let Some(holder) = tables.reservations.get(&identifier_key) {
                return Err(StoreError::IdentifierReserved {
                    identifier_key,
                    holder: holder.clone(),
                });
            }
            tables
                .reservations
                .insert(identifier_key.clone(), record.handle.clone());
        }
        tables
            .identifiers
            .entry(identifier_key)
            .or_default()
            .insert(record.handle.clone());
        tables.containers.insert(record.handle.clone(), record);
        Ok(())
    }

    async fn get_by_handle(
        &self,
        handle: &ContainerHandle,
    ) -> Result<Option<ContainerRecord>, StoreError> {
        Ok(self.tables.read().await.containers.get(handle).cloned())
    }

    async fn find_by_identifier(
        &self,
        identifier_key: &str,
    ) -> Result<Vec<ContainerRecord>, StoreError> {
        let tables = self.tables.read().await;
        let mut records: Vec<ContainerRecord> = tables
            .identifiers
            .get(identifier_key)
            .map(|handles| {
                handles
                    .iter()
                    .filter_map(|handle| tables.containers.get(handle).cloned())
                    .collect()
            })
            .unwrap_or_default();
        sort_most_recent_first(&mut records);
        Ok(records)
    }

    async fn update_state(
        &self,
        handle: &ContainerHandle,
        transition: Transition,
    ) -> Result<ContainerRecord, StoreError> {
        let mut tables = self.tables.write().await;
        let Some(current) = tables.containers.get(handle).cloned() else {
            return Err(StoreError::NotFound {
                handle: handle.clone(),
            });
        };
        let updated = transition.apply(&current)?;
        if current.state.holds_reservation() && !updated.state.holds_reservation() {
            tables.release_reservation(&current);
        }
        tables.containers.insert(handle.clone(), updated.clone());
        Ok(updated)
    }

    async fn delete(&self, handle: &ContainerHandle) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let Some(record) = tables.containers.remove(handle) else {
            return Err(StoreError::NotFound {
                handle: handle.clone(),
            });
        };
        tables.release_reservation(&record);
        let identifier_key = record.identifier.key();
        if let Some(handles) = tables.identifiers.get_mut(&identifier_key) {
            handles.remove(handle);
            if handles.is_empty() {
                tables.identifiers.remove(&identifier_key);
            }
        }
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerRecord>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .containers
            .values()
            .cloned()
            .collect())
    }

    async fn tombstone_owner(&self, owner: Owner, retired_at: u64) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables
            .tombstones
            .entry(owner.key())
            .or_insert(OwnerTombstone { owner, retired_at });
        Ok(())
    }

    async fn is_tombstoned(&self, owner: &Owner) -> Result<bool, StoreError> {
        Ok(self.tables.read().await.tombstones.contains_key(&owner.key()))
    }
}
