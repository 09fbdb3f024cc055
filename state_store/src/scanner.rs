use std::sync::Arc;

use data_model::{ContainerHandle, ContainerRecord, Owner};

use crate::{
    driver::{self, Reader, RocksDBDriver},
    state_machine::{identifier_index_prefix, ContainerColumns},
    StoreError,
};

#[derive(Clone)]
pub struct StateReader {
    db: Arc<RocksDBDriver>,
}

impl StateReader {
    pub fn new(db: Arc<RocksDBDriver>) -> Self {
        Self { db }
    }

    pub fn get_container(
        &self,
        handle: &ContainerHandle,
    ) -> Result<Option<ContainerRecord>, StoreError> {
        let Some(bytes) = self
            .db
            .get(ContainerColumns::Containers.as_ref(), handle.get())?
        else {
            return Ok(None);
        };
        Ok(Some(driver::decode(&bytes)?))
    }

    /// Every record filed under `identifier_key`, in index order.
    pub fn containers_for_identifier(
        &self,
        identifier_key: &str,
    ) -> Result<Vec<ContainerRecord>, StoreError> {
        let prefix = identifier_index_prefix(identifier_key);
        let mut records = Vec::new();
        for kv in self.db.iter_prefix(
            ContainerColumns::ContainerIdentifiers.as_ref(),
            prefix.as_bytes(),
        )? {
            let (key, _) = kv?;
            let handle = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            // The index entry and the record are written together, a miss
            // means the record was deleted after the iterator was created.
            if let Some(record) = self.get_container(&ContainerHandle::new(handle))? {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn all_containers(&self) -> Result<Vec<ContainerRecord>, StoreError> {
        let mut records = Vec::new();
        for kv in self
            .db
            .iter_prefix(ContainerColumns::Containers.as_ref(), b"")?
        {
            let (_, value) = kv?;
            records.push(driver::decode(&value)?);
        }
        Ok(records)
    }

    pub fn is_tombstoned(&self, owner: &Owner) -> Result<bool, StoreError> {
        Ok(self
            .db
            .get(ContainerColumns::OwnerTombstones.as_ref(), owner.key())?
            .is_some())
    }
}
