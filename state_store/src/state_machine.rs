use data_model::{ContainerHandle, ContainerRecord, OwnerTombstone};
use strum::AsRefStr;
use tracing::debug;

use crate::{
    driver::{self, RocksDBDriver, RocksDBTransaction, Writer},
    InsertMode,
    StoreError,
    Transition,
};

// Note: Do not change the names of the column families, they are the on-disk
// layout.
#[derive(AsRefStr, strum::Display, strum::EnumIter)]
pub enum ContainerColumns {
    Containers,           //  Handle -> ContainerRecord
    ContainerIdentifiers, //  IdentifierKey|Handle -> Empty
    Reservations,         //  IdentifierKey -> Handle
    OwnerTombstones,      //  OwnerKey -> OwnerTombstone
}

pub(crate) fn identifier_index_prefix(identifier_key: &str) -> String {
    format!("{}|", identifier_key)
}

pub(crate) fn identifier_index_key(identifier_key: &str, handle: &ContainerHandle) -> String {
    format!("{}|{}", identifier_key, handle.get())
}

pub(crate) fn insert_container(
    db: &RocksDBDriver,
    record: &ContainerRecord,
    mode: InsertMode,
) -> Result<(), StoreError> {
    let txn = db.transaction();
    if txn
        .get_for_update(ContainerColumns::Containers.as_ref(), record.key())?
        .is_some()
    {
        return Err(StoreError::DuplicateHandle {
            handle: record.handle.clone(),
        });
    }

    let identifier_key = record.identifier.key();
    if mode == InsertMode::Exclusive && record.state.holds_reservation() {
        if let Some(holder) =
            txn.get_for_update(ContainerColumns::Reservations.as_ref(), &identifier_key)?
        {
            return Err(StoreError::IdentifierReserved {
                identifier_key,
                holder: ContainerHandle::new(String::from_utf8_lossy(&holder).into_owned()),
            });
        }
        txn.put(
            ContainerColumns::Reservations.as_ref(),
            &identifier_key,
            record.key(),
        )?;
    }

    txn.put(
        ContainerColumns::Containers.as_ref(),
        record.key(),
        driver::encode(record)?,
    )?;
    txn.put(
        ContainerColumns::ContainerIdentifiers.as_ref(),
        identifier_index_key(&identifier_key, &record.handle),
        b"",
    )?;
    txn.commit()?;
    debug!(
        handle = record.key(),
        identifier_key = %identifier_key,
        "inserted container record"
    );
    Ok(())
}

pub(crate) fn update_container_state(
    db: &RocksDBDriver,
    handle: &ContainerHandle,
    transition: &Transition,
) -> Result<ContainerRecord, StoreError> {
    let txn = db.transaction();
    let Some(existing) = txn.get_for_update(ContainerColumns::Containers.as_ref(), handle.get())?
    else {
        return Err(StoreError::NotFound {
            handle: handle.clone(),
        });
    };
    let current: ContainerRecord = driver::decode(&existing)?;
    let updated = transition.apply(&current)?;

    if current.state.holds_reservation() && !updated.state.holds_reservation() {
        release_reservation(&txn, &current)?;
    }
    txn.put(
        ContainerColumns::Containers.as_ref(),
        handle.get(),
        driver::encode(&updated)?,
    )?;
    txn.commit()?;
    Ok(updated)
}

pub(crate) fn delete_container(
    db: &RocksDBDriver,
    handle: &ContainerHandle,
) -> Result<(), StoreError> {
    let txn = db.transaction();
    let Some(existing) = txn.get_for_update(ContainerColumns::Containers.as_ref(), handle.get())?
    else {
        return Err(StoreError::NotFound {
            handle: handle.clone(),
        });
    };
    let record: ContainerRecord = driver::decode(&existing)?;

    release_reservation(&txn, &record)?;
    txn.delete(
        ContainerColumns::ContainerIdentifiers.as_ref(),
        identifier_index_key(&record.identifier.key(), handle),
    )?;
    txn.delete(ContainerColumns::Containers.as_ref(), handle.get())?;
    txn.commit()?;
    debug!(handle = handle.get(), "deleted container record");
    Ok(())
}

pub(crate) fn tombstone_owner(
    db: &RocksDBDriver,
    tombstone: &OwnerTombstone,
) -> Result<(), StoreError> {
    let txn = db.transaction();
    let key = tombstone.owner.key();
    // The first retirement wins, later ones are no-ops.
    if txn
        .get_for_update(ContainerColumns::OwnerTombstones.as_ref(), &key)?
        .is_some()
    {
        return Ok(());
    }
    txn.put(
        ContainerColumns::OwnerTombstones.as_ref(),
        &key,
        driver::encode(tombstone)?,
    )?;
    txn.commit()?;
    Ok(())
}

// Only drops the reservation if this record is the one holding it.
fn release_reservation(
    txn: &RocksDBTransaction<'_>,
    record: &ContainerRecord,
) -> Result<(), StoreError> {
    let identifier_key = record.identifier.key();
    let holder = txn.get_for_update(ContainerColumns::Reservations.as_ref(), &identifier_key)?;
    if holder.as_deref() == Some(record.key().as_bytes()) {
        txn.delete(ContainerColumns::Reservations.as_ref(), &identifier_key)?;
    }
    Ok(())
}
