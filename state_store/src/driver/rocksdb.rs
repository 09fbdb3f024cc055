use std::path::PathBuf;

use rocksdb::{
    ColumnFamily,
    ColumnFamilyDescriptor,
    Direction,
    IteratorMode,
    Options as RocksDBOptions,
    Transaction,
    TransactionDB,
    TransactionDBOptions,
    TransactionOptions,
    WriteOptions,
};

use registry_utils::OptionInspectNone;

use crate::driver::{Error as DriverError, KVBytes, Reader, Writer};

/// Options to start a connection with RocksDB.
pub struct Options {
    pub path: PathBuf,
    pub column_families: Vec<ColumnFamilyDescriptor>,
    /// fsync the WAL on every commit.
    pub sync_writes: bool,
    /// How long a transaction waits on a locked key before giving up.
    pub lock_timeout_ms: i64,
}

/// Driver to connect with a RocksDB database.
pub struct RocksDBDriver {
    db: TransactionDB,
    sync_writes: bool,
    lock_timeout_ms: i64,
}

impl RocksDBDriver {
    /// Open a new connection with a RocksDB database.
    pub fn open(driver_options: Options) -> Result<RocksDBDriver, DriverError> {
        let mut db_opts = RocksDBOptions::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);

        let mut txn_db_opts = TransactionDBOptions::default();
        txn_db_opts.set_default_lock_timeout(driver_options.lock_timeout_ms);

        let db = TransactionDB::open_cf_descriptors(
            &db_opts,
            &txn_db_opts,
            &driver_options.path,
            driver_options.column_families,
        )?;

        Ok(RocksDBDriver {
            db,
            sync_writes: driver_options.sync_writes,
            lock_timeout_ms: driver_options.lock_timeout_ms,
        })
    }

    fn column_family(&self, name: &str) -> Result<&ColumnFamily, DriverError> {
        self.db
            .cf_handle(name)
            .inspect_none(|| {
                tracing::error!("failed to get column family handle for {}", name);
            })
            .ok_or_else(|| DriverError::MissingColumnFamily {
                name: name.to_string(),
            })
    }
}

impl Writer for RocksDBDriver {
    fn transaction(&self) -> RocksDBTransaction<'_> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        let mut txn_opts = TransactionOptions::default();
        txn_opts.set_lock_timeout(self.lock_timeout_ms);
        txn_opts.set_deadlock_detect(true);

        let tx = self.db.transaction_opt(&write_opts, &txn_opts);
        RocksDBTransaction { db: self, tx }
    }
}

impl Reader for RocksDBDriver {
    fn get<N, K>(&self, cf: N, key: K) -> Result<Option<Vec<u8>>, DriverError>
    where
        N: AsRef<str>,
        K: AsRef<[u8]>,
    {
        let cf = self.column_family(cf.as_ref())?;
        self.db.get_cf(cf, key).map_err(DriverError::from_rocksdb)
    }

    fn iter_prefix<'db>(
        &'db self,
        cf: &str,
        prefix: &'db [u8],
    ) -> Result<impl Iterator<Item = Result<KVBytes, DriverError>> + 'db, DriverError> {
        let cf = self.column_family(cf)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        Ok(iter
            .map(|item| item.map_err(DriverError::from_rocksdb))
            .take_while(move |item| match item {
                Ok((key, _)) => key.starts_with(prefix),
                Err(_) => true,
            }))
    }
}

/// A pessimistic transaction. Every key read through `get_for_update` stays
/// locked until the transaction commits or is dropped.
pub struct RocksDBTransaction<'a> {
    db: &'a RocksDBDriver,
    tx: Transaction<'a, TransactionDB>,
}

impl RocksDBTransaction<'_> {
    pub fn commit(self) -> Result<(), DriverError> {
        self.tx.commit().map_err(DriverError::from_rocksdb)
    }

    pub fn get_for_update<K: AsRef<[u8]>>(
        &self,
        table: &str,
        key: K,
    ) -> Result<Option<Vec<u8>>, DriverError> {
        let cf = self.db.column_family(table)?;
        self.tx
            .get_for_update_cf(cf, key, true)
            .map_err(DriverError::from_rocksdb)
    }

    pub fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        table: &str,
        key: K,
        value: V,
    ) -> Result<(), DriverError> {
        let cf = self.db.column_family(table)?;
        self.tx
            .put_cf(cf, key, value)
            .map_err(DriverError::from_rocksdb)
    }

    pub fn delete<K: AsRef<[u8]>>(&self, table: &str, key: K) -> Result<(), DriverError> {
        let cf = self.db.column_family(table)?;
        self.tx.delete_cf(cf, key).map_err(DriverError::from_rocksdb)
    }
}
