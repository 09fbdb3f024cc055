//! The driver module centralizes the logic for
//! reading and writing bytes in the container store.
//!
//! It defines the traits a database driver implements so the
//! container-level logic in `state_machine` and `scanner` never touches a
//! specific database API.

use std::any::type_name;

pub mod rocksdb;
pub use self::rocksdb::{Options, RocksDBDriver, RocksDBTransaction};

pub type KVBytes = (Box<[u8]>, Box<[u8]>);

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Failed to decode a serialized record. error: {}", source)]
    JsonDecoderFailed { source: anyhow::Error },

    #[error("Failed to encode a new serialized record. error: {}", source)]
    JsonEncoderFailed { source: anyhow::Error },

    #[error("Column family {} does not exist", name)]
    MissingColumnFamily { name: String },

    #[error("Lock contention on the database. error: {}", source)]
    Contention { source: ::rocksdb::Error },

    #[error(transparent)]
    RocksDBFailure {
        #[from]
        source: ::rocksdb::Error,
    },
}

impl Error {
    /// Identifies failed operations that can be retried.
    ///
    /// At the moment, only `Self::Contention` errors can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(&self, Self::Contention { .. })
    }

    pub(crate) fn from_rocksdb(source: ::rocksdb::Error) -> Self {
        match source.kind() {
            ::rocksdb::ErrorKind::Busy |
            ::rocksdb::ErrorKind::TimedOut |
            ::rocksdb::ErrorKind::TryAgain => Self::Contention { source },
            _ => Self::RocksDBFailure { source },
        }
    }
}

/// Serializes a record as json for storage.
pub(crate) fn encode<T: serde::Serialize + std::fmt::Debug>(value: &T) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(value).map_err(|e| Error::JsonEncoderFailed {
        source: anyhow::anyhow!(
            "error serializing into json: {}, type: {}, value: {:?}",
            e,
            type_name::<T>(),
            value
        ),
    })
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    serde_json::from_slice(bytes).map_err(|e| Error::JsonDecoderFailed {
        source: anyhow::anyhow!(
            "error deserializing from json bytes: {}, type: {}",
            e,
            type_name::<T>()
        ),
    })
}

/// Reader defines all the read operations for a given driver.
pub trait Reader {
    /// Get an item from the database.
    fn get<N, K>(&self, cf: N, key: K) -> Result<Option<Vec<u8>>, Error>
    where
        N: AsRef<str>,
        K: AsRef<[u8]>;

    /// Iterate over the Key/Value pairs whose key starts with `prefix`.
    /// An empty prefix walks the whole column family.
    fn iter_prefix<'db>(
        &'db self,
        cf: &str,
        prefix: &'db [u8],
    ) -> Result<impl Iterator<Item = Result<KVBytes, Error>> + 'db, Error>;
}

/// Writer defines all the write operations for a given driver.
pub trait Writer {
    /// Start a new pessimistic Transaction in the database.
    fn transaction(&self) -> RocksDBTransaction<'_>;
}
