//! Durable key/value media backing the persistent cache tier.
//!
//! The cache never depends on a medium for correctness: every failure here is
//! reported as a [`StorageError`], logged by the caller and otherwise ignored.

mod sqlite;

use std::collections::BTreeMap;
use std::sync::Mutex;

use thiserror::Error;

use crate::util::lock::mutex_lock;

pub use sqlite::SqliteMedium;

const SOURCE: &str = "infra::storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error during `{op}`: {message}")]
    Backend { op: &'static str, message: String },
    #[error("stored record for `{key}` failed its integrity check")]
    Corrupt { key: String },
    #[error("failed to encode cache record for `{key}`: {message}")]
    Encode { key: String, message: String },
    #[error("failed to decode cache record for `{key}`: {message}")]
    Decode { key: String, message: String },
}

impl StorageError {
    pub fn backend(op: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            op,
            message: message.into(),
        }
    }
}

/// Byte-oriented durable store used by the persistent cache tier.
pub trait PersistentMedium: Send + Sync {
    /// Read the record stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Insert or replace the record stored under `key`.
    fn set(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// Remove the record stored under `key`; removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Load every stored record, used to rehydrate the cache at startup.
    ///
    /// Records that cannot be read back are skipped by the implementation.
    fn load_all(&self) -> Result<Vec<(String, Vec<u8>)>, StorageError>;
}

/// Medium that keeps records in process memory.
///
/// Used when no storage path is configured and throughout the test suite.
#[derive(Default)]
pub struct MemoryMedium {
    records: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.records, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistentMedium for MemoryMedium {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(mutex_lock(&self.records, SOURCE, "get").get(key).cloned())
    }

    fn set(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        mutex_lock(&self.records, SOURCE, "set").insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        mutex_lock(&self.records, SOURCE, "remove").remove(key);
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        Ok(mutex_lock(&self.records, SOURCE, "load_all")
            .iter()
            .map(|(key, bytes)| (key.clone(), bytes.clone()))
            .collect())
    }
}
