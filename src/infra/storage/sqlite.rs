//! SQLite-backed persistent medium.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::util::lock::mutex_lock;

use super::{PersistentMedium, StorageError};

const SOURCE: &str = "infra::storage::sqlite";

/// Schema for the cache mirror.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_records (
    cache_key TEXT PRIMARY KEY,
    payload BLOB NOT NULL,
    checksum TEXT NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Medium storing one row per cache key, each guarded by a SHA-256 checksum.
///
/// A row whose checksum no longer matches its payload (torn write, manual
/// edit) is treated as absent rather than handed to the decoder.
pub struct SqliteMedium {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteMedium {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|err| {
                StorageError::backend("open", format!("create {}: {err}", parent.display()))
            })?;
        }

        let conn = Connection::open(path).map_err(|err| {
            StorageError::backend("open", format!("open {}: {err}", path.display()))
        })?;

        let medium = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        medium.migrate()?;
        debug!(path = %path.display(), "Opened sqlite cache medium");
        Ok(medium)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()
            .map_err(|err| StorageError::backend("open", err.to_string()))?;
        let medium = Self {
            conn: Mutex::new(conn),
            path: None,
        };
        medium.migrate()?;
        Ok(medium)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn migrate(&self) -> Result<(), StorageError> {
        mutex_lock(&self.conn, SOURCE, "migrate")
            .execute_batch(SCHEMA)
            .map_err(|err| StorageError::backend("migrate", err.to_string()))
    }
}

fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

impl PersistentMedium for SqliteMedium {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let conn = mutex_lock(&self.conn, SOURCE, "get");
        let row: Option<(Vec<u8>, String)> = conn
            .query_row(
                "SELECT payload, checksum FROM cache_records WHERE cache_key = ?",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|err| StorageError::backend("get", err.to_string()))?;

        match row {
            Some((payload, sum)) if checksum(&payload) == sum => Ok(Some(payload)),
            Some(_) => Err(StorageError::Corrupt {
                key: key.to_string(),
            }),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        mutex_lock(&self.conn, SOURCE, "set")
            .execute(
                "INSERT OR REPLACE INTO cache_records (cache_key, payload, checksum, written_at)
                 VALUES (?, ?, ?, datetime('now'))",
                params![key, bytes, checksum(bytes)],
            )
            .map(|_| ())
            .map_err(|err| StorageError::backend("set", err.to_string()))
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        mutex_lock(&self.conn, SOURCE, "remove")
            .execute(
                "DELETE FROM cache_records WHERE cache_key = ?",
                params![key],
            )
            .map(|_| ())
            .map_err(|err| StorageError::backend("remove", err.to_string()))
    }

    fn load_all(&self) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let conn = mutex_lock(&self.conn, SOURCE, "load_all");
        let mut stmt = conn
            .prepare("SELECT cache_key, payload, checksum FROM cache_records ORDER BY written_at")
            .map_err(|err| StorageError::backend("load_all", err.to_string()))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|err| StorageError::backend("load_all", err.to_string()))?;

        let mut records = Vec::new();
        for row in rows {
            match row {
                Ok((key, payload, sum)) if checksum(&payload) == sum => {
                    records.push((key, payload));
                }
                Ok((key, _, _)) => {
                    warn!(cache_key = %key, "Skipping cache record with checksum mismatch");
                }
                Err(err) => {
                    warn!(error = %err, "Skipping unreadable cache record");
                }
            }
        }
        Ok(records)
    }
}
