//! Durable local storage for the offline queue.
//!
//! The queue sees storage as a tiny key/value surface, the same shape as the
//! browser `localStorage` the web build sits on. Three backends are provided:
//! an in-memory map, an atomic file store with a checksummed envelope, and a
//! SQLite table.
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::capabilities::StorageKey;
use crate::crypto::{AadContext, CryptoError, CryptoProvider};

const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_STORE_BYTES: usize = 32 * 1024 * 1024;
const STORE_MAGIC: &[u8; 4] = b"MDQS";
const AAD_NAMESPACE: &str = "madad-offline-store";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("at-rest encryption: {0}")]
    Crypto(#[from] CryptoError),

    #[error("encoding stored value: {0}")]
    Serialization(String),

    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored value is corrupted: {reason}")]
    Corrupted { reason: String },

    #[error("checksum mismatch: stored {expected}, computed {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("stored value uses schema {found}, this build reads up to {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("stored value is {size} bytes, max {max}")]
    StoreTooLarge { size: usize, max: usize },

    #[error("storage quota exceeded: {needed} bytes needed, quota {quota}")]
    QuotaExceeded { needed: usize, quota: usize },

    #[error("invalid storage key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("background task failed: {0}")]
    TaskFailed(String),

    #[error("storage lock poisoned")]
    LockFailed,
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::TaskFailed(e.to_string())
    }
}

/// Key/value persistence used by the queue. Every `store` replaces the whole
/// value under the key and must be durable when it returns `Ok`.
#[async_trait::async_trait]
pub trait QueueStorage: Send + Sync {
    async fn load(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StoreError>;
    async fn store(&self, key: &StorageKey, value: &[u8]) -> Result<(), StoreError>;
    async fn remove(&self, key: &StorageKey) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
impl<T: QueueStorage + ?Sized> QueueStorage for Arc<T> {
    async fn load(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).load(key).await
    }

    async fn store(&self, key: &StorageKey, value: &[u8]) -> Result<(), StoreError> {
        (**self).store(key, value).await
    }

    async fn remove(&self, key: &StorageKey) -> Result<(), StoreError> {
        (**self).remove(key).await
    }
}

// ============================================================================
// In-memory storage
// ============================================================================

/// Process-local map. Clones share the same map, so dropping a queue and
/// opening a new one over a clone behaves like an app restart.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    quota_bytes: Option<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the total stored bytes, like a browser storage quota.
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: Arc::default(),
            quota_bytes: Some(quota_bytes),
        }
    }

    pub fn raw(&self, key: &StorageKey) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(key.as_str()).cloned())
    }
}

#[async_trait::async_trait]
impl QueueStorage for MemoryStorage {
    async fn load(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::LockFailed)?;
        Ok(entries.get(key.as_str()).cloned())
    }

    async fn store(&self, key: &StorageKey, value: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::LockFailed)?;

        if let Some(quota) = self.quota_bytes {
            let others: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key.as_str())
                .map(|(_, v)| v.len())
                .sum();
            let needed = others + value.len();
            if needed > quota {
                return Err(StoreError::QuotaExceeded { needed, quota });
            }
        }

        entries.insert(key.as_str().to_string(), value.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &StorageKey) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::LockFailed)?;
        entries.remove(key.as_str());
        Ok(())
    }
}

// ============================================================================
// File storage
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreContext {
    device_id: String,
}

impl StoreContext {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }

    fn to_aad(&self, key: &StorageKey) -> Result<Vec<u8>, StoreError> {
        let aad = AadContext {
            namespace: AAD_NAMESPACE,
            store: key.as_str(),
            schema_version: CURRENT_SCHEMA_VERSION,
            device_id: &self.device_id,
        };
        Ok(aad.to_bytes()?)
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

struct Sealing {
    crypto: Arc<dyn CryptoProvider>,
    ctx: StoreContext,
}

/// One file per key under a directory. Writes go to a temp file that is
/// fsynced and renamed over the target, so a crash leaves either the old or
/// the new value.
pub struct FileStorage {
    dir: PathBuf,
    sealing: Option<Sealing>,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, sealing: None })
    }

    /// Like [`FileStorage::new`], with every value encrypted at rest.
    pub fn encrypted(
        dir: impl Into<PathBuf>,
        crypto: Arc<dyn CryptoProvider>,
        ctx: StoreContext,
    ) -> Result<Self, StoreError> {
        let mut storage = Self::new(dir)?;
        storage.sealing = Some(Sealing { crypto, ctx });
        Ok(storage)
    }

    pub fn path_for(&self, key: &StorageKey) -> PathBuf {
        self.dir.join(format!("{}.bin", key.as_str()))
    }

    fn seal(&self, key: &StorageKey, value: &[u8]) -> Result<Vec<u8>, StoreError> {
        let checksum = blake3::hash(value);
        let envelope = StoreEnvelope {
            magic: *STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: *checksum.as_bytes(),
            payload: value.to_vec(),
        };

        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes)?;

        match &self.sealing {
            Some(sealing) => Ok(sealing.crypto.encrypt(&bytes, &sealing.ctx.to_aad(key)?)?),
            None => Ok(bytes),
        }
    }

    fn unseal(&self, key: &StorageKey, raw: &[u8]) -> Result<Vec<u8>, StoreError> {
        if raw.is_empty() {
            return Err(StoreError::Corrupted {
                reason: "empty file".into(),
            });
        }
        if raw.len() > MAX_STORE_BYTES {
            return Err(StoreError::StoreTooLarge {
                size: raw.len(),
                max: MAX_STORE_BYTES,
            });
        }

        let bytes = match &self.sealing {
            Some(sealing) => sealing.crypto.decrypt(raw, &sealing.ctx.to_aad(key)?)?,
            None => raw.to_vec(),
        };

        let envelope: StoreEnvelope = ciborium::from_reader(&bytes[..])?;

        if envelope.magic != *STORE_MAGIC {
            return Err(StoreError::Corrupted {
                reason: "invalid magic bytes".into(),
            });
        }

        if envelope.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::FutureSchema {
                found: envelope.schema_version,
                max: CURRENT_SCHEMA_VERSION,
            });
        }

        let actual = blake3::hash(&envelope.payload);
        if actual.as_bytes() != &envelope.checksum {
            return Err(StoreError::IntegrityCheckFailed {
                expected: hex::encode(envelope.checksum),
                actual: hex::encode(actual.as_bytes()),
            });
        }

        Ok(envelope.payload)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp_path = tmp_path(path);

    let mut file = File::create(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;

    std::fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

#[async_trait::async_trait]
impl QueueStorage for FileStorage {
    async fn load(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key);
        let raw = tokio::task::spawn_blocking(move || match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        })
        .await??;

        match raw {
            Some(raw) => Ok(Some(self.unseal(key, &raw)?)),
            None => Ok(None),
        }
    }

    async fn store(&self, key: &StorageKey, value: &[u8]) -> Result<(), StoreError> {
        let sealed = self.seal(key, value)?;
        let path = self.path_for(key);
        debug!(path = %path.display(), bytes = sealed.len(), "writing store file");
        tokio::task::spawn_blocking(move || write_atomic(&path, &sealed)).await?
    }

    async fn remove(&self, key: &StorageKey) -> Result<(), StoreError> {
        let path = self.path_for(key);
        tokio::task::spawn_blocking(move || match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        })
        .await?
    }
}

// ============================================================================
// SQLite storage
// ============================================================================

#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use self::sqlite::SqliteStorage;

#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
mod sqlite {
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use rusqlite::{params, Connection, OptionalExtension};

    use super::{QueueStorage, StoreError};
    use crate::capabilities::StorageKey;

    /// Single `kv` table, one row per storage key.
    #[derive(Clone)]
    pub struct SqliteStorage {
        conn: Arc<Mutex<Connection>>,
    }

    impl SqliteStorage {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
            Self::init(Connection::open(path)?)
        }

        pub fn open_in_memory() -> Result<Self, StoreError> {
            Self::init(Connection::open_in_memory()?)
        }

        fn init(conn: Connection) -> Result<Self, StoreError> {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS kv (
                    key TEXT PRIMARY KEY,
                    value BLOB NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                "#,
            )?;
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        }

        async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
        where
            T: Send + 'static,
            F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        {
            let conn = Arc::clone(&self.conn);
            tokio::task::spawn_blocking(move || {
                let conn = conn.lock().map_err(|_| StoreError::LockFailed)?;
                f(&conn)
            })
            .await?
        }
    }

    #[async_trait::async_trait]
    impl QueueStorage for SqliteStorage {
        async fn load(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StoreError> {
            let key = key.as_str().to_string();
            self.with_conn(move |conn| {
                Ok(conn
                    .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                        row.get::<_, Vec<u8>>(0)
                    })
                    .optional()?)
            })
            .await
        }

        async fn store(&self, key: &StorageKey, value: &[u8]) -> Result<(), StoreError> {
            let key = key.as_str().to_string();
            let value = value.to_vec();
            let now = chrono::Utc::now().timestamp_millis();
            self.with_conn(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                    ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = excluded.updated_at
                    "#,
                    params![key, value, now],
                )?;
                Ok(())
            })
            .await
        }

        async fn remove(&self, key: &StorageKey) -> Result<(), StoreError> {
            let key = key.as_str().to_string();
            self.with_conn(move |conn| {
                conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                Ok(())
            })
            .await
        }
    }
}
