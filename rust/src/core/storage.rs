// Small durable key/value store for call records that must survive a process kill.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::state::{ActiveCallRecord, PendingCallRecord};

pub const PENDING_CALL_KEY: &str = "@pending_intercom_call";
pub const ACTIVE_CALL_KEY: &str = "@active_call_session";

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    /// Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// One file per key under a data directory.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    dir: PathBuf,
}

impl FileKeyValueStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        match self.entries.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.lock().remove(key);
        Ok(())
    }
}

async fn load_json<T: serde::de::DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

async fn save_json<T: serde::Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw).await
}

pub async fn load_pending_call(
    store: &dyn KeyValueStore,
) -> Result<Option<PendingCallRecord>, StorageError> {
    load_json(store, PENDING_CALL_KEY).await
}

/// Overwrites any previous record; at most one pending call exists.
pub async fn save_pending_call(
    store: &dyn KeyValueStore,
    record: &PendingCallRecord,
) -> Result<(), StorageError> {
    save_json(store, PENDING_CALL_KEY, record).await
}

pub async fn clear_pending_call(store: &dyn KeyValueStore) -> Result<(), StorageError> {
    store.remove(PENDING_CALL_KEY).await
}

pub async fn load_active_call(
    store: &dyn KeyValueStore,
) -> Result<Option<ActiveCallRecord>, StorageError> {
    load_json(store, ACTIVE_CALL_KEY).await
}

pub async fn save_active_call(
    store: &dyn KeyValueStore,
    record: &ActiveCallRecord,
) -> Result<(), StorageError> {
    save_json(store, ACTIVE_CALL_KEY, record).await
}

pub async fn clear_active_call(store: &dyn KeyValueStore) -> Result<(), StorageError> {
    store.remove(ACTIVE_CALL_KEY).await
}
