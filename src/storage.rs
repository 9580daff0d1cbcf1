//! Key-value settings storage with change notifications, optionally persisted to a JSON file.

use serde::{
    de::DeserializeOwned,
    Serialize,
};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    path::{
        Path,
        PathBuf,
    },
};
use tokio::sync::{
    broadcast,
    Mutex,
};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid storage value: {0}")]
    Json(#[from] serde_json::Error),
}

/// Emitted whenever a stored value changes.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageChange {
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

pub struct Storage {
    values: Mutex<BTreeMap<String, Value>>,
    path: Option<PathBuf>,
    changes: broadcast::Sender<StorageChange>,
}

impl Storage {
    pub fn in_memory() -> Self {
        Self::with_values(BTreeMap::new(), None)
    }

    /// Load values from `path`. A missing file is an empty storage, it will be created on the first write.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let values = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(?path, "no storage file yet");
                BTreeMap::new()
            }
            Err(source) => return Err(StorageError::Io { path, source }),
        };
        debug!(?path, keys = values.len(), "storage loaded");
        Ok(Self::with_values(values, Some(path)))
    }

    fn with_values(values: BTreeMap<String, Value>, path: Option<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            values: Mutex::new(values),
            path,
            changes,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().await.get(key).cloned()
    }

    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let Some(value) = self.get(key).await else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(value)?))
    }

    pub async fn set(&self, key: &str, value: impl Serialize) -> Result<(), StorageError> {
        let new_value = serde_json::to_value(value)?;
        let mut values = self.values.lock().await;
        let mut next = values.clone();
        let old_value = next.insert(key.to_string(), new_value.clone());
        // memory only follows once the file has it
        self.persist(&next).await?;
        *values = next;
        drop(values);

        if old_value.as_ref() != Some(&new_value) {
            self.notify(StorageChange {
                key: key.to_string(),
                old_value,
                new_value: Some(new_value),
            });
        }
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut values = self.values.lock().await;
        let mut next = values.clone();
        let old_value = next.remove(key);
        self.persist(&next).await?;
        *values = next;
        drop(values);

        if old_value.is_some() {
            self.notify(StorageChange {
                key: key.to_string(),
                old_value,
                new_value: None,
            });
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }

    fn notify(&self, change: StorageChange) {
        trace!(key = %change.key, "storage changed");
        // no listeners is fine
        let _ = self.changes.send(change);
    }

    async fn persist(&self, values: &BTreeMap<String, Value>) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(values)?;
        tokio::fs::write(path, bytes).await.map_err(|source| StorageError::Io {
            path: path.clone(),
            source,
        })
    }
}
