use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend failed: {0}")]
    Backend(String),
    #[error("stored value is not valid json: {0}")]
    Decode(String),
}

/// Key-value backend with per-key expiry that callback records are kept in.
///
/// Every method must accept keys that do not exist: `read` reports `None`,
/// `delete` does nothing. Expired entries must read as `None`.
pub trait CallbackStorage: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<Value>, StorageError>;
    fn write(&self, key: &str, value: &Value, expires_in: Duration) -> Result<(), StorageError>;
    fn delete(&self, key: &str) -> Result<(), StorageError>;
}

struct StoredEntry {
    value: Value,
    expires_at: Instant,
}

/// Process-local backend; expiry is enforced lazily on read.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, StoredEntry>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries held, expired ones included until they are next read.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.read(key).map(|v| v.is_some()).unwrap_or(false)
    }
}

impl CallbackStorage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StorageError::Backend("memory storage lock poisoned".to_string()))?;
        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(key);
        }
        Ok(None)
    }

    fn write(&self, key: &str, value: &Value, expires_in: Duration) -> Result<(), StorageError> {
        let expires_at = Instant::now().checked_add(expires_in).ok_or_else(|| {
            StorageError::Backend(format!("expiry of {}s is out of range", expires_in.as_secs()))
        })?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StorageError::Backend("memory storage lock poisoned".to_string()))?;
        entries.insert(
            key.to_string(),
            StoredEntry {
                value: value.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StorageError::Backend("memory storage lock poisoned".to_string()))?;
        entries.remove(key);
        Ok(())
    }
}
