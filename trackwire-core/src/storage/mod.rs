//! Durable storage for queued dispatches and persistent event data
//!
//! Storage is an opaque key/value service. Callers never see rows or files,
//! only `save`/`retrieve`/`delete` of encoded values under a key:
//! - [`DiskStore`] is the byte-level trait implemented by backends
//! - [`TypedStore`] layers serde encoding on top and swallows failures
//! - [`SqliteStore`] is the on-disk backend, [`MemoryStore`] the in-process one
//!
//! A single `save` replaces the whole value under a key, so a reader never
//! observes a partially written entry.

pub mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Byte-level key/value storage backend
pub trait DiskStore: Send + Sync {
    /// Replace the value stored under `key`
    fn save(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Fetch the value stored under `key`, `None` if absent
    fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove `key`; removing a missing key is not an error
    fn delete(&self, key: &str) -> Result<()>;
}

/// Typed, best-effort view of one key in a [`DiskStore`].
///
/// Failures are logged and swallowed: a failed read looks like a miss and a
/// failed write is dropped. Persistence here is a durability layer, not a
/// correctness requirement.
pub struct TypedStore<T> {
    store: Arc<dyn DiskStore>,
    key: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TypedStore<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            key: self.key.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> TypedStore<T> {
    pub fn new(store: Arc<dyn DiskStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Encode and save `value`. Returns whether the write landed.
    pub fn save(&self, value: &T) -> bool {
        let result = serde_json::to_vec(value)
            .map_err(Error::from)
            .and_then(|bytes| self.store.save(&self.key, &bytes));

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Failed to save to durable storage");
                false
            }
        }
    }

    /// Load and decode the stored value; `None` on miss or decode failure
    pub fn retrieve(&self) -> Option<T> {
        let bytes = match self.store.retrieve(&self.key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Failed to read durable storage");
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Discarding undecodable stored value");
                None
            }
        }
    }

    pub fn delete(&self) -> bool {
        match self.store.delete(&self.key) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Failed to delete from durable storage");
                false
            }
        }
    }
}

/// In-process [`DiskStore`], used for tests and for hosts that opt out of
/// durability.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Vec<u8>>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Keys currently stored, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .values
            .lock()
            .map(|values| values.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Storage("memory store is failing".to_string()));
        }
        Ok(())
    }

    fn values(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.values
            .lock()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }
}

impl DiskStore for MemoryStore {
    fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check()?;
        self.values()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        Ok(self.values()?.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.check()?;
        self.values()?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    fn typed(store: &Arc<MemoryStore>) -> TypedStore<Sample> {
        TypedStore::new(store.clone() as Arc<dyn DiskStore>, "sample")
    }

    #[test]
    fn test_typed_round_trip_and_delete() {
        let store = Arc::new(MemoryStore::new());
        let typed = typed(&store);

        assert!(typed.retrieve().is_none());
        assert!(typed.save(&Sample {
            name: "a".to_string(),
            count: 2
        }));
        assert_eq!(typed.retrieve().unwrap().count, 2);

        assert!(typed.delete());
        assert!(typed.retrieve().is_none());
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_failures_are_swallowed() {
        let store = Arc::new(MemoryStore::new());
        let typed = typed(&store);
        typed.save(&Sample {
            name: "a".to_string(),
            count: 1,
        });

        store.set_failing(true);
        assert!(typed.retrieve().is_none());
        assert!(!typed.save(&Sample {
            name: "b".to_string(),
            count: 2
        }));

        store.set_failing(false);
        assert_eq!(typed.retrieve().unwrap().name, "a");
    }

    #[test]
    fn test_undecodable_value_reads_as_miss() {
        let store = Arc::new(MemoryStore::new());
        store.save("sample", b"not json").unwrap();
        assert!(typed(&store).retrieve().is_none());
    }
}
