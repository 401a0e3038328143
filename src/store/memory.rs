//! In-process store, used for ephemeral sessions and tests.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use super::{check_capacity, entry_size, KeyValueStore, StorageError, DEFAULT_CAPACITY_BYTES};

/// Key-value store kept entirely in memory.
pub struct MemoryStore {
  entries: Mutex<BTreeMap<String, String>>,
  capacity: usize,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::with_capacity(DEFAULT_CAPACITY_BYTES)
  }

  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      entries: Mutex::new(BTreeMap::new()),
      capacity,
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl Default for MemoryStore {
  fn default() -> Self {
    Self::new()
  }
}

impl KeyValueStore for MemoryStore {
  fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
    Ok(self.lock().get(key).cloned())
  }

  fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
    let mut entries = self.lock();
    let used: usize = entries.iter().map(|(k, v)| entry_size(k, v)).sum();
    let old_size = entries.get(key).map_or(0, |v| entry_size(key, v));
    check_capacity(key, value, used, old_size, self.capacity)?;
    entries.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove_item(&self, key: &str) -> Result<(), StorageError> {
    self.lock().remove(key);
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>, StorageError> {
    Ok(self.lock().keys().cloned().collect())
  }

  fn used_bytes(&self) -> Result<usize, StorageError> {
    Ok(self.lock().iter().map(|(k, v)| entry_size(k, v)).sum())
  }

  fn capacity_bytes(&self) -> usize {
    self.capacity
  }
}
