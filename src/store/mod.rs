//! Durable key-value storage underneath the cache.
//!
//! Stores hold plain string values under string keys, enforce a hard capacity
//! limit, and have no notion of expiry. Everything richer (metadata, queues,
//! migration markers) is layered on top by the cache.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Default capacity, matching the usual browser local storage quota.
pub const DEFAULT_CAPACITY_BYTES: usize = 5 * 1024 * 1024;

/// Errors reported by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
  /// The write would push the store over its capacity. Nothing was written.
  #[error("storage quota exceeded writing '{key}': needs {needed} bytes, {available} available")]
  QuotaExceeded {
    key: String,
    needed: usize,
    available: usize,
  },
  #[error("storage backend error: {0}")]
  Backend(String),
}

impl From<rusqlite::Error> for StorageError {
  fn from(e: rusqlite::Error) -> Self {
    StorageError::Backend(e.to_string())
  }
}

/// Synchronous string key-value store with a capacity ceiling.
pub trait KeyValueStore: Send + Sync {
  fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

  /// Insert or replace a value. Fails with [`StorageError::QuotaExceeded`]
  /// without touching the previous value when capacity would be exceeded.
  fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

  fn remove_item(&self, key: &str) -> Result<(), StorageError>;

  /// All keys currently stored, in no particular order.
  fn keys(&self) -> Result<Vec<String>, StorageError>;

  /// Bytes in use, counted as key length plus value length for every entry.
  fn used_bytes(&self) -> Result<usize, StorageError>;

  fn capacity_bytes(&self) -> usize;
}

/// Size an entry occupies against the store capacity.
pub(crate) fn entry_size(key: &str, value: &str) -> usize {
  key.len() + value.len()
}

/// Check that replacing an entry of `old_size` bytes with `key`/`value` fits.
pub(crate) fn check_capacity(
  key: &str,
  value: &str,
  used: usize,
  old_size: usize,
  capacity: usize,
) -> Result<(), StorageError> {
  let needed = entry_size(key, value);
  let available = capacity.saturating_sub(used.saturating_sub(old_size));
  if needed > available {
    return Err(StorageError::QuotaExceeded {
      key: key.to_string(),
      needed,
      available,
    });
  }
  Ok(())
}
