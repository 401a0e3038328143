//! Per-entry bookkeeping stored next to each cached value.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

use super::keys::{meta_key_for, TableName};
use crate::store::{KeyValueStore, StorageError};

/// Where an entry stands relative to the remote copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
  Synced,
  Pending,
  Error,
  Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
  /// Data key this metadata describes
  pub key: String,
  #[serde(rename = "type")]
  pub table: TableName,
  pub data_hash: String,
  pub last_modified: DateTime<Utc>,
  pub expires_at: Option<DateTime<Utc>>,
  pub sync_status: SyncStatus,
  pub version: u64,
}

impl CacheMetadata {
  /// Metadata for a fresh write of `serialized`, following `previous` if any.
  ///
  /// `last_modified` never moves backwards for a key, even if the clock does.
  pub fn stamp(
    key: &str,
    table: TableName,
    serialized: &str,
    previous: Option<&CacheMetadata>,
    now: DateTime<Utc>,
    ttl: Duration,
    sync_status: SyncStatus,
  ) -> Self {
    let last_modified = previous.map_or(now, |p| p.last_modified.max(now));
    Self {
      key: key.to_string(),
      table,
      data_hash: data_hash(serialized),
      last_modified,
      expires_at: now.checked_add_signed(ttl),
      sync_status,
      version: previous.map_or(1, |p| p.version + 1),
    }
  }

  /// An entry is usable iff it has not passed `expires_at` and is younger than `ttl`.
  pub fn is_valid(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
    let young = now - self.last_modified < ttl;
    match self.expires_at {
      Some(expires_at) => now < expires_at && young,
      None => young,
    }
  }
}

/// Content fingerprint used to spot changed payloads.
pub fn data_hash(serialized: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(serialized.as_bytes());
  hex::encode(hasher.finalize())
}

/// Reads and writes [`CacheMetadata`] records in the persistent store.
#[derive(Clone)]
pub struct MetadataStore {
  store: Arc<dyn KeyValueStore>,
}

impl MetadataStore {
  pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
    Self { store }
  }

  /// Load metadata for a data key. Unreadable records count as absent.
  pub fn load(&self, data_key: &str) -> Option<CacheMetadata> {
    let meta_key = meta_key_for(data_key)?;
    let raw = match self.store.get_item(&meta_key) {
      Ok(raw) => raw?,
      Err(e) => {
        warn!(key = %meta_key, error = %e, "failed to read cache metadata");
        return None;
      }
    };

    match serde_json::from_str(&raw) {
      Ok(meta) => Some(meta),
      Err(e) => {
        debug!(key = %meta_key, error = %e, "discarding unreadable cache metadata");
        None
      }
    }
  }

  pub fn save(&self, meta: &CacheMetadata) -> Result<(), StorageError> {
    let meta_key = meta_key_for(&meta.key)
      .ok_or_else(|| StorageError::Backend(format!("'{}' is not a cache data key", meta.key)))?;
    let raw = serde_json::to_string(meta).map_err(|e| StorageError::Backend(e.to_string()))?;
    self.store.set_item(&meta_key, &raw)
  }

  pub fn remove(&self, data_key: &str) -> Result<(), StorageError> {
    match meta_key_for(data_key) {
      Some(meta_key) => self.store.remove_item(&meta_key),
      None => Ok(()),
    }
  }

  /// Rewrite the sync status of an entry, but only if it still describes the
  /// write made at `last_modified` with content `data_hash`.
  pub fn mark(
    &self,
    data_key: &str,
    last_modified: DateTime<Utc>,
    data_hash: &str,
    status: SyncStatus,
  ) {
    let Some(mut meta) = self.load(data_key) else {
      return;
    };
    if meta.last_modified != last_modified
      || meta.data_hash != data_hash
      || meta.sync_status == status
    {
      return;
    }
    meta.sync_status = status;
    if let Err(e) = self.save(&meta) {
      warn!(key = %data_key, error = %e, "failed to update sync status");
    }
  }
}
