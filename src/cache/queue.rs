//! Durable FIFO of mutations waiting to reach the remote store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

use super::keys::{TableName, SYNC_QUEUE_KEY};
use crate::store::KeyValueStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
  Create,
  Update,
  Delete,
}

/// What to send for a queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncPayload {
  Upsert {
    data: Value,
    data_hash: String,
    last_modified: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
  },
  Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
  pub id: String,
  pub table: TableName,
  /// Namespaced cache key the mutation applies to
  pub key: String,
  pub user_id: Option<String>,
  pub operation: SyncOperation,
  pub payload: SyncPayload,
  pub enqueued_at: DateTime<Utc>,
  pub retry_count: u32,
}

/// Pending sync items, written through to the store on every change.
pub struct SyncQueue {
  items: VecDeque<SyncQueueItem>,
  store: Arc<dyn KeyValueStore>,
  next_seq: u64,
}

impl SyncQueue {
  /// Restore the queue persisted in `store`. A missing or unreadable record
  /// yields an empty queue.
  pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
    let items = match store.get_item(SYNC_QUEUE_KEY) {
      Ok(Some(raw)) => match serde_json::from_str::<VecDeque<SyncQueueItem>>(&raw) {
        Ok(items) => items,
        Err(e) => {
          warn!(error = %e, "discarding unreadable sync queue");
          VecDeque::new()
        }
      },
      Ok(None) => VecDeque::new(),
      Err(e) => {
        warn!(error = %e, "failed to read sync queue");
        VecDeque::new()
      }
    };

    if !items.is_empty() {
      debug!(count = items.len(), "restored sync queue");
    }

    Self {
      items,
      store,
      next_seq: 0,
    }
  }

  /// Allocate a queue item id unique within this process.
  pub fn next_id(&mut self, now: DateTime<Utc>) -> String {
    self.next_seq += 1;
    format!("{}-{}", now.timestamp_millis(), self.next_seq)
  }

  pub fn push(&mut self, item: SyncQueueItem) {
    self.items.push_back(item);
    self.persist();
  }

  /// Remove a single item by id, if it is still queued.
  pub fn take(&mut self, id: &str) -> Option<SyncQueueItem> {
    let position = self.items.iter().position(|item| item.id == id)?;
    let item = self.items.remove(position);
    self.persist();
    item
  }

  /// Empty the queue, returning its contents in FIFO order.
  pub fn take_all(&mut self) -> Vec<SyncQueueItem> {
    let items: Vec<_> = self.items.drain(..).collect();
    if !items.is_empty() {
      self.persist();
    }
    items
  }

  /// Put a failed item back with one more retry on its count.
  ///
  /// Returns `false` when the item has used up `max_retries` and was dropped.
  pub fn requeue(&mut self, mut item: SyncQueueItem, max_retries: u32) -> bool {
    item.retry_count += 1;
    if item.retry_count > max_retries {
      warn!(
        id = %item.id,
        key = %item.key,
        retries = max_retries,
        "dropping sync item after exhausting retries"
      );
      return false;
    }
    self.push(item);
    true
  }

  pub fn clear(&mut self) {
    self.items.clear();
    self.persist();
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  /// Items that have failed at least once.
  pub fn error_count(&self) -> usize {
    self.items.iter().filter(|item| item.retry_count > 0).count()
  }

  pub fn items(&self) -> impl Iterator<Item = &SyncQueueItem> {
    self.items.iter()
  }

  /// Write the queue to the store. Failures are logged; the in-memory queue
  /// stays authoritative until the next successful write.
  pub fn persist(&self) -> bool {
    let raw = match serde_json::to_string(&self.items) {
      Ok(raw) => raw,
      Err(e) => {
        warn!(error = %e, "failed to serialize sync queue");
        return false;
      }
    };

    match self.store.set_item(SYNC_QUEUE_KEY, &raw) {
      Ok(()) => true,
      Err(e) => {
        warn!(error = %e, pending = self.items.len(), "failed to persist sync queue");
        false
      }
    }
  }
}
