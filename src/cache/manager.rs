//! Cache manager that orchestrates local storage, metadata, and remote sync.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::handle::{SyncHandle, SyncOutcome};
use super::keys::{data_key, in_namespace, TableName};
use super::metadata::{CacheMetadata, MetadataStore, SyncStatus};
use super::queue::{SyncOperation, SyncPayload, SyncQueue, SyncQueueItem};
use super::traits::ListRecord;
use crate::clock::{Clock, SystemClock};
use crate::records::{Preferences, Record};
use crate::remote::{RemoteRow, RemoteSyncClient};
use crate::store::{KeyValueStore, StorageError};

/// Runtime-tunable cache behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
  /// How long a cached value is served without consulting the remote
  pub ttl: Duration,
  /// Failed sync attempts retried before an item is dropped
  pub max_retries: u32,
  /// Period of the background queue flush
  pub sync_interval: Duration,
  /// Suppress all remote reads and writes
  pub offline_mode: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl: Duration::from_secs(24 * 60 * 60),
      max_retries: 3,
      sync_interval: Duration::from_secs(5 * 60),
      offline_mode: false,
    }
  }
}

/// Partial update for [`CacheConfig`]; `None` fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct ConfigPatch {
  pub ttl: Option<Duration>,
  pub max_retries: Option<u32>,
  pub sync_interval: Option<Duration>,
  pub offline_mode: Option<bool>,
}

/// Queue counters for status banners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
  /// Items waiting to be synced
  pub pending: usize,
  /// Waiting items that have failed at least once
  pub errors: usize,
  pub offline: bool,
  /// Items given up on since this manager was created
  pub dropped: u64,
}

/// Bytes held in the store against its capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StorageUsage {
  pub used_bytes: usize,
  pub capacity_bytes: usize,
}

/// Summary of one queue flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessResult {
  pub attempted: usize,
  pub succeeded: usize,
  pub requeued: usize,
  pub dropped: usize,
  /// Items put back untouched because the cache went offline mid-flush
  pub deferred: usize,
}

/// Local-first cache with best-effort remote synchronization.
///
/// Reads are served from the persistent store while fresh and fall back to
/// the remote otherwise. Writes land locally first, are queued for sync, and
/// are pushed in the background when online. Cloning is cheap; clones share
/// the same state.
#[derive(Clone)]
pub struct CacheManager {
  inner: Arc<Inner>,
}

struct Inner {
  store: Arc<dyn KeyValueStore>,
  metadata: MetadataStore,
  remote: Arc<dyn RemoteSyncClient>,
  clock: Arc<dyn Clock>,
  config: RwLock<CacheConfig>,
  /// Platform connectivity as last reported
  online: AtomicBool,
  queue: Mutex<SyncQueue>,
  dropped: AtomicU64,
}

impl CacheManager {
  /// Create a manager on the system clock.
  pub fn new(
    store: Arc<dyn KeyValueStore>,
    remote: Arc<dyn RemoteSyncClient>,
    config: CacheConfig,
  ) -> Self {
    Self::with_clock(store, remote, config, Arc::new(SystemClock))
  }

  /// Create a manager with an explicit time source, restoring any persisted
  /// sync queue from `store`.
  pub fn with_clock(
    store: Arc<dyn KeyValueStore>,
    remote: Arc<dyn RemoteSyncClient>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
  ) -> Self {
    let queue = SyncQueue::load(Arc::clone(&store));
    Self {
      inner: Arc::new(Inner {
        metadata: MetadataStore::new(Arc::clone(&store)),
        store,
        remote,
        clock,
        config: RwLock::new(config),
        online: AtomicBool::new(true),
        queue: Mutex::new(queue),
        dropped: AtomicU64::new(0),
      }),
    }
  }

  /// Current runtime configuration.
  pub fn config(&self) -> CacheConfig {
    self
      .inner
      .config
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  /// Apply `patch` and return the resulting configuration.
  pub fn update_config(&self, patch: ConfigPatch) -> CacheConfig {
    let mut config = self
      .inner
      .config
      .write()
      .unwrap_or_else(PoisonError::into_inner);
    if let Some(ttl) = patch.ttl {
      config.ttl = ttl;
    }
    if let Some(max_retries) = patch.max_retries {
      config.max_retries = max_retries;
    }
    if let Some(sync_interval) = patch.sync_interval {
      config.sync_interval = sync_interval;
    }
    if let Some(offline_mode) = patch.offline_mode {
      config.offline_mode = offline_mode;
    }
    config.clone()
  }

  /// Record the platform's connectivity state.
  pub fn set_online(&self, online: bool) {
    self.inner.online.store(online, Ordering::SeqCst);
  }

  /// Whether remote calls are currently allowed.
  pub fn is_online(&self) -> bool {
    self.inner.online.load(Ordering::SeqCst)
      && !self.config().offline_mode
      && self.inner.remote.is_available()
  }

  /// Queue counters and connectivity for status displays.
  pub fn sync_status(&self) -> QueueStatus {
    let queue = self.lock_queue();
    QueueStatus {
      pending: queue.len(),
      errors: queue.error_count(),
      offline: !self.is_online(),
      dropped: self.inner.dropped.load(Ordering::SeqCst),
    }
  }

  /// Copy of the pending sync items in FIFO order.
  pub fn queue_snapshot(&self) -> Vec<SyncQueueItem> {
    self.lock_queue().items().cloned().collect()
  }

  /// Write the sync queue to the store, e.g. before shutdown.
  pub fn persist_queue(&self) -> bool {
    self.lock_queue().persist()
  }

  /// Bytes used in the store against its capacity.
  pub fn storage_usage(&self) -> Result<StorageUsage, StorageError> {
    Ok(StorageUsage {
      used_bytes: self.inner.store.used_bytes()?,
      capacity_bytes: self.inner.store.capacity_bytes(),
    })
  }

  /// Metadata for the entry of `table`, if any.
  pub fn metadata(&self, table: TableName, user_id: Option<&str>) -> Option<CacheMetadata> {
    self.inner.metadata.load(&data_key(table, user_id))
  }

  pub(crate) fn store(&self) -> &Arc<dyn KeyValueStore> {
    &self.inner.store
  }

  pub(crate) fn remote(&self) -> &Arc<dyn RemoteSyncClient> {
    &self.inner.remote
  }

  pub(crate) fn now(&self) -> DateTime<Utc> {
    self.inner.clock.now()
  }

  fn ttl(&self) -> chrono::Duration {
    chrono::Duration::from_std(self.config().ttl)
      .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
  }

  fn lock_queue(&self) -> MutexGuard<'_, SyncQueue> {
    self
      .inner
      .queue
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Read the value of `table`, or `default` when nothing usable is found.
  ///
  /// 1. Serve the local entry if its metadata is still valid
  /// 2. Otherwise, when online, fetch from the remote and cache the result
  /// 3. Fall back to `default` on a miss, a remote failure, or while offline
  ///
  /// Never fails; unreadable local data counts as a miss.
  pub async fn get<T>(&self, table: TableName, default: T, user_id: Option<&str>) -> T
  where
    T: DeserializeOwned,
  {
    let key = data_key(table, user_id);
    let local_meta = self.inner.metadata.load(&key);

    if let Some(meta) = &local_meta {
      if meta.is_valid(self.now(), self.ttl()) {
        if let Some(value) = self.read_entry(&key) {
          debug!(%key, "cache hit");
          return value;
        }
      }
    }

    if !self.is_online() {
      debug!(%key, "cache miss while offline");
      return default;
    }

    let row = match self.inner.remote.fetch(user_id, &key).await {
      Ok(Some(row)) => row,
      Ok(None) => {
        debug!(%key, "cache miss, remote has no entry");
        return default;
      }
      Err(e) => {
        debug!(%key, error = %e, "remote fetch failed");
        return default;
      }
    };

    match self.adopt_remote(table, &key, user_id, row, local_meta).await {
      Some(value) => value,
      None => default,
    }
  }

  /// Reconcile a fetched remote row with the local entry, last writer wins.
  async fn adopt_remote<T>(
    &self,
    table: TableName,
    key: &str,
    user_id: Option<&str>,
    row: RemoteRow,
    local_meta: Option<CacheMetadata>,
  ) -> Option<T>
  where
    T: DeserializeOwned,
  {
    if let Some(meta) = &local_meta {
      if meta.last_modified > row.last_modified {
        if let Some(value) = self.read_entry(key) {
          debug!(%key, "local entry newer than remote, keeping it");
          return Some(value);
        }
      }
    }

    let value: T = match serde_json::from_value(row.data.clone()) {
      Ok(value) => value,
      Err(e) => {
        debug!(%key, error = %e, "discarding unreadable remote entry");
        return None;
      }
    };

    let unchanged = local_meta
      .filter(|meta| meta.data_hash == row.data_hash)
      .filter(|_| matches!(self.inner.store.get_item(key), Ok(Some(_))));

    match unchanged {
      Some(meta) => self.refresh(meta),
      None => {
        debug!(%key, "caching remote entry");
        // The push this triggers runs on its own; nothing to wait for here
        let _ = self.set(table, &row.data, user_id).await;
      }
    }

    Some(value)
  }

  /// Extend the lifetime of an entry the remote confirmed as current.
  fn refresh(&self, mut meta: CacheMetadata) {
    let now = self.now();
    meta.last_modified = meta.last_modified.max(now);
    meta.expires_at = now.checked_add_signed(self.ttl());
    meta.sync_status = SyncStatus::Synced;
    if let Err(e) = self.inner.metadata.save(&meta) {
      warn!(key = %meta.key, error = %e, "failed to refresh cache metadata");
    }
  }

  fn read_entry<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let raw = match self.inner.store.get_item(key) {
      Ok(raw) => raw?,
      Err(e) => {
        warn!(%key, error = %e, "failed to read cache entry");
        return None;
      }
    };

    match serde_json::from_str(&raw) {
      Ok(value) => Some(value),
      Err(e) => {
        debug!(%key, error = %e, "treating unreadable cache entry as a miss");
        None
      }
    }
  }

  /// Store `value` for `table` and queue it for sync.
  ///
  /// The local write either fully succeeds or leaves the previous entry in
  /// place; failures are logged, not returned. When online the push starts
  /// immediately in the background and the returned handle reports on it.
  pub async fn set<T>(&self, table: TableName, value: &T, user_id: Option<&str>) -> SyncHandle
  where
    T: Serialize + ?Sized,
  {
    let key = data_key(table, user_id);

    let data = match serde_json::to_value(value) {
      Ok(data) => data,
      Err(e) => {
        warn!(%key, error = %e, "cache write aborted, value not serializable");
        return SyncHandle::ready(SyncOutcome::Dropped);
      }
    };
    let serialized = data.to_string();

    let previous_raw = self.inner.store.get_item(&key).ok().flatten();
    if let Err(e) = self.inner.store.set_item(&key, &serialized) {
      warn!(%key, error = %e, "cache write aborted");
      return SyncHandle::ready(SyncOutcome::Dropped);
    }

    let online = self.is_online();
    let previous = self.inner.metadata.load(&key);
    let status = if online {
      SyncStatus::Pending
    } else {
      SyncStatus::Offline
    };
    let meta = CacheMetadata::stamp(
      &key,
      table,
      &serialized,
      previous.as_ref(),
      self.now(),
      self.ttl(),
      status,
    );

    if let Err(e) = self.inner.metadata.save(&meta) {
      warn!(%key, error = %e, "cache metadata write failed, rolling back");
      self.restore_entry(&key, previous_raw.as_deref());
      return SyncHandle::ready(SyncOutcome::Dropped);
    }

    let operation = if previous.is_some() {
      SyncOperation::Update
    } else {
      SyncOperation::Create
    };
    let id = self.enqueue(
      table,
      &key,
      user_id,
      operation,
      SyncPayload::Upsert {
        data,
        data_hash: meta.data_hash.clone(),
        last_modified: meta.last_modified,
        expires_at: meta.expires_at,
      },
    );

    debug!(%key, version = meta.version, ?status, "cached value");
    self.dispatch(id, online)
  }

  fn restore_entry(&self, key: &str, previous: Option<&str>) {
    let result = match previous {
      Some(raw) => self.inner.store.set_item(key, raw),
      None => self.inner.store.remove_item(key),
    };
    if let Err(e) = result {
      warn!(%key, error = %e, "failed to roll back cache entry");
    }
  }

  /// Delete the entry for `table` and queue the deletion for sync.
  pub async fn remove(&self, table: TableName, user_id: Option<&str>) -> SyncHandle {
    let key = data_key(table, user_id);

    if let Err(e) = self.inner.store.remove_item(&key) {
      warn!(%key, error = %e, "failed to remove cache entry");
    }
    if let Err(e) = self.inner.metadata.remove(&key) {
      warn!(%key, error = %e, "failed to remove cache metadata");
    }

    let id = self.enqueue(table, &key, user_id, SyncOperation::Delete, SyncPayload::Delete);
    debug!(%key, "removed cache entry");
    self.dispatch(id, self.is_online())
  }

  /// Delete every entry in the namespace of `user_id` (the shared namespace
  /// when `None`) and empty the sync queue. Returns the number of keys removed.
  pub fn clear(&self, user_id: Option<&str>) -> usize {
    let keys = match self.inner.store.keys() {
      Ok(keys) => keys,
      Err(e) => {
        warn!(error = %e, "failed to list cache keys");
        Vec::new()
      }
    };

    let mut removed = 0;
    for key in keys.iter().filter(|key| in_namespace(key, user_id)) {
      match self.inner.store.remove_item(key) {
        Ok(()) => removed += 1,
        Err(e) => warn!(%key, error = %e, "failed to remove cache key"),
      }
    }

    self.lock_queue().clear();
    info!(removed, user = ?user_id, "cleared cache");
    removed
  }

  fn enqueue(
    &self,
    table: TableName,
    key: &str,
    user_id: Option<&str>,
    operation: SyncOperation,
    payload: SyncPayload,
  ) -> String {
    let now = self.now();
    let mut queue = self.lock_queue();
    let id = queue.next_id(now);
    queue.push(SyncQueueItem {
      id: id.clone(),
      table,
      key: key.to_string(),
      user_id: user_id.map(String::from),
      operation,
      payload,
      enqueued_at: now,
      retry_count: 0,
    });
    id
  }

  fn dispatch(&self, id: String, online: bool) -> SyncHandle {
    if !online {
      return SyncHandle::ready(SyncOutcome::Deferred);
    }
    let manager = self.clone();
    SyncHandle::spawn(async move { manager.dispatch_queued(&id).await })
  }

  /// Push one queued item right away, taking it out of the queue first.
  async fn dispatch_queued(&self, id: &str) -> SyncOutcome {
    let item = self.lock_queue().take(id);
    // Already picked up by a flush
    let Some(item) = item else {
      return SyncOutcome::Deferred;
    };

    if !self.is_online() {
      self.lock_queue().push(item);
      return SyncOutcome::Deferred;
    }

    match self.sync_item(&item).await {
      Ok(()) => {
        self.mark(&item, SyncStatus::Synced);
        SyncOutcome::Pushed
      }
      Err(e) => {
        let message = format!("{:#}", e);
        warn!(key = %item.key, error = %message, "immediate sync failed, queued for retry");
        self.mark(&item, SyncStatus::Error);
        self.requeue(item);
        SyncOutcome::Failed(message)
      }
    }
  }

  async fn sync_item(&self, item: &SyncQueueItem) -> color_eyre::Result<()> {
    match &item.payload {
      SyncPayload::Upsert {
        data,
        data_hash,
        last_modified,
        expires_at,
      } => {
        let row = RemoteRow {
          user_id: item.user_id.clone(),
          cache_key: item.key.clone(),
          cache_type: item.table,
          data: data.clone(),
          data_hash: data_hash.clone(),
          last_modified: *last_modified,
          expires_at: *expires_at,
          sync_status: SyncStatus::Synced,
        };
        self.inner.remote.push(&row).await
      }
      SyncPayload::Delete => {
        self
          .inner
          .remote
          .delete(item.user_id.as_deref(), &item.key)
          .await
      }
    }
  }

  fn mark(&self, item: &SyncQueueItem, status: SyncStatus) {
    if let SyncPayload::Upsert {
      data_hash,
      last_modified,
      ..
    } = &item.payload
    {
      self
        .inner
        .metadata
        .mark(&item.key, *last_modified, data_hash, status);
    }
  }

  fn requeue(&self, item: SyncQueueItem) -> bool {
    let max_retries = self.config().max_retries;
    let kept = self.lock_queue().requeue(item, max_retries);
    if !kept {
      self.inner.dropped.fetch_add(1, Ordering::SeqCst);
    }
    kept
  }

  /// Flush the sync queue once.
  ///
  /// The current queue is taken as a snapshot and each item is synced in
  /// FIFO order. Failures go back on the live queue with one more retry on
  /// their count. Items queued meanwhile wait for the next flush.
  pub async fn process_sync_queue(&self) -> ProcessResult {
    let mut result = ProcessResult::default();
    if !self.is_online() {
      debug!("skipping sync queue flush while offline");
      return result;
    }

    let batch = self.lock_queue().take_all();
    for item in batch {
      if !self.is_online() {
        self.lock_queue().push(item);
        result.deferred += 1;
        continue;
      }

      result.attempted += 1;
      match self.sync_item(&item).await {
        Ok(()) => {
          self.mark(&item, SyncStatus::Synced);
          result.succeeded += 1;
        }
        Err(e) => {
          debug!(key = %item.key, retry = item.retry_count, error = %e, "sync attempt failed");
          self.mark(&item, SyncStatus::Error);
          if self.requeue(item) {
            result.requeued += 1;
          } else {
            result.dropped += 1;
          }
        }
      }
    }

    if result.attempted > 0 || result.deferred > 0 {
      info!(
        attempted = result.attempted,
        succeeded = result.succeeded,
        requeued = result.requeued,
        dropped = result.dropped,
        deferred = result.deferred,
        "processed sync queue"
      );
    }
    result
  }

  /// All records of kind `R`.
  pub async fn list<R: ListRecord>(&self, user_id: Option<&str>) -> Vec<R> {
    self.get(R::TABLE, Vec::new(), user_id).await
  }

  /// Replace the record with the same id, or append it.
  pub async fn upsert<R: ListRecord>(&self, record: R, user_id: Option<&str>) -> SyncHandle {
    let mut records = self.list::<R>(user_id).await;
    match records.iter_mut().find(|existing| existing.id() == record.id()) {
      Some(existing) => *existing = record,
      None => records.push(record),
    }
    self.set(R::TABLE, &records, user_id).await
  }

  /// Remove the record with `id`. Returns `None` when no such record exists.
  pub async fn delete_record<R: ListRecord>(
    &self,
    id: &str,
    user_id: Option<&str>,
  ) -> Option<SyncHandle> {
    let mut records = self.list::<R>(user_id).await;
    let before = records.len();
    records.retain(|record| record.id() != id);
    if records.len() == before {
      return None;
    }
    Some(self.set(R::TABLE, &records, user_id).await)
  }

  /// Save any business record into its table.
  pub async fn save_record(&self, record: Record, user_id: Option<&str>) -> SyncHandle {
    match record {
      Record::Request(r) => self.upsert(r, user_id).await,
      Record::Incident(r) => self.upsert(r, user_id).await,
      Record::Vendor(r) => self.upsert(r, user_id).await,
      Record::Consent(r) => self.upsert(r, user_id).await,
      Record::Compliance(r) => self.upsert(r, user_id).await,
      Record::Form(r) => self.upsert(r, user_id).await,
      Record::Preferences(p) => self.save_preferences(&p, user_id).await,
    }
  }

  /// Stored preferences, or the defaults.
  pub async fn preferences(&self, user_id: Option<&str>) -> Preferences {
    self
      .get(TableName::Preferences, Preferences::default(), user_id)
      .await
  }

  /// Replace the preferences object.
  pub async fn save_preferences(&self, prefs: &Preferences, user_id: Option<&str>) -> SyncHandle {
    self.set(TableName::Preferences, prefs, user_id).await
  }

  /// Raw JSON view of a table, mainly for diagnostics.
  pub async fn get_value(&self, table: TableName, user_id: Option<&str>) -> Value {
    self.get(table, Value::Null, user_id).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::records::PrivacyIncident;
  use crate::store::MemoryStore;
  use crate::test_support::{manager_with, ManualClock, ScriptedRemote};
  use serde_json::json;

  fn incident(id: &str, title: &str) -> PrivacyIncident {
    serde_json::from_value(json!({ "id": id, "title": title })).unwrap()
  }

  fn setup() -> (CacheManager, Arc<ScriptedRemote>, Arc<ManualClock>) {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let remote = ScriptedRemote::new();
    let clock = ManualClock::new();
    let manager = manager_with(store, remote.clone(), clock.clone(), CacheConfig::default());
    (manager, remote, clock)
  }

  #[tokio::test]
  async fn test_preferences_roundtrip_and_remove() {
    let (cache, _remote, _clock) = setup();
    cache.set_online(false);

    cache
      .set(TableName::Preferences, &json!({ "theme": "dark" }), None)
      .await;
    let prefs = cache.preferences(None).await;
    assert_eq!(prefs.theme.as_deref(), Some("dark"));

    cache.remove(TableName::Preferences, None).await;
    assert_eq!(cache.preferences(None).await, Preferences::default());
  }

  #[tokio::test]
  async fn test_never_set_returns_default() {
    let (cache, _remote, _clock) = setup();
    let value = cache
      .get(TableName::Vendors, json!({ "fallback": true }), Some("u1"))
      .await;
    assert_eq!(value, json!({ "fallback": true }));
  }

  #[tokio::test]
  async fn test_expired_entry_falls_back_to_default() {
    let (cache, remote, clock) = setup();
    cache.update_config(ConfigPatch {
      ttl: Some(Duration::from_secs(3600)),
      ..Default::default()
    });

    let outcome = cache
      .set(TableName::Vendors, &json!([{ "id": "v1" }]), None)
      .await
      .outcome()
      .await;
    assert_eq!(outcome, SyncOutcome::Pushed);
    remote.clear_rows();

    assert_eq!(
      cache.get(TableName::Vendors, json!([]), None).await,
      json!([{ "id": "v1" }])
    );

    clock.advance(chrono::Duration::hours(2));
    assert_eq!(cache.get(TableName::Vendors, json!([]), None).await, json!([]));
  }

  #[tokio::test]
  async fn test_miss_is_filled_from_remote() {
    let (cache, remote, clock) = setup();
    remote.insert_row(RemoteRow {
      user_id: Some("u1".to_string()),
      cache_key: "cc_user_u1_vendors".to_string(),
      cache_type: TableName::Vendors,
      data: json!([{ "id": "v9", "name": "Acme" }]),
      data_hash: "remote-hash".to_string(),
      last_modified: clock.now(),
      expires_at: None,
      sync_status: SyncStatus::Synced,
    });

    let vendors = cache.get(TableName::Vendors, json!([]), Some("u1")).await;
    assert_eq!(vendors, json!([{ "id": "v9", "name": "Acme" }]));

    // Now served locally even with the remote gone
    remote.fail_all(true);
    let again = cache.get(TableName::Vendors, json!([]), Some("u1")).await;
    assert_eq!(again, vendors);
    assert!(cache.metadata(TableName::Vendors, Some("u1")).is_some());
  }

  #[tokio::test]
  async fn test_newer_local_entry_wins_over_remote() {
    let (cache, remote, clock) = setup();
    cache.set_online(false);
    cache
      .set(TableName::Vendors, &json!([{ "id": "local" }]), None)
      .await;
    let written_at = clock.now();

    clock.advance(chrono::Duration::days(2));
    cache.set_online(true);
    remote.insert_row(RemoteRow {
      user_id: None,
      cache_key: "cc_vendors".to_string(),
      cache_type: TableName::Vendors,
      data: json!([{ "id": "remote" }]),
      data_hash: "older".to_string(),
      last_modified: written_at - chrono::Duration::hours(1),
      expires_at: None,
      sync_status: SyncStatus::Synced,
    });

    let vendors = cache.get(TableName::Vendors, json!([]), None).await;
    assert_eq!(vendors, json!([{ "id": "local" }]));
  }

  #[tokio::test]
  async fn test_unchanged_remote_entry_refreshes_without_queueing() {
    let (cache, remote, clock) = setup();
    let outcome = cache
      .set(TableName::Vendors, &json!([{ "id": "v1" }]), None)
      .await
      .outcome()
      .await;
    assert_eq!(outcome, SyncOutcome::Pushed);
    assert_eq!(cache.sync_status().pending, 0);

    clock.advance(chrono::Duration::days(2));
    let vendors = cache.get(TableName::Vendors, json!([]), None).await;
    assert_eq!(vendors, json!([{ "id": "v1" }]));

    assert_eq!(cache.sync_status().pending, 0);
    assert_eq!(remote.push_count(), 1);
    let meta = cache.metadata(TableName::Vendors, None).unwrap();
    assert_eq!(meta.sync_status, SyncStatus::Synced);
    assert!(meta.is_valid(clock.now(), cache.ttl()));
  }

  #[tokio::test]
  async fn test_online_write_is_pushed_immediately() {
    let (cache, remote, _clock) = setup();
    let outcome = cache
      .set(TableName::Preferences, &json!({ "theme": "dark" }), Some("u1"))
      .await
      .outcome()
      .await;

    assert_eq!(outcome, SyncOutcome::Pushed);
    assert_eq!(cache.sync_status().pending, 0);
    let row = remote.row(Some("u1"), "cc_user_u1_preferences").unwrap();
    assert_eq!(row.data, json!({ "theme": "dark" }));
    assert_eq!(
      cache
        .metadata(TableName::Preferences, Some("u1"))
        .unwrap()
        .sync_status,
      SyncStatus::Synced
    );
  }

  #[tokio::test]
  async fn test_failed_immediate_push_is_requeued() {
    let (cache, remote, _clock) = setup();
    remote.fail_all(true);

    let outcome = cache
      .set(TableName::Vendors, &json!([]), None)
      .await
      .outcome()
      .await;
    assert!(matches!(outcome, SyncOutcome::Failed(_)));

    let status = cache.sync_status();
    assert_eq!(status.pending, 1);
    assert_eq!(status.errors, 1);
    assert_eq!(
      cache.metadata(TableName::Vendors, None).unwrap().sync_status,
      SyncStatus::Error
    );
  }

  #[tokio::test]
  async fn test_offline_write_waits_for_flush() {
    let (cache, remote, _clock) = setup();
    cache.set_online(false);

    let outcome = cache
      .set(TableName::Vendors, &json!([{ "id": "v1" }]), None)
      .await
      .outcome()
      .await;
    assert_eq!(outcome, SyncOutcome::Deferred);
    assert_eq!(
      cache.metadata(TableName::Vendors, None).unwrap().sync_status,
      SyncStatus::Offline
    );
    assert_eq!(cache.process_sync_queue().await, ProcessResult::default());

    cache.set_online(true);
    let result = cache.process_sync_queue().await;
    assert_eq!(result.succeeded, 1);
    assert_eq!(remote.push_count(), 1);
    assert_eq!(
      cache.metadata(TableName::Vendors, None).unwrap().sync_status,
      SyncStatus::Synced
    );
  }

  #[tokio::test]
  async fn test_online_remove_pushes_delete_immediately() {
    let (cache, remote, _clock) = setup();
    cache
      .set(TableName::Vendors, &json!([{ "id": "v1" }]), None)
      .await
      .outcome()
      .await;
    assert!(remote.row(None, "cc_vendors").is_some());

    let outcome = cache.remove(TableName::Vendors, None).await.outcome().await;
    assert_eq!(outcome, SyncOutcome::Pushed);
    assert_eq!(remote.delete_count(), 1);
    assert_eq!(cache.sync_status().pending, 0);
    assert!(remote.row(None, "cc_vendors").is_none());
    assert!(cache.metadata(TableName::Vendors, None).is_none());
  }

  #[tokio::test]
  async fn test_flush_before_immediate_push_sends_once() {
    let (cache, remote, _clock) = setup();

    // The spawned push cannot run until this task yields, and the flush
    // below completes without yielding.
    let handle = cache
      .set(TableName::Vendors, &json!([{ "id": "v1" }]), None)
      .await;
    let result = cache.process_sync_queue().await;
    assert_eq!(result.succeeded, 1);

    assert_eq!(handle.outcome().await, SyncOutcome::Deferred);
    assert_eq!(remote.push_count(), 1);
    assert_eq!(cache.sync_status().pending, 0);
    assert_eq!(
      cache.metadata(TableName::Vendors, None).unwrap().sync_status,
      SyncStatus::Synced
    );
  }

  #[tokio::test]
  async fn test_expired_entry_is_refilled_from_changed_remote_row() {
    let (cache, remote, clock) = setup();
    cache
      .set(TableName::Vendors, &json!([{ "id": "v1" }]), None)
      .await
      .outcome()
      .await;
    assert_eq!(cache.metadata(TableName::Vendors, None).unwrap().version, 1);

    clock.advance(chrono::Duration::days(2));
    let remote_data = json!([{ "id": "v2" }]);
    remote.insert_row(RemoteRow {
      user_id: None,
      cache_key: "cc_vendors".to_string(),
      cache_type: TableName::Vendors,
      data: remote_data.clone(),
      data_hash: crate::cache::data_hash(&remote_data.to_string()),
      last_modified: clock.now(),
      expires_at: None,
      sync_status: SyncStatus::Synced,
    });

    let vendors = cache.get(TableName::Vendors, json!([]), None).await;
    assert_eq!(vendors, remote_data);

    let meta = cache.metadata(TableName::Vendors, None).unwrap();
    assert_eq!(meta.version, 2);
    assert_eq!(meta.data_hash, crate::cache::data_hash(&remote_data.to_string()));
    assert!(meta.is_valid(clock.now(), cache.ttl()));

    // Served locally from now on
    remote.fail_all(true);
    assert_eq!(cache.get(TableName::Vendors, json!([]), None).await, remote_data);
  }

  #[tokio::test]
  async fn test_queue_snapshot_and_storage_usage() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::with_capacity(4096));
    let cache = manager_with(
      store,
      ScriptedRemote::new(),
      ManualClock::new(),
      CacheConfig::default(),
    );
    cache.set_online(false);

    cache.set(TableName::Vendors, &json!([]), None).await;
    cache.remove(TableName::FormDrafts, Some("u1")).await;

    let items = cache.queue_snapshot();
    let summary: Vec<_> = items
      .iter()
      .map(|item| (item.operation, item.key.as_str()))
      .collect();
    assert_eq!(
      summary,
      vec![
        (SyncOperation::Create, "cc_vendors"),
        (SyncOperation::Delete, "cc_user_u1_form_drafts"),
      ]
    );

    let usage = cache.storage_usage().unwrap();
    assert_eq!(usage.capacity_bytes, 4096);
    assert!(usage.used_bytes > 0 && usage.used_bytes < 4096);
  }

  #[tokio::test]
  async fn test_offline_mode_suppresses_remote_reads() {
    let (cache, remote, _clock) = setup();
    cache.update_config(ConfigPatch {
      offline_mode: Some(true),
      ..Default::default()
    });
    assert!(cache.sync_status().offline);

    cache.get(TableName::Vendors, json!([]), None).await;
    assert_eq!(remote.fetch_count(), 0);
  }

  #[tokio::test]
  async fn test_retry_ceiling() {
    let (cache, remote, _clock) = setup();
    cache.set_online(false);
    cache.remove(TableName::Vendors, None).await;
    cache.set_online(true);
    remote.fail_all(true);

    let first = cache.process_sync_queue().await;
    assert_eq!(first.requeued, 1);
    assert_eq!(cache.sync_status().errors, 1);

    for _ in 0..3 {
      cache.process_sync_queue().await;
    }

    // One initial attempt plus max_retries retries
    assert_eq!(remote.delete_count(), 4);
    let status = cache.sync_status();
    assert_eq!(status.pending, 0);
    assert_eq!(status.errors, 0);
    assert_eq!(status.dropped, 1);
  }

  #[tokio::test]
  async fn test_queue_survives_restart() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let remote = ScriptedRemote::new();
    let clock = ManualClock::new();
    let cache = manager_with(
      store.clone(),
      remote.clone(),
      clock.clone(),
      CacheConfig::default(),
    );
    cache.set_online(false);
    for n in 0..5 {
      cache
        .upsert(incident(&format!("inc-{n}"), "X"), None)
        .await;
    }
    assert_eq!(cache.sync_status().pending, 5);
    drop(cache);

    let reopened = manager_with(store, remote, clock, CacheConfig::default());
    assert_eq!(reopened.sync_status().pending, 5);
    assert_eq!(reopened.list::<PrivacyIncident>(None).await.len(), 5);
  }

  #[tokio::test]
  async fn test_quota_exceeded_leaves_previous_state() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::with_capacity(2048));
    let cache = manager_with(
      store,
      ScriptedRemote::new(),
      ManualClock::new(),
      CacheConfig::default(),
    );
    cache.set_online(false);

    cache
      .set(TableName::Preferences, &json!({ "theme": "dark" }), None)
      .await;
    let meta_before = cache.metadata(TableName::Preferences, None);
    let pending_before = cache.sync_status().pending;

    let huge = json!({ "theme": "x".repeat(4096) });
    let outcome = cache
      .set(TableName::Preferences, &huge, None)
      .await
      .outcome()
      .await;
    assert_eq!(outcome, SyncOutcome::Dropped);

    assert_eq!(cache.preferences(None).await.theme.as_deref(), Some("dark"));
    assert_eq!(cache.metadata(TableName::Preferences, None), meta_before);
    assert_eq!(cache.sync_status().pending, pending_before);
  }

  #[tokio::test]
  async fn test_metadata_failure_rolls_back_entry() {
    // Room for the value but not for its metadata
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::with_capacity(64));
    let cache = manager_with(
      store.clone(),
      ScriptedRemote::new(),
      ManualClock::new(),
      CacheConfig::default(),
    );
    cache.set_online(false);

    let outcome = cache
      .set(TableName::Preferences, &json!({ "theme": "dark" }), None)
      .await
      .outcome()
      .await;
    assert_eq!(outcome, SyncOutcome::Dropped);
    assert_eq!(store.get_item("cc_preferences").unwrap(), None);
    assert_eq!(cache.sync_status().pending, 0);
  }

  #[tokio::test]
  async fn test_clear_is_scoped_to_user() {
    let (cache, _remote, _clock) = setup();
    cache.set_online(false);
    cache.set(TableName::Vendors, &json!(["a"]), Some("a")).await;
    cache.set(TableName::Vendors, &json!(["b"]), Some("b")).await;
    cache.set(TableName::Vendors, &json!(["shared"]), None).await;

    // Data and metadata for user a
    assert_eq!(cache.clear(Some("a")), 2);
    assert_eq!(cache.sync_status().pending, 0);

    assert_eq!(
      cache.get(TableName::Vendors, json!([]), Some("a")).await,
      json!([])
    );
    assert_eq!(
      cache.get(TableName::Vendors, json!([]), Some("b")).await,
      json!(["b"])
    );
    assert_eq!(
      cache.get(TableName::Vendors, json!([]), None).await,
      json!(["shared"])
    );

    cache.clear(None);
    assert_eq!(cache.get(TableName::Vendors, json!([]), None).await, json!([]));
    assert_eq!(
      cache.get(TableName::Vendors, json!([]), Some("b")).await,
      json!(["b"])
    );
  }

  #[tokio::test]
  async fn test_upsert_replaces_by_id() {
    let (cache, _remote, _clock) = setup();
    cache.set_online(false);

    cache.upsert(incident("inc-1", "first"), None).await;
    cache.upsert(incident("inc-2", "second"), None).await;
    cache.upsert(incident("inc-1", "edited"), None).await;

    let incidents = cache.list::<PrivacyIncident>(None).await;
    assert_eq!(incidents.len(), 2);
    assert_eq!(incidents[0].title.as_deref(), Some("edited"));

    assert!(cache
      .delete_record::<PrivacyIncident>("inc-2", None)
      .await
      .is_some());
    assert!(cache
      .delete_record::<PrivacyIncident>("missing", None)
      .await
      .is_none());
    assert_eq!(cache.list::<PrivacyIncident>(None).await.len(), 1);

    let meta = cache.metadata(TableName::PrivacyIncidents, None).unwrap();
    assert_eq!(meta.version, 4);
  }

  #[tokio::test]
  async fn test_update_config_returns_merged_config() {
    let (cache, _remote, _clock) = setup();
    let config = cache.update_config(ConfigPatch {
      max_retries: Some(5),
      ..Default::default()
    });
    assert_eq!(config.max_retries, 5);
    assert_eq!(config.sync_interval, CacheConfig::default().sync_interval);
    assert_eq!(cache.config(), config);
  }
}
