//! Fakes shared by the unit tests.

use chrono::{DateTime, Duration, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::{self, BoxFuture};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::{CacheConfig, CacheManager};
use crate::clock::Clock;
use crate::remote::{RemoteRow, RemoteSyncClient};
use crate::store::KeyValueStore;

/// Clock that only moves when told to.
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      now: Mutex::new(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()),
    })
  }

  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock().unwrap();
    *now += by;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap()
  }
}

type RowKey = (Option<String>, String);

/// In-memory remote whose failures can be switched on and off.
pub struct ScriptedRemote {
  rows: Mutex<HashMap<RowKey, RemoteRow>>,
  failing: AtomicBool,
  fetches: AtomicUsize,
  pushes: AtomicUsize,
  deletes: AtomicUsize,
}

impl ScriptedRemote {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      rows: Mutex::new(HashMap::new()),
      failing: AtomicBool::new(false),
      fetches: AtomicUsize::new(0),
      pushes: AtomicUsize::new(0),
      deletes: AtomicUsize::new(0),
    })
  }

  pub fn fail_all(&self, failing: bool) {
    self.failing.store(failing, Ordering::SeqCst);
  }

  pub fn insert_row(&self, row: RemoteRow) {
    let key = (row.user_id.clone(), row.cache_key.clone());
    self.rows.lock().unwrap().insert(key, row);
  }

  pub fn row(&self, user_id: Option<&str>, cache_key: &str) -> Option<RemoteRow> {
    let key = (user_id.map(String::from), cache_key.to_string());
    self.rows.lock().unwrap().get(&key).cloned()
  }

  pub fn clear_rows(&self) {
    self.rows.lock().unwrap().clear();
  }

  pub fn fetch_count(&self) -> usize {
    self.fetches.load(Ordering::SeqCst)
  }

  pub fn push_count(&self) -> usize {
    self.pushes.load(Ordering::SeqCst)
  }

  pub fn delete_count(&self) -> usize {
    self.deletes.load(Ordering::SeqCst)
  }

  fn check(&self) -> Result<()> {
    if self.failing.load(Ordering::SeqCst) {
      Err(eyre!("scripted remote failure"))
    } else {
      Ok(())
    }
  }
}

impl RemoteSyncClient for ScriptedRemote {
  fn fetch<'a>(
    &'a self,
    user_id: Option<&'a str>,
    cache_key: &'a str,
  ) -> BoxFuture<'a, Result<Option<RemoteRow>>> {
    self.fetches.fetch_add(1, Ordering::SeqCst);
    let result = self.check().map(|()| self.row(user_id, cache_key));
    Box::pin(future::ready(result))
  }

  fn push<'a>(&'a self, row: &'a RemoteRow) -> BoxFuture<'a, Result<()>> {
    self.pushes.fetch_add(1, Ordering::SeqCst);
    let result = self.check().map(|()| self.insert_row(row.clone()));
    Box::pin(future::ready(result))
  }

  fn delete<'a>(
    &'a self,
    user_id: Option<&'a str>,
    cache_key: &'a str,
  ) -> BoxFuture<'a, Result<()>> {
    self.deletes.fetch_add(1, Ordering::SeqCst);
    let result = self.check().map(|()| {
      let key = (user_id.map(String::from), cache_key.to_string());
      self.rows.lock().unwrap().remove(&key);
    });
    Box::pin(future::ready(result))
  }

  fn ping(&self) -> BoxFuture<'_, Result<()>> {
    Box::pin(future::ready(self.check()))
  }
}

pub fn manager_with(
  store: Arc<dyn KeyValueStore>,
  remote: Arc<ScriptedRemote>,
  clock: Arc<ManualClock>,
  config: CacheConfig,
) -> CacheManager {
  CacheManager::with_clock(store, remote, config, clock)
}
