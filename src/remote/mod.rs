//! Remote sync target the cache pushes to and falls back on.

mod http;

pub use http::HttpRemoteClient;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::{self, BoxFuture};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::{SyncStatus, TableName};

/// One cached entry as stored remotely, keyed by `(user_id, cache_key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRow {
  pub user_id: Option<String>,
  pub cache_key: String,
  pub cache_type: TableName,
  pub data: Value,
  pub data_hash: String,
  pub last_modified: DateTime<Utc>,
  pub expires_at: Option<DateTime<Utc>>,
  pub sync_status: SyncStatus,
}

/// Backend the cache synchronizes with.
///
/// Errors are soft: the cache logs them and keeps working locally.
pub trait RemoteSyncClient: Send + Sync {
  /// Whether a backend is configured at all. An unavailable remote keeps the
  /// cache in local-only mode.
  fn is_available(&self) -> bool {
    true
  }

  fn fetch<'a>(
    &'a self,
    user_id: Option<&'a str>,
    cache_key: &'a str,
  ) -> BoxFuture<'a, Result<Option<RemoteRow>>>;

  /// Insert or replace the row for `(row.user_id, row.cache_key)`.
  fn push<'a>(&'a self, row: &'a RemoteRow) -> BoxFuture<'a, Result<()>>;

  fn delete<'a>(&'a self, user_id: Option<&'a str>, cache_key: &'a str)
    -> BoxFuture<'a, Result<()>>;

  /// Cheap reachability check.
  fn ping(&self) -> BoxFuture<'_, Result<()>>;
}

/// Stand-in used when no remote is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableRemote;

impl RemoteSyncClient for UnavailableRemote {
  fn is_available(&self) -> bool {
    false
  }

  fn fetch<'a>(
    &'a self,
    _user_id: Option<&'a str>,
    _cache_key: &'a str,
  ) -> BoxFuture<'a, Result<Option<RemoteRow>>> {
    Box::pin(future::ready(Err(eyre!("remote sync target not configured"))))
  }

  fn push<'a>(&'a self, _row: &'a RemoteRow) -> BoxFuture<'a, Result<()>> {
    Box::pin(future::ready(Err(eyre!("remote sync target not configured"))))
  }

  fn delete<'a>(
    &'a self,
    _user_id: Option<&'a str>,
    _cache_key: &'a str,
  ) -> BoxFuture<'a, Result<()>> {
    Box::pin(future::ready(Err(eyre!("remote sync target not configured"))))
  }

  fn ping(&self) -> BoxFuture<'_, Result<()>> {
    Box::pin(future::ready(Err(eyre!("remote sync target not configured"))))
  }
}
