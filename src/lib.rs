pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod logging;
pub mod migration;
pub mod records;
pub mod remote;
pub mod store;

#[cfg(test)]
mod test_support;

use color_eyre::Result;
use std::sync::Arc;

use cache::CacheManager;
use config::Config;
use remote::{HttpRemoteClient, RemoteSyncClient, UnavailableRemote};
use store::{KeyValueStore, SqliteStore};

/// Open the configured store and remote and wrap them in a [`CacheManager`].
pub fn open_cache(config: &Config) -> Result<CacheManager> {
  let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(
    config.storage.path.as_deref(),
    config.storage.capacity_bytes,
  )?);

  let remote: Arc<dyn RemoteSyncClient> = match &config.remote {
    Some(remote) => Arc::new(HttpRemoteClient::new(remote, Config::api_key())?),
    None => {
      tracing::info!("no remote configured, running local-only");
      Arc::new(UnavailableRemote)
    }
  };

  Ok(CacheManager::new(store, remote, config.cache.to_cache_config()))
}
