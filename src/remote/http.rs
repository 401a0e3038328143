//! HTTP adapter for a PostgREST-style remote table.

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use reqwest::{Client, Method, RequestBuilder};
use std::time::Duration;
use url::Url;

use super::{RemoteRow, RemoteSyncClient};
use crate::config::RemoteConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Remote client talking to `<base>/rest/v1/<table>`.
#[derive(Clone)]
pub struct HttpRemoteClient {
  client: Client,
  endpoint: Url,
  api_key: Option<String>,
}

impl HttpRemoteClient {
  pub fn new(config: &RemoteConfig, api_key: Option<String>) -> Result<Self> {
    let mut base =
      Url::parse(&config.url).map_err(|e| eyre!("Invalid remote url '{}': {}", config.url, e))?;
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let endpoint = base
      .join(&format!("rest/v1/{}", config.table))
      .map_err(|e| eyre!("Invalid remote table '{}': {}", config.table, e))?;

    let client = Client::builder()
      .timeout(REQUEST_TIMEOUT)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      endpoint,
      api_key,
    })
  }

  /// Endpoint url filtered down to a single `(user_id, cache_key)` row.
  fn row_url(&self, user_id: Option<&str>, cache_key: &str) -> Url {
    let mut url = self.endpoint.clone();
    {
      let mut query = url.query_pairs_mut();
      match user_id {
        Some(id) => query.append_pair("user_id", &format!("eq.{}", id)),
        None => query.append_pair("user_id", "is.null"),
      };
      query.append_pair("cache_key", &format!("eq.{}", cache_key));
    }
    url
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let builder = self.client.request(method, url);
    match &self.api_key {
      Some(key) => builder.header("apikey", key).bearer_auth(key),
      None => builder,
    }
  }
}

impl RemoteSyncClient for HttpRemoteClient {
  fn fetch<'a>(
    &'a self,
    user_id: Option<&'a str>,
    cache_key: &'a str,
  ) -> BoxFuture<'a, Result<Option<RemoteRow>>> {
    async move {
      let mut url = self.row_url(user_id, cache_key);
      url.query_pairs_mut().append_pair("limit", "1");

      let rows: Vec<RemoteRow> = self
        .request(Method::GET, url)
        .send()
        .await
        .map_err(|e| eyre!("Failed to fetch {}: {}", cache_key, e))?
        .error_for_status()
        .map_err(|e| eyre!("Remote rejected fetch of {}: {}", cache_key, e))?
        .json()
        .await
        .map_err(|e| eyre!("Failed to parse remote row for {}: {}", cache_key, e))?;

      Ok(rows.into_iter().next())
    }
    .boxed()
  }

  fn push<'a>(&'a self, row: &'a RemoteRow) -> BoxFuture<'a, Result<()>> {
    async move {
      let mut url = self.endpoint.clone();
      url
        .query_pairs_mut()
        .append_pair("on_conflict", "user_id,cache_key");

      self
        .request(Method::POST, url)
        .header("Prefer", "resolution=merge-duplicates")
        .json(&[row])
        .send()
        .await
        .map_err(|e| eyre!("Failed to push {}: {}", row.cache_key, e))?
        .error_for_status()
        .map_err(|e| eyre!("Remote rejected push of {}: {}", row.cache_key, e))?;

      Ok(())
    }
    .boxed()
  }

  fn delete<'a>(
    &'a self,
    user_id: Option<&'a str>,
    cache_key: &'a str,
  ) -> BoxFuture<'a, Result<()>> {
    async move {
      self
        .request(Method::DELETE, self.row_url(user_id, cache_key))
        .send()
        .await
        .map_err(|e| eyre!("Failed to delete {}: {}", cache_key, e))?
        .error_for_status()
        .map_err(|e| eyre!("Remote rejected delete of {}: {}", cache_key, e))?;

      Ok(())
    }
    .boxed()
  }

  fn ping(&self) -> BoxFuture<'_, Result<()>> {
    async move {
      let mut url = self.endpoint.clone();
      url
        .query_pairs_mut()
        .append_pair("select", "cache_key")
        .append_pair("limit", "1");

      self
        .request(Method::GET, url)
        .send()
        .await
        .map_err(|e| eyre!("Remote unreachable: {}", e))?
        .error_for_status()
        .map_err(|e| eyre!("Remote unhealthy: {}", e))?;

      Ok(())
    }
    .boxed()
  }
}
