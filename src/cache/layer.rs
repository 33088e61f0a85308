//! Cache layer that orchestrates caching strategies with network fetching.

use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, warn};

use super::traits::{CacheKey, CacheStorage};
use crate::http::{Network, Request, Response};
use crate::lifecycle::ExtendableEvent;

/// Cache layer that applies a caching strategy to a single request.
///
/// Writes are detached: they are registered on the event's lifetime
/// extension and keep running after the response has been handed back.
pub struct CacheLayer<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
}

impl<S: CacheStorage, N: Network> CacheLayer<S, N> {
  pub fn new(storage: Arc<S>, network: Arc<N>) -> Self {
    Self { storage, network }
  }

  /// Serve from the partition when present, otherwise fetch.
  ///
  /// 1. Check cache - on hit, return immediately (no freshness check)
  /// 2. On miss, fetch from network
  /// 3. Store 2xx responses, return anything else uncached
  ///
  /// Fails only when the entry is missing and the network is unusable.
  pub async fn cache_first(
    &self,
    request: &Request,
    partition: &str,
    event: &ExtendableEvent,
  ) -> Result<Response> {
    let key = CacheKey::for_request(request);

    if let Some(cached) = self.lookup(partition, &key) {
      debug!(partition, "Cache hit: {}", request.url);
      return Ok(cached);
    }

    debug!(partition, "Cache miss, fetching: {}", request.url);
    let response = self.network.fetch(request).await?;

    if response.is_ok() {
      self.store_detached(event, partition, key, response.clone());
    }

    Ok(response)
  }

  /// Prefer the network, fall back to the partition when it is unusable.
  ///
  /// 1. Fetch from network; store and return 2xx responses
  /// 2. Non-2xx responses are returned as-is, uncached
  /// 3. On network failure, return the cached entry (offline mode)
  /// 4. No cached entry: propagate the network error
  pub async fn network_first(
    &self,
    request: &Request,
    partition: &str,
    event: &ExtendableEvent,
  ) -> Result<Response> {
    let key = CacheKey::for_request(request);

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_ok() {
          self.store_detached(event, partition, key, response.clone());
        }
        Ok(response)
      }
      Err(err) => match self.lookup(partition, &key) {
        Some(cached) => {
          debug!(partition, "Network failed, serving cache: {}", request.url);
          Ok(cached)
        }
        None => Err(err),
      },
    }
  }

  /// Partition lookup; a broken lookup is treated as a miss.
  fn lookup(&self, partition: &str, key: &CacheKey) -> Option<Response> {
    match self.storage.match_in(partition, key) {
      Ok(found) => found,
      Err(e) => {
        warn!(partition, "Cache lookup failed for {}: {}", key, e);
        None
      }
    }
  }

  /// Queue a write of `response` that outlives the caller.
  fn store_detached(
    &self,
    event: &ExtendableEvent,
    partition: &str,
    key: CacheKey,
    response: Response,
  ) {
    let storage = Arc::clone(&self.storage);
    let partition = partition.to_string();

    event.wait_until(async move {
      if let Err(e) = storage.put(&partition, &key, &response) {
        warn!(partition = %partition, "Failed to cache {}: {}", key, e);
      }
    });
  }
}
