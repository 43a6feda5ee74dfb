//! Cache policy engine that applies the strategy table to requests.

use futures::future::join_all;
use reqwest::Method;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::fetch::Fetcher;
use super::http::{CacheRequest, CachedResponse};
use super::storage::HttpCache;
use super::strategy::{
  classify, current_cache_names, versioned, CacheStrategy, Handler, PRECACHE_NAME, STRATEGIES,
};
use crate::clock::{Clock, SystemClock};
use crate::error::{CacheStoreError, FetchError};
use crate::store::{StorageEstimate, Store};

/// Result of handling a request, including where the response came from.
#[derive(Debug, Clone)]
pub struct CacheResult {
  pub response: CachedResponse,
  pub source: CacheSource,
}

impl CacheResult {
  fn from_network(response: CachedResponse) -> Self {
    Self {
      response,
      source: CacheSource::Network,
    }
  }

  fn from_cache(response: CachedResponse) -> Self {
    Self {
      response,
      source: CacheSource::CacheFresh,
    }
  }

  fn offline(response: CachedResponse) -> Self {
    Self {
      response,
      source: CacheSource::Offline,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheSource {
  /// Fresh from the network (or passed through untouched)
  Network,
  /// Unexpired cache entry
  CacheFresh,
  /// Cached entry served because the network failed or timed out
  Offline,
}

/// Tunables that do not belong in the shared strategy table.
#[derive(Debug, Clone, Copy)]
pub struct PolicySettings {
  pub network_timeout: Duration,
  /// Fraction of the quota at which purgeable caches start being evicted.
  pub quota_threshold: f64,
  pub purge_batch_size: usize,
}

impl Default for PolicySettings {
  fn default() -> Self {
    Self {
      network_timeout: Duration::from_millis(3000),
      quota_threshold: 0.8,
      purge_batch_size: 10,
    }
  }
}

/// Outcome of [`CachePolicyEngine::warm_cache`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WarmReport {
  pub stored: Vec<String>,
  pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub name: String,
  pub entries: usize,
  pub bytes: u64,
}

/// Where a response should be written and how large that cache may grow.
struct Target {
  cache_name: String,
  max_entries: Option<usize>,
}

impl Target {
  fn for_strategy(strategy: &CacheStrategy) -> Self {
    Self {
      cache_name: strategy.cache_name(),
      max_entries: Some(strategy.max_entries),
    }
  }

  fn precache() -> Self {
    Self {
      cache_name: versioned(PRECACHE_NAME),
      max_entries: None,
    }
  }
}

/// Which bytes count against the quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Usage {
  /// Cached response bodies only; what a put is checked against.
  Cache,
  /// Everything the origin keeps locally, including the durable store.
  Origin,
}

/// Applies the strategy table to requests against a named HTTP cache.
///
/// Cheap to clone; stale-while-revalidate refreshes run on a clone.
#[derive(Clone)]
pub struct CachePolicyEngine {
  cache: Arc<dyn HttpCache>,
  fetcher: Arc<dyn Fetcher>,
  clock: Arc<dyn Clock>,
  strategies: &'static [CacheStrategy],
  settings: PolicySettings,
  durable: Option<Store>,
}

impl CachePolicyEngine {
  pub fn new(cache: Arc<dyn HttpCache>, fetcher: Arc<dyn Fetcher>) -> Self {
    Self {
      cache,
      fetcher,
      clock: Arc::new(SystemClock),
      strategies: STRATEGIES,
      settings: PolicySettings::default(),
      durable: None,
    }
  }

  pub fn with_settings(mut self, settings: PolicySettings) -> Self {
    self.settings = settings;
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Count the durable store's usage toward the shared quota.
  pub fn with_durable_store(mut self, store: Store) -> Self {
    self.durable = Some(store);
    self
  }

  pub fn with_strategies(mut self, strategies: &'static [CacheStrategy]) -> Self {
    self.strategies = strategies;
    self
  }

  pub fn strategies(&self) -> &'static [CacheStrategy] {
    self.strategies
  }

  pub fn cache(&self) -> &Arc<dyn HttpCache> {
    &self.cache
  }

  /// Answer `request` according to its strategy.
  ///
  /// Non-GET, non-HTTP(S) and unclassified requests go straight to the network.
  pub async fn handle(&self, request: &CacheRequest) -> Result<CacheResult, FetchError> {
    if request.method != Method::GET || !request.is_http() {
      return self.pass_through(request).await;
    }
    let Some(strategy) = classify(self.strategies, request) else {
      return self.pass_through(request).await;
    };

    debug!(url = %request.url, strategy = strategy.name, "handling request");
    match strategy.handler {
      Handler::CacheFirst => self.cache_first(strategy, request).await,
      Handler::NetworkFirst => self.network_first(strategy, request).await,
      Handler::StaleWhileRevalidate => self.stale_while_revalidate(strategy, request).await,
    }
  }

  async fn pass_through(&self, request: &CacheRequest) -> Result<CacheResult, FetchError> {
    self
      .fetcher
      .fetch(request)
      .await
      .map(CacheResult::from_network)
  }

  async fn cache_first(
    &self,
    strategy: &CacheStrategy,
    request: &CacheRequest,
  ) -> Result<CacheResult, FetchError> {
    let cached = self.lookup(&strategy.cache_name(), request).await;
    if let Some(hit) = &cached {
      if !strategy.is_expired(hit, self.clock.now()) {
        return Ok(CacheResult::from_cache(hit.clone()));
      }
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        let response = self.store(&Target::for_strategy(strategy), request, response).await;
        Ok(CacheResult::from_network(response))
      }
      Err(e) => match cached {
        Some(stale) => {
          debug!(url = %request.url, "network failed, serving stale entry: {}", e);
          Ok(CacheResult::offline(stale))
        }
        None => Err(e),
      },
    }
  }

  async fn network_first(
    &self,
    strategy: &CacheStrategy,
    request: &CacheRequest,
  ) -> Result<CacheResult, FetchError> {
    let timeout = self.settings.network_timeout;
    // Timing out drops the fetch future, which aborts the request.
    let error = match tokio::time::timeout(timeout, self.fetcher.fetch(request)).await {
      Ok(Ok(response)) => {
        let response = self.store(&Target::for_strategy(strategy), request, response).await;
        return Ok(CacheResult::from_network(response));
      }
      Ok(Err(e)) => e,
      Err(_) => FetchError::Timeout(timeout.as_millis() as u64),
    };

    match self.lookup(&strategy.cache_name(), request).await {
      Some(cached) => {
        debug!(url = %request.url, "{}, serving cached entry", error);
        Ok(CacheResult::offline(cached))
      }
      None => Err(error),
    }
  }

  async fn stale_while_revalidate(
    &self,
    strategy: &CacheStrategy,
    request: &CacheRequest,
  ) -> Result<CacheResult, FetchError> {
    let cached = self.lookup(&strategy.cache_name(), request).await;
    if let Some(hit) = &cached {
      if !strategy.is_expired(hit, self.clock.now()) {
        self.revalidate(*strategy, request.clone());
        return Ok(CacheResult::from_cache(hit.clone()));
      }
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        let response = self.store(&Target::for_strategy(strategy), request, response).await;
        Ok(CacheResult::from_network(response))
      }
      Err(e) => match cached {
        Some(stale) => Ok(CacheResult::offline(stale)),
        None => Err(e),
      },
    }
  }

  /// Refresh an entry in the background; the caller does not wait.
  fn revalidate(&self, strategy: CacheStrategy, request: CacheRequest) {
    let engine = self.clone();
    tokio::spawn(async move {
      match engine.fetcher.fetch(&request).await {
        Ok(response) => {
          engine.store(&Target::for_strategy(&strategy), &request, response).await;
        }
        Err(e) => debug!(url = %request.url, "background revalidation failed: {}", e),
      }
    });
  }

  async fn lookup(&self, cache_name: &str, request: &CacheRequest) -> Option<CachedResponse> {
    match self.cache.lookup(cache_name, request).await {
      Ok(hit) => hit,
      Err(e) => {
        warn!("Cache lookup in {} failed: {}", cache_name, e);
        None
      }
    }
  }

  /// Stamp and store a cacheable response, then trim and check the quota.
  ///
  /// Returns the response to serve. Storage failures are logged; the
  /// response is served either way.
  async fn store(
    &self,
    target: &Target,
    request: &CacheRequest,
    response: CachedResponse,
  ) -> CachedResponse {
    if !response.is_cacheable() {
      debug!(url = %request.url, status = response.status, "response not cacheable");
      return response;
    }
    let response = response.stamped(self.clock.now());

    if let Err(e) = self.put(&target.cache_name, request, &response).await {
      warn!(url = %request.url, "Failed to cache response: {}", e);
      return response;
    }
    if let Some(max_entries) = target.max_entries {
      if let Err(e) = self.trim(&target.cache_name, max_entries).await {
        warn!("Failed to trim {}: {}", target.cache_name, e);
      }
    }
    if let Err(e) = self.enforce_quota().await {
      warn!("Quota enforcement failed: {}", e);
    }
    response
  }

  /// Put, and on a quota rejection free space and try exactly once more.
  async fn put(
    &self,
    cache_name: &str,
    request: &CacheRequest,
    response: &CachedResponse,
  ) -> Result<(), CacheStoreError> {
    match self.cache.put(cache_name, request, response).await {
      Err(CacheStoreError::QuotaExceeded { needed, .. }) => {
        let evicted = self
          .purge(Usage::Cache, |estimate| {
            estimate.usage.saturating_add(needed) <= estimate.quota
          })
          .await?;
        debug!(evicted, "quota exceeded on put, retrying once");
        self.cache.put(cache_name, request, response).await
      }
      other => other,
    }
  }

  /// Delete the oldest entries of `cache_name` beyond `max_entries`.
  async fn trim(&self, cache_name: &str, max_entries: usize) -> Result<usize, CacheStoreError> {
    let keys = self.cache.keys(cache_name).await?;
    let excess = keys.len().saturating_sub(max_entries);
    for key in &keys[..excess] {
      self.cache.delete(cache_name, &key.request_key).await?;
    }
    Ok(excess)
  }

  /// Evict from purgeable caches until origin-wide usage is back under the threshold.
  ///
  /// Returns the number of entries evicted. Caches whose strategy does not
  /// allow purging are never touched.
  pub async fn enforce_quota(&self) -> Result<usize, CacheStoreError> {
    let threshold = self.settings.quota_threshold;
    self
      .purge(Usage::Origin, |estimate| estimate.ratio() < threshold)
      .await
  }

  async fn purge(
    &self,
    usage: Usage,
    satisfied: impl Fn(&StorageEstimate) -> bool,
  ) -> Result<usize, CacheStoreError> {
    let batch = self.settings.purge_batch_size.max(1);
    let mut estimate = self.usage(usage).await?;
    let mut evicted = 0;

    for strategy in self.strategies.iter().filter(|s| s.purge_on_quota_error) {
      let cache_name = strategy.cache_name();
      while !satisfied(&estimate) {
        let keys = self.cache.keys(&cache_name).await?;
        if keys.is_empty() {
          break;
        }
        for key in keys.iter().take(batch) {
          self.cache.delete(&cache_name, &key.request_key).await?;
          evicted += 1;
        }
        estimate = self.usage(usage).await?;
      }
      if satisfied(&estimate) {
        break;
      }
    }

    if evicted > 0 {
      info!(
        evicted,
        usage = estimate.usage,
        quota = estimate.quota,
        "purged cache entries under quota pressure"
      );
    }
    Ok(evicted)
  }

  /// Fetch and store every URL concurrently. Failures are reported, never raised.
  ///
  /// URLs no strategy claims go to the precache cache. The quota is enforced
  /// once the whole batch has landed.
  pub async fn warm_cache(&self, urls: &[Url]) -> WarmReport {
    let results = join_all(urls.iter().map(|url| self.warm_one(url.clone()))).await;

    let mut report = WarmReport::default();
    for (url, result) in urls.iter().zip(results) {
      match result {
        Ok(()) => report.stored.push(url.to_string()),
        Err(reason) => {
          warn!(url = %url, "Failed to warm cache: {}", reason);
          report.failed.push((url.to_string(), reason));
        }
      }
    }
    if !report.stored.is_empty() {
      if let Err(e) = self.enforce_quota().await {
        warn!("Quota enforcement after warming failed: {}", e);
      }
    }
    info!(
      stored = report.stored.len(),
      failed = report.failed.len(),
      "cache warm finished"
    );
    report
  }

  async fn warm_one(&self, url: Url) -> Result<(), String> {
    let request = CacheRequest::get(url);
    let target = match classify(self.strategies, &request) {
      Some(strategy) => Target::for_strategy(strategy),
      None => Target::precache(),
    };
    let response = self.fetcher.fetch(&request).await.map_err(|e| e.to_string())?;
    if !response.is_cacheable() {
      return Err(format!("response not cacheable (HTTP {})", response.status));
    }
    let response = response.stamped(self.clock.now());
    self
      .put(&target.cache_name, &request, &response)
      .await
      .map_err(|e| e.to_string())?;
    if let Some(max_entries) = target.max_entries {
      self
        .trim(&target.cache_name, max_entries)
        .await
        .map_err(|e| e.to_string())?;
    }
    Ok(())
  }

  /// Delete expired entries from every strategy cache. Returns how many went.
  pub async fn cleanup_expired(&self) -> Result<usize, CacheStoreError> {
    let now = self.clock.now();
    let mut removed = 0;
    for strategy in self.strategies {
      let cache_name = strategy.cache_name();
      for key in self.cache.keys(&cache_name).await? {
        if strategy.is_expired_at(key.captured_at, now)
          && self.cache.delete(&cache_name, &key.request_key).await?
        {
          removed += 1;
        }
      }
    }
    if removed > 0 {
      info!(removed, "removed expired cache entries");
    }
    Ok(removed)
  }

  /// Delete every cache the current strategy table does not own.
  pub async fn delete_outdated_caches(&self) -> Result<Vec<String>, CacheStoreError> {
    let current = current_cache_names(self.strategies);
    let mut deleted = Vec::new();
    for name in self.cache.cache_names().await? {
      if !current.contains(&name) {
        self.cache.delete_cache(&name).await?;
        info!(cache = %name, "deleted outdated cache");
        deleted.push(name);
      }
    }
    Ok(deleted)
  }

  pub async fn stats(&self) -> Result<Vec<CacheStats>, CacheStoreError> {
    let mut stats = Vec::new();
    for name in self.cache.cache_names().await? {
      let keys = self.cache.keys(&name).await?;
      stats.push(CacheStats {
        entries: keys.len(),
        bytes: keys.iter().map(|k| k.bytes).sum(),
        name,
      });
    }
    Ok(stats)
  }

  /// Origin-wide usage against the cache quota.
  pub async fn estimate(&self) -> Result<StorageEstimate, CacheStoreError> {
    self.usage(Usage::Origin).await
  }

  async fn usage(&self, usage: Usage) -> Result<StorageEstimate, CacheStoreError> {
    let mut estimate = self.cache.estimate().await?;
    if let (Usage::Origin, Some(store)) = (usage, &self.durable) {
      estimate.usage = estimate.usage.saturating_add(store.estimate().await.usage);
    }
    Ok(estimate)
  }
}
