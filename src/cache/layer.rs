//! Cache layer that orchestrates caching strategies with network fetching.

use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::traits::CacheResult;
use crate::http::Response;

/// What to answer when the network failed and the request has no cached copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
  /// Cached offline page, else a plain "Offline" 503
  OfflinePage,
  /// JSON 503 with an `error` field, so API callers can tell it from a real 5xx
  ApiError,
}

/// Cache layer that manages caching strategies and network fetching.
///
/// Cache writes are best-effort: a storage failure is logged and the
/// response is still returned to the caller.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  /// Key of the offline placeholder page, if one is configured
  offline_page: Option<String>,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: Arc<S>) -> Self {
    Self {
      storage,
      offline_page: None,
    }
  }

  /// Set the cache key of the offline placeholder page.
  pub fn with_offline_page(mut self, key: Option<String>) -> Self {
    self.offline_page = key;
    self
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Serve from cache when present; fetch from the network only on a miss.
  ///
  /// 1. Cache hit - return immediately, the network is not touched
  /// 2. Miss - fetch, store a copy if the response is successful
  /// 3. Network failure - offline page or synthetic "Offline"
  pub async fn cache_first<F, Fut>(
    &self,
    cache: &str,
    key: &str,
    fetcher: F,
  ) -> CacheResult<Response>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    match self.storage.match_entry(cache, key) {
      Ok(Some(cached)) => return CacheResult::from_cache(cached.response, cached.cached_at),
      Ok(None) => {}
      Err(e) => warn!(cache, key, error = %e, "cache lookup failed"),
    }

    match fetcher().await {
      Ok(response) => {
        if response.is_success() {
          self.store(cache, key, &response);
        }
        CacheResult::from_network(response)
      }
      Err(e) => {
        debug!(key, error = %e, "network unavailable for cache-first request");
        self.fallback(Fallback::OfflinePage)
      }
    }
  }

  /// Always try the network; fall back to the cache only on transport failure.
  ///
  /// An HTTP error status is a real answer and is passed through untouched.
  pub async fn network_first<F, Fut>(
    &self,
    cache: &str,
    key: &str,
    fallback: Fallback,
    fetcher: F,
  ) -> CacheResult<Response>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    match fetcher().await {
      Ok(response) => {
        if response.is_success() {
          self.store(cache, key, &response);
        }
        CacheResult::from_network(response)
      }
      Err(e) => {
        debug!(key, error = %e, "network unavailable, trying cache");
        match self.storage.match_entry(cache, key) {
          Ok(Some(cached)) => CacheResult::from_cache(cached.response, cached.cached_at),
          Ok(None) => self.fallback(fallback),
          Err(e) => {
            warn!(cache, key, error = %e, "cache lookup failed");
            self.fallback(fallback)
          }
        }
      }
    }
  }

  fn store(&self, cache: &str, key: &str, response: &Response) {
    if let Err(e) = self.storage.put(cache, key, response) {
      warn!(cache, key, error = %e, "failed to write cache entry");
    }
  }

  fn fallback(&self, fallback: Fallback) -> CacheResult<Response> {
    if fallback == Fallback::ApiError {
      return CacheResult::fallback(Response::offline_api(), None);
    }

    let page = self
      .offline_page
      .as_deref()
      .and_then(|key| match self.storage.match_any(key) {
        Ok(entry) => entry,
        Err(e) => {
          warn!(key, error = %e, "offline page lookup failed");
          None
        }
      });

    match page {
      Some(entry) => CacheResult::fallback(entry.response, Some(entry.cached_at)),
      None => CacheResult::fallback(Response::offline_text(), None),
    }
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      offline_page: self.offline_page.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::MemoryStorage;
  use crate::cache::traits::{CacheSource, CachedEntry};
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicU32, Ordering};

  const CACHE: &str = "lifeline-api-v1";
  const KEY: &str = "http://app.test/api/tasks";

  /// Storage whose writes always fail (quota exceeded).
  struct FullStorage;

  impl CacheStorage for FullStorage {
    fn open(&self, _cache: &str) -> Result<()> {
      Ok(())
    }
    fn match_entry(&self, _cache: &str, _key: &str) -> Result<Option<CachedEntry>> {
      Ok(None)
    }
    fn match_any(&self, _key: &str) -> Result<Option<CachedEntry>> {
      Ok(None)
    }
    fn put(&self, _cache: &str, _key: &str, _response: &Response) -> Result<()> {
      Err(eyre!("quota exceeded"))
    }
    fn keys(&self, _cache: &str) -> Result<Vec<String>> {
      Ok(Vec::new())
    }
    fn cache_names(&self) -> Result<Vec<String>> {
      Ok(Vec::new())
    }
    fn delete_cache(&self, _cache: &str) -> Result<bool> {
      Ok(false)
    }
  }

  fn layer() -> CacheLayer<MemoryStorage> {
    CacheLayer::new(Arc::new(MemoryStorage::new()))
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let layer = layer();
    layer
      .storage()
      .put(CACHE, KEY, &Response::text(200, "cached"))
      .unwrap();

    let calls = AtomicU32::new(0);
    let counter = &calls;
    let result = layer
      .cache_first(CACHE, KEY, || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Response::text(200, "fresh"))
      })
      .await;

    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.body_text(), "cached");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_cache_first_does_not_store_errors() {
    let layer = layer();
    let result = layer
      .cache_first(CACHE, KEY, || async { Ok(Response::text(404, "missing")) })
      .await;

    assert_eq!(result.data.status, 404);
    assert!(layer.storage().match_entry(CACHE, KEY).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_network_first_keeps_http_errors() {
    let layer = layer();
    layer
      .storage()
      .put(CACHE, KEY, &Response::text(200, "cached"))
      .unwrap();

    // A 500 is an answer, not a transport failure: no cache fallback
    let result = layer
      .network_first(CACHE, KEY, Fallback::ApiError, || async {
        Ok(Response::text(500, "boom"))
      })
      .await;

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.status, 500);
  }

  #[tokio::test]
  async fn test_offline_page_fallback() {
    let layer = layer().with_offline_page(Some("http://app.test/offline.html".to_string()));
    layer
      .storage()
      .put(
        "lifeline-static-v1",
        "http://app.test/offline.html",
        &Response::text(200, "<h1>offline</h1>"),
      )
      .unwrap();

    let result = layer
      .network_first(
        "lifeline-dynamic-v1",
        "http://app.test/reports",
        Fallback::OfflinePage,
        || async { Err(eyre!("connection refused")) },
      )
      .await;

    assert_eq!(result.source, CacheSource::Fallback);
    assert_eq!(result.data.body_text(), "<h1>offline</h1>");
  }

  #[tokio::test]
  async fn test_plain_offline_without_page() {
    let result = layer()
      .cache_first("lifeline-static-v1", "http://app.test/app.js", || async {
        Err(eyre!("dns failure"))
      })
      .await;

    assert_eq!(result.source, CacheSource::Fallback);
    assert_eq!(result.data.status, 503);
    assert_eq!(result.data.body_text(), "Offline");
  }

  #[tokio::test]
  async fn test_write_failure_does_not_break_response() {
    let layer = CacheLayer::new(Arc::new(FullStorage));
    let result = layer
      .network_first(CACHE, KEY, Fallback::ApiError, || async {
        Ok(Response::text(200, "fresh"))
      })
      .await;

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body_text(), "fresh");
  }
}
