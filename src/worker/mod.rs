//! Network interception layer.
//!
//! Answers GET requests from three version-qualified cache partitions:
//! static assets cache-first, API and page content network-first. Owns the
//! install/activate lifecycle that primes the shell and garbage-collects
//! partitions left behind by older versions.

mod classify;
mod lifecycle;
mod messages;

pub use classify::{Route, RoutingRules};
pub use lifecycle::WorkerState;
pub use messages::{VersionReply, WorkerMessage};

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheResult, CacheStorage, CacheVersion, Fallback, Partition};
use crate::config::Config;
use crate::http::{Request, Response, Transport};
use lifecycle::Lifecycle;

/// Settings the interception layer needs from the configuration.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
  pub version: CacheVersion,
  pub rules: RoutingRules,
  /// Shell assets primed at install time
  pub shell: Vec<Url>,
  /// Placeholder served when a page can't be reached
  pub offline_page: Option<Url>,
}

impl WorkerOptions {
  pub fn from_config(config: &Config) -> Result<Self> {
    let origin = config.origin_url()?;
    let join = |path: &str| -> Result<Url> {
      origin
        .join(path)
        .map_err(|e| eyre!("Invalid asset path '{}': {}", path, e))
    };

    let shell = config
      .cache
      .shell
      .iter()
      .map(|path| join(path.as_str()))
      .collect::<Result<Vec<_>>>()?;
    let offline_page = config.cache.offline_page.as_deref().map(join).transpose()?;

    Ok(Self {
      version: CacheVersion::new(&config.cache.prefix, &config.cache.version),
      rules: RoutingRules::new(origin.clone(), &config.api_prefix, &config.cache.static_extensions),
      shell,
      offline_page,
    })
  }
}

/// The interception layer: a lifecycle plus a cache layer in front of a transport.
pub struct ServiceWorker<T: Transport, S: CacheStorage> {
  transport: T,
  layer: CacheLayer<S>,
  options: WorkerOptions,
  lifecycle: Mutex<Lifecycle>,
}

impl<T: Transport, S: CacheStorage> ServiceWorker<T, S> {
  pub fn new(transport: T, storage: Arc<S>, options: WorkerOptions) -> Self {
    let layer =
      CacheLayer::new(storage).with_offline_page(options.offline_page.as_ref().map(Url::to_string));

    Self {
      transport,
      layer,
      options,
      lifecycle: Mutex::new(Lifecycle::new()),
    }
  }

  pub fn version(&self) -> &CacheVersion {
    &self.options.version
  }

  pub fn storage(&self) -> &S {
    self.layer.storage()
  }

  pub fn state(&self) -> WorkerState {
    self
      .lifecycle
      .lock()
      .map(|l| l.state)
      .unwrap_or(WorkerState::Redundant)
  }

  /// Whether open clients have been claimed and requests are intercepted.
  pub fn is_controlling(&self) -> bool {
    self.lifecycle.lock().map(|l| l.controlling).unwrap_or(false)
  }

  fn with_lifecycle<R>(&self, f: impl FnOnce(&mut Lifecycle) -> Result<R>) -> Result<R> {
    let mut lifecycle = self
      .lifecycle
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    f(&mut lifecycle)
  }

  /// Install and, since install requests it, activate right away.
  pub async fn start(&self) -> Result<()> {
    self.install().await?;

    let skip = self.with_lifecycle(|l| Ok(l.skip_waiting))?;
    if skip {
      self.activate()?;
    }
    Ok(())
  }

  /// Come back after a process restart.
  ///
  /// If the current version's static partition exists the worker was already
  /// installed and becomes active without re-priming the shell.
  pub async fn resume(&self) -> Result<()> {
    let static_cache = self.options.version.cache_name(Partition::Static);
    let installed = self
      .storage()
      .cache_names()?
      .iter()
      .any(|name| *name == static_cache);

    if !installed {
      return self.start().await;
    }

    self.with_lifecycle(|l| l.transition(WorkerState::Active))?;
    info!(version = %self.options.version, "resumed installed worker");
    self.purge_stale_caches()?;
    self.claim()
  }

  /// Prime the static partition with the shell manifest.
  ///
  /// All-or-nothing: every asset is fetched before any is stored, and one
  /// failed asset fails the install.
  pub async fn install(&self) -> Result<()> {
    self.with_lifecycle(|l| l.transition(WorkerState::Installing))?;
    info!(
      version = %self.options.version,
      assets = self.options.shell.len(),
      "installing"
    );

    match self.prime_shell().await {
      Ok(()) => {
        self.with_lifecycle(|l| l.transition(WorkerState::Waiting))?;
        self.skip_waiting()?;
        Ok(())
      }
      Err(e) => {
        error!(error = %e, "install failed");
        self.with_lifecycle(|l| l.transition(WorkerState::Redundant))?;
        Err(e)
      }
    }
  }

  async fn prime_shell(&self) -> Result<()> {
    let fetches = self
      .options
      .shell
      .iter()
      .map(|url| self.transport.send(Request::get(url.clone())));
    let results = futures::future::join_all(fetches).await;

    let mut primed = Vec::with_capacity(results.len());
    for (url, result) in self.options.shell.iter().zip(results) {
      let response = result.map_err(|e| eyre!("Failed to fetch shell asset {}: {}", url, e))?;
      if !response.is_success() {
        return Err(eyre!(
          "Shell asset {} answered with status {}",
          url,
          response.status
        ));
      }
      primed.push((url, response));
    }

    let static_cache = self.options.version.cache_name(Partition::Static);
    self.storage().open(&static_cache)?;
    for (url, response) in primed {
      self.storage().put(&static_cache, url.as_str(), &response)?;
    }

    Ok(())
  }

  /// Ask to activate as soon as installed.
  pub fn skip_waiting(&self) -> Result<()> {
    self.with_lifecycle(|l| {
      l.skip_waiting = true;
      Ok(())
    })
  }

  /// Drop stale partitions, then take control of open clients.
  pub fn activate(&self) -> Result<()> {
    self.with_lifecycle(|l| l.transition(WorkerState::Active))?;
    info!(version = %self.options.version, "activating");

    self.purge_stale_caches()?;
    self.claim()
  }

  /// Delete every partition of this product that doesn't carry the current version.
  ///
  /// Returns the names that were removed. Running it again is a no-op.
  pub fn purge_stale_caches(&self) -> Result<Vec<String>> {
    let stale: Vec<String> = self
      .storage()
      .cache_names()?
      .into_iter()
      .filter(|name| self.options.version.is_stale(name))
      .collect();

    for name in &stale {
      info!(cache = %name, "deleting stale cache");
      self.storage().delete_cache(name)?;
    }

    Ok(stale)
  }

  fn claim(&self) -> Result<()> {
    self.with_lifecycle(|l| {
      l.controlling = true;
      Ok(())
    })
  }

  /// Answer a request.
  ///
  /// Pass-through requests may fail with the transport's error. Intercepted
  /// requests always produce a response.
  pub async fn fetch(&self, request: Request) -> Result<CacheResult<Response>> {
    let route = if self.is_controlling() {
      self.options.rules.classify(&request)
    } else {
      Route::Passthrough
    };
    debug!(method = %request.method, url = %request.url, ?route, "fetch");

    let key = request.url.to_string();
    let version = &self.options.version;
    let fetcher = || self.transport.send(request);

    let served = match route {
      Route::Passthrough => {
        return fetcher().await.map(CacheResult::from_network);
      }
      Route::Api => {
        let cache = version.cache_name(Partition::Api);
        self
          .layer
          .network_first(&cache, &key, Fallback::ApiError, fetcher)
          .await
      }
      Route::Static => {
        let cache = version.cache_name(Partition::Static);
        self.layer.cache_first(&cache, &key, fetcher).await
      }
      Route::Dynamic => {
        let cache = version.cache_name(Partition::Dynamic);
        self
          .layer
          .network_first(&cache, &key, Fallback::OfflinePage, fetcher)
          .await
      }
    };

    Ok(served)
  }

  /// Handle a control message from a page.
  pub async fn post_message(
    &self,
    message: WorkerMessage,
    reply: Option<oneshot::Sender<VersionReply>>,
  ) -> Result<()> {
    match message {
      WorkerMessage::SkipWaiting => {
        self.skip_waiting()?;
        if self.state() == WorkerState::Waiting {
          self.activate()?;
        }
      }
      WorkerMessage::GetVersion => {
        let version = VersionReply {
          version: self.options.version.to_string(),
        };
        match reply {
          Some(tx) => {
            if tx.send(version).is_err() {
              warn!("GET_VERSION asker went away before the reply");
            }
          }
          None => debug!("GET_VERSION without a reply channel"),
        }
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryStorage};
  use crate::http::Method;
  use crate::testing::ScriptedTransport;

  fn options(version: &str) -> WorkerOptions {
    let origin = Url::parse("http://app.test").unwrap();
    let extensions: Vec<String> = ["js", "css", "png", "ico"].iter().map(|s| s.to_string()).collect();
    WorkerOptions {
      version: CacheVersion::new("lifeline", version),
      rules: RoutingRules::new(origin.clone(), "/api", &extensions),
      shell: vec![
        origin.join("/").unwrap(),
        origin.join("/manifest.json").unwrap(),
        origin.join("/offline.html").unwrap(),
      ],
      offline_page: Some(origin.join("/offline.html").unwrap()),
    }
  }

  fn url(path: &str) -> Url {
    Url::parse("http://app.test").unwrap().join(path).unwrap()
  }

  async fn started(
    version: &str,
  ) -> (
    Arc<ScriptedTransport>,
    ServiceWorker<Arc<ScriptedTransport>, MemoryStorage>,
  ) {
    let transport = ScriptedTransport::new();
    transport.route("/offline.html", Response::text(200, "<p>You are offline</p>"));
    let worker = ServiceWorker::new(
      transport.clone(),
      Arc::new(MemoryStorage::new()),
      options(version),
    );
    worker.start().await.unwrap();
    transport.clear_requests();
    (transport, worker)
  }

  #[tokio::test]
  async fn test_start_primes_shell_and_activates() {
    let (_transport, worker) = started("v1").await;

    assert_eq!(worker.state(), WorkerState::Active);
    assert!(worker.is_controlling());
    let keys = worker.storage().keys("lifeline-static-v1").unwrap();
    assert_eq!(keys.len(), 3);
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let transport = ScriptedTransport::new();
    transport.route("/manifest.json", Response::text(404, "missing"));
    let worker = ServiceWorker::new(
      transport.clone(),
      Arc::new(MemoryStorage::new()),
      options("v1"),
    );

    assert!(worker.start().await.is_err());
    assert_eq!(worker.state(), WorkerState::Redundant);
    assert!(worker.storage().keys("lifeline-static-v1").unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_static_hit_does_not_touch_network() {
    let (transport, worker) = started("v1").await;
    transport.route("/app.js", Response::text(200, "console.log(1)"));

    let first = worker.fetch(Request::get(url("/app.js"))).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);

    for _ in 0..3 {
      let again = worker.fetch(Request::get(url("/app.js"))).await.unwrap();
      assert_eq!(again.source, CacheSource::Cache);
      assert_eq!(again.data.body_text(), "console.log(1)");
    }
    assert_eq!(transport.count("/app.js"), 1);
  }

  #[tokio::test]
  async fn test_api_response_served_from_cache_when_offline() {
    let (transport, worker) = started("v1").await;
    transport.route("/api/tasks", Response::text(200, r#"[{"id":1}]"#));

    let online = worker.fetch(Request::get(url("/api/tasks"))).await.unwrap();
    assert_eq!(online.source, CacheSource::Network);

    transport.set_online(false);
    let offline = worker.fetch(Request::get(url("/api/tasks"))).await.unwrap();
    assert_eq!(offline.source, CacheSource::Cache);
    assert_eq!(offline.data.body_text(), r#"[{"id":1}]"#);
  }

  #[tokio::test]
  async fn test_uncached_api_offline_is_json_503() {
    let (transport, worker) = started("v1").await;
    transport.set_online(false);

    let served = worker.fetch(Request::get(url("/api/invoices"))).await.unwrap();
    assert_eq!(served.source, CacheSource::Fallback);
    assert_eq!(served.data.status, 503);

    let body: serde_json::Value = serde_json::from_slice(&served.data.body).unwrap();
    assert!(body["error"].is_string());
  }

  #[tokio::test]
  async fn test_uncached_page_offline_gets_placeholder() {
    let (transport, worker) = started("v1").await;
    transport.set_online(false);

    let served = worker.fetch(Request::get(url("/hr/staff"))).await.unwrap();
    assert_eq!(served.source, CacheSource::Fallback);
    assert_eq!(served.data.body_text(), "<p>You are offline</p>");
  }

  #[tokio::test]
  async fn test_writes_pass_through_uncached() {
    let (transport, worker) = started("v1").await;

    let request = Request::new(Method::Post, url("/api/tasks")).with_body(b"{}".to_vec());
    worker.fetch(request).await.unwrap();
    assert!(worker.storage().keys("lifeline-api-v1").unwrap().is_empty());

    transport.set_online(false);
    let request = Request::new(Method::Post, url("/api/tasks"));
    assert!(worker.fetch(request).await.is_err());
  }

  #[tokio::test]
  async fn test_activation_purges_only_older_versions() {
    let transport = ScriptedTransport::new();
    let storage = Arc::new(MemoryStorage::new());
    storage
      .put("lifeline-api-v0", "http://app.test/api/old", &Response::text(200, "old"))
      .unwrap();
    storage.open("unrelated-cache").unwrap();

    let first = ServiceWorker::new(transport.clone(), storage.clone(), options("v1"));
    first.start().await.unwrap();
    first
      .fetch(Request::get(url("/api/tasks")))
      .await
      .unwrap();

    // Same version activating again keeps its partitions
    let second = ServiceWorker::new(transport.clone(), storage.clone(), options("v1"));
    second.start().await.unwrap();
    assert!(second.purge_stale_caches().unwrap().is_empty());

    let names = storage.cache_names().unwrap();
    assert!(names.contains(&"lifeline-static-v1".to_string()));
    assert!(names.contains(&"lifeline-api-v1".to_string()));
    assert!(names.contains(&"unrelated-cache".to_string()));
    assert!(!names.contains(&"lifeline-api-v0".to_string()));
    assert_eq!(storage.keys("lifeline-api-v1").unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_resume_skips_priming() {
    let transport = ScriptedTransport::new();
    let storage = Arc::new(MemoryStorage::new());
    ServiceWorker::new(transport.clone(), storage.clone(), options("v1"))
      .start()
      .await
      .unwrap();
    transport.clear_requests();

    let worker = ServiceWorker::new(transport.clone(), storage, options("v1"));
    worker.resume().await.unwrap();
    assert_eq!(worker.state(), WorkerState::Active);
    assert!(transport.requests().is_empty());
  }

  #[tokio::test]
  async fn test_not_intercepting_before_activation() {
    let transport = ScriptedTransport::new();
    let worker = ServiceWorker::new(transport.clone(), Arc::new(MemoryStorage::new()), options("v1"));
    transport.set_online(false);

    assert!(worker.fetch(Request::get(url("/api/tasks"))).await.is_err());
  }

  #[tokio::test]
  async fn test_get_version_message() {
    let (_transport, worker) = started("v7").await;
    let (tx, rx) = oneshot::channel();

    worker
      .post_message(WorkerMessage::GetVersion, Some(tx))
      .await
      .unwrap();
    assert_eq!(rx.await.unwrap().version, "lifeline-v7");
  }

  #[tokio::test]
  async fn test_skip_waiting_message_activates_waiting_worker() {
    let transport = ScriptedTransport::new();
    let worker = ServiceWorker::new(transport, Arc::new(MemoryStorage::new()), options("v1"));
    worker.install().await.unwrap();
    assert_eq!(worker.state(), WorkerState::Waiting);

    worker
      .post_message(WorkerMessage::SkipWaiting, None)
      .await
      .unwrap();
    assert_eq!(worker.state(), WorkerState::Active);
    assert!(worker.is_controlling());
  }
}
