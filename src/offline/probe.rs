//! Reachability signals: passive link events and an active health probe.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::http::{Method, Request, Transport};

/// Passive link-layer signal (the platform's online/offline events).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
  Up,
  Down,
}

/// Active reachability check against the backend.
pub trait ConnectivityProbe: Send + Sync + 'static {
  /// Whether the backend answered. Must finish in bounded time.
  fn check(&self) -> impl Future<Output = bool> + Send;
}

/// `HEAD` against a health endpoint with caching disabled.
pub struct HealthProbe<T: Transport> {
  transport: Arc<T>,
  url: Url,
  timeout: Duration,
}

impl<T: Transport> HealthProbe<T> {
  pub fn new(transport: Arc<T>, url: Url, timeout: Duration) -> Self {
    Self {
      transport,
      url,
      timeout,
    }
  }
}

impl<T: Transport> ConnectivityProbe for HealthProbe<T> {
  async fn check(&self) -> bool {
    let request = Request::new(Method::Head, self.url.clone())
      .with_header("Cache-Control", "no-cache")
      .with_header("Pragma", "no-cache");

    match tokio::time::timeout(self.timeout, self.transport.send(request)).await {
      Ok(Ok(response)) => response.is_success(),
      Ok(Err(e)) => {
        debug!(error = %e, "health probe failed");
        false
      }
      Err(_) => {
        debug!(timeout = ?self.timeout, "health probe timed out");
        false
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Response;
  use crate::testing::ScriptedTransport;

  fn probe(transport: Arc<ScriptedTransport>) -> HealthProbe<ScriptedTransport> {
    HealthProbe::new(
      transport,
      Url::parse("http://app.test/api/health").unwrap(),
      Duration::from_millis(50),
    )
  }

  #[tokio::test]
  async fn test_probe_uses_head_on_health_endpoint() {
    let transport = ScriptedTransport::new();
    assert!(probe(transport.clone()).check().await);
    assert_eq!(
      transport.requests(),
      vec![(Method::Head, "/api/health".to_string())]
    );
  }

  #[tokio::test]
  async fn test_probe_fails_on_error_status_and_transport_failure() {
    let transport = ScriptedTransport::new();
    transport.respond_once("/api/health", Response::text(502, "bad gateway"));
    assert!(!probe(transport.clone()).check().await);

    transport.set_online(false);
    assert!(!probe(transport).check().await);
  }

  #[tokio::test]
  async fn test_hung_probe_times_out() {
    let transport = ScriptedTransport::new();
    let _gate = transport.hold();
    assert!(!probe(transport).check().await);
  }
}
