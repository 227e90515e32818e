//! Request classification for the interception layer.

use url::Url;

use crate::http::{Method, Request};

/// How an intercepted request is answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Not intercepted, goes straight to the network
  Passthrough,
  /// Network-first against the API partition
  Api,
  /// Cache-first against the static partition
  Static,
  /// Network-first against the dynamic partition
  Dynamic,
}

/// URL rules deciding which strategy serves a request.
#[derive(Debug, Clone)]
pub struct RoutingRules {
  origin: Url,
  api_prefix: String,
  static_extensions: Vec<String>,
}

impl RoutingRules {
  pub fn new(origin: Url, api_prefix: impl Into<String>, static_extensions: &[String]) -> Self {
    Self {
      origin,
      api_prefix: api_prefix.into(),
      static_extensions: static_extensions
        .iter()
        .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
        .collect(),
    }
  }

  /// Whether the path lies under the API prefix, on a segment boundary.
  pub fn is_api_path(&self, path: &str) -> bool {
    match path.strip_prefix(self.api_prefix.trim_end_matches('/')) {
      Some(rest) => rest.is_empty() || rest.starts_with('/'),
      None => false,
    }
  }

  /// Classify a request. Rules are evaluated in priority order.
  pub fn classify(&self, request: &Request) -> Route {
    if request.method != Method::Get {
      return Route::Passthrough;
    }

    let path = request.url.path();
    let is_api = self.is_api_path(path);
    let same_origin = request.url.origin() == self.origin.origin();

    if !same_origin && !is_api {
      return Route::Passthrough;
    }

    if is_api {
      return Route::Api;
    }

    if self.has_static_extension(path) {
      return Route::Static;
    }

    Route::Dynamic
  }

  fn has_static_extension(&self, path: &str) -> bool {
    let file = path.rsplit('/').next().unwrap_or_default();
    match file.rsplit_once('.') {
      Some((_, ext)) => {
        let ext = ext.to_ascii_lowercase();
        self.static_extensions.iter().any(|known| *known == ext)
      }
      None => false,
    }
  }
}
