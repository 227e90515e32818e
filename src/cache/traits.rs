//! Core types for the caching system.

use chrono::{DateTime, Utc};

use crate::http::Response;

/// A response stored in a cache partition.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  /// The stored response
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for a synthesized offline answer.
  pub fn fallback(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
      cached_at,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Live answer from the network
  Network,
  /// Stored copy of this exact request
  Cache,
  /// Network unreachable and nothing cached: offline page or synthetic 503
  Fallback,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Network => f.write_str("network"),
      Self::Cache => f.write_str("cache"),
      Self::Fallback => f.write_str("fallback"),
    }
  }
}
