//! Version-qualified names for the three cache partitions.

use std::fmt;

/// Logical cache partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
  Static,
  Dynamic,
  Api,
}

impl Partition {
  pub const ALL: [Partition; 3] = [Partition::Static, Partition::Dynamic, Partition::Api];

  fn label(&self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Dynamic => "dynamic",
      Self::Api => "api",
    }
  }
}

/// Cache version identifier, e.g. prefix `lifeline` + version `v1`.
///
/// Every partition name in use carries the same version suffix; anything else
/// under the product prefix belongs to an older deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheVersion {
  prefix: String,
  version: String,
}

impl CacheVersion {
  pub fn new(prefix: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      prefix: prefix.into(),
      version: version.into(),
    }
  }

  /// Full partition name, e.g. `lifeline-static-v1`
  pub fn cache_name(&self, partition: Partition) -> String {
    format!("{}-{}-{}", self.prefix, partition.label(), self.version)
  }

  /// All partition names for this version
  pub fn current_names(&self) -> Vec<String> {
    Partition::ALL.iter().map(|p| self.cache_name(*p)).collect()
  }

  /// Whether a cache name belongs to this product but not to this version.
  pub fn is_stale(&self, name: &str) -> bool {
    let owned = name.starts_with(&format!("{}-", self.prefix));
    owned && !self.current_names().iter().any(|current| current == name)
  }
}

impl fmt::Display for CacheVersion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}-{}", self.prefix, self.version)
  }
}
