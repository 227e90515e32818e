//! Named cache partitions and the strategies that serve requests from them.
//!
//! This module provides:
//! - Version-qualified partition names with stale-name detection
//! - Storage backends (SQLite for durability, in-memory for tests)
//! - Cache-first and network-first strategies with offline fallbacks

mod layer;
mod storage;
mod traits;
mod version;

pub use layer::{CacheLayer, Fallback};
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, CachedEntry};
pub use version::{CacheVersion, Partition};
