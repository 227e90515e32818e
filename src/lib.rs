//! Offline resilience for web applications.
//!
//! Two cooperating components:
//! - [`worker::ServiceWorker`] intercepts GET requests and answers them from
//!   version-qualified cache partitions when the network is unavailable.
//! - [`offline::OfflineManager`] tracks connectivity and keeps a durable,
//!   ordered queue of writes that couldn't be delivered, replaying them once
//!   the backend is reachable again.

pub mod cache;
pub mod config;
pub mod db;
pub mod http;
pub mod offline;
#[cfg(test)]
mod testing;
pub mod worker;
