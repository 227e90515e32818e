//! Connection status and its observers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

/// Perceived connectivity. `Syncing` only exists while the queue drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
  Online,
  Offline,
  Syncing,
}

impl ConnectionStatus {
  /// Derive the published status from reachability and drain activity.
  pub fn derive(reachable: bool, draining: bool) -> Self {
    match (reachable, draining) {
      (false, _) => Self::Offline,
      (true, true) => Self::Syncing,
      (true, false) => Self::Online,
    }
  }
}

impl fmt::Display for ConnectionStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Online => f.write_str("online"),
      Self::Offline => f.write_str("offline"),
      Self::Syncing => f.write_str("syncing"),
    }
  }
}

type Listener = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

#[derive(Default)]
struct Registry {
  next_id: u64,
  listeners: Vec<(u64, Listener)>,
}

/// Set of status listeners.
#[derive(Clone, Default)]
pub struct Listeners {
  registry: Arc<Mutex<Registry>>,
}

impl Listeners {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a listener and hand it the current status right away.
  pub fn subscribe<F>(&self, current: ConnectionStatus, listener: F) -> Subscription
  where
    F: Fn(ConnectionStatus) + Send + Sync + 'static,
  {
    let listener: Listener = Arc::new(listener);
    let id = match self.registry.lock() {
      Ok(mut registry) => {
        registry.next_id += 1;
        let id = registry.next_id;
        registry.listeners.push((id, listener.clone()));
        id
      }
      Err(_) => 0,
    };

    listener(current);

    Subscription {
      id,
      registry: Arc::downgrade(&self.registry),
    }
  }

  /// Call every listener with the new status.
  ///
  /// Listeners are called outside the lock, so they may subscribe or
  /// unsubscribe from inside the callback.
  pub fn emit(&self, status: ConnectionStatus) {
    let snapshot: Vec<Listener> = match self.registry.lock() {
      Ok(registry) => registry.listeners.iter().map(|(_, l)| l.clone()).collect(),
      Err(_) => return,
    };

    for listener in snapshot {
      listener(status);
    }
  }

  pub fn clear(&self) {
    if let Ok(mut registry) = self.registry.lock() {
      registry.listeners.clear();
    }
  }

  pub fn len(&self) -> usize {
    self
      .registry
      .lock()
      .map(|r| r.listeners.len())
      .unwrap_or(0)
  }
}

/// Handle returned by `subscribe`.
#[must_use = "dropping a Subscription keeps the listener registered; call unsubscribe() to remove it"]
pub struct Subscription {
  id: u64,
  registry: Weak<Mutex<Registry>>,
}

impl Subscription {
  pub fn unsubscribe(self) {
    if let Some(registry) = self.registry.upgrade() {
      if let Ok(mut registry) = registry.lock() {
        registry.listeners.retain(|(id, _)| *id != self.id);
      }
    }
  }
}
