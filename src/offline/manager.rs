//! Connectivity tracking and the durable replay queue.

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use url::Url;

use super::notify::{Notice, NotificationSink};
use super::operation::PendingOperation;
use super::probe::{ConnectivityProbe, LinkEvent};
use super::status::{ConnectionStatus, Listeners, Subscription};
use super::store::QueueStore;
use crate::config::Config;
use crate::http::{Request, Transport, WriteMethod};

/// Tunables for the manager.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
  /// Origin that queued endpoints are resolved against
  pub base_url: Url,
  /// Interval between active health probes
  pub poll_interval: Duration,
  /// Upper bound for a single replay attempt
  pub replay_timeout: Duration,
}

impl ManagerOptions {
  pub fn from_config(config: &Config) -> Result<Self> {
    Ok(Self {
      base_url: config.origin_url()?,
      poll_interval: Duration::from_secs(config.sync.poll_interval_secs.max(1)),
      replay_timeout: Duration::from_secs(config.sync.replay_timeout_secs),
    })
  }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Acknowledged by the server and removed
  pub delivered: usize,
  /// Failed but kept for a later pass
  pub failed: usize,
  /// Failed for the last time and discarded
  pub dropped: usize,
  /// Left in the queue after the pass
  pub pending: usize,
}

enum ReplayError {
  Transport(color_eyre::Report),
  Timeout,
  Status(u16),
  Invalid(String),
}

impl ReplayError {
  fn is_transport(&self) -> bool {
    matches!(self, Self::Transport(_) | Self::Timeout)
  }
}

impl std::fmt::Display for ReplayError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Transport(e) => write!(f, "transport failure: {}", e),
      Self::Timeout => f.write_str("timed out"),
      Self::Status(status) => write!(f, "server answered {}", status),
      Self::Invalid(msg) => f.write_str(msg),
    }
  }
}

struct State {
  queue: Vec<PendingOperation>,
  /// Backend believed reachable
  reachable: bool,
  /// A drain pass owns the queue snapshot
  draining: bool,
  /// Last status handed to listeners
  published: ConnectionStatus,
}

impl State {
  /// Claim the drain guard if there is work and nobody else holds it.
  fn claim_drain(&mut self) -> bool {
    if self.draining || !self.reachable || self.queue.is_empty() {
      return false;
    }
    self.draining = true;
    true
  }
}

struct Inner<T, P> {
  transport: T,
  probe: P,
  store: Arc<dyn QueueStore>,
  sink: Arc<dyn NotificationSink>,
  options: ManagerOptions,
  state: Mutex<State>,
  /// Held from a state change until its status is delivered
  publish: Mutex<()>,
  /// Mirrors `State::reachable` for tasks that wait on it
  link: watch::Sender<bool>,
  listeners: Listeners,
  monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Single source of truth for connectivity and the pending write queue.
///
/// Cheap to clone; clones share the same state. Construct one per page or
/// process, call [`start`](Self::start) to begin monitoring and
/// [`dispose`](Self::dispose) to stop.
pub struct OfflineManager<T: Transport, P: ConnectivityProbe> {
  inner: Arc<Inner<T, P>>,
}

impl<T: Transport, P: ConnectivityProbe> Clone for OfflineManager<T, P> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T: Transport, P: ConnectivityProbe> OfflineManager<T, P> {
  /// Create a manager, restoring whatever queue the store holds.
  ///
  /// Starts out offline until a probe or link event says otherwise.
  pub fn new(
    transport: T,
    probe: P,
    store: Arc<dyn QueueStore>,
    sink: Arc<dyn NotificationSink>,
    options: ManagerOptions,
  ) -> Self {
    let queue = store.load().unwrap_or_else(|e| {
      error!(error = %e, "failed to load offline queue, starting empty");
      Vec::new()
    });
    if !queue.is_empty() {
      info!(operations = queue.len(), "restored offline queue");
    }

    let (link, _) = watch::channel(false);

    Self {
      inner: Arc::new(Inner {
        transport,
        probe,
        store,
        sink,
        options,
        state: Mutex::new(State {
          queue,
          reachable: false,
          draining: false,
          published: ConnectionStatus::Offline,
        }),
        publish: Mutex::new(()),
        link,
        listeners: Listeners::new(),
        monitor: Mutex::new(None),
      }),
    }
  }

  fn state(&self) -> MutexGuard<'_, State> {
    self
      .inner
      .state
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn publishing(&self) -> MutexGuard<'_, ()> {
    self
      .inner
      .publish
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Mutate state, then publish the derived status if it changed.
  ///
  /// Publication is serialized, so listeners see transitions in the order
  /// they were applied. Listeners must not trigger transitions themselves.
  fn update<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
    let _publishing = self.publishing();
    let (result, changed) = {
      let mut state = self.state();
      let result = f(&mut state);
      let reachable = state.reachable;
      self.inner.link.send_if_modified(|link| {
        let modified = *link != reachable;
        *link = reachable;
        modified
      });

      let status = ConnectionStatus::derive(state.reachable, state.draining);
      let changed = status != state.published;
      state.published = status;
      (result, changed.then_some(status))
    };

    if let Some(status) = changed {
      info!(%status, "connection status changed");
      self.inner.listeners.emit(status);
    }
    result
  }

  fn persist(&self, queue: &[PendingOperation]) {
    if let Err(e) = self.inner.store.save(queue) {
      error!(error = %e, "failed to persist offline queue");
    }
  }

  pub fn status(&self) -> ConnectionStatus {
    self.state().published
  }

  pub fn is_online(&self) -> bool {
    self.state().reachable
  }

  /// Snapshot of queued operations in replay order.
  pub fn pending(&self) -> Vec<PendingOperation> {
    self.state().queue.clone()
  }

  pub fn pending_count(&self) -> usize {
    self.state().queue.len()
  }

  /// Observe status changes. The listener is called once immediately.
  pub fn subscribe<F>(&self, listener: F) -> Subscription
  where
    F: Fn(ConnectionStatus) + Send + Sync + 'static,
  {
    let _publishing = self.publishing();
    let current = self.status();
    self.inner.listeners.subscribe(current, listener)
  }

  /// Begin monitoring: probe now, then every poll interval, and react to link events.
  ///
  /// Drains triggered by the monitor run in their own task, so a link event
  /// arriving mid-drain is applied right away.
  pub fn start(&self, events: mpsc::UnboundedReceiver<LinkEvent>) {
    let this = self.clone();
    let poll_interval = self.inner.options.poll_interval;

    let handle = tokio::spawn(async move {
      let mut events = events;
      let mut ticker = tokio::time::interval(poll_interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        tokio::select! {
          _ = ticker.tick() => {
            let reachable = this.probe().await;
            if reachable != this.is_online() {
              this.apply(reachable);
            }
          }
          Some(event) = events.recv() => {
            debug!(?event, "link event");
            this.apply(event == LinkEvent::Up);
          }
        }
      }
    });

    let previous = self
      .inner
      .monitor
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .replace(handle);
    if let Some(previous) = previous {
      previous.abort();
    }
    debug!(interval = ?poll_interval, "connectivity monitor started");
  }

  /// Stop monitoring and drop every listener.
  pub fn dispose(&self) {
    let handle = self
      .inner
      .monitor
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .take();
    if let Some(handle) = handle {
      handle.abort();
    }
    self.inner.listeners.clear();
    debug!("connectivity monitor stopped");
  }

  /// Passive signal from the platform. Returns the report of the drain it
  /// triggered, if any.
  pub async fn on_link_event(&self, event: LinkEvent) -> Option<SyncReport> {
    debug!(?event, "link event");
    match event {
      LinkEvent::Up => self.handle_online().await,
      LinkEvent::Down => {
        self.handle_offline();
        None
      }
    }
  }

  /// Ask the backend whether it is reachable without changing any state.
  pub async fn probe(&self) -> bool {
    self.inner.probe.check().await
  }

  /// Run the health probe once and act on a disagreement with the current state.
  pub async fn poll_once(&self) -> bool {
    let reachable = self.probe().await;
    let believed = self.is_online();

    if reachable && !believed {
      self.handle_online().await;
    } else if !reachable && believed {
      self.handle_offline();
    }
    reachable
  }

  /// Act on an observation without waiting for the drain it may start.
  fn apply(&self, reachable: bool) {
    if !reachable {
      self.handle_offline();
    } else if self.mark_online() {
      let this = self.clone();
      tokio::spawn(async move {
        this.drain().await;
      });
    }
  }

  async fn handle_online(&self) -> Option<SyncReport> {
    if !self.mark_online() {
      return None;
    }
    Some(self.drain().await)
  }

  /// Mark the backend reachable. Returns whether the caller now owns a drain.
  fn mark_online(&self) -> bool {
    let (was_reachable, drain) = self.update(|state| {
      let was = state.reachable;
      state.reachable = true;
      (was, state.claim_drain())
    });

    if !was_reachable {
      self.inner.sink.notify(&Notice::connection_restored());
    }
    drain
  }

  fn handle_offline(&self) {
    let was_reachable = self.update(|state| std::mem::replace(&mut state.reachable, false));

    if was_reachable {
      self.inner.sink.notify(&Notice::working_offline());
    }
  }

  /// Queue a write that couldn't be delivered.
  ///
  /// The queue is durable before this returns. When online and no drain is
  /// running, a drain is started in the background.
  pub fn enqueue(
    &self,
    endpoint: &str,
    method: WriteMethod,
    payload: Option<String>,
  ) -> Result<String> {
    let operation = PendingOperation::new(endpoint, method, payload);
    let id = operation.id.clone();

    let drain_now = {
      let mut state = self.state();
      state.queue.push(operation);
      if let Err(e) = self.inner.store.save(&state.queue) {
        state.queue.pop();
        return Err(eyre!("Failed to persist queued {} {}: {}", method, endpoint, e));
      }
      state.reachable && !state.draining
    };
    info!(%id, %method, endpoint, "queued operation");

    if drain_now {
      match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
          let this = self.clone();
          runtime.spawn(async move {
            this.sync().await;
          });
        }
        Err(_) => debug!("no runtime, operation waits for the next drain"),
      }
    }

    Ok(id)
  }

  /// Replay queued operations in order.
  ///
  /// No-op (returns `None`) when a drain is already running, the queue is
  /// empty, or the backend is believed unreachable.
  pub async fn sync(&self) -> Option<SyncReport> {
    let claimed = self.update(State::claim_drain);
    if !claimed {
      return None;
    }
    Some(self.drain().await)
  }

  /// Body of a drain pass. The caller must have claimed the drain guard.
  async fn drain(&self) -> SyncReport {
    // Operations enqueued from here on wait for the next pass
    let snapshot = self.state().queue.clone();
    info!(operations = snapshot.len(), "syncing offline queue");

    let mut report = SyncReport::default();
    for operation in snapshot {
      if !self.is_online() {
        info!("connectivity lost during sync, stopping");
        break;
      }

      let outcome = tokio::select! {
        outcome = self.replay(&operation) => Some(outcome),
        _ = self.connectivity_lost() => None,
      };
      let Some(outcome) = outcome else {
        info!(id = %operation.id, "connectivity lost during replay, operation stays queued");
        break;
      };

      match outcome {
        Ok(()) => {
          debug!(id = %operation.id, "operation delivered");
          self.remove(&operation.id);
          report.delivered += 1;
        }
        Err(e) => {
          warn!(id = %operation.id, endpoint = %operation.endpoint, error = %e, "replay failed");
          match self.record_failure(&operation.id) {
            Some(true) => report.failed += 1,
            Some(false) => report.dropped += 1,
            None => {}
          }

          if e.is_transport() && !self.inner.probe.check().await {
            self.handle_offline();
            break;
          }
        }
      }
    }

    report.pending = self.update(|state| {
      state.draining = false;
      state.queue.len()
    });

    if report.pending == 0 {
      self.inner.sink.notify(&Notice::all_synced());
    } else {
      self
        .inner
        .sink
        .notify(&Notice::partial_sync(report.pending));
    }
    info!(
      delivered = report.delivered,
      failed = report.failed,
      dropped = report.dropped,
      pending = report.pending,
      "sync finished"
    );
    report
  }

  /// Resolves once the backend is believed unreachable.
  async fn connectivity_lost(&self) {
    let mut link = self.inner.link.subscribe();
    if link.wait_for(|reachable| !*reachable).await.is_err() {
      std::future::pending::<()>().await;
    }
  }

  async fn replay(&self, operation: &PendingOperation) -> std::result::Result<(), ReplayError> {
    let url = self
      .inner
      .options
      .base_url
      .join(&operation.endpoint)
      .map_err(|e| {
        ReplayError::Invalid(format!("bad endpoint {}: {}", operation.endpoint, e))
      })?;

    let mut request =
      Request::new(operation.method.into(), url).with_header("Content-Type", "application/json");
    if let Some(payload) = &operation.payload {
      request = request.with_body(payload.clone().into_bytes());
    }

    let attempt = self.inner.transport.send(request);
    match tokio::time::timeout(self.inner.options.replay_timeout, attempt).await {
      Err(_) => Err(ReplayError::Timeout),
      Ok(Err(e)) => Err(ReplayError::Transport(e)),
      Ok(Ok(response)) if response.is_success() => Ok(()),
      Ok(Ok(response)) => Err(ReplayError::Status(response.status)),
    }
  }

  fn remove(&self, id: &str) {
    let mut state = self.state();
    state.queue.retain(|op| op.id != id);
    self.persist(&state.queue);
  }

  /// Bump the retry counter, dropping the operation at the ceiling.
  /// Returns whether it was kept, or `None` if it is no longer queued.
  fn record_failure(&self, id: &str) -> Option<bool> {
    let mut state = self.state();
    let index = state.queue.iter().position(|op| op.id == id)?;

    let kept = state.queue[index].record_failure();
    if !kept {
      let dropped = state.queue.remove(index);
      warn!(
        id = %dropped.id,
        method = %dropped.method,
        endpoint = %dropped.endpoint,
        retries = dropped.retries,
        "dropping operation after max retries"
      );
    }
    self.persist(&state.queue);
    Some(kept)
  }
}
