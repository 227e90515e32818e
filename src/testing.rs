//! In-memory collaborators for tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use crate::http::{Method, Request, Response, Transport};
use crate::offline::{Notice, NotificationSink};

/// Transport with a scriptable network.
///
/// Every request is recorded before it is answered. Responses are looked up
/// by path; queued one-shot replies take priority over the standing route.
pub struct ScriptedTransport {
  online: AtomicBool,
  routes: Mutex<HashMap<String, Response>>,
  queued: Mutex<HashMap<String, VecDeque<Response>>>,
  unreachable: Mutex<HashSet<String>>,
  requests: Mutex<Vec<(Method, String)>>,
  gate: Mutex<Option<Arc<Semaphore>>>,
}

impl ScriptedTransport {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      online: AtomicBool::new(true),
      routes: Mutex::new(HashMap::new()),
      queued: Mutex::new(HashMap::new()),
      unreachable: Mutex::new(HashSet::new()),
      requests: Mutex::new(Vec::new()),
      gate: Mutex::new(None),
    })
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Standing answer for a path.
  pub fn route(&self, path: &str, response: Response) {
    self.routes.lock().unwrap().insert(path.to_string(), response);
  }

  /// One-shot answer for a path, used before the standing route.
  pub fn respond_once(&self, path: &str, response: Response) {
    self
      .queued
      .lock()
      .unwrap()
      .entry(path.to_string())
      .or_default()
      .push_back(response);
  }

  /// Make a single path fail at the transport level.
  pub fn fail_path(&self, path: &str) {
    self.unreachable.lock().unwrap().insert(path.to_string());
  }

  /// Hold every request until permits are added to the returned semaphore.
  pub fn hold(&self) -> Arc<Semaphore> {
    let gate = Arc::new(Semaphore::new(0));
    *self.gate.lock().unwrap() = Some(gate.clone());
    gate
  }

  pub fn requests(&self) -> Vec<(Method, String)> {
    self.requests.lock().unwrap().clone()
  }

  /// Requests that hit a path.
  pub fn count(&self, path: &str) -> usize {
    self
      .requests()
      .iter()
      .filter(|(_, p)| p == path)
      .count()
  }

  pub fn clear_requests(&self) {
    self.requests.lock().unwrap().clear();
  }
}

impl Transport for ScriptedTransport {
  async fn send(&self, request: Request) -> Result<Response> {
    let path = request.url.path().to_string();
    self
      .requests
      .lock()
      .unwrap()
      .push((request.method, path.clone()));

    let gate = self.gate.lock().unwrap().clone();
    if let Some(gate) = gate {
      gate
        .acquire()
        .await
        .map_err(|e| eyre!("gate closed: {}", e))?
        .forget();
    }

    if !self.online.load(Ordering::SeqCst) || self.unreachable.lock().unwrap().contains(&path) {
      return Err(eyre!("network unreachable: {}", request.url));
    }

    if let Some(response) = self
      .queued
      .lock()
      .unwrap()
      .get_mut(&path)
      .and_then(|q| q.pop_front())
    {
      return Ok(response);
    }

    Ok(
      self
        .routes
        .lock()
        .unwrap()
        .get(&path)
        .cloned()
        .unwrap_or_else(|| Response::text(200, "ok")),
    )
  }
}

/// Sink that remembers every notice.
#[derive(Default)]
pub struct RecordingSink {
  notices: Mutex<Vec<Notice>>,
}

impl RecordingSink {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn titles(&self) -> Vec<String> {
    self
      .notices
      .lock()
      .unwrap()
      .iter()
      .map(|n| n.title.clone())
      .collect()
  }

  pub fn last(&self) -> Option<Notice> {
    self.notices.lock().unwrap().last().cloned()
  }
}

impl NotificationSink for RecordingSink {
  fn notify(&self, notice: &Notice) {
    self.notices.lock().unwrap().push(notice.clone());
  }
}
