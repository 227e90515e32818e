//! User-facing notices about connectivity and sync outcomes.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
  Success,
  Info,
  Warning,
  Error,
}

/// Payload of the banner event: `{ title, message, type }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
  pub title: String,
  pub message: String,
  #[serde(rename = "type")]
  pub kind: NoticeKind,
}

impl Notice {
  pub fn new(kind: NoticeKind, title: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      title: title.into(),
      message: message.into(),
      kind,
    }
  }

  pub fn connection_restored() -> Self {
    Self::new(
      NoticeKind::Success,
      "Connection restored",
      "You are back online. Pending changes will be synced.",
    )
  }

  pub fn working_offline() -> Self {
    Self::new(
      NoticeKind::Warning,
      "Working offline",
      "Changes will be saved locally and synced when the connection returns.",
    )
  }

  pub fn all_synced() -> Self {
    Self::new(NoticeKind::Success, "All synced", "All pending changes were saved.")
  }

  pub fn partial_sync(pending: usize) -> Self {
    Self::new(
      NoticeKind::Warning,
      "Partial sync",
      format!("{} operations pending", pending),
    )
  }
}

/// Receives every status-changing notice.
pub trait NotificationSink: Send + Sync {
  fn notify(&self, notice: &Notice);
}

/// Writes notices to the log.
pub struct TracingSink;

impl NotificationSink for TracingSink {
  fn notify(&self, notice: &Notice) {
    match notice.kind {
      NoticeKind::Success | NoticeKind::Info => {
        info!(title = %notice.title, "{}", notice.message)
      }
      NoticeKind::Warning => warn!(title = %notice.title, "{}", notice.message),
      NoticeKind::Error => error!(title = %notice.title, "{}", notice.message),
    }
  }
}

/// Fans notices out to any number of UI consumers.
#[derive(Clone)]
pub struct BroadcastSink {
  tx: broadcast::Sender<Notice>,
}

impl BroadcastSink {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity);
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
    self.tx.subscribe()
  }
}

impl NotificationSink for BroadcastSink {
  fn notify(&self, notice: &Notice) {
    // No receivers is fine: nobody is showing banners right now
    let _ = self.tx.send(notice.clone());
  }
}
