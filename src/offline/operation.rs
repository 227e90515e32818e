//! Queued mutation records.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::http::WriteMethod;

/// Replay attempts before an operation is dropped.
pub const MAX_RETRIES: u32 = 3;

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// A write that could not reach the server and awaits replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
  /// `{timestamp}-{random suffix}`
  pub id: String,
  /// Creation time in milliseconds since the epoch
  pub timestamp: i64,
  /// Endpoint path relative to the backend origin, e.g. `/api/tasks/1`
  pub endpoint: String,
  pub method: WriteMethod,
  /// Opaque request body (JSON text), passed through untouched
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub payload: Option<String>,
  #[serde(default)]
  pub retries: u32,
}

impl PendingOperation {
  pub fn new(endpoint: impl Into<String>, method: WriteMethod, payload: Option<String>) -> Self {
    let timestamp = Utc::now().timestamp_millis();
    Self {
      id: format!("{}-{}", timestamp, random_suffix(9)),
      timestamp,
      endpoint: endpoint.into(),
      method,
      payload,
      retries: 0,
    }
  }

  /// Record a failed attempt. Returns whether the operation should be kept.
  pub fn record_failure(&mut self) -> bool {
    self.retries = self.retries.saturating_add(1);
    self.retries < MAX_RETRIES
  }
}

fn random_suffix(len: usize) -> String {
  let mut rng = rand::thread_rng();
  (0..len)
    .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_ids_are_unique_and_timestamped() {
    let a = PendingOperation::new("/api/tasks", WriteMethod::Post, None);
    let b = PendingOperation::new("/api/tasks", WriteMethod::Post, None);

    assert_ne!(a.id, b.id);
    assert!(a.id.starts_with(&a.timestamp.to_string()));
    assert_eq!(a.id.len(), a.timestamp.to_string().len() + 10);
    assert_eq!(a.retries, 0);
  }

  #[test]
  fn test_retry_ceiling() {
    let mut op = PendingOperation::new("/api/tasks/1", WriteMethod::Patch, None);
    assert!(op.record_failure());
    assert!(op.record_failure());
    assert!(!op.record_failure());
    assert_eq!(op.retries, MAX_RETRIES);
  }

  #[test]
  fn test_wire_format() {
    let op = PendingOperation {
      id: "1700000000000-abc123xyz".to_string(),
      timestamp: 1_700_000_000_000,
      endpoint: "/api/tasks".to_string(),
      method: WriteMethod::Post,
      payload: Some(r#"{"title":"A"}"#.to_string()),
      retries: 1,
    };

    let value = serde_json::to_value(&op).unwrap();
    assert_eq!(value["method"], "POST");
    assert_eq!(value["endpoint"], "/api/tasks");
    assert_eq!(value["retries"], 1);

    let back: PendingOperation = serde_json::from_value(value).unwrap();
    assert_eq!(back, op);
  }
}
