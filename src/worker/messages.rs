//! Control messages accepted from the page.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};

/// Page -> worker message, e.g. `{ "type": "SKIP_WAITING" }`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
  /// Activate immediately instead of waiting
  SkipWaiting,
  /// Report the active cache version on the reply channel
  GetVersion,
}

impl WorkerMessage {
  pub fn parse(json: &str) -> Result<Self> {
    serde_json::from_str(json).map_err(|e| eyre!("Unrecognized worker message {}: {}", json, e))
  }
}

/// Reply to `GET_VERSION`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionReply {
  pub version: String,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_wire_format() {
    assert_eq!(
      WorkerMessage::parse(r#"{"type":"SKIP_WAITING"}"#).unwrap(),
      WorkerMessage::SkipWaiting
    );
    assert_eq!(
      WorkerMessage::parse(r#"{"type":"GET_VERSION"}"#).unwrap(),
      WorkerMessage::GetVersion
    );
  }

  #[test]
  fn test_unknown_type_is_error() {
    assert!(WorkerMessage::parse(r#"{"type":"CLAIM"}"#).is_err());
  }
}
