//! Worker lifecycle states.

use color_eyre::{eyre::eyre, Result};
use std::fmt;

/// Lifecycle state of the interception layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Constructed, install not started
  Parsed,
  /// Priming the static partition
  Installing,
  /// Installed, waiting to take over
  Waiting,
  /// Serving intercepted requests
  Active,
  /// Install failed or replaced
  Redundant,
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Waiting => "waiting",
      Self::Active => "active",
      Self::Redundant => "redundant",
    };
    f.write_str(name)
  }
}

/// Check if a state transition is valid
pub fn is_valid_transition(from: WorkerState, to: WorkerState) -> bool {
  use WorkerState::*;
  matches!(
    (from, to),
    (Parsed, Installing)
      | (Parsed, Active)
      | (Installing, Waiting)
      | (Installing, Redundant)
      | (Waiting, Active)
      | (Waiting, Redundant)
      | (Active, Redundant)
  )
}

/// Mutable lifecycle bookkeeping guarded by the worker.
#[derive(Debug)]
pub struct Lifecycle {
  pub state: WorkerState,
  /// Activate as soon as install completes
  pub skip_waiting: bool,
  /// Clients have been claimed; requests are intercepted
  pub controlling: bool,
}

impl Lifecycle {
  pub fn new() -> Self {
    Self {
      state: WorkerState::Parsed,
      skip_waiting: false,
      controlling: false,
    }
  }

  pub fn transition(&mut self, to: WorkerState) -> Result<()> {
    if !is_valid_transition(self.state, to) {
      return Err(eyre!("Invalid worker transition {} -> {}", self.state, to));
    }
    self.state = to;
    if to == WorkerState::Redundant {
      self.controlling = false;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_happy_path() {
    let mut lifecycle = Lifecycle::new();
    lifecycle.transition(WorkerState::Installing).unwrap();
    lifecycle.transition(WorkerState::Waiting).unwrap();
    lifecycle.transition(WorkerState::Active).unwrap();
    assert_eq!(lifecycle.state, WorkerState::Active);
  }

  #[test]
  fn test_cannot_activate_twice() {
    let mut lifecycle = Lifecycle::new();
    lifecycle.transition(WorkerState::Installing).unwrap();
    lifecycle.transition(WorkerState::Waiting).unwrap();
    lifecycle.transition(WorkerState::Active).unwrap();
    assert!(lifecycle.transition(WorkerState::Active).is_err());
  }

  #[test]
  fn test_redundant_drops_control() {
    let mut lifecycle = Lifecycle::new();
    lifecycle.controlling = true;
    lifecycle.transition(WorkerState::Installing).unwrap();
    lifecycle.transition(WorkerState::Redundant).unwrap();
    assert!(!lifecycle.controlling);
  }
}
