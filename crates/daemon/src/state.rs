//! Lifecycle state machine.

use std::sync::RwLock;

/// Daemon lifecycle states. Any state may transition to `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Uninitialized,
  Initializing,
  Ready,
  ShuttingDown,
  Terminated,
  Error,
}

impl LifecycleState {
  pub fn as_str(&self) -> &'static str {
    match self {
      LifecycleState::Uninitialized => "uninitialized",
      LifecycleState::Initializing => "initializing",
      LifecycleState::Ready => "ready",
      LifecycleState::ShuttingDown => "shutting_down",
      LifecycleState::Terminated => "terminated",
      LifecycleState::Error => "error",
    }
  }

  /// Legal forward transitions; `Error` is reachable from anywhere.
  fn can_transition_to(&self, next: LifecycleState) -> bool {
    use LifecycleState::*;
    matches!(
      (self, next),
      (Uninitialized, Initializing)
        | (Initializing, Ready)
        | (Ready, ShuttingDown)
        | (Initializing, ShuttingDown)
        | (ShuttingDown, Terminated)
        | (_, Error)
    )
  }
}

/// Thread-safe state holder with transition validation.
pub struct StateMachine {
  state: RwLock<LifecycleState>,
}

impl StateMachine {
  pub fn new() -> Self {
    Self {
      state: RwLock::new(LifecycleState::Uninitialized),
    }
  }

  pub fn current(&self) -> LifecycleState {
    *self.state.read().expect("lifecycle state")
  }

  /// Attempt a transition; false (and no change) when illegal.
  pub fn transition(&self, next: LifecycleState) -> bool {
    let mut state = self.state.write().expect("lifecycle state");
    if state.can_transition_to(next) {
      tracing::info!(from = state.as_str(), to = next.as_str(), "Lifecycle transition");
      *state = next;
      true
    } else {
      tracing::warn!(from = state.as_str(), to = next.as_str(), "Illegal lifecycle transition");
      false
    }
  }
}

impl Default for StateMachine {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn happy_path_transitions() {
    let machine = StateMachine::new();
    assert_eq!(machine.current(), LifecycleState::Uninitialized);
    assert!(machine.transition(LifecycleState::Initializing));
    assert!(machine.transition(LifecycleState::Ready));
    assert!(machine.transition(LifecycleState::ShuttingDown));
    assert!(machine.transition(LifecycleState::Terminated));
  }

  #[test]
  fn illegal_transitions_are_rejected() {
    let machine = StateMachine::new();
    assert!(!machine.transition(LifecycleState::Ready));
    assert!(!machine.transition(LifecycleState::Terminated));
    assert_eq!(machine.current(), LifecycleState::Uninitialized);
  }

  #[test]
  fn error_is_reachable_from_anywhere() {
    let machine = StateMachine::new();
    assert!(machine.transition(LifecycleState::Error));

    let machine = StateMachine::new();
    machine.transition(LifecycleState::Initializing);
    machine.transition(LifecycleState::Ready);
    assert!(machine.transition(LifecycleState::Error));
  }
}
