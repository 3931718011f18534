//! Runtime lifecycle state machine

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::events::{EventBus, RuntimeEvent};
use crate::types::StateError;

const HISTORY_LIMIT: usize = 100;

/// Lifecycle states of the runtime engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeState {
    #[default]
    Idle,
    Initializing,
    Ready,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RuntimeState::Idle => "idle",
            RuntimeState::Initializing => "initializing",
            RuntimeState::Ready => "ready",
            RuntimeState::Running => "running",
            RuntimeState::Stopping => "stopping",
            RuntimeState::Stopped => "stopped",
            RuntimeState::Error => "error",
        };
        f.write_str(label)
    }
}

/// A recorded state change
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub from: RuntimeState,
    pub to: RuntimeState,
    pub at: DateTime<Utc>,
}

/// Guards the runtime's current state against invalid transitions.
pub struct StateMachine {
    valid_transitions: HashMap<RuntimeState, Vec<RuntimeState>>,
    state: RwLock<RuntimeState>,
    history: RwLock<VecDeque<StateTransition>>,
    events: Option<EventBus>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        let mut valid_transitions = HashMap::new();

        valid_transitions.insert(
            RuntimeState::Idle,
            vec![RuntimeState::Initializing, RuntimeState::Ready],
        );
        valid_transitions.insert(RuntimeState::Initializing, vec![RuntimeState::Ready]);
        valid_transitions.insert(RuntimeState::Ready, vec![RuntimeState::Running]);
        valid_transitions.insert(
            RuntimeState::Running,
            vec![RuntimeState::Stopping, RuntimeState::Stopped],
        );
        valid_transitions.insert(RuntimeState::Stopping, vec![RuntimeState::Stopped]);
        valid_transitions.insert(RuntimeState::Stopped, vec![]);
        valid_transitions.insert(RuntimeState::Error, vec![]);

        Self {
            valid_transitions,
            state: RwLock::new(RuntimeState::Idle),
            history: RwLock::new(VecDeque::new()),
            events: None,
        }
    }

    /// Publish `state:changed` on every successful transition.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> RuntimeState {
        *self.state.read()
    }

    /// Any state may move to `Error`.
    pub fn is_valid_transition(&self, from: &RuntimeState, to: &RuntimeState) -> bool {
        if *to == RuntimeState::Error {
            return true;
        }
        self.valid_transitions
            .get(from)
            .map(|transitions| transitions.contains(to))
            .unwrap_or(false)
    }

    /// Move to `target`, leaving the state untouched when the edge is invalid.
    pub fn transition_to(&self, target: RuntimeState) -> Result<(), StateError> {
        let from = {
            let mut state = self.state.write();
            let from = *state;
            if !self.is_valid_transition(&from, &target) {
                return Err(StateError::InvalidTransition { from, to: target });
            }
            *state = target;
            from
        };

        self.record(from, target);
        tracing::debug!("Runtime state {} -> {}", from, target);
        Ok(())
    }

    /// Return to `Idle` from `Error` or `Stopped`.
    pub fn reset(&self) -> Result<(), StateError> {
        let from = {
            let mut state = self.state.write();
            let from = *state;
            if !matches!(from, RuntimeState::Error | RuntimeState::Stopped) {
                return Err(StateError::InvalidTransition {
                    from,
                    to: RuntimeState::Idle,
                });
            }
            *state = RuntimeState::Idle;
            from
        };

        self.record(from, RuntimeState::Idle);
        tracing::info!("Runtime reset from {}", from);
        Ok(())
    }

    /// Fail unless the runtime is currently in `expected`.
    pub fn ensure(&self, expected: RuntimeState) -> Result<(), StateError> {
        let actual = self.state();
        if actual == expected {
            Ok(())
        } else {
            Err(StateError::NotInState { expected, actual })
        }
    }

    pub fn history(&self) -> Vec<StateTransition> {
        self.history.read().iter().cloned().collect()
    }

    fn record(&self, from: RuntimeState, to: RuntimeState) {
        {
            let mut history = self.history.write();
            if history.len() == HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(StateTransition {
                from,
                to,
                at: Utc::now(),
            });
        }
        if let Some(events) = &self.events {
            events.publish(RuntimeEvent::StateChanged { from, to });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [RuntimeState; 7] = [
        RuntimeState::Idle,
        RuntimeState::Initializing,
        RuntimeState::Ready,
        RuntimeState::Running,
        RuntimeState::Stopping,
        RuntimeState::Stopped,
        RuntimeState::Error,
    ];

    fn machine_in(state: RuntimeState) -> StateMachine {
        let machine = StateMachine::new();
        *machine.state.write() = state;
        machine
    }

    #[test]
    fn test_state_machine() {
        let state_machine = StateMachine::new();

        assert!(state_machine.is_valid_transition(&RuntimeState::Idle, &RuntimeState::Ready));
        assert!(state_machine.is_valid_transition(&RuntimeState::Ready, &RuntimeState::Running));
        assert!(state_machine.is_valid_transition(&RuntimeState::Running, &RuntimeState::Stopped));

        assert!(!state_machine.is_valid_transition(&RuntimeState::Idle, &RuntimeState::Running));
        assert!(!state_machine.is_valid_transition(&RuntimeState::Stopped, &RuntimeState::Running));
    }

    #[test]
    fn test_every_edge_is_enforced() {
        let reference = StateMachine::new();
        for from in ALL {
            for to in ALL {
                let machine = machine_in(from);
                let result = machine.transition_to(to);
                if reference.is_valid_transition(&from, &to) {
                    assert!(result.is_ok(), "{from} -> {to} should be allowed");
                    assert_eq!(machine.state(), to);
                } else {
                    assert_eq!(
                        result,
                        Err(StateError::InvalidTransition { from, to }),
                        "{from} -> {to} should be rejected"
                    );
                    assert_eq!(machine.state(), from, "state must not change on rejection");
                }
            }
        }
    }

    #[test]
    fn test_full_lifecycle_records_history() {
        let machine = StateMachine::new();
        machine.transition_to(RuntimeState::Initializing).unwrap();
        machine.transition_to(RuntimeState::Ready).unwrap();
        machine.transition_to(RuntimeState::Running).unwrap();
        machine.transition_to(RuntimeState::Stopping).unwrap();
        machine.transition_to(RuntimeState::Stopped).unwrap();

        let history = machine.history();
        assert_eq!(history.len(), 5);
        assert_eq!(history[0].from, RuntimeState::Idle);
        assert_eq!(history[4].to, RuntimeState::Stopped);
    }

    #[test]
    fn test_reset_only_from_terminal_states() {
        let machine = StateMachine::new();
        assert!(machine.reset().is_err());

        machine.transition_to(RuntimeState::Error).unwrap();
        machine.reset().unwrap();
        assert_eq!(machine.state(), RuntimeState::Idle);
    }

    #[tokio::test]
    async fn test_transition_publishes_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_topic("state:changed");
        let machine = StateMachine::new().with_events(bus);

        machine.transition_to(RuntimeState::Ready).unwrap();
        let event = rx.recv().await.unwrap();
        match &event.event {
            RuntimeEvent::StateChanged { from, to } => {
                assert_eq!(*from, RuntimeState::Idle);
                assert_eq!(*to, RuntimeState::Ready);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_ensure() {
        let machine = StateMachine::new();
        assert!(machine.ensure(RuntimeState::Idle).is_ok());
        assert!(matches!(
            machine.ensure(RuntimeState::Running),
            Err(StateError::NotInState { .. })
        ));
    }
}
