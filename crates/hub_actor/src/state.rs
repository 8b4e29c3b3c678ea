use crate::error::{Error, Result};
use std::fmt;

/// Lifecycle of one actor connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No channel exists.
    #[default]
    Idle,
    /// Channel opened, waiting for the transport and the greet ack.
    Connecting,
    /// Hub accepted the key, capability registration in flight.
    Greeted,
    /// Capabilities registered, events may be piped.
    Registered,
    /// Leave sent, waiting for the hub to acknowledge it.
    Disconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Greeted => "greeted",
            ConnectionState::Registered => "registered",
            ConnectionState::Disconnecting => "disconnecting",
        }
    }

    /// Whether the hub has seen our greeting, which obliges a leave message on
    /// teardown.
    pub fn is_greeted(&self) -> bool {
        matches!(self, ConnectionState::Greeted | ConnectionState::Registered)
    }

    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Greeted)
                | (Greeted, Registered)
                | (Connecting, Idle)
                | (Greeted, Disconnecting)
                | (Registered, Disconnecting)
                | (Disconnecting, Idle)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one connect/disconnect cycle.
///
/// Handshake continuations capture the generation they were scheduled in and
/// give up when it no longer matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(u64);

impl Generation {
    pub fn value(&self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        Generation(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct StateMachine {
    state: ConnectionState,
    generation: Generation,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_current(&self, generation: Generation) -> bool {
        self.generation == generation
    }

    pub fn transition(&mut self, next: ConnectionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Moves to `next` and starts a new generation, invalidating every
    /// continuation scheduled so far.
    pub fn transition_and_advance(&mut self, next: ConnectionState) -> Result<Generation> {
        self.transition(next)?;
        self.generation = self.generation.next();
        Ok(self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_path_is_legal() {
        let mut machine = StateMachine::new();
        machine
            .transition_and_advance(ConnectionState::Connecting)
            .unwrap();
        machine.transition(ConnectionState::Greeted).unwrap();
        machine.transition(ConnectionState::Registered).unwrap();
        machine
            .transition_and_advance(ConnectionState::Disconnecting)
            .unwrap();
        machine.transition(ConnectionState::Idle).unwrap();
        assert_eq!(machine.state(), ConnectionState::Idle);
        assert_eq!(machine.generation().value(), 2);
    }

    #[test]
    fn test_illegal_transition_is_rejected() {
        let mut machine = StateMachine::new();
        let err = machine
            .transition(ConnectionState::Registered)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::IllegalTransition {
                from: ConnectionState::Idle,
                to: ConnectionState::Registered
            }
        ));
        assert_eq!(machine.state(), ConnectionState::Idle);
        assert_eq!(machine.generation(), Generation::default());
    }

    #[test]
    fn test_no_reentrant_connect() {
        let mut machine = StateMachine::new();
        machine
            .transition_and_advance(ConnectionState::Connecting)
            .unwrap();
        let generation = machine.generation();
        assert!(machine
            .transition_and_advance(ConnectionState::Connecting)
            .is_err());
        assert!(machine.is_current(generation));
    }

    #[test]
    fn test_greeted_states() {
        assert!(!ConnectionState::Connecting.is_greeted());
        assert!(ConnectionState::Greeted.is_greeted());
        assert!(ConnectionState::Registered.is_greeted());
        assert!(!ConnectionState::Disconnecting.is_greeted());
    }

    #[test]
    fn test_registered_cannot_skip_leave() {
        assert!(!ConnectionState::Registered.can_transition_to(ConnectionState::Idle));
        assert!(!ConnectionState::Disconnecting.can_transition_to(ConnectionState::Connecting));
    }
}
