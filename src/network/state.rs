//! Node lifecycle state machine

use crate::logging::Logger;
use std::fmt;
use std::sync::Arc;

/// Lifecycle state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Stopped,
    Running,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Stopped => write!(f, "Stopped"),
            NodeState::Running => write!(f, "Running"),
        }
    }
}

/// Operations gated by the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Start,
    Stop,
    SendToOne,
    SendToAll,
    GetPeers,
    RemoveClient,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of offering a command to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Command permitted; the machine is now in this state
    Valid(NodeState),
    /// Command rejected; the state did not change
    Invalid,
}

impl Transition {
    pub fn is_valid(&self) -> bool {
        matches!(self, Transition::Valid(_))
    }
}

/// Next state for a command, or `None` when the pair is not allowed
fn next_state(state: NodeState, command: Command) -> Option<NodeState> {
    use Command::*;
    use NodeState::*;

    match (state, command) {
        (Stopped, Start) => Some(Running),
        (Running, Stop) => Some(Stopped),
        (Running, SendToOne | SendToAll | GetPeers | RemoveClient) => Some(Running),
        _ => None,
    }
}

/// Validates node operations against the current lifecycle state
pub struct NodeStateMachine {
    state: NodeState,
    logger: Arc<dyn Logger>,
}

impl NodeStateMachine {
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self {
            state: NodeState::Stopped,
            logger,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Apply `command`, logging a warning when it is rejected
    pub fn move_next(&mut self, command: Command) -> Transition {
        match next_state(self.state, command) {
            Some(next) => {
                self.state = next;
                Transition::Valid(next)
            }
            None => {
                self.logger.warning(&format!(
                    "Can't call {} when node is {}",
                    command, self.state
                ));
                Transition::Invalid
            }
        }
    }

    /// Undo a Start whose startup failed
    pub(crate) fn reset(&mut self) {
        self.state = NodeState::Stopped;
    }
}
