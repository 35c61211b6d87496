//! Agent node state machine

use serde::{Deserialize, Serialize};

/// Lifecycle state of an agent node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeState {
    /// Launch requested, nothing remote yet
    #[default]
    Requested,

    /// `runTask` accepted, waiting for the task to run
    TaskStarting,

    /// Remote task is running
    TaskRunning,

    /// Waiting for the agent to attach
    AgentConnecting,

    /// Agent attached, not yet accepting work
    AgentOnline,

    /// Online with no work
    Idle,

    /// Online and executing work
    Busy,

    /// No new work; finishing what it has
    Draining,

    /// Gone for good
    Terminated,
}

impl NodeState {
    /// Check if this is a terminal state (cannot transition further)
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Terminated)
    }

    /// Agent is attached to the controller
    pub fn is_online(&self) -> bool {
        matches!(
            self,
            NodeState::AgentOnline | NodeState::Idle | NodeState::Busy | NodeState::Draining
        )
    }

    /// Still on the way to online
    pub fn is_launching(&self) -> bool {
        matches!(
            self,
            NodeState::Requested
                | NodeState::TaskStarting
                | NodeState::TaskRunning
                | NodeState::AgentConnecting
        )
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// Any non-terminal state may go straight to `Terminated`.
    pub fn can_transition_to(&self, next: NodeState) -> bool {
        use NodeState::*;

        if self.is_terminal() {
            return false;
        }
        if next == Terminated {
            return true;
        }

        matches!(
            (self, next),
            (Requested, TaskStarting)
                | (TaskStarting, TaskRunning)
                // retryable failure starts the run again
                | (TaskStarting, TaskStarting)
                | (TaskRunning, TaskStarting)
                | (TaskRunning, AgentConnecting)
                | (AgentConnecting, AgentOnline)
                | (AgentOnline, Idle)
                | (AgentOnline, Busy)
                | (Idle, Busy)
                | (Busy, Idle)
                | (Idle, Draining)
                | (Busy, Draining)
        )
    }

    /// Get display name for the state
    pub fn display_name(&self) -> &'static str {
        match self {
            NodeState::Requested => "Requested",
            NodeState::TaskStarting => "TaskStarting",
            NodeState::TaskRunning => "TaskRunning",
            NodeState::AgentConnecting => "AgentConnecting",
            NodeState::AgentOnline => "AgentOnline",
            NodeState::Idle => "Idle",
            NodeState::Busy => "Busy",
            NodeState::Draining => "Draining",
            NodeState::Terminated => "Terminated",
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}
