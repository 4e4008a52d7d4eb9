//! Node and run lifecycle states.

use serde::{Deserialize, Serialize};

use crate::event::EventKind;

/// Runtime status of a single workflow node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
    WaitingApproval,
    Paused,
}

impl NodeStatus {
    /// Terminal statuses absorb every subsequent event until a run reset.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Failed)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Idle => "idle",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::WaitingApproval => "waiting_approval",
            NodeStatus::Paused => "paused",
        };
        f.write_str(s)
    }
}

/// Overall mode of the tracked run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Design,
    Executing,
    Completed,
    Failed,
    Paused,
}

impl RunMode {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunMode::Completed | RunMode::Failed)
    }

    /// The live channel is only held open in these modes.
    pub fn is_live(&self) -> bool {
        matches!(self, RunMode::Executing | RunMode::Paused)
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunMode::Design => "design",
            RunMode::Executing => "executing",
            RunMode::Completed => "completed",
            RunMode::Failed => "failed",
            RunMode::Paused => "paused",
        };
        f.write_str(s)
    }
}

/// The per-node status state machine.
///
/// Returns the next status, or `None` when the event maps to no transition.
/// Unmapped events are still appended to the event log for the timeline;
/// they just never move node status.
pub fn next_status(current: NodeStatus, kind: &EventKind) -> Option<NodeStatus> {
    if current.is_terminal() {
        return None;
    }
    match (current, kind) {
        (NodeStatus::Idle, EventKind::NodeStarted) => Some(NodeStatus::Running),
        (NodeStatus::Running, EventKind::NodeCompleted) => Some(NodeStatus::Completed),
        (NodeStatus::Running, EventKind::NodeFailed) => Some(NodeStatus::Failed),
        (NodeStatus::Running, EventKind::ApprovalRequested) => Some(NodeStatus::WaitingApproval),
        (NodeStatus::WaitingApproval, EventKind::ApprovalGranted) => Some(NodeStatus::Completed),
        (NodeStatus::WaitingApproval, EventKind::ApprovalDenied) => Some(NodeStatus::Failed),
        _ => None,
    }
}
