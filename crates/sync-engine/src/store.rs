//! Single source of truth for one tracked run.
//!
//! All mutation goes through the explicit setters here; the stream client,
//! reducer and approval gate write, view layers only read snapshots.
//! Observers subscribe to a revision counter and re-read on change.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};

use crate::approval::ApprovalRequest;
use crate::event::{Deduplicator, EventKind, ExecutionEvent};
use crate::status::{next_status, NodeStatus, RunMode};

/// Definition subset of a workflow node that the engine tracks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    pub label: String,
    /// Free-form node type string (`agent`, `approval`, `timer`, ...).
    pub kind: String,
    #[serde(default)]
    pub status: NodeStatus,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, label: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind: kind.into(),
            status: NodeStatus::Idle,
        }
    }
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub id: String,
    pub source: String,
    pub target: String,
}

/// Final output of a run, set by a workflow-terminal event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutput {
    pub status: RunMode,
    pub result: serde_json::Value,
}

/// Read-only snapshot of the tracked run.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    pub workflow_id: Option<String>,
    pub execution_id: Option<String>,
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<WorkflowEdge>,
    /// Append-only, deduplicated event log.
    pub events: Vec<ExecutionEvent>,
    pub mode: RunMode,
    pub output: Option<RunOutput>,
    /// Live-channel connectivity flag.
    pub connected: bool,
    pub active_approval: Option<ApprovalRequest>,
}

/// What [`WorkflowStateStore::apply_event`] did with an event.
#[derive(Debug, Clone, Default)]
pub struct Applied {
    /// The event was a repeat and was dropped whole.
    pub duplicate: bool,
    /// Node status transition performed, if any.
    pub status_change: Option<(String, NodeStatus)>,
    /// An approval request was surfaced.
    pub approval_surfaced: bool,
    /// The event ended the run; the channel should close normally.
    pub workflow_terminal: bool,
}

struct Inner {
    run: RunState,
    dedup: Deduplicator,
}

/// Cheaply cloneable handle on the run state.
///
/// Constructed explicitly and passed to the components that need it; there
/// is no ambient global.
#[derive(Clone)]
pub struct WorkflowStateStore {
    inner: Arc<RwLock<Inner>>,
    revision: Arc<watch::Sender<u64>>,
}

impl WorkflowStateStore {
    pub fn new(dedup_capacity: usize) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(RwLock::new(Inner {
                run: RunState::default(),
                dedup: Deduplicator::new(dedup_capacity),
            })),
            revision: Arc::new(revision),
        }
    }

    /// Subscribe to state changes. Receivers re-read a snapshot on change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    /// Clone the current state.
    pub async fn snapshot(&self) -> RunState {
        self.inner.read().await.run.clone()
    }

    /// Load the workflow definition the run executes against.
    pub async fn set_definition(
        &self,
        workflow_id: &str,
        nodes: Vec<WorkflowNode>,
        edges: Vec<WorkflowEdge>,
    ) {
        let mut inner = self.inner.write().await;
        inner.run.workflow_id = Some(workflow_id.to_string());
        inner.run.nodes = nodes;
        inner.run.edges = edges;
        drop(inner);
        self.bump();
    }

    /// Start tracking a fresh run: clears the log, output, approval and the
    /// dedup window, resets every node to idle, and enters executing mode.
    pub async fn begin_run(&self, execution_id: &str) {
        let mut inner = self.inner.write().await;
        inner.run.execution_id = Some(execution_id.to_string());
        inner.run.events.clear();
        inner.run.output = None;
        inner.run.active_approval = None;
        inner.run.mode = RunMode::Executing;
        for node in &mut inner.run.nodes {
            node.status = NodeStatus::Idle;
        }
        inner.dedup.clear();
        drop(inner);

        tracing::info!(execution_id = %execution_id, "Tracking run");
        self.bump();
    }

    /// Apply one decoded event: dedup, reduce node status, surface
    /// approvals, handle workflow-terminal events, append to the log.
    ///
    /// The whole read-reduce-write sequence runs under a single write guard
    /// with no await points, so two events for the same node can never
    /// interleave.
    pub async fn apply_event(&self, event: ExecutionEvent) -> Applied {
        let mut inner = self.inner.write().await;

        if !inner.dedup.insert(&event.id) {
            tracing::debug!(event_id = %event.id, "Duplicate event dropped");
            return Applied {
                duplicate: true,
                ..Applied::default()
            };
        }

        let mut applied = Applied::default();

        // Node status reduction.
        if let Some(node_id) = event.node_id.clone() {
            if let Some(node) = inner.run.nodes.iter_mut().find(|n| n.id == node_id) {
                if let Some(next) = next_status(node.status, &event.kind) {
                    node.status = next;
                    applied.status_change = Some((node_id.clone(), next));
                    tracing::debug!(
                        node_id = %node_id,
                        status = ?next,
                        "Node status updated"
                    );
                }
            }
        }

        match &event.kind {
            EventKind::ApprovalRequested => {
                if let Some(request) = ApprovalRequest::from_event(&event) {
                    if let Some(pending) = &inner.run.active_approval {
                        tracing::warn!(
                            pending_id = %pending.id,
                            replacement_id = %request.id,
                            "Approval requested while another is pending, replacing"
                        );
                    }
                    // The approval gate marks the node as waiting even when
                    // the reducer had nothing to transition (e.g. the node
                    // never reported started).
                    let node_id = request.node_id.clone();
                    if let Some(node) = inner.run.nodes.iter_mut().find(|n| n.id == node_id) {
                        if !node.status.is_terminal() {
                            node.status = NodeStatus::WaitingApproval;
                            applied.status_change = Some((node_id, NodeStatus::WaitingApproval));
                        }
                    }
                    inner.run.active_approval = Some(request);
                    applied.approval_surfaced = true;
                }
            }
            EventKind::ApprovalGranted | EventKind::ApprovalDenied => {
                // The authoritative resolution arrived on the channel; the
                // modal has nothing left to show.
                inner.run.active_approval = None;
            }
            EventKind::WorkflowCompleted => {
                inner.run.mode = RunMode::Completed;
                inner.run.output = Some(RunOutput {
                    status: RunMode::Completed,
                    result: event.data.clone(),
                });
                inner.run.active_approval = None;
                applied.workflow_terminal = true;
            }
            EventKind::WorkflowFailed => {
                inner.run.mode = RunMode::Failed;
                inner.run.output = Some(RunOutput {
                    status: RunMode::Failed,
                    result: event.data.clone(),
                });
                inner.run.active_approval = None;
                applied.workflow_terminal = true;
            }
            _ => {}
        }

        inner.run.events.push(event);
        drop(inner);

        self.bump();
        applied
    }

    /// Append an event to the log without driving any other state. Most
    /// callers want [`Self::apply_event`]; this is the raw log setter.
    /// Returns false when the event was a repeat.
    pub async fn append_event(&self, event: ExecutionEvent) -> bool {
        let mut inner = self.inner.write().await;
        if !inner.dedup.insert(&event.id) {
            tracing::debug!(event_id = %event.id, "Duplicate event dropped");
            return false;
        }
        inner.run.events.push(event);
        drop(inner);
        self.bump();
        true
    }

    /// Explicit status setter. Refuses to move a node out of a terminal
    /// state; only [`Self::begin_run`] does that.
    pub async fn set_node_status(&self, node_id: &str, status: NodeStatus) {
        let mut inner = self.inner.write().await;
        if let Some(node) = inner.run.nodes.iter_mut().find(|n| n.id == node_id) {
            if node.status.is_terminal() && !status.is_terminal() {
                tracing::debug!(
                    node_id = %node_id,
                    "Ignoring status write against a terminal node"
                );
                return;
            }
            node.status = status;
        }
        drop(inner);
        self.bump();
    }

    pub async fn set_mode(&self, mode: RunMode) {
        self.inner.write().await.run.mode = mode;
        self.bump();
    }

    pub async fn set_output(&self, output: Option<RunOutput>) {
        self.inner.write().await.run.output = output;
        self.bump();
    }

    pub async fn set_connected(&self, connected: bool) {
        self.inner.write().await.run.connected = connected;
        self.bump();
    }

    pub async fn set_approval(&self, request: ApprovalRequest) {
        self.inner.write().await.run.active_approval = Some(request);
        self.bump();
    }

    pub async fn clear_approval(&self) {
        self.inner.write().await.run.active_approval = None;
        self.bump();
    }

    // Targeted accessors for hosts that do not need a full snapshot.

    pub async fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.inner
            .read()
            .await
            .run
            .nodes
            .iter()
            .find(|n| n.id == node_id)
            .map(|n| n.status)
    }

    pub async fn mode(&self) -> RunMode {
        self.inner.read().await.run.mode
    }

    pub async fn connected(&self) -> bool {
        self.inner.read().await.run.connected
    }

    pub async fn active_approval(&self) -> Option<ApprovalRequest> {
        self.inner.read().await.run.active_approval.clone()
    }

    pub async fn events_len(&self) -> usize {
        self.inner.read().await.run.events.len()
    }

    pub async fn execution_id(&self) -> Option<String> {
        self.inner.read().await.run.execution_id.clone()
    }

    /// Epoch seconds of the newest logged event, for replay catch-up.
    pub async fn last_event_seconds(&self) -> Option<f64> {
        self.inner
            .read()
            .await
            .run
            .events
            .last()
            .map(|e| e.timestamp.timestamp_millis() as f64 / 1000.0)
    }
}

impl Default for WorkflowStateStore {
    fn default() -> Self {
        Self::new(4_096)
    }
}
