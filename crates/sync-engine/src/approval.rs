//! Human-approval gate.
//!
//! At most one approval request is live per run. Requests are surfaced from
//! the event path; resolution is an out-of-band HTTP command. The command
//! response closes the modal optimistically, but the authoritative node
//! transition arrives later as a `granted`/`denied` event on the channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::ControlPlaneClient;
use crate::error::{SyncError, SyncResult};
use crate::event::{EventKind, ExecutionEvent};
use crate::store::WorkflowStateStore;

/// Direction of an approval resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

/// Lifecycle status of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// A pending human-approval gate for one node of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub execution_id: String,
    pub node_id: String,
    pub title: String,
    pub description: String,
    /// Arbitrary structured data shown to the approver.
    pub context: serde_json::Value,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
}

impl ApprovalRequest {
    /// Build a request from an `approval.requested` event's payload.
    ///
    /// Returns `None` for events of any other kind or ones that name no
    /// node.
    pub fn from_event(event: &ExecutionEvent) -> Option<Self> {
        if event.kind != EventKind::ApprovalRequested {
            return None;
        }
        let node_id = event.node_id.clone()?;
        let data = &event.data;

        let str_field = |name: &str, fallback: &str| {
            data.get(name)
                .and_then(serde_json::Value::as_str)
                .unwrap_or(fallback)
                .to_string()
        };

        Some(Self {
            id: str_field("approval_id", &event.id),
            execution_id: event.execution_id.clone(),
            node_id,
            title: str_field("title", "Approval required"),
            description: str_field("description", "Please review."),
            context: data
                .get("context")
                .cloned()
                .unwrap_or_else(|| serde_json::json!({})),
            status: ApprovalStatus::Pending,
            requested_at: event.timestamp,
        })
    }
}

/// Body of the approval resolution command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalCommand {
    pub action: ApprovalDecision,
    pub approver: String,
    pub comment: String,
}

/// Control plane response to an approval resolution.
#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalOutcome {
    pub status: ApprovalStatus,
    #[serde(default)]
    pub execution_id: Option<String>,
}

/// Resolves the store's active approval against the control plane.
#[derive(Clone)]
pub struct ApprovalGate {
    api: ControlPlaneClient,
    store: WorkflowStateStore,
}

impl ApprovalGate {
    pub fn new(api: ControlPlaneClient, store: WorkflowStateStore) -> Self {
        Self { api, store }
    }

    /// Surface a request, replacing any pending one, and mark the target
    /// node as waiting.
    ///
    /// The event path normally does this on `approval.requested`; hosts call
    /// it directly when they learn about a pending gate some other way
    /// (e.g. a pending-approvals fetch on page load).
    pub async fn request(&self, request: ApprovalRequest) {
        if let Some(pending) = self.store.active_approval().await {
            if pending.id != request.id {
                tracing::warn!(
                    pending_id = %pending.id,
                    replacement_id = %request.id,
                    "Approval requested while another is pending, replacing"
                );
            }
        }
        self.store
            .set_node_status(&request.node_id, crate::status::NodeStatus::WaitingApproval)
            .await;
        self.store.set_approval(request).await;
    }

    /// Resolve the pending request.
    ///
    /// Fails with [`SyncError::NoActiveApproval`] when nothing is pending
    /// and with [`SyncError::CommandRejected`] when the control plane
    /// declines (e.g. already resolved by another actor); in the rejected
    /// case the request stays active so the caller can retry or refresh.
    pub async fn resolve(
        &self,
        decision: ApprovalDecision,
        approver: &str,
        comment: &str,
    ) -> SyncResult<ApprovalOutcome> {
        let pending = self
            .store
            .active_approval()
            .await
            .ok_or(SyncError::NoActiveApproval)?;

        let command = ApprovalCommand {
            action: decision,
            approver: approver.to_string(),
            comment: comment.to_string(),
        };

        let outcome = self
            .api
            .resolve_approval(&pending.execution_id, &command)
            .await?;

        match outcome.status {
            ApprovalStatus::Pending => {
                // Multi-approver gate still waiting for more responses; the
                // request stays live.
                tracing::info!(
                    approval_id = %pending.id,
                    "Approval recorded, waiting for more approvers"
                );
            }
            status => {
                tracing::info!(
                    approval_id = %pending.id,
                    node_id = %pending.node_id,
                    status = ?status,
                    "Approval resolved"
                );
                self.store.clear_approval().await;
            }
        }

        Ok(outcome)
    }
}
