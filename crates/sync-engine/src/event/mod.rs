//! Execution events observed on the live channel.
//!
//! The channel delivers raw envelopes; [`decode_frame`] turns them into
//! [`ExecutionEvent`] values with a closed [`EventKind`] classification, so
//! downstream code matches exhaustively instead of probing optional fields.

mod decoder;
mod dedup;

pub use decoder::{decode_envelope, decode_frame, epoch_seconds_to_utc, DecodeError, WireEnvelope};
pub use dedup::Deduplicator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of a wire event type.
///
/// Node-scoped kinds are classified by the dot-separated type's suffix, so
/// `node.started`, `timer.started` and `fork.started` all count as
/// [`EventKind::NodeStarted`]. Types the engine has no reaction to land in
/// [`EventKind::Other`] and only appear in the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    ApprovalRequested,
    ApprovalGranted,
    ApprovalDenied,
    WorkflowCompleted,
    WorkflowFailed,
    /// Audit-only event type (e.g. `meta.observation`).
    Other(String),
}

impl EventKind {
    /// Classify a raw dot-separated event type.
    pub fn classify(event_type: &str) -> Self {
        match event_type {
            "workflow.completed" => return EventKind::WorkflowCompleted,
            "workflow.failed" => return EventKind::WorkflowFailed,
            _ => {}
        }

        // The approval activity emits both `approval.requested` and the
        // UI-addressed `ui.approval.requested` variant.
        if event_type.ends_with("approval.requested") {
            return EventKind::ApprovalRequested;
        }
        if event_type.ends_with("approval.granted") {
            return EventKind::ApprovalGranted;
        }
        if event_type.ends_with("approval.denied") {
            return EventKind::ApprovalDenied;
        }

        let suffix = event_type.rsplit('.').next().unwrap_or(event_type);
        match suffix {
            "started" => EventKind::NodeStarted,
            "completed" => EventKind::NodeCompleted,
            "failed" => EventKind::NodeFailed,
            _ => EventKind::Other(event_type.to_string()),
        }
    }

    /// True for the two run-terminal kinds.
    pub fn is_workflow_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::WorkflowCompleted | EventKind::WorkflowFailed
        )
    }
}

/// One observed fact about a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Dedup key, derived from execution, node, type and timestamp.
    pub id: String,

    /// Workflow definition the run belongs to.
    pub workflow_id: String,

    /// The specific run.
    pub execution_id: String,

    /// Absent for workflow-scoped events.
    pub node_id: Option<String>,

    /// Raw dot-separated wire type, kept for the timeline display.
    pub event_type: String,

    /// Closed classification of `event_type`.
    pub kind: EventKind,

    /// When the event was produced. Not necessarily monotonic relative to
    /// arrival order.
    pub timestamp: DateTime<Utc>,

    /// Result on success shapes, error detail on failure shapes, otherwise
    /// the whole inner payload.
    pub data: serde_json::Value,

    /// Explicit error string, present only on failure events.
    pub error: Option<String>,
}

impl ExecutionEvent {
    /// Build an event from already-parsed envelope parts.
    ///
    /// Both the live frame path and the HTTP replay path funnel through
    /// here, so a replayed event derives the same dedup key as its live
    /// twin.
    pub fn from_parts(
        event_type: &str,
        timestamp: DateTime<Utc>,
        inner: serde_json::Value,
    ) -> Self {
        let kind = EventKind::classify(event_type);

        let str_field = |name: &str| {
            inner
                .get(name)
                .and_then(serde_json::Value::as_str)
                .map(str::to_owned)
        };

        let workflow_id = str_field("workflow_id").unwrap_or_default();
        let execution_id = str_field("execution_id").unwrap_or_default();
        let node_id = str_field("node_id");
        let error = str_field("error");

        let id = format!(
            "{}-{}-{}-{}",
            execution_id,
            node_id.as_deref().unwrap_or("workflow"),
            event_type,
            timestamp.timestamp_millis()
        );

        // Result on success, error detail on failure, whole payload as the
        // fallback context.
        let data = if let Some(result) = inner.get("result") {
            result.clone()
        } else if let Some(err) = inner.get("error") {
            err.clone()
        } else {
            inner
        };

        Self {
            id,
            workflow_id,
            execution_id,
            node_id,
            event_type: event_type.to_string(),
            kind,
            timestamp,
            data,
            error,
        }
    }
}
