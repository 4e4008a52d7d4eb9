//! Control plane HTTP client.
//!
//! The engine commands the backend over plain HTTP; the live channel is
//! receive-only. Approval resolution, run starts, definition fetches and
//! event replay all go through here.

use std::time::Duration;

use serde::Deserialize;

use crate::approval::{ApprovalCommand, ApprovalOutcome};
use crate::error::{SyncError, SyncResult};
use crate::event::{DecodeError, ExecutionEvent};
use crate::store::{WorkflowEdge, WorkflowNode};

/// Response to a run-start request.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionResponse {
    pub execution_id: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// The definition subset the store tracks.
#[derive(Debug, Clone, Default)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<WorkflowEdge>,
}

/// One event returned by the replay endpoint.
///
/// Replay differs from the live wire shape: the inner payload arrives
/// already parsed and the timestamp is a float.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayEvent {
    pub event_type: String,
    pub timestamp: f64,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ReplayEvent {
    /// Convert to the canonical event representation. The dedup key comes
    /// out identical to the one a live frame with the same fields derives.
    pub fn into_event(self) -> Result<ExecutionEvent, DecodeError> {
        let timestamp = crate::event::epoch_seconds_to_utc(self.timestamp)
            .ok_or_else(|| DecodeError::Timestamp(self.timestamp.to_string()))?;
        Ok(ExecutionEvent::from_parts(
            &self.event_type,
            timestamp,
            self.data,
        ))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ReplayResponse {
    #[serde(default)]
    events: Vec<ReplayEvent>,
}

#[derive(Debug, Clone, Deserialize)]
struct WorkflowResource {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    definition: DefinitionResource,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct DefinitionResource {
    #[serde(default)]
    nodes: Vec<NodeResource>,
    #[serde(default)]
    edges: Vec<WorkflowEdge>,
}

/// Canvas node as the backend stores it; only the fields the engine needs.
#[derive(Debug, Clone, Deserialize)]
struct NodeResource {
    id: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl NodeResource {
    fn into_node(self) -> WorkflowNode {
        let label = self
            .data
            .get("label")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(&self.id)
            .to_string();
        WorkflowNode::new(self.id, label, self.kind)
    }
}

/// HTTP client for the control plane API.
#[derive(Clone)]
pub struct ControlPlaneClient {
    http: reqwest::Client,
    base_url: String,
}

impl ControlPlaneClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Start a run of a workflow definition.
    /// POST /workflows/{id}/execute
    pub async fn start_run(
        &self,
        workflow_id: &str,
        input: serde_json::Value,
    ) -> SyncResult<ExecutionResponse> {
        let url = format!("{}/workflows/{}/execute", self.base_url, workflow_id);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "input_data": input }))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(SyncError::CommandRejected {
                status: status.as_u16(),
                message: body,
            });
        }

        Ok(serde_json::from_str(&body)?)
    }

    /// Fetch a workflow definition.
    /// GET /workflows/{id}
    pub async fn fetch_workflow(&self, workflow_id: &str) -> SyncResult<WorkflowDefinition> {
        let url = format!("{}/workflows/{}", self.base_url, workflow_id);
        let response = self.http.get(&url).send().await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(SyncError::CommandRejected {
                status: status.as_u16(),
                message: body,
            });
        }

        let resource: WorkflowResource = serde_json::from_str(&body)?;
        Ok(WorkflowDefinition {
            id: resource.id,
            name: resource.name,
            nodes: resource
                .definition
                .nodes
                .into_iter()
                .map(NodeResource::into_node)
                .collect(),
            edges: resource.definition.edges,
        })
    }

    /// Fetch a status snapshot of a run.
    /// GET /executions/{id}
    pub async fn fetch_execution(&self, execution_id: &str) -> SyncResult<serde_json::Value> {
        let url = format!("{}/executions/{}", self.base_url, execution_id);
        let response = self.http.get(&url).send().await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(SyncError::CommandRejected {
                status: status.as_u16(),
                message: body,
            });
        }

        Ok(serde_json::from_str(&body)?)
    }

    /// Replay persisted events of a run, optionally from a point in time.
    /// GET /events/replay/execution/{id}
    pub async fn replay_events(
        &self,
        execution_id: &str,
        from_timestamp: Option<f64>,
    ) -> SyncResult<Vec<ReplayEvent>> {
        let url = format!("{}/events/replay/execution/{}", self.base_url, execution_id);
        let mut request = self.http.get(&url);
        if let Some(from) = from_timestamp {
            request = request.query(&[("from_timestamp", from)]);
        }
        let response = request.send().await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(SyncError::CommandRejected {
                status: status.as_u16(),
                message: body,
            });
        }

        let parsed: ReplayResponse = serde_json::from_str(&body)?;
        Ok(parsed.events)
    }

    /// Resolve the pending approval of a run.
    /// POST /approvals/{execution_id}/approve
    pub async fn resolve_approval(
        &self,
        execution_id: &str,
        command: &ApprovalCommand,
    ) -> SyncResult<ApprovalOutcome> {
        let url = format!("{}/approvals/{}/approve", self.base_url, execution_id);
        let response = self.http.post(&url).json(command).send().await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(SyncError::CommandRejected {
                status: status.as_u16(),
                message: body,
            });
        }

        Ok(serde_json::from_str(&body)?)
    }
}
