//! HTTP client for the workflow control plane.

mod api;

pub use api::{
    ControlPlaneClient, ExecutionResponse, ReplayEvent, WorkflowDefinition,
};
