//! Flowdeck sync engine
//!
//! Keeps a client-side view of one workflow run consistent with the event
//! stream the control plane emits.
//!
//! This crate provides:
//! - WebSocket event stream client with bounded reconnect and replay catch-up
//! - Wire envelope decoder for the doubly-encoded event payload
//! - Duplicate-event filter for at-least-once delivery
//! - Per-node status state machine
//! - Human-approval gate with out-of-band HTTP resolution
//! - The run state store view layers observe

pub mod approval;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod status;
pub mod store;
pub mod stream;

pub use approval::{ApprovalDecision, ApprovalGate, ApprovalRequest};
pub use client::ControlPlaneClient;
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use event::{EventKind, ExecutionEvent};
pub use status::{NodeStatus, RunMode};
pub use store::{WorkflowEdge, WorkflowNode, WorkflowStateStore};
pub use stream::{ConnectionState, EventStreamClient};
