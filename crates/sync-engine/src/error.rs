//! Error types for the sync engine.
//!
//! Decode failures and single transport hiccups are absorbed inside the
//! engine (logged and dropped); only errors that affect correctness, such as
//! an exhausted reconnect budget or a rejected approval command, reach the
//! caller.

use thiserror::Error;

use crate::event::DecodeError;

/// Engine-level errors.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Malformed wire frame. Recovered locally, never fatal for the channel.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Socket-level failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The reconnect budget is spent; the run view is stale until reopened.
    #[error("Connection lost after {attempts} reconnect attempts")]
    MaxReconnectExceeded { attempts: u32 },

    /// An approval was resolved with no request pending.
    #[error("No approval request is pending")]
    NoActiveApproval,

    /// The control plane declined an approval command.
    #[error("Approval command rejected ({status}): {message}")]
    CommandRejected { status: u16, message: String },

    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias using SyncError.
pub type SyncResult<T> = Result<T, SyncError>;
