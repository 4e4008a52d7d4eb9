//! Live event channel lifecycle.

mod client;

pub use client::{backoff_delay, EventStreamClient};

/// Transient connectivity of the live channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}
