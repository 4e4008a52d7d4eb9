//! Wire frame decoding.
//!
//! The channel wraps every event in a two-layer envelope: the outer JSON
//! object carries the event type and an epoch-seconds timestamp, and its
//! `data` field is itself a JSON-encoded string that must be parsed a second
//! time to obtain the inner payload.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use thiserror::Error;

use super::ExecutionEvent;

/// Outer wire envelope, one per frame.
#[derive(Debug, Clone, Deserialize)]
pub struct WireEnvelope {
    /// Dot-separated event type, e.g. `node.started`.
    pub event_type: String,

    /// Inner payload, JSON-encoded a second time.
    #[serde(default)]
    pub data: String,

    /// Epoch seconds as a string, possibly fractional.
    pub timestamp: String,
}

/// Frame decoding failures. The stream client logs and drops these; they
/// never tear the channel down.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed envelope: {0}")]
    Envelope(String),

    #[error("Malformed inner payload: {0}")]
    Payload(String),

    #[error("Unparseable timestamp: {0}")]
    Timestamp(String),
}

/// Decode a raw text frame into an [`ExecutionEvent`].
pub fn decode_frame(raw: &str) -> Result<ExecutionEvent, DecodeError> {
    let envelope: WireEnvelope =
        serde_json::from_str(raw).map_err(|e| DecodeError::Envelope(e.to_string()))?;
    decode_envelope(envelope)
}

/// Decode an already-parsed envelope.
pub fn decode_envelope(envelope: WireEnvelope) -> Result<ExecutionEvent, DecodeError> {
    // An absent data field decodes as an empty payload.
    let inner: serde_json::Value = if envelope.data.is_empty() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_str(&envelope.data).map_err(|e| DecodeError::Payload(e.to_string()))?
    };

    let timestamp = parse_epoch_seconds(&envelope.timestamp)?;

    Ok(ExecutionEvent::from_parts(
        &envelope.event_type,
        timestamp,
        inner,
    ))
}

/// Normalize an epoch-seconds string (possibly fractional) to UTC.
pub fn parse_epoch_seconds(raw: &str) -> Result<DateTime<Utc>, DecodeError> {
    let seconds: f64 = raw
        .trim()
        .parse()
        .map_err(|_| DecodeError::Timestamp(raw.to_string()))?;
    epoch_seconds_to_utc(seconds).ok_or_else(|| DecodeError::Timestamp(raw.to_string()))
}

/// Convert fractional epoch seconds to UTC, rejecting out-of-range values.
pub fn epoch_seconds_to_utc(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    Utc.timestamp_millis_opt((seconds * 1000.0) as i64).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    #[test]
    fn test_decode_node_started_frame() {
        let raw = r#"{"event_type":"node.started","data":"{\"node_id\":\"n1\",\"execution_id\":\"exec-1\",\"workflow_id\":\"wf-1\"}","timestamp":"100"}"#;

        let event = decode_frame(raw).unwrap();
        assert_eq!(event.kind, EventKind::NodeStarted);
        assert_eq!(event.node_id.as_deref(), Some("n1"));
        assert_eq!(event.execution_id, "exec-1");
        assert_eq!(event.workflow_id, "wf-1");
        assert_eq!(event.timestamp.timestamp(), 100);
        assert_eq!(event.error, None);
    }

    #[test]
    fn test_decode_selects_result_on_success() {
        let raw = r#"{"event_type":"node.completed","data":"{\"node_id\":\"n1\",\"execution_id\":\"exec-1\",\"result\":{\"ok\":true}}","timestamp":"105"}"#;

        let event = decode_frame(raw).unwrap();
        assert_eq!(event.kind, EventKind::NodeCompleted);
        assert_eq!(event.data, serde_json::json!({"ok": true}));
    }

    #[test]
    fn test_decode_selects_error_on_failure() {
        let raw = r#"{"event_type":"node.failed","data":"{\"node_id\":\"n1\",\"execution_id\":\"exec-1\",\"error\":\"boom\"}","timestamp":"105"}"#;

        let event = decode_frame(raw).unwrap();
        assert_eq!(event.kind, EventKind::NodeFailed);
        assert_eq!(event.data, serde_json::json!("boom"));
        assert_eq!(event.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_decode_keeps_whole_payload_as_fallback() {
        let raw = r#"{"event_type":"ui.approval.requested","data":"{\"node_id\":\"n2\",\"execution_id\":\"exec-1\",\"approval_id\":\"apr-1\",\"title\":\"Ship it?\"}","timestamp":"103.5"}"#;

        let event = decode_frame(raw).unwrap();
        assert_eq!(event.kind, EventKind::ApprovalRequested);
        assert_eq!(event.data["approval_id"], "apr-1");
        assert_eq!(event.data["title"], "Ship it?");
        assert_eq!(event.timestamp.timestamp_millis(), 103_500);
    }

    #[test]
    fn test_decode_empty_data_field() {
        let raw = r#"{"event_type":"workflow.completed","data":"","timestamp":"106"}"#;

        let event = decode_frame(raw).unwrap();
        assert_eq!(event.kind, EventKind::WorkflowCompleted);
        assert_eq!(event.execution_id, "");
        assert_eq!(event.data, serde_json::json!({}));
    }

    #[test]
    fn test_decode_rejects_malformed_envelope() {
        let err = decode_frame("not json").unwrap_err();
        assert!(matches!(err, DecodeError::Envelope(_)));
    }

    #[test]
    fn test_decode_rejects_malformed_inner_payload() {
        let raw = r#"{"event_type":"node.started","data":"{broken","timestamp":"100"}"#;
        let err = decode_frame(raw).unwrap_err();
        assert!(matches!(err, DecodeError::Payload(_)));
    }

    #[test]
    fn test_decode_rejects_bad_timestamp() {
        let raw = r#"{"event_type":"node.started","data":"{}","timestamp":"later"}"#;
        let err = decode_frame(raw).unwrap_err();
        assert!(matches!(err, DecodeError::Timestamp(_)));
    }
}
