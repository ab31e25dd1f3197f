//! # Protocol Events
//!
//! Structured notifications emitted at security-relevant protocol
//! transitions. The default sink forwards to `tracing`; embedders can
//! supply their own sink to surface events in a UI or audit log.
//!
//! Event payloads carry identifiers and reasons only. Plaintext and key
//! material never appear in an event.

use serde::{Deserialize, Serialize};

/// Well-known event type strings
pub mod event_type {
    /// Outbound handshake created
    pub const HANDSHAKE_INITIATED: &str = "handshake_initiated";
    /// Handshake verified and session key derived
    pub const HANDSHAKE_ESTABLISHED: &str = "handshake_established";
    /// Handshake rejected (bad signature or unknown peer)
    pub const HANDSHAKE_REJECTED: &str = "handshake_rejected";
    /// Inbound envelope rejected by the replay guard
    pub const REPLAY_REJECTED: &str = "replay_rejected";
    /// Authentication tag verification failed
    pub const INTEGRITY_FAILURE: &str = "integrity_failure";
    /// Session re-keyed
    pub const SESSION_ROTATED: &str = "session_rotated";
    /// Session closed and key material dropped
    pub const SESSION_CLOSED: &str = "session_closed";
    /// Identity key encrypted and persisted
    pub const KEY_STORED: &str = "key_stored";
    /// Identity key decrypted from storage
    pub const KEY_LOADED: &str = "key_loaded";
}

/// A security-relevant protocol transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolEvent {
    /// Event type (see [`event_type`])
    pub event_type: String,
    /// Session this event belongs to, when applicable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// User this event concerns, when applicable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Machine-readable reason for rejections
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ProtocolEvent {
    /// Build an event with just a type
    pub fn new(event_type: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            session_id: None,
            user_id: None,
            reason: None,
        }
    }

    /// Attach a session id
    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    /// Attach a user id
    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    /// Attach a rejection reason
    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }
}

/// Receiver for protocol events.
pub trait EventSink: Send + Sync {
    /// Record a single event. Must not block.
    fn record(&self, event: ProtocolEvent);
}

/// Default sink that logs events through `tracing`.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: ProtocolEvent) {
        tracing::info!(
            event_type = %event.event_type,
            session_id = event.session_id.as_deref(),
            user_id = event.user_id.as_deref(),
            reason = event.reason.as_deref(),
            "protocol event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Test sink that collects events for assertions
    pub struct CollectingSink(pub Mutex<Vec<ProtocolEvent>>);

    impl EventSink for CollectingSink {
        fn record(&self, event: ProtocolEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn test_builder_attaches_fields() {
        let event = ProtocolEvent::new(event_type::REPLAY_REJECTED)
            .with_session("s1")
            .with_user("alice")
            .with_reason("STALE_TIMESTAMP");

        assert_eq!(event.event_type, "replay_rejected");
        assert_eq!(event.session_id.as_deref(), Some("s1"));
        assert_eq!(event.user_id.as_deref(), Some("alice"));
        assert_eq!(event.reason.as_deref(), Some("STALE_TIMESTAMP"));
    }

    #[test]
    fn test_collecting_sink_records() {
        let sink = CollectingSink(Mutex::new(Vec::new()));
        sink.record(ProtocolEvent::new(event_type::SESSION_CLOSED));
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_serialization_omits_empty_fields() {
        let json =
            serde_json::to_string(&ProtocolEvent::new(event_type::KEY_STORED)).unwrap();
        assert!(!json.contains("session_id"));
        assert!(!json.contains("reason"));
    }
}
