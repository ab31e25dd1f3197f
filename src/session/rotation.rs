//! # Key Rotation Policy
//!
//! Decides when an established session should re-key. Rotation runs the
//! normal signed key exchange again; the replay window carries over so a
//! re-key never reopens old sequence numbers.

use crate::session::state::{SessionPhase, SessionState};

/// Default message count before a re-key is due.
pub const DEFAULT_MAX_MESSAGES: u64 = 1000;

/// Default key age before a re-key is due (1 hour).
pub const DEFAULT_MAX_AGE_MS: i64 = 60 * 60 * 1000;

/// Thresholds that make a session key due for rotation.
#[derive(Debug, Clone, Copy)]
pub struct RotationPolicy {
    /// Re-key after this many messages sent under the current key
    pub max_messages: u64,
    /// Re-key after the current key is this old, in milliseconds
    pub max_age_ms: i64,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            max_age_ms: DEFAULT_MAX_AGE_MS,
        }
    }
}

impl RotationPolicy {
    /// Whether the session's current key is due for rotation. Only
    /// established sessions rotate; a session already mid-rotation is
    /// not due again.
    pub fn should_rotate(&self, state: &SessionState, now_ms: i64) -> bool {
        if !matches!(state.phase, SessionPhase::Established) {
            return false;
        }
        if state.messages_sent >= self.max_messages {
            return true;
        }
        match state.established_at {
            Some(at) => now_ms - at >= self.max_age_ms,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{IdentityKeyPair, SessionKey};

    fn established_state(now_ms: i64) -> SessionState {
        let mut state =
            SessionState::new("alice", "bob", IdentityKeyPair::generate().public());
        state.install_key(SessionKey::from_bytes([1u8; 32]), now_ms);
        state
    }

    #[test]
    fn test_fresh_key_is_not_due() {
        let policy = RotationPolicy::default();
        let state = established_state(1000);
        assert!(!policy.should_rotate(&state, 1001));
    }

    #[test]
    fn test_message_count_triggers_rotation() {
        let policy = RotationPolicy::default();
        let mut state = established_state(1000);
        state.messages_sent = DEFAULT_MAX_MESSAGES;
        assert!(policy.should_rotate(&state, 1001));
    }

    #[test]
    fn test_key_age_triggers_rotation() {
        let policy = RotationPolicy::default();
        let state = established_state(1000);
        assert!(policy.should_rotate(&state, 1000 + DEFAULT_MAX_AGE_MS));
    }

    #[test]
    fn test_idle_session_never_rotates() {
        let policy = RotationPolicy::default();
        let state = SessionState::new("alice", "bob", IdentityKeyPair::generate().public());
        assert!(!policy.should_rotate(&state, i64::MAX));
    }
}
