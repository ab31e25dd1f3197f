//! # Session State
//!
//! Per-peer session lifecycle:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     SESSION STATE MACHINE                       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │   Idle ──initiate──► AwaitingResponse ──complete──► Established │
//! │    ▲                        │                           │       │
//! │    └──────bad signature─────┘              rotate       │       │
//! │                                               │         │       │
//! │                                               ▼         │       │
//! │                                           Rotating ─────┘       │
//! │                                        (complete re-keys)       │
//! │                                                                 │
//! │   any state ──close──► Closed (key material dropped)            │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A pending ephemeral secret lives inside the phase itself, so leaving
//! `AwaitingResponse` or `Rotating` drops it by construction.

use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::crypto::{EphemeralKeyPair, IdentityPublicKey, SessionKey, KEY_SIZE};
use crate::session::replay::ReplayWindow;
use crate::time::now_timestamp_millis;

/// Where a session is in its lifecycle. Phases that wait on a peer
/// response carry the pending ephemeral secret.
pub enum SessionPhase {
    /// No key exchange in progress
    Idle,
    /// We sent KEP_INIT and hold the ephemeral secret until the response
    AwaitingResponse {
        /// Our pending ephemeral key pair
        ephemeral: EphemeralKeyPair,
    },
    /// Session key derived, messages flow
    Established,
    /// Established session re-keying; old key stays usable until complete
    Rotating {
        /// Our pending ephemeral key pair for the new key
        ephemeral: EphemeralKeyPair,
    },
    /// Terminated, key material dropped
    Closed,
}

impl SessionPhase {
    /// Phase name for logging and errors
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingResponse { .. } => "awaiting_response",
            Self::Established => "established",
            Self::Rotating { .. } => "rotating",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Debug for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never debug-print the ephemeral secret
        f.write_str(self.name())
    }
}

/// Full state for one peer session.
pub struct SessionState {
    /// Deterministic session identifier
    pub session_id: String,
    /// Our user id
    pub local_id: String,
    /// Peer user id
    pub peer_id: String,
    /// Peer's verified identity key
    pub peer_identity: IdentityPublicKey,
    /// Current lifecycle phase
    pub phase: SessionPhase,
    /// Active session key, present only while established or rotating
    pub session_key: Option<SessionKey>,
    /// Inbound replay guard, survives rotation
    pub replay: ReplayWindow,
    /// Peer ephemeral keys already consumed by an accepted handshake.
    /// A fresh handshake always announces a new random key, so a
    /// repeat here is a verbatim replay. Survives rotation.
    seen_handshake_keys: HashSet<[u8; KEY_SIZE]>,
    /// When this state was created (epoch ms)
    pub created_at: i64,
    /// When the current key was established (epoch ms)
    pub established_at: Option<i64>,
    /// Messages sent under the current key
    pub messages_sent: u64,
    /// Next outbound sequence number
    pub next_seq: u64,
}

impl SessionState {
    /// Create a fresh idle session with a peer.
    pub fn new(local_id: &str, peer_id: &str, peer_identity: IdentityPublicKey) -> Self {
        Self {
            session_id: session_id_for(local_id, peer_id),
            local_id: local_id.to_string(),
            peer_id: peer_id.to_string(),
            peer_identity,
            phase: SessionPhase::Idle,
            session_key: None,
            replay: ReplayWindow::new(),
            seen_handshake_keys: HashSet::new(),
            created_at: now_timestamp_millis(),
            established_at: None,
            messages_sent: 0,
            next_seq: 1,
        }
    }

    /// Whether a session key is currently usable.
    pub fn is_established(&self) -> bool {
        matches!(
            self.phase,
            SessionPhase::Established | SessionPhase::Rotating { .. }
        ) && self.session_key.is_some()
    }

    /// Install a freshly derived session key and mark the session
    /// established. The replay window is deliberately left alone so a
    /// rotation cannot reopen it.
    pub fn install_key(&mut self, key: SessionKey, now_ms: i64) {
        self.session_key = Some(key);
        self.phase = SessionPhase::Established;
        self.established_at = Some(now_ms);
        self.messages_sent = 0;
    }

    /// Whether an accepted handshake already consumed this ephemeral key.
    pub fn handshake_key_seen(&self, key: &[u8; KEY_SIZE]) -> bool {
        self.seen_handshake_keys.contains(key)
    }

    /// Record a peer ephemeral key consumed by an accepted handshake.
    pub fn note_handshake_key(&mut self, key: [u8; KEY_SIZE]) {
        self.seen_handshake_keys.insert(key);
    }

    /// Claim the next outbound sequence number.
    pub fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Drop all key material and terminate the session.
    pub fn close(&mut self) {
        self.session_key = None;
        self.phase = SessionPhase::Closed;
    }
}

/// Deterministic session id from the unordered user-id pair. Both peers
/// derive the same id without negotiation.
pub fn session_id_for(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(first.as_bytes());
    hasher.update(b"|");
    hasher.update(second.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

// ============================================================================
// TESTS
// ============================================================================
