//! # Replay Guard
//!
//! Per-session defense against replayed and reordered envelopes. Three
//! independent checks run in order against every inbound envelope:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      REPLAY GUARD PIPELINE                      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  inbound envelope                                               │
//! │        │                                                        │
//! │        ▼                                                        │
//! │  1. Timestamp window    |now - ts| <= 2 min   ──► STALE_TIMESTAMP│
//! │        │                                                        │
//! │        ▼                                                        │
//! │  2. Sequence check      seq > last_seq        ──► NON_MONOTONIC  │
//! │        │                (gaps allowed)             _SEQ          │
//! │        ▼                                                        │
//! │  3. Nonce cache         nonce unseen          ──► DUPLICATE_NONCE│
//! │        │                (bounded FIFO)                           │
//! │        ▼                                                        │
//! │    accept + commit      state mutates only on acceptance        │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The guard survives key rotation: a rotated session keeps its window so
//! pre-rotation envelopes cannot be replayed after the re-key.

use std::collections::{HashSet, VecDeque};

use crate::envelope::MessageEnvelope;

/// Maximum tolerated clock skew between peers, in milliseconds.
pub const TIMESTAMP_SKEW_MS: i64 = 2 * 60 * 1000;

/// Maximum number of nonces remembered per session.
pub const NONCE_CACHE_CAPACITY: usize = 1024;

/// Why the replay guard rejected an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Timestamp outside the ±2 minute acceptance window
    StaleTimestamp,
    /// Sequence number not strictly greater than the last accepted one
    NonMonotonicSeq,
    /// Nonce already seen within the cache window
    DuplicateNonce,
}

impl RejectReason {
    /// Machine-readable reason string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StaleTimestamp => "STALE_TIMESTAMP",
            Self::NonMonotonicSeq => "NON_MONOTONIC_SEQ",
            Self::DuplicateNonce => "DUPLICATE_NONCE",
        }
    }
}

/// Per-session replay window tracking the peer's inbound stream.
#[derive(Debug)]
pub struct ReplayWindow {
    /// Highest accepted sequence number (0 = none accepted yet)
    last_seq: u64,
    /// Timestamp of the last accepted envelope
    last_timestamp: i64,
    /// Nonces seen within the cache window
    seen: HashSet<String>,
    /// Insertion order for FIFO eviction
    order: VecDeque<String>,
    /// Cache capacity
    capacity: usize,
}

impl ReplayWindow {
    /// Create an empty window with the default nonce capacity.
    pub fn new() -> Self {
        Self::with_capacity(NONCE_CACHE_CAPACITY)
    }

    /// Create an empty window with a custom nonce capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            last_seq: 0,
            last_timestamp: 0,
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Highest sequence number accepted so far.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Validate an inbound envelope and, if it passes every check, commit
    /// it to the window. Rejected envelopes leave the window untouched.
    pub fn accept(&mut self, envelope: &MessageEnvelope, now_ms: i64) -> Result<(), RejectReason> {
        if (now_ms - envelope.timestamp).abs() > TIMESTAMP_SKEW_MS {
            return Err(RejectReason::StaleTimestamp);
        }

        if envelope.seq <= self.last_seq {
            return Err(RejectReason::NonMonotonicSeq);
        }

        if let Some(nonce) = &envelope.nonce {
            if self.seen.contains(nonce) {
                return Err(RejectReason::DuplicateNonce);
            }
        }

        // All checks passed, commit
        self.last_seq = envelope.seq;
        self.last_timestamp = envelope.timestamp;
        if let Some(nonce) = &envelope.nonce {
            self.remember(nonce.clone());
        }
        Ok(())
    }

    fn remember(&mut self, nonce: String) {
        if self.seen.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.seen.insert(nonce.clone());
        self.order.push_back(nonce);
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeType;

    const NOW: i64 = 1_700_000_000_000;

    fn envelope(seq: u64, timestamp: i64, nonce: &str) -> MessageEnvelope {
        MessageEnvelope {
            envelope_type: EnvelopeType::Msg,
            session_id: "s".into(),
            sender: "alice".into(),
            receiver: "bob".into(),
            ciphertext: String::new(),
            iv: String::new(),
            auth_tag: String::new(),
            timestamp,
            seq,
            nonce: Some(nonce.into()),
            chunk: None,
        }
    }

    #[test]
    fn test_accepts_fresh_envelope() {
        let mut window = ReplayWindow::new();
        assert!(window.accept(&envelope(1, NOW, "n1"), NOW).is_ok());
        assert_eq!(window.last_seq(), 1);
    }

    #[test]
    fn test_rejects_stale_timestamp() {
        let mut window = ReplayWindow::new();
        let old = envelope(1, NOW - TIMESTAMP_SKEW_MS - 1, "n1");
        assert_eq!(window.accept(&old, NOW), Err(RejectReason::StaleTimestamp));

        let future = envelope(1, NOW + TIMESTAMP_SKEW_MS + 1, "n1");
        assert_eq!(
            window.accept(&future, NOW),
            Err(RejectReason::StaleTimestamp)
        );
    }

    #[test]
    fn test_accepts_edge_of_skew_window() {
        let mut window = ReplayWindow::new();
        let edge = envelope(1, NOW - TIMESTAMP_SKEW_MS, "n1");
        assert!(window.accept(&edge, NOW).is_ok());
    }

    #[test]
    fn test_rejects_replayed_seq() {
        let mut window = ReplayWindow::new();
        window.accept(&envelope(5, NOW, "n1"), NOW).unwrap();

        assert_eq!(
            window.accept(&envelope(5, NOW, "n2"), NOW),
            Err(RejectReason::NonMonotonicSeq)
        );
        assert_eq!(
            window.accept(&envelope(3, NOW, "n3"), NOW),
            Err(RejectReason::NonMonotonicSeq)
        );
    }

    #[test]
    fn test_allows_sequence_gaps() {
        let mut window = ReplayWindow::new();
        window.accept(&envelope(1, NOW, "n1"), NOW).unwrap();
        assert!(window.accept(&envelope(10, NOW, "n2"), NOW).is_ok());
        assert_eq!(window.last_seq(), 10);
    }

    #[test]
    fn test_rejects_duplicate_nonce() {
        let mut window = ReplayWindow::new();
        window.accept(&envelope(1, NOW, "n1"), NOW).unwrap();
        assert_eq!(
            window.accept(&envelope(2, NOW, "n1"), NOW),
            Err(RejectReason::DuplicateNonce)
        );
    }

    #[test]
    fn test_rejection_leaves_window_untouched() {
        let mut window = ReplayWindow::new();
        window.accept(&envelope(5, NOW, "n1"), NOW).unwrap();

        // Fails the nonce check, so seq must not advance
        let _ = window.accept(&envelope(9, NOW, "n1"), NOW);
        assert_eq!(window.last_seq(), 5);

        // seq 6 still usable
        assert!(window.accept(&envelope(6, NOW, "n2"), NOW).is_ok());
    }

    #[test]
    fn test_nonce_cache_evicts_fifo() {
        let mut window = ReplayWindow::with_capacity(2);
        window.accept(&envelope(1, NOW, "n1"), NOW).unwrap();
        window.accept(&envelope(2, NOW, "n2"), NOW).unwrap();
        window.accept(&envelope(3, NOW, "n3"), NOW).unwrap();

        // n1 was evicted, only n2/n3 remain
        assert!(!window.seen.contains("n1"));
        assert!(window.seen.contains("n2"));
        assert!(window.seen.contains("n3"));
        assert_eq!(window.order.len(), 2);
    }

    #[test]
    fn test_envelope_without_nonce_skips_cache() {
        let mut window = ReplayWindow::new();
        let mut env = envelope(1, NOW, "unused");
        env.nonce = None;
        assert!(window.accept(&env, NOW).is_ok());
        assert!(window.seen.is_empty());
    }
}
