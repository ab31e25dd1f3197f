//! # Signed Key Exchange
//!
//! Ephemeral key exchange messages authenticated by long-term identity
//! keys. Each handshake carries a fresh X25519 public key signed by the
//! sender's Ed25519 identity key, binding the ephemeral key to the
//! claimed sender and a timestamp:
//!
//! ```text
//!   signed payload = eph_pub (32 bytes) || sender_id || timestamp_be (8 bytes)
//! ```
//!
//! A relay that substitutes its own ephemeral key cannot produce a valid
//! signature, so verification fails and the exchange is aborted.

use serde::{Deserialize, Serialize};

use crate::crypto::{self, EphemeralKeyPair, IdentityKeyPair, IdentityPublicKey, Signature, KEY_SIZE};
use crate::time::now_timestamp_millis;

/// Signed ephemeral key exchange message (KEP_INIT / KEP_RESPONSE body).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeMessage {
    /// Claimed sender user id
    pub sender_id: String,
    /// Fresh X25519 public key
    #[serde(with = "eph_hex")]
    pub ephemeral_public_key: [u8; KEY_SIZE],
    /// Unix timestamp in milliseconds at signing time
    pub timestamp: i64,
    /// Ed25519 signature over `eph_pub || sender_id || timestamp`
    pub signature: Signature,
}

impl HandshakeMessage {
    /// Verify this handshake against the sender's known identity key.
    ///
    /// Returns `false` on any failure. The specific reason is logged but
    /// never surfaced to the remote peer.
    pub fn verify(&self, peer_identity: &IdentityPublicKey) -> bool {
        let payload = signing_payload(&self.ephemeral_public_key, &self.sender_id, self.timestamp);
        match crypto::verify(peer_identity, &payload, &self.signature) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(sender = %self.sender_id, error = %e, "handshake verification failed");
                false
            }
        }
    }
}

/// Generate a fresh ephemeral key pair and a signed handshake announcing it.
pub fn create_handshake(
    identity: &IdentityKeyPair,
    sender_id: &str,
) -> (EphemeralKeyPair, HandshakeMessage) {
    let ephemeral = EphemeralKeyPair::generate();
    let message = sign_handshake(identity, sender_id, ephemeral.public_bytes());
    (ephemeral, message)
}

/// Sign a handshake announcing an already-chosen ephemeral public key.
/// Used by the responder, whose ephemeral key must match the one it fed
/// into key agreement.
pub fn sign_handshake(
    identity: &IdentityKeyPair,
    sender_id: &str,
    ephemeral_public_key: [u8; KEY_SIZE],
) -> HandshakeMessage {
    sign_handshake_at(
        identity,
        sender_id,
        ephemeral_public_key,
        now_timestamp_millis(),
    )
}

/// Sign a handshake with an explicit timestamp. The receiver rejects
/// handshakes whose timestamp falls outside its freshness window.
pub fn sign_handshake_at(
    identity: &IdentityKeyPair,
    sender_id: &str,
    ephemeral_public_key: [u8; KEY_SIZE],
    timestamp: i64,
) -> HandshakeMessage {
    let payload = signing_payload(&ephemeral_public_key, sender_id, timestamp);
    let signature = identity.sign(&payload);

    HandshakeMessage {
        sender_id: sender_id.to_string(),
        ephemeral_public_key,
        timestamp,
        signature,
    }
}

fn signing_payload(eph_pub: &[u8; KEY_SIZE], sender_id: &str, timestamp: i64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(KEY_SIZE + sender_id.len() + 8);
    payload.extend_from_slice(eph_pub);
    payload.extend_from_slice(sender_id.as_bytes());
    payload.extend_from_slice(&timestamp.to_be_bytes());
    payload
}

/// Hex serialization for the ephemeral public key field
mod eph_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::crypto::KEY_SIZE;

    pub fn serialize<S: Serializer>(bytes: &[u8; KEY_SIZE], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; KEY_SIZE], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("ephemeral public key must be 32 bytes"))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_honest_handshake_verifies() {
        let identity = IdentityKeyPair::generate();
        let (_eph, message) = create_handshake(&identity, "alice");
        assert!(message.verify(&identity.public()));
    }

    #[test]
    fn test_substituted_ephemeral_key_fails() {
        let identity = IdentityKeyPair::generate();
        let (_eph, mut message) = create_handshake(&identity, "alice");

        // Relay swaps in its own ephemeral key
        let attacker = EphemeralKeyPair::generate();
        message.ephemeral_public_key = attacker.public_bytes();
        assert!(!message.verify(&identity.public()));
    }

    #[test]
    fn test_tampered_sender_id_fails() {
        let identity = IdentityKeyPair::generate();
        let (_eph, mut message) = create_handshake(&identity, "alice");
        message.sender_id = "mallory".into();
        assert!(!message.verify(&identity.public()));
    }

    #[test]
    fn test_tampered_timestamp_fails() {
        let identity = IdentityKeyPair::generate();
        let (_eph, mut message) = create_handshake(&identity, "alice");
        message.timestamp += 1;
        assert!(!message.verify(&identity.public()));
    }

    #[test]
    fn test_wrong_identity_key_fails() {
        let identity = IdentityKeyPair::generate();
        let other = IdentityKeyPair::generate();
        let (_eph, message) = create_handshake(&identity, "alice");
        assert!(!message.verify(&other.public()));
    }

    #[test]
    fn test_serde_round_trip() {
        let identity = IdentityKeyPair::generate();
        let (_eph, message) = create_handshake(&identity, "alice");

        let json = serde_json::to_string(&message).unwrap();
        let restored: HandshakeMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.ephemeral_public_key, message.ephemeral_public_key);
        assert!(restored.verify(&identity.public()));
    }
}
