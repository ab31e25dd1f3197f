//! # Session Key Derivation
//!
//! HKDF-SHA256 derivation of session keys from ephemeral shared secrets.
//!
//! ## Derivation Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 SHARED SECRET → SESSION KEY                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 X25519 SHARED SECRET                            │   │
//! │  │                                                                 │   │
//! │  │  initiator_eph_private × responder_eph_public                   │   │
//! │  │    = responder_eph_private × initiator_eph_public               │   │
//! │  │                                                                 │   │
//! │  │  → 32 bytes (possibly structured; never used directly)          │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │                                ▼                                        │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 HKDF KEY DERIVATION                             │   │
//! │  │                                                                 │   │
//! │  │  HKDF-SHA256(                                                   │   │
//! │  │    ikm  = shared_secret,                                        │   │
//! │  │    salt = SHA-256(initiator_eph_pub || responder_eph_pub),     │   │
//! │  │    info = "sable-session-key-v1"                               │   │
//! │  │  )                                                              │   │
//! │  │                                                                 │   │
//! │  │  → 32-byte AES-256-GCM session key                             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  Why hash both ephemeral publics into the salt?                        │
//! │  ───────────────────────────────────────────────                        │
//! │  • Fresh per handshake: ephemeral keys are fresh per attempt          │
//! │  • Both peers compute it with no extra negotiation                    │
//! │  • Binds the key to this exact exchange, so a repeated shared         │
//! │    secret still yields a distinct session key                         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! HKDF's extract-then-expand construction prevents weak or structured DH
//! outputs from being used directly as symmetric keys, and the fixed info
//! string keeps keys derived for other protocol roles cryptographically
//! independent.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};

use crate::crypto::cipher::{SessionKey, SESSION_KEY_SIZE};
use crate::crypto::keys::SharedSecret;
use crate::error::{Error, Result};

/// Domain separation strings for HKDF
pub mod domain {
    /// Info string for session key derivation
    pub const SESSION_KEY: &[u8] = b"sable-session-key-v1";

    /// Prefix mixed into the per-handshake salt
    pub const HANDSHAKE_SALT: &[u8] = b"sable-handshake-salt-v1";
}

/// Compute the per-handshake salt from both ephemeral public keys.
///
/// The initiator's ephemeral public always hashes first, so both sides
/// compute the same salt independently. Fresh per handshake because the
/// ephemerals are fresh per attempt.
pub fn handshake_salt(initiator_eph_pub: &[u8; 32], responder_eph_pub: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(domain::HANDSHAKE_SALT);
    hasher.update(initiator_eph_pub);
    hasher.update(responder_eph_pub);
    hasher.finalize().into()
}

/// Derive an AES-256-GCM session key from an ephemeral shared secret.
///
/// Runs HKDF-SHA256 with the given per-handshake salt and the fixed
/// session-key info string, extracting a 256-bit key.
pub fn derive_session_key(shared_secret: &SharedSecret, salt: &[u8; 32]) -> Result<SessionKey> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), shared_secret.as_bytes());

    let mut key = [0u8; SESSION_KEY_SIZE];
    hkdf.expand(domain::SESSION_KEY, &mut key)
        .map_err(|_| Error::KeyDerivationFailed("HKDF expansion failed".into()))?;

    Ok(SessionKey::from_bytes(key))
}

// ============================================================================
// TESTS
// ============================================================================
