//! # Key Management
//!
//! Key generation and handling for the session protocol.
//!
//! ## Key Types
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          KEY TYPES                                      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  IdentityKeyPair (Ed25519)                                      │   │
//! │  │  ─────────────────────────                                       │   │
//! │  │                                                                  │   │
//! │  │  Long-term signing keypair. The private key never leaves the    │   │
//! │  │  endpoint in plaintext; at rest it is password-wrapped by the   │   │
//! │  │  key store. The public key is the root of trust for this        │   │
//! │  │  user's handshakes.                                             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  EphemeralKeyPair (X25519)                                      │   │
//! │  │  ─────────────────────────                                       │   │
//! │  │                                                                  │   │
//! │  │  Short-lived key-agreement keypair, generated fresh per         │   │
//! │  │  handshake attempt and per rotation. Never persisted;          │   │
//! │  │  discarded on rotation or teardown (forward secrecy boundary). │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use ed25519_dalek::{Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::error::{Error, Result};

/// Size of identity and ephemeral keys in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of an identity signature in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Named curve identifier carried in the canonical public-key form
pub const IDENTITY_CURVE: &str = "ed25519";

// ============================================================================
// IDENTITY KEYPAIR
// ============================================================================

/// Long-term Ed25519 signing keypair binding ephemeral keys to a user.
#[derive(Debug, ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    /// Private signing key (secret)
    #[zeroize(skip)] // ed25519_dalek::SigningKey handles its own zeroization
    secret: SigningKey,
}

impl IdentityKeyPair {
    /// Generate a new random identity keypair.
    ///
    /// Uses the operating system's secure random number generator.
    pub fn generate() -> Self {
        let secret = SigningKey::generate(&mut OsRng);
        Self { secret }
    }

    /// Create from raw secret bytes (as produced by [`secret_bytes`](Self::secret_bytes)).
    pub fn from_bytes(bytes: &[u8; KEY_SIZE]) -> Self {
        let secret = SigningKey::from_bytes(bytes);
        Self { secret }
    }

    /// Get the secret key bytes, for password-wrapped storage only.
    ///
    /// Never log or transmit these bytes.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; KEY_SIZE]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// Get the public half in its canonical serializable form.
    pub fn public(&self) -> IdentityPublicKey {
        IdentityPublicKey {
            curve: IDENTITY_CURVE.to_string(),
            key: self.secret.verifying_key().to_bytes(),
        }
    }

    /// Sign a message with the identity key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = self.secret.sign(message);
        Signature(sig.to_bytes())
    }
}

/// Public identity key in canonical serializable form.
///
/// Contains the named curve plus the public point and never the private
/// scalar. Safe to serialize, transmit, and store without restriction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityPublicKey {
    /// Named curve identifier (always `"ed25519"`)
    pub curve: String,

    /// Compressed public point (32 bytes, hex encoded on the wire)
    #[serde(with = "hex_bytes")]
    pub key: [u8; KEY_SIZE],
}

impl IdentityPublicKey {
    /// Create from raw public bytes.
    pub fn from_bytes(key: [u8; KEY_SIZE]) -> Self {
        Self {
            curve: IDENTITY_CURVE.to_string(),
            key,
        }
    }

    /// Get the verifying key, rejecting off-curve or unknown-curve input.
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        if self.curve != IDENTITY_CURVE {
            return Err(Error::InvalidKey(format!(
                "Unsupported curve: {}",
                self.curve
            )));
        }
        VerifyingKey::from_bytes(&self.key)
            .map_err(|e| Error::InvalidKey(format!("Invalid identity public key: {}", e)))
    }

    /// Encode the public point as a hex string (for display/directories).
    pub fn to_hex(&self) -> String {
        hex::encode(self.key)
    }

    /// Decode from a hex string.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| Error::InvalidKey(format!("Invalid hex: {}", e)))?;
        let key: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey("Public key must be 32 bytes".into()))?;
        Ok(Self::from_bytes(key))
    }

    /// Short fingerprint for metadata-only log records.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let hash = Sha256::digest(self.key);
        hex::encode(&hash[..8])
    }
}

// ============================================================================
// SIGNATURES
// ============================================================================

/// An Ed25519 signature over handshake material.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "sig_bytes")] pub [u8; SIGNATURE_SIZE]);

impl Signature {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }
}

/// Verify a signature under an identity public key.
///
/// Returns `Ok(())` on a valid signature. An off-curve key yields
/// `InvalidKey`; a non-verifying signature yields
/// `HandshakeAuthenticationFailure`.
pub fn verify(
    public_key: &IdentityPublicKey,
    message: &[u8],
    signature: &Signature,
) -> Result<()> {
    let verifying_key = public_key.verifying_key()?;
    let sig = Ed25519Signature::from_bytes(&signature.0);
    verifying_key
        .verify(message, &sig)
        .map_err(|_| Error::HandshakeAuthenticationFailure("signature invalid".into()))
}

// ============================================================================
// EPHEMERAL KEYPAIR
// ============================================================================

/// Short-lived X25519 keypair for one session-establishment attempt.
///
/// Generated fresh per handshake and per rotation, never persisted, and
/// dropped (zeroized) when the attempt completes or is discarded.
#[derive(ZeroizeOnDrop)]
pub struct EphemeralKeyPair {
    /// Private agreement key (secret)
    #[zeroize(skip)] // x25519_dalek handles its own zeroization
    secret: StaticSecret,
    /// Public agreement key (derived from secret)
    #[zeroize(skip)]
    public: X25519PublicKey,
}

impl EphemeralKeyPair {
    /// Generate a new random ephemeral keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Get the public key bytes for the handshake message.
    pub fn public_bytes(&self) -> [u8; KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Perform Diffie-Hellman key agreement with the peer's ephemeral key.
    ///
    /// Both sides compute the same shared secret:
    /// initiator_secret × responder_public = responder_secret × initiator_public.
    pub fn diffie_hellman(&self, their_public: &[u8; KEY_SIZE]) -> SharedSecret {
        let their_public = X25519PublicKey::from(*their_public);
        SharedSecret::from_bytes(self.secret.diffie_hellman(&their_public).to_bytes())
    }
}

/// A shared secret produced by ephemeral key agreement.
///
/// Never used directly as a symmetric key; always passed through HKDF
/// (see [`crate::crypto::kdf::derive_session_key`]).
#[derive(ZeroizeOnDrop)]
pub struct SharedSecret {
    bytes: [u8; KEY_SIZE],
}

impl SharedSecret {
    /// Create from raw DH output
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Get the raw bytes (input key material for HKDF)
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

// ============================================================================
// SERDE HELPERS
// ============================================================================

/// Serde helper for serializing 32-byte arrays as hex
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid length"))
    }
}

/// Serde helper for signature bytes
mod sig_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 64], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid signature length"))
    }
}

// ============================================================================
// TESTS
// ============================================================================
