//! # Message Cipher
//!
//! AES-256-GCM authenticated encryption for message confidentiality and
//! integrity.
//!
//! ## Transport Form
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      SEALED MESSAGE LAYOUT                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  encrypt(session_key, plaintext, aad)                                  │
//! │        │                                                                │
//! │        ├──► iv          12 bytes, random per call, never reused        │
//! │        ├──► ciphertext  len(plaintext) bytes                           │
//! │        └──► auth_tag    16 bytes, detached for transport               │
//! │                                                                         │
//! │  The tag is carried as its own envelope field; decrypt re-joins        │
//! │  ciphertext || tag before handing the buffer to AES-GCM.               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Critical Security Requirement
//!
//! **Never reuse an IV with the same key.** IV reuse under GCM leaks the
//! authentication key and allows forgery. Every call to [`encrypt`] draws
//! a fresh random 96-bit IV from the OS CSPRNG; random IVs are safe for up
//! to 2^32 messages per key, far beyond the rotation thresholds.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce as AesNonce,
};
use rand::RngCore;
use zeroize::ZeroizeOnDrop;

use crate::error::{Error, Result};

/// Size of the AES-GCM IV in bytes (96 bits)
pub const IV_SIZE: usize = 12;

/// Size of the AES-GCM authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Size of the session key in bytes (256 bits)
pub const SESSION_KEY_SIZE: usize = 32;

/// A random initialization vector for one AES-GCM operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Iv(pub [u8; IV_SIZE]);

impl Iv {
    /// Generate a cryptographically random IV.
    pub fn random() -> Self {
        let mut bytes = [0u8; IV_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from existing bytes
    pub fn from_bytes(bytes: [u8; IV_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; IV_SIZE] {
        &self.0
    }
}

/// A detached AES-GCM authentication tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthTag(pub [u8; TAG_SIZE]);

impl AuthTag {
    /// Create from existing bytes
    pub fn from_bytes(bytes: [u8; TAG_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; TAG_SIZE] {
        &self.0
    }
}

/// A derived AES-256-GCM session key.
///
/// Produced by [`crate::crypto::kdf::derive_session_key`], held only while
/// the session is active, zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl SessionKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw key bytes
    pub(crate) fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }
}

/// Output of one encryption call: ciphertext body with detached IV and tag.
#[derive(Clone, Debug)]
pub struct SealedMessage {
    /// Encrypted payload (without the trailing tag)
    pub ciphertext: Vec<u8>,
    /// Fresh random IV used for this message
    pub iv: Iv,
    /// Detached authentication tag
    pub auth_tag: AuthTag,
}

/// Encrypt a payload under the session key.
///
/// Generates a fresh random IV, encrypts with AES-256-GCM, and detaches
/// the trailing 16-byte tag for transport. The `aad` is authenticated but
/// not encrypted; decryption with mismatched AAD fails the tag check.
pub fn encrypt(key: &SessionKey, plaintext: &[u8], aad: &[u8]) -> Result<SealedMessage> {
    let iv = Iv::random();
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| Error::EncryptionFailed(format!("Invalid key: {}", e)))?;

    let payload = Payload {
        msg: plaintext,
        aad,
    };

    let mut combined = cipher
        .encrypt(AesNonce::from_slice(&iv.0), payload)
        .map_err(|e| Error::EncryptionFailed(format!("Encryption failed: {}", e)))?;

    // aes-gcm appends the tag; split it off for the wire format
    let tag_start = combined.len() - TAG_SIZE;
    let tag: [u8; TAG_SIZE] = combined[tag_start..]
        .try_into()
        .map_err(|_| Error::EncryptionFailed("Tag split failed".into()))?;
    combined.truncate(tag_start);

    Ok(SealedMessage {
        ciphertext: combined,
        iv,
        auth_tag: AuthTag(tag),
    })
}

/// Decrypt a payload under the session key.
///
/// Fails with [`Error::IntegrityFailure`] if the authentication tag does
/// not verify. A tag mismatch is tamper or corruption: the caller drops
/// the envelope, logs metadata only, and never falls back to accepting
/// the plaintext.
pub fn decrypt(
    key: &SessionKey,
    ciphertext: &[u8],
    iv: &Iv,
    auth_tag: &AuthTag,
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| Error::IntegrityFailure(format!("Invalid key: {}", e)))?;

    let mut combined = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(&auth_tag.0);

    let payload = Payload {
        msg: &combined,
        aad,
    };

    cipher
        .decrypt(AesNonce::from_slice(&iv.0), payload)
        .map_err(|_| Error::IntegrityFailure("authentication tag mismatch".into()))
}

// ============================================================================
// TESTS
// ============================================================================
