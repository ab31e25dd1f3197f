//! # Error Handling
//!
//! This module provides the error taxonomy for Sable Core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Key Store Errors                                                  │
//! │  │   ├── AuthenticationFailure  - Wrong password unwrapping a key      │
//! │  │   ├── NotFound               - No stored record for the user        │
//! │  │   ├── KeyDerivationFailed    - KDF (Argon2/HKDF) failure            │
//! │  │   └── InvalidKey             - Malformed key material               │
//! │  │                                                                      │
//! │  ├── Handshake / Session Errors                                        │
//! │  │   ├── HandshakeAuthenticationFailure - Forged handshake signature   │
//! │  │   ├── InvalidState           - Operation illegal in current phase   │
//! │  │   └── KeyExchangeFailed      - ECDH / session derivation failure    │
//! │  │                                                                      │
//! │  ├── Cipher Errors                                                     │
//! │  │   ├── IntegrityFailure       - AES-GCM tag mismatch (tamper)        │
//! │  │   └── EncryptionFailed       - Encryption operation failed          │
//! │  │                                                                      │
//! │  ├── Replay Guard Rejections                                           │
//! │  │   └── Replay(reason)         - STALE_TIMESTAMP / NON_MONOTONIC_SEQ  │
//! │  │                                / DUPLICATE_NONCE                    │
//! │  │                                                                      │
//! │  └── Ambient Errors                                                    │
//! │      ├── ChunkReassemblyFailed  - Missing/inconsistent file chunks      │
//! │      ├── StorageError           - Record store backend failure          │
//! │      └── Serialization errors   - Wire encode/decode failures           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Cryptographic primitive failures never surface raw: they are always
//! translated into this taxonomy before reaching a caller. Corruption and
//! forgery are fatal to the single envelope or handshake attempt, never to
//! the whole session.

use thiserror::Error;

use crate::session::replay::RejectReason;

/// Result type alias for Sable Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Sable Core
///
/// All errors are categorized by module/domain to make error handling
/// clearer and to provide meaningful messages to callers.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Key Store Errors (100-199)
    // ========================================================================

    /// The wrapping key derived from the supplied password failed to
    /// authenticate the stored record. Recoverable: the user may retry.
    #[error("Authentication failure: wrong password for stored identity key")]
    AuthenticationFailure,

    /// No encrypted key record exists for the user
    #[error("No stored identity key for user: {0}")]
    NotFound(String),

    /// Key derivation failed
    #[error("Failed to derive key: {0}")]
    KeyDerivationFailed(String),

    /// Invalid key format or length
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Record store backend failure
    #[error("Key record store error: {0}")]
    StorageError(String),

    // ========================================================================
    // Handshake / Session Errors (200-299)
    // ========================================================================

    /// A handshake signature did not verify under the peer's identity key.
    /// The attempt aborts back to IDLE; the rejected ephemeral material is
    /// never reused.
    #[error("Handshake authentication failure: {0}")]
    HandshakeAuthenticationFailure(String),

    /// The operation is not legal in the session's current phase
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// Key exchange failed
    #[error("Key exchange failed: {0}")]
    KeyExchangeFailed(String),

    // ========================================================================
    // Cipher Errors (300-399)
    // ========================================================================

    /// AES-GCM authentication tag mismatch: tamper or corruption. The
    /// envelope is dropped and never retried with the same ciphertext.
    #[error("Integrity failure: {0}")]
    IntegrityFailure(String),

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    // ========================================================================
    // Replay Guard Rejections (400-499)
    // ========================================================================

    /// An inbound envelope was rejected by the replay guard. The envelope
    /// is dropped; the session remains usable.
    #[error("Replay guard rejection: {}", .0.as_str())]
    Replay(RejectReason),

    // ========================================================================
    // File Transfer Errors (500-599)
    // ========================================================================

    /// Chunk set incomplete or inconsistent; reassembly aborted
    #[error("Chunk reassembly failed: {0}")]
    ChunkReassemblyFailed(String),

    // ========================================================================
    // Serialization Errors (900-999)
    // ========================================================================

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

impl Error {
    /// Get the numeric error code
    ///
    /// Error codes are organized by category:
    /// - 100-199: Key store
    /// - 200-299: Handshake / session
    /// - 300-399: Cipher
    /// - 400-499: Replay guard
    /// - 500-599: File transfer
    /// - 900-999: Serialization
    pub fn code(&self) -> i32 {
        match self {
            // Key store (100-199)
            Error::AuthenticationFailure => 100,
            Error::NotFound(_) => 101,
            Error::KeyDerivationFailed(_) => 102,
            Error::InvalidKey(_) => 103,
            Error::StorageError(_) => 104,

            // Handshake / session (200-299)
            Error::HandshakeAuthenticationFailure(_) => 200,
            Error::InvalidState(_) => 201,
            Error::KeyExchangeFailed(_) => 202,

            // Cipher (300-399)
            Error::IntegrityFailure(_) => 300,
            Error::EncryptionFailed(_) => 301,

            // Replay guard (400-499)
            Error::Replay(RejectReason::StaleTimestamp) => 400,
            Error::Replay(RejectReason::NonMonotonicSeq) => 401,
            Error::Replay(RejectReason::DuplicateNonce) => 402,

            // File transfer (500-599)
            Error::ChunkReassemblyFailed(_) => 500,

            // Serialization (900-999)
            Error::SerializationError(_) => 900,
            Error::DeserializationError(_) => 901,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors can potentially be resolved by retrying or by
    /// user action: a wrong password can be re-entered, a rejected
    /// handshake can be retried with fresh ephemeral material.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::AuthenticationFailure | Error::HandshakeAuthenticationFailure(_)
        )
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================
