//! # Message Envelope
//!
//! The wire format relayed between peers by the untrusted server.
//!
//! ## Wire Protocol
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      MESSAGE ENVELOPE FORMAT                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  MessageEnvelope (JSON serialized)                                     │
//! │  ─────────────────────────────────                                      │
//! │  {                                                                      │
//! │    "type": "MSG",                // KEP_INIT | KEP_RESPONSE | MSG |     │
//! │                                  // FILE_META | FILE_CHUNK | KEY_UPDATE │
//! │    "session_id": "...",          // Deterministic, derived by both     │
//! │    "sender": "alice",            // Routing metadata                    │
//! │    "receiver": "bob",            // Routing metadata                    │
//! │    "ciphertext": "base64...",    // Encrypted content                   │
//! │    "iv": "base64...",            // 12 bytes                            │
//! │    "auth_tag": "base64...",      // 16 bytes                            │
//! │    "timestamp": 1234567890123,   // Epoch milliseconds                  │
//! │    "seq": 7,                     // Per-sender monotonic counter        │
//! │    "nonce": "uuid"               // Optional, replay-guard tracked      │
//! │  }                                                                      │
//! │                                                                         │
//! │  ciphertext/iv/auth_tag are the only cryptographic material that       │
//! │  ever crosses the relay boundary. Plaintext and session keys never do. │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::crypto::{AuthTag, Iv, SealedMessage, IV_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use crate::session::handshake::HandshakeMessage;

/// Envelope type identifier for the wire protocol
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeType {
    /// Key exchange initiation
    KepInit,
    /// Key exchange response
    KepResponse,
    /// Regular encrypted message
    Msg,
    /// File transfer metadata
    FileMeta,
    /// Encrypted file chunk
    FileChunk,
    /// Rotation re-key announcement
    KeyUpdate,
}

impl EnvelopeType {
    /// Get the numeric type code
    pub fn code(&self) -> u8 {
        match self {
            Self::KepInit => 1,
            Self::KepResponse => 2,
            Self::Msg => 3,
            Self::FileMeta => 4,
            Self::FileChunk => 5,
            Self::KeyUpdate => 6,
        }
    }

    /// Parse from numeric code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::KepInit),
            2 => Some(Self::KepResponse),
            3 => Some(Self::Msg),
            4 => Some(Self::FileMeta),
            5 => Some(Self::FileChunk),
            6 => Some(Self::KeyUpdate),
            _ => None,
        }
    }

    /// Whether envelopes of this type carry a replay-guard nonce
    pub fn carries_nonce(&self) -> bool {
        matches!(self, Self::Msg | Self::FileMeta | Self::FileChunk)
    }

    /// Whether this type carries a signed handshake instead of sealed
    /// content. Control envelopes are replay-protected by their signed
    /// timestamp, not by the sequence window.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::KepInit | Self::KepResponse | Self::KeyUpdate)
    }
}

/// Cleartext routing info carried by FILE_CHUNK envelopes so chunks can
/// be filed before decryption. Tamper-evident indirectly: the chunk's
/// AAD binds the same values, so rewriting them breaks tag verification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Transfer the chunk belongs to
    pub file_id: String,
    /// Zero-based position within the file
    pub chunk_index: u32,
    /// Total chunks in the transfer
    pub total_chunks: u32,
    /// Plaintext size of this chunk
    pub size: usize,
}

/// Encrypted envelope relayed between the two session endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Envelope type
    #[serde(rename = "type")]
    pub envelope_type: EnvelopeType,
    /// Session identifier (derived from the sorted user-id pair)
    pub session_id: String,
    /// Sender user id (routing metadata)
    pub sender: String,
    /// Receiver user id (routing metadata)
    pub receiver: String,
    /// Encrypted content (base64)
    pub ciphertext: String,
    /// AES-GCM IV, always 12 bytes (base64)
    pub iv: String,
    /// Detached AES-GCM tag, always 16 bytes (base64)
    pub auth_tag: String,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Per-sender strictly increasing sequence number
    pub seq: u64,
    /// Replay-guard nonce for types that carry one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Chunk routing info, present only on FILE_CHUNK envelopes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkInfo>,
}

impl MessageEnvelope {
    /// Build an envelope from a sealed message.
    #[allow(clippy::too_many_arguments)]
    pub fn from_sealed(
        envelope_type: EnvelopeType,
        session_id: &str,
        sender: &str,
        receiver: &str,
        sealed: &SealedMessage,
        timestamp: i64,
        seq: u64,
        nonce: Option<String>,
    ) -> Self {
        Self {
            envelope_type,
            session_id: session_id.to_string(),
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            ciphertext: BASE64.encode(&sealed.ciphertext),
            iv: BASE64.encode(sealed.iv.as_bytes()),
            auth_tag: BASE64.encode(sealed.auth_tag.as_bytes()),
            timestamp,
            seq,
            nonce,
            chunk: None,
        }
    }

    /// Attach chunk routing info (FILE_CHUNK envelopes).
    pub fn with_chunk(mut self, chunk: ChunkInfo) -> Self {
        self.chunk = Some(chunk);
        self
    }

    /// Build a control envelope carrying a signed handshake. The
    /// handshake travels in the clear (it is public, signed material);
    /// its own timestamp doubles as the envelope timestamp.
    pub fn control(
        envelope_type: EnvelopeType,
        session_id: &str,
        receiver: &str,
        handshake: &HandshakeMessage,
    ) -> Result<Self> {
        let body = serde_json::to_vec(handshake)
            .map_err(|e| Error::SerializationError(e.to_string()))?;
        Ok(Self {
            envelope_type,
            session_id: session_id.to_string(),
            sender: handshake.sender_id.clone(),
            receiver: receiver.to_string(),
            ciphertext: BASE64.encode(&body),
            iv: String::new(),
            auth_tag: String::new(),
            timestamp: handshake.timestamp,
            seq: 0,
            nonce: None,
            chunk: None,
        })
    }

    /// Extract the signed handshake from a control envelope.
    pub fn handshake(&self) -> Result<HandshakeMessage> {
        if !self.envelope_type.is_control() {
            return Err(Error::DeserializationError(format!(
                "Envelope type {:?} carries no handshake",
                self.envelope_type
            )));
        }
        let body = self.decode_ciphertext()?;
        serde_json::from_slice(&body).map_err(|e| Error::DeserializationError(e.to_string()))
    }

    /// Decode the ciphertext body.
    pub fn decode_ciphertext(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.ciphertext)
            .map_err(|e| Error::DeserializationError(format!("Invalid ciphertext: {}", e)))
    }

    /// Decode and length-check the IV (must be exactly 12 bytes).
    pub fn decode_iv(&self) -> Result<Iv> {
        let bytes = BASE64
            .decode(&self.iv)
            .map_err(|e| Error::DeserializationError(format!("Invalid iv: {}", e)))?;
        let arr: [u8; IV_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::DeserializationError("IV must be 12 bytes".into()))?;
        Ok(Iv::from_bytes(arr))
    }

    /// Decode and length-check the authentication tag (must be 16 bytes).
    pub fn decode_auth_tag(&self) -> Result<AuthTag> {
        let bytes = BASE64
            .decode(&self.auth_tag)
            .map_err(|e| Error::DeserializationError(format!("Invalid auth tag: {}", e)))?;
        let arr: [u8; TAG_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::DeserializationError("Auth tag must be 16 bytes".into()))?;
        Ok(AuthTag::from_bytes(arr))
    }

    /// Serialize to JSON for the transport
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::SerializationError(e.to_string()))
    }

    /// Deserialize from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::DeserializationError(e.to_string()))
    }
}

// ============================================================================
// TESTS
// ============================================================================
