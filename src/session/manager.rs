//! # Session Manager
//!
//! Orchestrates the full session lifecycle for one local user across all
//! peers: handshakes, message sealing, replay enforcement, rotation, and
//! teardown.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        SESSION MANAGER                              │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │   SessionManager                                                    │
//! │   ├── identity: IdentityKeyPair         (local long-term key)       │
//! │   ├── directory: Arc<dyn Directory>     (peer identity lookup)      │
//! │   ├── events: Arc<dyn EventSink>        (security notifications)    │
//! │   └── sessions: RwLock<HashMap<peer_id,                             │
//! │                  Arc<Mutex<SessionState>>>>                         │
//! │                                                                     │
//! │   initiate ──► KEP_INIT        handle_init ──► KEP_RESPONSE        │
//! │   complete ──► key installed   encrypt/decrypt ──► envelopes       │
//! │   rotate   ──► KEY_UPDATE      close ──► key material dropped      │
//! │                                                                     │
//! │   Every exchange travels as a MessageEnvelope: control envelopes    │
//! │   carry signed handshakes, MSG/FILE_* envelopes carry sealed        │
//! │   content admitted through the replay guard.                        │
//! │                                                                     │
//! │   Each session has its own async mutex, so traffic with one peer    │
//! │   never blocks traffic with another.                                │
//! │                                                                     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::crypto::{
    self, derive_session_key, handshake_salt, EphemeralKeyPair, IdentityKeyPair,
    IdentityPublicKey,
};
use crate::envelope::{ChunkInfo, EnvelopeType, MessageEnvelope};
use crate::error::{Error, Result};
use crate::event::{event_type, EventSink, ProtocolEvent, TracingEventSink};
use crate::files::{EncryptedChunk, FileMetadata, DEFAULT_CHUNK_SIZE};
use crate::session::handshake::{create_handshake, sign_handshake, HandshakeMessage};
use crate::session::replay::TIMESTAMP_SKEW_MS;
use crate::session::rotation::RotationPolicy;
use crate::session::state::{SessionPhase, SessionState};
use crate::time::now_timestamp_millis;

/// Lookup of peer identity keys, verified out of band.
///
/// The protocol trusts whatever this returns; implementations are
/// expected to pin keys obtained through a trusted channel.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Resolve a user's pinned identity key, if known.
    async fn identity_for(&self, user_id: &str) -> Result<Option<IdentityPublicKey>>;
}

/// In-memory identity directory for tests and single-process embedders.
#[derive(Default)]
pub struct MemoryDirectory {
    entries: RwLock<HashMap<String, IdentityPublicKey>>,
}

impl MemoryDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin a user's identity key.
    pub fn register(&self, user_id: &str, key: IdentityPublicKey) {
        self.entries.write().insert(user_id.to_string(), key);
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn identity_for(&self, user_id: &str) -> Result<Option<IdentityPublicKey>> {
        Ok(self.entries.read().get(user_id).cloned())
    }
}

/// Manages all peer sessions for one local user.
pub struct SessionManager {
    local_id: String,
    identity: IdentityKeyPair,
    directory: Arc<dyn Directory>,
    events: Arc<dyn EventSink>,
    policy: RotationPolicy,
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionState>>>>,
}

impl SessionManager {
    /// Create a manager with the default rotation policy and tracing
    /// event sink.
    pub fn new(local_id: &str, identity: IdentityKeyPair, directory: Arc<dyn Directory>) -> Self {
        Self::with_options(
            local_id,
            identity,
            directory,
            Arc::new(TracingEventSink),
            RotationPolicy::default(),
        )
    }

    /// Create a manager with a custom event sink and rotation policy.
    pub fn with_options(
        local_id: &str,
        identity: IdentityKeyPair,
        directory: Arc<dyn Directory>,
        events: Arc<dyn EventSink>,
        policy: RotationPolicy,
    ) -> Self {
        Self {
            local_id: local_id.to_string(),
            identity,
            directory,
            events,
            policy,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Local user id this manager speaks for.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Our public identity key, for registration in a directory.
    pub fn public_identity(&self) -> IdentityPublicKey {
        self.identity.public()
    }

    /// Get the session for a peer, creating an idle one on first use.
    async fn session_for(&self, peer_id: &str) -> Result<Arc<Mutex<SessionState>>> {
        if let Some(existing) = self.sessions.read().get(peer_id) {
            return Ok(existing.clone());
        }

        let peer_identity = self
            .directory
            .identity_for(peer_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("No identity key for user: {}", peer_id)))?;

        let mut sessions = self.sessions.write();
        // Another task may have raced us here
        let entry = sessions
            .entry(peer_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SessionState::new(
                    &self.local_id,
                    peer_id,
                    peer_identity,
                )))
            });
        Ok(entry.clone())
    }

    /// Get an existing session or fail.
    fn existing_session(&self, peer_id: &str) -> Result<Arc<Mutex<SessionState>>> {
        self.sessions
            .read()
            .get(peer_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("No session with user: {}", peer_id)))
    }

    // ========================================================================
    // KEY EXCHANGE
    // ========================================================================

    /// Start a key exchange with a peer. Returns the KEP_INIT envelope
    /// to relay; the ephemeral secret stays inside the session phase
    /// until [`complete`](Self::complete).
    pub async fn initiate(&self, peer_id: &str) -> Result<MessageEnvelope> {
        let session = self.session_for(peer_id).await?;
        let mut state = session.lock().await;

        match state.phase {
            SessionPhase::Established | SessionPhase::Rotating { .. } => {
                return Err(Error::InvalidState(format!(
                    "Cannot initiate from {} state, use rotate",
                    state.phase.name()
                )));
            }
            SessionPhase::Closed => {
                return Err(Error::InvalidState(format!(
                    "Session with {} is closed",
                    peer_id
                )));
            }
            SessionPhase::Idle | SessionPhase::AwaitingResponse { .. } => {}
        }

        let (ephemeral, message) = create_handshake(&self.identity, &self.local_id);
        state.phase = SessionPhase::AwaitingResponse { ephemeral };

        tracing::debug!(peer = peer_id, session_id = %state.session_id, "initiating key exchange");
        self.events.record(
            ProtocolEvent::new(event_type::HANDSHAKE_INITIATED)
                .with_session(&state.session_id)
                .with_user(peer_id),
        );
        MessageEnvelope::control(EnvelopeType::KepInit, &state.session_id, peer_id, &message)
    }

    /// Handle an inbound KEP_INIT or KEY_UPDATE as the responder.
    /// Verifies the handshake, derives the session key, and returns the
    /// KEP_RESPONSE envelope to relay back.
    ///
    /// A KEY_UPDATE arriving on an established session is a peer-driven
    /// rotation: the key is replaced but the replay window is preserved.
    pub async fn handle_init(&self, envelope: &MessageEnvelope) -> Result<MessageEnvelope> {
        if !matches!(
            envelope.envelope_type,
            EnvelopeType::KepInit | EnvelopeType::KeyUpdate
        ) {
            return Err(Error::InvalidState(format!(
                "Expected KEP_INIT or KEY_UPDATE, got {:?}",
                envelope.envelope_type
            )));
        }
        let message = envelope.handshake()?;
        let peer_id = message.sender_id.clone();
        let session = self.session_for(&peer_id).await?;
        let mut state = session.lock().await;

        self.screen_handshake(&state, &message)?;

        if !message.verify(&state.peer_identity) {
            self.events.record(
                ProtocolEvent::new(event_type::HANDSHAKE_REJECTED)
                    .with_session(&state.session_id)
                    .with_user(&peer_id)
                    .with_reason("signature invalid"),
            );
            return Err(Error::HandshakeAuthenticationFailure(format!(
                "Handshake from {} failed signature verification",
                peer_id
            )));
        }

        let was_established = state.is_established();

        // Crypto first, state mutation only after everything succeeded
        let ephemeral = EphemeralKeyPair::generate();
        let our_eph_pub = ephemeral.public_bytes();
        let shared = ephemeral.diffie_hellman(&message.ephemeral_public_key);
        let salt = handshake_salt(&message.ephemeral_public_key, &our_eph_pub);
        let key = derive_session_key(&shared, &salt)?;

        let response = sign_handshake(&self.identity, &self.local_id, our_eph_pub);

        let now = now_timestamp_millis();
        state.note_handshake_key(message.ephemeral_public_key);
        state.install_key(key, now);

        let event = if was_established {
            event_type::SESSION_ROTATED
        } else {
            event_type::HANDSHAKE_ESTABLISHED
        };
        tracing::info!(peer = %peer_id, session_id = %state.session_id, "session established");
        self.events.record(
            ProtocolEvent::new(event)
                .with_session(&state.session_id)
                .with_user(&peer_id),
        );
        MessageEnvelope::control(
            EnvelopeType::KepResponse,
            &state.session_id,
            &peer_id,
            &response,
        )
    }

    /// Complete a key exchange we initiated, consuming the inbound
    /// KEP_RESPONSE envelope. On signature failure the pending ephemeral
    /// secret is discarded and the session returns to idle.
    pub async fn complete(&self, envelope: &MessageEnvelope) -> Result<()> {
        if envelope.envelope_type != EnvelopeType::KepResponse {
            return Err(Error::InvalidState(format!(
                "Expected KEP_RESPONSE, got {:?}",
                envelope.envelope_type
            )));
        }
        let message = envelope.handshake()?;
        let peer_id = message.sender_id.clone();
        let session = self.existing_session(&peer_id)?;
        let mut state = session.lock().await;

        // A stale or replayed response must not cancel a live pending
        // exchange, so screen before touching the phase
        self.screen_handshake(&state, &message)?;

        let was_rotating = matches!(state.phase, SessionPhase::Rotating { .. });
        let ephemeral = match std::mem::replace(&mut state.phase, SessionPhase::Idle) {
            SessionPhase::AwaitingResponse { ephemeral } => ephemeral,
            SessionPhase::Rotating { ephemeral } => ephemeral,
            other => {
                state.phase = other;
                return Err(Error::InvalidState(format!(
                    "No pending key exchange with {} (state: {})",
                    peer_id,
                    state.phase.name()
                )));
            }
        };

        if !message.verify(&state.peer_identity) {
            // Pending ephemeral already dropped with the phase swap
            if was_rotating {
                // Old key stays usable, the rotation attempt is abandoned
                state.phase = SessionPhase::Established;
            }
            self.events.record(
                ProtocolEvent::new(event_type::HANDSHAKE_REJECTED)
                    .with_session(&state.session_id)
                    .with_user(&peer_id)
                    .with_reason("signature invalid"),
            );
            return Err(Error::HandshakeAuthenticationFailure(format!(
                "Response from {} failed signature verification",
                peer_id
            )));
        }

        let our_eph_pub = ephemeral.public_bytes();
        let shared = ephemeral.diffie_hellman(&message.ephemeral_public_key);
        // We initiated, so our ephemeral key comes first in the salt
        let salt = handshake_salt(&our_eph_pub, &message.ephemeral_public_key);
        let key = derive_session_key(&shared, &salt)?;

        let now = now_timestamp_millis();
        state.note_handshake_key(message.ephemeral_public_key);
        state.install_key(key, now);

        let event = if was_rotating {
            event_type::SESSION_ROTATED
        } else {
            event_type::HANDSHAKE_ESTABLISHED
        };
        tracing::info!(peer = %peer_id, session_id = %state.session_id, "session established");
        self.events.record(
            ProtocolEvent::new(event)
                .with_session(&state.session_id)
                .with_user(&peer_id),
        );
        Ok(())
    }

    /// Reject a handshake whose signed timestamp falls outside the
    /// freshness window, or whose ephemeral key was already consumed by
    /// an earlier exchange. A fresh handshake always announces a new
    /// random key, so a repeat is a verbatim replay even when the
    /// timestamp is still inside the window.
    fn screen_handshake(&self, state: &SessionState, message: &HandshakeMessage) -> Result<()> {
        let now = now_timestamp_millis();
        if (now - message.timestamp).abs() > TIMESTAMP_SKEW_MS {
            self.events.record(
                ProtocolEvent::new(event_type::HANDSHAKE_REJECTED)
                    .with_session(&state.session_id)
                    .with_user(&message.sender_id)
                    .with_reason("stale handshake timestamp"),
            );
            return Err(Error::HandshakeAuthenticationFailure(format!(
                "Handshake from {} has a stale timestamp",
                message.sender_id
            )));
        }
        if state.handshake_key_seen(&message.ephemeral_public_key) {
            self.events.record(
                ProtocolEvent::new(event_type::HANDSHAKE_REJECTED)
                    .with_session(&state.session_id)
                    .with_user(&message.sender_id)
                    .with_reason("replayed handshake"),
            );
            return Err(Error::HandshakeAuthenticationFailure(format!(
                "Handshake from {} replays a consumed ephemeral key",
                message.sender_id
            )));
        }
        Ok(())
    }

    // ========================================================================
    // MESSAGING
    // ========================================================================

    /// Encrypt a plaintext for a peer into a relay-ready MSG envelope.
    pub async fn encrypt_message(&self, peer_id: &str, plaintext: &[u8]) -> Result<MessageEnvelope> {
        let session = self.existing_session(peer_id)?;
        let mut state = session.lock().await;
        self.seal(&mut state, peer_id, EnvelopeType::Msg, plaintext)
    }

    /// Decrypt an inbound MSG envelope from a peer. The replay guard
    /// runs before any decryption work; rejected envelopes are never
    /// decrypted. Control and file envelopes have their own entry
    /// points and are refused here.
    pub async fn decrypt_envelope(&self, envelope: &MessageEnvelope) -> Result<Vec<u8>> {
        if envelope.envelope_type != EnvelopeType::Msg {
            return Err(Error::InvalidState(format!(
                "Expected MSG, got {:?}",
                envelope.envelope_type
            )));
        }
        let peer_id = envelope.sender.clone();
        let session = self.existing_session(&peer_id)?;
        let mut state = session.lock().await;

        if state.session_key.is_none() {
            return Err(Error::InvalidState(format!(
                "No session key with {} (state: {})",
                peer_id,
                state.phase.name()
            )));
        }

        self.admit(&mut state, envelope)?;
        self.open(&state, envelope)
    }

    /// Seal a plaintext into an outbound envelope, consuming the next
    /// sequence number. Counters advance only after sealing succeeded.
    fn seal(
        &self,
        state: &mut SessionState,
        receiver: &str,
        envelope_type: EnvelopeType,
        plaintext: &[u8],
    ) -> Result<MessageEnvelope> {
        let key = state.session_key.as_ref().ok_or_else(|| {
            Error::InvalidState(format!(
                "No session key with {} (state: {})",
                receiver,
                state.phase.name()
            ))
        })?;

        let timestamp = now_timestamp_millis();
        let seq = state.next_seq;
        let aad = message_aad(&state.session_id, &state.local_id, receiver, timestamp, seq);
        let sealed = crypto::encrypt(key, plaintext, &aad)?;

        state.take_seq();
        state.messages_sent += 1;

        Ok(MessageEnvelope::from_sealed(
            envelope_type,
            &state.session_id,
            &state.local_id,
            receiver,
            &sealed,
            timestamp,
            seq,
            Some(Uuid::new_v4().to_string()),
        ))
    }

    /// Run an inbound envelope through the session's replay guard.
    fn admit(&self, state: &mut SessionState, envelope: &MessageEnvelope) -> Result<()> {
        let now = now_timestamp_millis();
        if let Err(reason) = state.replay.accept(envelope, now) {
            tracing::warn!(
                peer = %envelope.sender,
                session_id = %envelope.session_id,
                reason = reason.as_str(),
                seq = envelope.seq,
                "replay guard rejected envelope"
            );
            self.events.record(
                ProtocolEvent::new(event_type::REPLAY_REJECTED)
                    .with_session(&envelope.session_id)
                    .with_user(&envelope.sender)
                    .with_reason(reason.as_str()),
            );
            return Err(Error::Replay(reason));
        }
        Ok(())
    }

    /// Decrypt an admitted envelope's sealed body.
    fn open(&self, state: &SessionState, envelope: &MessageEnvelope) -> Result<Vec<u8>> {
        let key = state.session_key.as_ref().ok_or_else(|| {
            Error::InvalidState(format!("No session key with {}", state.peer_id))
        })?;
        let aad = message_aad(
            &envelope.session_id,
            &envelope.sender,
            &envelope.receiver,
            envelope.timestamp,
            envelope.seq,
        );
        let ciphertext = envelope.decode_ciphertext()?;
        let iv = envelope.decode_iv()?;
        let tag = envelope.decode_auth_tag()?;

        match crypto::decrypt(key, &ciphertext, &iv, &tag, &aad) {
            Ok(plaintext) => Ok(plaintext),
            Err(e) => {
                self.events.record(
                    ProtocolEvent::new(event_type::INTEGRITY_FAILURE)
                        .with_session(&envelope.session_id)
                        .with_user(&envelope.sender),
                );
                Err(e)
            }
        }
    }

    // ========================================================================
    // FILE TRANSFER
    // ========================================================================

    /// Encrypt a file for a peer. Returns a FILE_META envelope carrying
    /// the sealed transfer description followed by one FILE_CHUNK
    /// envelope per chunk, each consuming a sequence number so the
    /// receiver's replay guard covers the whole transfer.
    pub async fn encrypt_file(&self, peer_id: &str, data: &[u8]) -> Result<Vec<MessageEnvelope>> {
        let session = self.existing_session(peer_id)?;
        let mut state = session.lock().await;

        let file_id = Uuid::new_v4().to_string();
        let chunks = {
            let key = state.session_key.as_ref().ok_or_else(|| {
                Error::InvalidState(format!("No session key with {}", peer_id))
            })?;
            crate::files::encrypt_chunks(key, &file_id, data, DEFAULT_CHUNK_SIZE)?
        };

        let metadata = FileMetadata {
            file_id: file_id.clone(),
            total_chunks: chunks.len() as u32,
            total_size: data.len(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        };
        let body = serde_json::to_vec(&metadata)?;

        let mut envelopes = Vec::with_capacity(chunks.len() + 1);
        envelopes.push(self.seal(&mut state, peer_id, EnvelopeType::FileMeta, &body)?);

        for chunk in chunks {
            // The chunk is already sealed with its own AAD; the envelope
            // just carries its parts plus cleartext routing info
            let envelope = MessageEnvelope {
                envelope_type: EnvelopeType::FileChunk,
                session_id: state.session_id.clone(),
                sender: state.local_id.clone(),
                receiver: peer_id.to_string(),
                ciphertext: chunk.ciphertext,
                iv: chunk.iv,
                auth_tag: chunk.auth_tag,
                timestamp: now_timestamp_millis(),
                seq: state.take_seq(),
                nonce: Some(Uuid::new_v4().to_string()),
                chunk: Some(ChunkInfo {
                    file_id: chunk.file_id,
                    chunk_index: chunk.chunk_index,
                    total_chunks: chunk.total_chunks,
                    size: chunk.size,
                }),
            };
            state.messages_sent += 1;
            envelopes.push(envelope);
        }
        Ok(envelopes)
    }

    /// Reassemble and decrypt a file transfer received from a peer.
    /// Every envelope passes through the replay guard; envelopes may
    /// arrive in any order and are sorted by sequence number first.
    pub async fn decrypt_file(&self, envelopes: &[MessageEnvelope]) -> Result<Vec<u8>> {
        let first = envelopes.first().ok_or_else(|| {
            Error::ChunkReassemblyFailed("No envelopes in transfer".into())
        })?;
        let peer_id = first.sender.clone();
        let session = self.existing_session(&peer_id)?;
        let mut state = session.lock().await;

        if state.session_key.is_none() {
            return Err(Error::InvalidState(format!(
                "No session key with {} (state: {})",
                peer_id,
                state.phase.name()
            )));
        }

        let mut ordered: Vec<&MessageEnvelope> = envelopes.iter().collect();
        ordered.sort_by_key(|e| e.seq);

        let mut metadata: Option<FileMetadata> = None;
        let mut chunks: Vec<EncryptedChunk> = Vec::new();
        for envelope in ordered {
            self.admit(&mut state, envelope)?;
            match envelope.envelope_type {
                EnvelopeType::FileMeta => {
                    let body = self.open(&state, envelope)?;
                    metadata = Some(serde_json::from_slice(&body).map_err(|e| {
                        Error::DeserializationError(format!("Invalid file metadata: {}", e))
                    })?);
                }
                EnvelopeType::FileChunk => {
                    let info = envelope.chunk.as_ref().ok_or_else(|| {
                        Error::ChunkReassemblyFailed(
                            "FILE_CHUNK envelope missing chunk info".into(),
                        )
                    })?;
                    chunks.push(EncryptedChunk {
                        file_id: info.file_id.clone(),
                        chunk_index: info.chunk_index,
                        total_chunks: info.total_chunks,
                        size: info.size,
                        iv: envelope.iv.clone(),
                        ciphertext: envelope.ciphertext.clone(),
                        auth_tag: envelope.auth_tag.clone(),
                    });
                }
                other => {
                    return Err(Error::ChunkReassemblyFailed(format!(
                        "Unexpected {:?} envelope in file transfer",
                        other
                    )));
                }
            }
        }

        let metadata = metadata.ok_or_else(|| {
            Error::ChunkReassemblyFailed("Transfer is missing its FILE_META envelope".into())
        })?;
        if chunks.len() as u32 != metadata.total_chunks {
            return Err(Error::ChunkReassemblyFailed(format!(
                "Expected {} chunks, got {}",
                metadata.total_chunks,
                chunks.len()
            )));
        }
        if chunks.iter().any(|c| c.file_id != metadata.file_id) {
            return Err(Error::ChunkReassemblyFailed(
                "Chunk does not belong to this transfer".into(),
            ));
        }

        let key = state.session_key.as_ref().ok_or_else(|| {
            Error::InvalidState(format!("No session key with {}", peer_id))
        })?;
        let data = crate::files::decrypt_chunks(key, &chunks)?;
        if data.len() != metadata.total_size {
            return Err(Error::ChunkReassemblyFailed(format!(
                "Reassembled {} bytes, metadata says {}",
                data.len(),
                metadata.total_size
            )));
        }
        Ok(data)
    }

    // ========================================================================
    // ROTATION AND TEARDOWN
    // ========================================================================

    /// Whether the session with a peer is due for a re-key under the
    /// configured policy.
    pub async fn should_rotate(&self, peer_id: &str) -> Result<bool> {
        let session = self.existing_session(peer_id)?;
        let state = session.lock().await;
        Ok(self.policy.should_rotate(&state, now_timestamp_millis()))
    }

    /// Begin re-keying an established session. Returns the KEY_UPDATE
    /// envelope to relay; the old key stays usable until
    /// [`complete`](Self::complete) installs the new one. The replay
    /// window is preserved across the rotation.
    pub async fn rotate(&self, peer_id: &str) -> Result<MessageEnvelope> {
        let session = self.existing_session(peer_id)?;
        let mut state = session.lock().await;

        if !matches!(state.phase, SessionPhase::Established) {
            return Err(Error::InvalidState(format!(
                "Cannot rotate session with {} (state: {})",
                peer_id,
                state.phase.name()
            )));
        }

        let (ephemeral, message) = create_handshake(&self.identity, &self.local_id);
        state.phase = SessionPhase::Rotating { ephemeral };

        tracing::debug!(peer = peer_id, session_id = %state.session_id, "rotating session key");
        self.events.record(
            ProtocolEvent::new(event_type::HANDSHAKE_INITIATED)
                .with_session(&state.session_id)
                .with_user(peer_id),
        );
        MessageEnvelope::control(EnvelopeType::KeyUpdate, &state.session_id, peer_id, &message)
    }

    /// Close the session with a peer and drop its key material.
    pub async fn close(&self, peer_id: &str) -> Result<()> {
        let session = self.existing_session(peer_id)?;
        let mut state = session.lock().await;
        state.close();

        tracing::info!(peer = peer_id, session_id = %state.session_id, "session closed");
        self.events.record(
            ProtocolEvent::new(event_type::SESSION_CLOSED)
                .with_session(&state.session_id)
                .with_user(peer_id),
        );
        Ok(())
    }
}

/// Additional authenticated data binding a message to its session,
/// direction, timestamp, and sequence number. Any relay tampering with
/// envelope metadata breaks tag verification.
fn message_aad(
    session_id: &str,
    sender: &str,
    receiver: &str,
    timestamp: i64,
    seq: u64,
) -> Vec<u8> {
    let mut aad = Vec::with_capacity(session_id.len() + sender.len() + receiver.len() + 19);
    aad.extend_from_slice(session_id.as_bytes());
    aad.push(b'|');
    aad.extend_from_slice(sender.as_bytes());
    aad.push(b'|');
    aad.extend_from_slice(receiver.as_bytes());
    aad.push(b'|');
    aad.extend_from_slice(&timestamp.to_be_bytes());
    aad.extend_from_slice(&seq.to_be_bytes());
    aad
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::handshake::sign_handshake_at;

    fn pair() -> (SessionManager, SessionManager) {
        let directory = Arc::new(MemoryDirectory::new());
        let alice_identity = IdentityKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();
        directory.register("alice", alice_identity.public());
        directory.register("bob", bob_identity.public());

        let alice = SessionManager::new("alice", alice_identity, directory.clone());
        let bob = SessionManager::new("bob", bob_identity, directory);
        (alice, bob)
    }

    async fn establish(alice: &SessionManager, bob: &SessionManager) {
        let init = alice.initiate("bob").await.unwrap();
        let response = bob.handle_init(&init).await.unwrap();
        alice.complete(&response).await.unwrap();
    }

    /// Re-wrap a handshake after mutating it, preserving the envelope
    /// framing a relay would see.
    fn rewrap(
        envelope: &MessageEnvelope,
        mutate: impl FnOnce(&mut HandshakeMessage),
    ) -> MessageEnvelope {
        let mut message = envelope.handshake().unwrap();
        mutate(&mut message);
        MessageEnvelope::control(
            envelope.envelope_type,
            &envelope.session_id,
            &envelope.receiver,
            &message,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_full_exchange_round_trip() {
        let (alice, bob) = pair();
        establish(&alice, &bob).await;

        let envelope = alice.encrypt_message("bob", b"hello bob").await.unwrap();
        let plaintext = bob.decrypt_envelope(&envelope).await.unwrap();
        assert_eq!(plaintext, b"hello bob");
    }

    #[tokio::test]
    async fn test_init_envelope_is_kep_init() {
        let (alice, _bob) = pair();
        let init = alice.initiate("bob").await.unwrap();
        assert_eq!(init.envelope_type, EnvelopeType::KepInit);
        assert_eq!(init.sender, "alice");
        assert_eq!(init.receiver, "bob");
    }

    #[tokio::test]
    async fn test_unknown_peer_fails() {
        let (alice, _bob) = pair();
        let err = alice.initiate("carol").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_encrypt_without_session_fails() {
        let (alice, _bob) = pair();
        let err = alice.encrypt_message("bob", b"hi").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_tampered_init_rejected() {
        let (alice, bob) = pair();
        let init = alice.initiate("bob").await.unwrap();
        let forged = rewrap(&init, |m| {
            m.ephemeral_public_key = EphemeralKeyPair::generate().public_bytes();
        });

        let err = bob.handle_init(&forged).await.unwrap_err();
        assert!(matches!(err, Error::HandshakeAuthenticationFailure(_)));
    }

    #[tokio::test]
    async fn test_tampered_response_resets_initiator() {
        let (alice, bob) = pair();
        let init = alice.initiate("bob").await.unwrap();
        let response = bob.handle_init(&init).await.unwrap();
        let forged = rewrap(&response, |m| {
            m.ephemeral_public_key = EphemeralKeyPair::generate().public_bytes();
        });

        let err = alice.complete(&forged).await.unwrap_err();
        assert!(matches!(err, Error::HandshakeAuthenticationFailure(_)));

        // The pending exchange was discarded, no key installed
        let err = alice.encrypt_message("bob", b"hi").await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_stale_init_rejected() {
        let directory = Arc::new(MemoryDirectory::new());
        let alice_identity = IdentityKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();
        directory.register("alice", alice_identity.public());
        directory.register("bob", bob_identity.public());
        let bob = SessionManager::new("bob", bob_identity, directory);

        // Validly signed, but two windows in the past
        let old = sign_handshake_at(
            &alice_identity,
            "alice",
            EphemeralKeyPair::generate().public_bytes(),
            now_timestamp_millis() - 2 * TIMESTAMP_SKEW_MS,
        );
        let session_id = crate::session::state::session_id_for("alice", "bob");
        let stale =
            MessageEnvelope::control(EnvelopeType::KepInit, &session_id, "bob", &old).unwrap();

        let err = bob.handle_init(&stale).await.unwrap_err();
        assert!(matches!(err, Error::HandshakeAuthenticationFailure(_)));
    }

    #[tokio::test]
    async fn test_replayed_init_rejected_on_established_session() {
        let (alice, bob) = pair();
        let init = alice.initiate("bob").await.unwrap();
        let response = bob.handle_init(&init).await.unwrap();
        alice.complete(&response).await.unwrap();

        // A relay re-delivering the captured init must not desync the
        // established session
        let err = bob.handle_init(&init).await.unwrap_err();
        assert!(matches!(err, Error::HandshakeAuthenticationFailure(_)));

        // Traffic still flows under the original key
        let envelope = alice.encrypt_message("bob", b"still here").await.unwrap();
        assert_eq!(bob.decrypt_envelope(&envelope).await.unwrap(), b"still here");
    }

    #[tokio::test]
    async fn test_replayed_response_does_not_cancel_pending_exchange() {
        let (alice, bob) = pair();
        establish(&alice, &bob).await;

        let rekey = alice.rotate("bob").await.unwrap();
        let response = bob.handle_init(&rekey).await.unwrap();
        alice.complete(&response).await.unwrap();

        // Start another rotation, then replay the previous response
        let rekey2 = alice.rotate("bob").await.unwrap();
        let err = alice.complete(&response).await.unwrap_err();
        assert!(matches!(err, Error::HandshakeAuthenticationFailure(_)));

        // The new pending exchange is still live and can complete
        let response2 = bob.handle_init(&rekey2).await.unwrap();
        alice.complete(&response2).await.unwrap();
        let envelope = alice.encrypt_message("bob", b"rotated twice").await.unwrap();
        assert_eq!(bob.decrypt_envelope(&envelope).await.unwrap(), b"rotated twice");
    }

    #[tokio::test]
    async fn test_replayed_envelope_rejected() {
        let (alice, bob) = pair();
        establish(&alice, &bob).await;

        let envelope = alice.encrypt_message("bob", b"once").await.unwrap();
        bob.decrypt_envelope(&envelope).await.unwrap();

        let err = bob.decrypt_envelope(&envelope).await.unwrap_err();
        assert!(matches!(err, Error::Replay(_)));
    }

    #[tokio::test]
    async fn test_metadata_tampering_breaks_tag() {
        let (alice, bob) = pair();
        establish(&alice, &bob).await;

        let mut envelope = alice.encrypt_message("bob", b"hello").await.unwrap();
        envelope.receiver = "mallory".into();

        let err = bob.decrypt_envelope(&envelope).await.unwrap_err();
        assert!(matches!(err, Error::IntegrityFailure(_)));
    }

    #[tokio::test]
    async fn test_decrypt_refuses_control_envelopes() {
        let (alice, bob) = pair();
        let init = alice.initiate("bob").await.unwrap();
        let err = bob.decrypt_envelope(&init).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_rotation_installs_new_key() {
        let (alice, bob) = pair();
        establish(&alice, &bob).await;

        let before = alice.encrypt_message("bob", b"old key").await.unwrap();
        bob.decrypt_envelope(&before).await.unwrap();

        let rekey = alice.rotate("bob").await.unwrap();
        assert_eq!(rekey.envelope_type, EnvelopeType::KeyUpdate);
        let response = bob.handle_init(&rekey).await.unwrap();
        alice.complete(&response).await.unwrap();

        // Traffic still flows under the new key
        let after = alice.encrypt_message("bob", b"new key").await.unwrap();
        assert_eq!(bob.decrypt_envelope(&after).await.unwrap(), b"new key");
    }

    #[tokio::test]
    async fn test_rotation_preserves_replay_window() {
        let (alice, bob) = pair();
        establish(&alice, &bob).await;

        let old = alice.encrypt_message("bob", b"before rotation").await.unwrap();
        bob.decrypt_envelope(&old).await.unwrap();

        let rekey = alice.rotate("bob").await.unwrap();
        let response = bob.handle_init(&rekey).await.unwrap();
        alice.complete(&response).await.unwrap();

        // Pre-rotation envelope cannot be replayed after the re-key
        let err = bob.decrypt_envelope(&old).await.unwrap_err();
        assert!(matches!(err, Error::Replay(_)));
    }

    #[tokio::test]
    async fn test_rotate_requires_established() {
        let (alice, _bob) = pair();
        alice.initiate("bob").await.unwrap();
        let err = alice.rotate("bob").await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_close_drops_key() {
        let (alice, bob) = pair();
        establish(&alice, &bob).await;

        alice.close("bob").await.unwrap();
        let err = alice.encrypt_message("bob", b"hi").await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_initiate_after_close_rejected() {
        let (alice, bob) = pair();
        establish(&alice, &bob).await;
        alice.close("bob").await.unwrap();

        let err = alice.initiate("bob").await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_seq_numbers_strictly_increase() {
        let (alice, bob) = pair();
        establish(&alice, &bob).await;

        let first = alice.encrypt_message("bob", b"1").await.unwrap();
        let second = alice.encrypt_message("bob", b"2").await.unwrap();
        assert!(second.seq > first.seq);
    }

    #[tokio::test]
    async fn test_file_round_trip_through_manager() {
        let (alice, bob) = pair();
        establish(&alice, &bob).await;

        let data = vec![7u8; 1_000_000];
        let envelopes = alice.encrypt_file("bob", &data).await.unwrap();
        assert_eq!(envelopes[0].envelope_type, EnvelopeType::FileMeta);
        assert!(envelopes[1..]
            .iter()
            .all(|e| e.envelope_type == EnvelopeType::FileChunk));

        let restored = bob.decrypt_file(&envelopes).await.unwrap();
        assert_eq!(restored, data);
    }

    #[tokio::test]
    async fn test_file_envelopes_tolerate_reordering() {
        let (alice, bob) = pair();
        establish(&alice, &bob).await;

        let data = vec![9u8; 600_000];
        let mut envelopes = alice.encrypt_file("bob", &data).await.unwrap();
        envelopes.reverse();

        let restored = bob.decrypt_file(&envelopes).await.unwrap();
        assert_eq!(restored, data);
    }

    #[tokio::test]
    async fn test_replayed_file_transfer_rejected() {
        let (alice, bob) = pair();
        establish(&alice, &bob).await;

        let envelopes = alice.encrypt_file("bob", &[1u8; 1000]).await.unwrap();
        bob.decrypt_file(&envelopes).await.unwrap();

        let err = bob.decrypt_file(&envelopes).await.unwrap_err();
        assert!(matches!(err, Error::Replay(_)));
    }

    #[tokio::test]
    async fn test_file_chunk_routing_tamper_detected() {
        let (alice, bob) = pair();
        establish(&alice, &bob).await;

        let mut envelopes = alice.encrypt_file("bob", &vec![5u8; 600_000]).await.unwrap();
        // Swap two chunks' positions in their cleartext routing info;
        // the chunk AAD binds the real index so decryption must fail
        let info = envelopes[1].chunk.as_mut().unwrap();
        info.chunk_index = 1;
        let info = envelopes[2].chunk.as_mut().unwrap();
        info.chunk_index = 0;

        let err = bob.decrypt_file(&envelopes).await.unwrap_err();
        assert!(matches!(err, Error::IntegrityFailure(_)));
    }

    #[tokio::test]
    async fn test_file_transfer_requires_metadata() {
        let (alice, bob) = pair();
        establish(&alice, &bob).await;

        let envelopes = alice.encrypt_file("bob", &[2u8; 1000]).await.unwrap();
        let chunks_only: Vec<MessageEnvelope> = envelopes[1..].to_vec();

        let err = bob.decrypt_file(&chunks_only).await.unwrap_err();
        assert!(matches!(err, Error::ChunkReassemblyFailed(_)));
    }

    #[tokio::test]
    async fn test_messages_interleave_with_file_transfer() {
        let (alice, bob) = pair();
        establish(&alice, &bob).await;

        let before = alice.encrypt_message("bob", b"before").await.unwrap();
        let envelopes = alice.encrypt_file("bob", &[3u8; 1000]).await.unwrap();
        let after = alice.encrypt_message("bob", b"after").await.unwrap();

        assert_eq!(bob.decrypt_envelope(&before).await.unwrap(), b"before");
        bob.decrypt_file(&envelopes).await.unwrap();
        assert_eq!(bob.decrypt_envelope(&after).await.unwrap(), b"after");
    }
}
