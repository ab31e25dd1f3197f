//! # Sable Core
//!
//! End-to-end encrypted messaging session protocol. The relay server
//! only ever sees sealed envelopes; plaintext and key material exist
//! exclusively at the two endpoints.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            SABLE CORE                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌────────────────────────── SessionManager ──────────────────────────┐│
//! │  │  initiate / handle_init / complete     signed key exchange         ││
//! │  │  encrypt_message / decrypt_envelope    AES-256-GCM envelopes       ││
//! │  │  rotate / close                        key lifecycle               ││
//! │  └──────┬──────────────┬───────────────┬──────────────┬──────────────┘│
//! │         │              │               │              │               │
//! │         ▼              ▼               ▼              ▼               │
//! │  ┌────────────┐ ┌────────────┐ ┌─────────────┐ ┌────────────┐        │
//! │  │  session   │ │   crypto   │ │  envelope   │ │   files    │        │
//! │  │ handshake  │ │ keys (Ed/  │ │ wire format │ │ chunked    │        │
//! │  │ state      │ │  X25519)   │ │ base64+JSON │ │ file       │        │
//! │  │ replay     │ │ cipher     │ │             │ │ cipher     │        │
//! │  │ rotation   │ │ (AES-GCM)  │ │             │ │            │        │
//! │  └────────────┘ │ kdf (HKDF) │ └─────────────┘ └────────────┘        │
//! │                 └────────────┘                                        │
//! │  ┌────────────┐ ┌────────────┐ ┌─────────────┐                       │
//! │  │  keystore  │ │   event    │ │    error    │                       │
//! │  │ Argon2id   │ │ EventSink  │ │  taxonomy   │                       │
//! │  │ key wrap   │ │ + tracing  │ │ with codes  │                       │
//! │  └────────────┘ └────────────┘ └─────────────┘                       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Invariants
//!
//! - Handshakes are signed by long-term identity keys; an unsigned or
//!   forged ephemeral key aborts the exchange.
//! - Two honest endpoints derive bit-identical session keys; nothing a
//!   relay observes suffices to derive them.
//! - Every envelope carries a fresh IV; metadata rides in the AAD, so
//!   relay tampering breaks tag verification.
//! - The replay guard rejects stale timestamps, non-increasing sequence
//!   numbers, and duplicate nonces, and survives key rotation.
//! - Private keys persist only password-wrapped (Argon2id + AES-GCM) and
//!   are never logged or transmitted.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use sable_core::{IdentityKeyPair, MemoryDirectory, SessionManager};
//!
//! # async fn demo() -> sable_core::Result<()> {
//! let directory = Arc::new(MemoryDirectory::new());
//! let alice_key = IdentityKeyPair::generate();
//! let bob_key = IdentityKeyPair::generate();
//! directory.register("alice", alice_key.public());
//! directory.register("bob", bob_key.public());
//!
//! let alice = SessionManager::new("alice", alice_key, directory.clone());
//! let bob = SessionManager::new("bob", bob_key, directory);
//!
//! // Signed key exchange, relayed by an untrusted server
//! let init = alice.initiate("bob").await?;
//! let response = bob.handle_init(&init).await?;
//! alice.complete(&response).await?;
//!
//! // Sealed traffic
//! let envelope = alice.encrypt_message("bob", b"hello").await?;
//! let plaintext = bob.decrypt_envelope(&envelope).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod crypto;
pub mod envelope;
pub mod error;
pub mod event;
pub mod files;
pub mod keystore;
pub mod session;
pub mod time;

pub use crypto::{IdentityKeyPair, IdentityPublicKey, SessionKey};
pub use envelope::{ChunkInfo, EnvelopeType, MessageEnvelope};
pub use error::{Error, Result};
pub use event::{EventSink, ProtocolEvent, TracingEventSink};
pub use files::{EncryptedChunk, FileMetadata, DEFAULT_CHUNK_SIZE};
pub use keystore::{EncryptedKeyRecord, KeyRecordStore, KeyStore, MemoryKeyRecordStore};
pub use session::{
    Directory, HandshakeMessage, MemoryDirectory, RejectReason, RotationPolicy, SessionManager,
};
