//! # Session Layer
//!
//! Signed ephemeral key exchange, per-peer session state, replay
//! enforcement, and key rotation. [`SessionManager`] is the entry point;
//! the submodules hold the pieces it orchestrates.

pub mod handshake;
pub mod manager;
pub mod replay;
pub mod rotation;
pub mod state;

pub use handshake::{create_handshake, sign_handshake, sign_handshake_at, HandshakeMessage};
pub use manager::{Directory, MemoryDirectory, SessionManager};
pub use replay::{RejectReason, ReplayWindow, NONCE_CACHE_CAPACITY, TIMESTAMP_SKEW_MS};
pub use rotation::RotationPolicy;
pub use state::{session_id_for, SessionPhase, SessionState};
