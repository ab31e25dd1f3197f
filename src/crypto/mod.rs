//! # Cryptography Module
//!
//! Cryptographic primitives for the Sable session protocol.
//!
//! ## Algorithm Choices & Rationale
//!
//! | Algorithm | Purpose | Why Chosen |
//! |-----------|---------|------------|
//! | Ed25519 | Identity signatures | Fast, small keys, widely audited |
//! | X25519 | Ephemeral key exchange | Fast ECDH, same curve family |
//! | AES-256-GCM | Message encryption | Hardware acceleration, AEAD |
//! | HKDF-SHA256 | Session key derivation | Extract-then-expand, well-analyzed |
//! | Argon2id | Password key wrapping | Memory-hard, resists offline guessing |
//!
//! ## Security Considerations
//!
//! 1. **Key Zeroization**: secret keys and session keys are zeroized on drop
//! 2. **Constant-Time Operations**: dalek crates for constant-time curve math
//! 3. **Secure Random**: `rand::rngs::OsRng` for all key and IV generation
//! 4. **No IV Reuse**: a fresh random IV for every encryption operation

mod cipher;
mod kdf;
mod keys;

pub use cipher::{
    decrypt, encrypt, AuthTag, Iv, SealedMessage, SessionKey, IV_SIZE, SESSION_KEY_SIZE, TAG_SIZE,
};
pub use kdf::{derive_session_key, handshake_salt};
pub use keys::{
    verify, EphemeralKeyPair, IdentityKeyPair, IdentityPublicKey, SharedSecret, Signature,
    IDENTITY_CURVE, KEY_SIZE, SIGNATURE_SIZE,
};
