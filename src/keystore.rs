//! # Identity Key Store
//!
//! Password-wrapped persistence for long-term identity keys.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                      KEY WRAPPING PIPELINE                          │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │   password ──► Argon2id(salt, params) ──► wrapping key (32 bytes)   │
//! │                                                │                    │
//! │   identity secret ──► AES-256-GCM ◄────────────┘                    │
//! │   (32 bytes)          iv: fresh 12 bytes per store                  │
//! │                       aad: user_id                                  │
//! │                                                │                    │
//! │                                                ▼                    │
//! │   EncryptedKeyRecord { ciphertext, iv, salt, kdf_params }           │
//! │                                                                     │
//! │   A wrong password fails tag verification and surfaces as           │
//! │   AuthenticationFailure. The private key bytes never touch the      │
//! │   store in the clear.                                               │
//! │                                                                     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;

use argon2::{Algorithm, Argon2, Params, Version};
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{decrypt, encrypt, IdentityKeyPair, Iv, SessionKey, KEY_SIZE};
use crate::error::{Error, Result};
use crate::event::{event_type, EventSink, ProtocolEvent};

/// Salt length for the password KDF.
pub const SALT_SIZE: usize = 16;

/// Argon2id cost parameters stored alongside each record, so records
/// written under older defaults stay readable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Iteration count
    pub iterations: u32,
    /// Lane count
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // Argon2id defaults (RFC 9106 low-memory profile)
        Self {
            memory_kib: 19_456,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// A password-wrapped identity key as it sits in storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedKeyRecord {
    /// Owner of the wrapped key
    pub user_id: String,
    /// AES-GCM ciphertext of the private key, tag appended
    #[serde(with = "hex_vec")]
    pub encrypted_private_key: Vec<u8>,
    /// IV used for the wrap, fresh per store
    #[serde(with = "hex_iv")]
    pub iv: [u8; 12],
    /// Argon2 salt, fresh per store
    #[serde(with = "hex_salt")]
    pub salt: [u8; SALT_SIZE],
    /// KDF cost parameters used for this record
    pub kdf_params: KdfParams,
}

/// Backend that persists encrypted key records.
#[async_trait]
pub trait KeyRecordStore: Send + Sync {
    /// Fetch the record for a user, if any.
    async fn get(&self, user_id: &str) -> Result<Option<EncryptedKeyRecord>>;
    /// Insert or replace the record for a user.
    async fn put(&self, record: EncryptedKeyRecord) -> Result<()>;
    /// Remove the record for a user. Removing a missing record is not an
    /// error.
    async fn delete(&self, user_id: &str) -> Result<()>;
}

/// In-memory record store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryKeyRecordStore {
    records: RwLock<HashMap<String, EncryptedKeyRecord>>,
}

impl MemoryKeyRecordStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyRecordStore for MemoryKeyRecordStore {
    async fn get(&self, user_id: &str) -> Result<Option<EncryptedKeyRecord>> {
        Ok(self.records.read().get(user_id).cloned())
    }

    async fn put(&self, record: EncryptedKeyRecord) -> Result<()> {
        self.records.write().insert(record.user_id.clone(), record);
        Ok(())
    }

    async fn delete(&self, user_id: &str) -> Result<()> {
        self.records.write().remove(user_id);
        Ok(())
    }
}

/// Password-wrapping key store over a pluggable record backend.
pub struct KeyStore<S: KeyRecordStore> {
    store: S,
    params: KdfParams,
}

impl<S: KeyRecordStore> KeyStore<S> {
    /// Create a key store with the default KDF parameters.
    pub fn new(store: S) -> Self {
        Self {
            store,
            params: KdfParams::default(),
        }
    }

    /// Create a key store with custom KDF parameters (used by tests to
    /// keep Argon2 cheap).
    pub fn with_params(store: S, params: KdfParams) -> Self {
        Self { store, params }
    }

    /// Wrap an identity key under the password and persist it.
    pub async fn store(
        &self,
        user_id: &str,
        identity: &IdentityKeyPair,
        password: &str,
    ) -> Result<()> {
        let mut salt = [0u8; SALT_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut salt);

        let wrapping_key = derive_wrapping_key(password, &salt, &self.params)?;
        let secret = identity.secret_bytes();

        // AAD binds the record to its owner, so records cannot be swapped
        // between users in storage
        let sealed = encrypt(&wrapping_key, secret.as_slice(), user_id.as_bytes())?;

        let mut ciphertext = sealed.ciphertext;
        ciphertext.extend_from_slice(sealed.auth_tag.as_bytes());

        let record = EncryptedKeyRecord {
            user_id: user_id.to_string(),
            encrypted_private_key: ciphertext,
            iv: *sealed.iv.as_bytes(),
            salt,
            kdf_params: self.params,
        };
        self.store.put(record).await?;

        tracing::debug!(user = user_id, "identity key stored");
        Ok(())
    }

    /// Load and unwrap a user's identity key.
    ///
    /// A wrong password surfaces as [`Error::AuthenticationFailure`], a
    /// missing record as [`Error::NotFound`].
    pub async fn load(&self, user_id: &str, password: &str) -> Result<IdentityKeyPair> {
        let record = self
            .store
            .get(user_id)
            .await?
            .ok_or_else(|| Error::NotFound(user_id.to_string()))?;

        let wrapping_key = derive_wrapping_key(password, &record.salt, &record.kdf_params)?;

        if record.encrypted_private_key.len() < crate::crypto::TAG_SIZE {
            return Err(Error::InvalidKey("Stored record too short".into()));
        }
        let split = record.encrypted_private_key.len() - crate::crypto::TAG_SIZE;
        let (body, tag_bytes) = record.encrypted_private_key.split_at(split);
        let tag: [u8; crate::crypto::TAG_SIZE] = tag_bytes
            .try_into()
            .map_err(|_| Error::InvalidKey("Malformed auth tag".into()))?;

        let plaintext = decrypt(
            &wrapping_key,
            body,
            &Iv::from_bytes(record.iv),
            &crate::crypto::AuthTag::from_bytes(tag),
            user_id.as_bytes(),
        )
        .map_err(|_| Error::AuthenticationFailure)?;

        let secret: Zeroizing<[u8; KEY_SIZE]> = Zeroizing::new(
            plaintext
                .as_slice()
                .try_into()
                .map_err(|_| Error::InvalidKey("Stored key has wrong length".into()))?,
        );

        tracing::debug!(user = user_id, "identity key loaded");
        Ok(IdentityKeyPair::from_bytes(&secret))
    }

    /// Whether a record exists for the user.
    pub async fn exists(&self, user_id: &str) -> Result<bool> {
        Ok(self.store.get(user_id).await?.is_some())
    }

    /// Remove a user's stored key.
    pub async fn delete(&self, user_id: &str) -> Result<()> {
        self.store.delete(user_id).await
    }

    /// Store with an event sink notification, for embedders that audit
    /// key material access.
    pub async fn store_with_events(
        &self,
        user_id: &str,
        identity: &IdentityKeyPair,
        password: &str,
        events: &dyn EventSink,
    ) -> Result<()> {
        self.store(user_id, identity, password).await?;
        events.record(ProtocolEvent::new(event_type::KEY_STORED).with_user(user_id));
        Ok(())
    }

    /// Load with an event sink notification.
    pub async fn load_with_events(
        &self,
        user_id: &str,
        password: &str,
        events: &dyn EventSink,
    ) -> Result<IdentityKeyPair> {
        let identity = self.load(user_id, password).await?;
        events.record(ProtocolEvent::new(event_type::KEY_LOADED).with_user(user_id));
        Ok(identity)
    }
}

/// Stretch a password into a 32-byte wrapping key with Argon2id.
fn derive_wrapping_key(password: &str, salt: &[u8], params: &KdfParams) -> Result<SessionKey> {
    let argon_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| Error::KeyDerivationFailed(e.to_string()))?;

    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    argon
        .hash_password_into(password.as_bytes(), salt, key.as_mut_slice())
        .map_err(|e| Error::KeyDerivationFailed(e.to_string()))?;
    Ok(SessionKey::from_bytes(*key))
}

// ============================================================================
// SERDE HELPERS
// ============================================================================

mod hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

mod hex_iv {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 12], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 12], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("iv must be 12 bytes"))
    }
}

mod hex_salt {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::SALT_SIZE;

    pub fn serialize<S: Serializer>(bytes: &[u8; SALT_SIZE], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; SALT_SIZE], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("salt must be 16 bytes"))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Cheap Argon2 parameters so tests stay fast
    fn test_params() -> KdfParams {
        KdfParams {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    fn test_store() -> KeyStore<MemoryKeyRecordStore> {
        KeyStore::with_params(MemoryKeyRecordStore::new(), test_params())
    }

    #[tokio::test]
    async fn test_store_and_load_round_trip() {
        let store = test_store();
        let identity = IdentityKeyPair::generate();
        store.store("alice", &identity, "hunter2").await.unwrap();

        let loaded = store.load("alice", "hunter2").await.unwrap();
        assert_eq!(loaded.public(), identity.public());
    }

    #[tokio::test]
    async fn test_wrong_password_is_authentication_failure() {
        let store = test_store();
        let identity = IdentityKeyPair::generate();
        store.store("alice", &identity, "hunter2").await.unwrap();

        let err = store.load("alice", "wrong").await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailure));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_missing_record_is_not_found() {
        let store = test_store();
        let err = store.load("nobody", "pw").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_fresh_iv_and_salt_per_store() {
        let store = test_store();
        let identity = IdentityKeyPair::generate();

        store.store("alice", &identity, "pw").await.unwrap();
        let first = store.store.get("alice").await.unwrap().unwrap();

        store.store("alice", &identity, "pw").await.unwrap();
        let second = store.store.get("alice").await.unwrap().unwrap();

        assert_ne!(first.iv, second.iv);
        assert_ne!(first.salt, second.salt);
        assert_ne!(first.encrypted_private_key, second.encrypted_private_key);
    }

    #[tokio::test]
    async fn test_record_bound_to_user_id() {
        let store = test_store();
        let identity = IdentityKeyPair::generate();
        store.store("alice", &identity, "pw").await.unwrap();

        // Re-file alice's record under bob's name; the AAD binding makes
        // it unreadable even with the right password
        let mut record = store.store.get("alice").await.unwrap().unwrap();
        record.user_id = "bob".into();
        store.store.put(record).await.unwrap();

        let err = store.load("bob", "pw").await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailure));
    }

    #[tokio::test]
    async fn test_exists_and_delete() {
        let store = test_store();
        let identity = IdentityKeyPair::generate();

        assert!(!store.exists("alice").await.unwrap());
        store.store("alice", &identity, "pw").await.unwrap();
        assert!(store.exists("alice").await.unwrap());

        store.delete("alice").await.unwrap();
        assert!(!store.exists("alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_record_serde_round_trip() {
        let store = test_store();
        let identity = IdentityKeyPair::generate();
        store.store("alice", &identity, "pw").await.unwrap();

        let record = store.store.get("alice").await.unwrap().unwrap();
        let json = serde_json::to_string(&record).unwrap();
        let restored: EncryptedKeyRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.iv, record.iv);
        assert_eq!(restored.salt, record.salt);
        assert_eq!(restored.kdf_params, record.kdf_params);
    }
}
