//! # File Chunk Cipher
//!
//! Chunked encryption for file transfer over the same session key as
//! messages. Each chunk is sealed independently with its own IV, so
//! chunks can be relayed and stored out of order; the AAD binds every
//! chunk to its file, its position, and the total count, so substituting
//! a chunk from another file, reordering, or truncating the set breaks
//! tag verification.
//!
//! ```text
//!   file ──split──► [chunk 0][chunk 1]...[chunk n-1]
//!                       │
//!                       ▼  per chunk
//!   AES-256-GCM(key, chunk, iv: fresh, aad: "file_id/index/total")
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::crypto::{decrypt, encrypt, AuthTag, Iv, SessionKey, IV_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

/// Default plaintext chunk size: 256 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Transfer-level description of a chunked file, sealed into the
/// FILE_META envelope that precedes the chunks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMetadata {
    /// Transfer identifier shared by every chunk of this file
    pub file_id: String,
    /// Total chunks in the transfer
    pub total_chunks: u32,
    /// Plaintext size of the whole file
    pub total_size: usize,
    /// Plaintext chunk size used by the sender
    pub chunk_size: usize,
}

/// One independently sealed file chunk (FILE_CHUNK envelope body).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedChunk {
    /// Transfer this chunk belongs to
    pub file_id: String,
    /// Zero-based position within the file
    pub chunk_index: u32,
    /// Total chunks in the file
    pub total_chunks: u32,
    /// Plaintext size of this chunk
    pub size: usize,
    /// Per-chunk IV (base64)
    pub iv: String,
    /// Sealed chunk body (base64)
    pub ciphertext: String,
    /// Detached authentication tag (base64)
    pub auth_tag: String,
}

/// AAD binding a chunk to its transfer, position, and the full set size.
fn chunk_aad(file_id: &str, chunk_index: u32, total_chunks: u32) -> Vec<u8> {
    format!("{}/{}/{}", file_id, chunk_index, total_chunks).into_bytes()
}

/// Split a file into chunks and seal each one independently.
///
/// The `file_id` ties every chunk to one transfer; chunks sealed under a
/// different id will not authenticate. An empty file produces an empty
/// chunk set.
pub fn encrypt_chunks(
    key: &SessionKey,
    file_id: &str,
    data: &[u8],
    chunk_size: usize,
) -> Result<Vec<EncryptedChunk>> {
    if chunk_size == 0 {
        return Err(Error::EncryptionFailed("Chunk size must be non-zero".into()));
    }

    let total = data.len().div_ceil(chunk_size);
    let total_chunks = u32::try_from(total)
        .map_err(|_| Error::EncryptionFailed("File produces too many chunks".into()))?;

    let mut chunks = Vec::with_capacity(total);
    for (index, plaintext) in data.chunks(chunk_size).enumerate() {
        let chunk_index = index as u32;
        let sealed = encrypt(key, plaintext, &chunk_aad(file_id, chunk_index, total_chunks))?;
        chunks.push(EncryptedChunk {
            file_id: file_id.to_string(),
            chunk_index,
            total_chunks,
            size: plaintext.len(),
            iv: BASE64.encode(sealed.iv.as_bytes()),
            ciphertext: BASE64.encode(&sealed.ciphertext),
            auth_tag: BASE64.encode(sealed.auth_tag.as_bytes()),
        });
    }
    Ok(chunks)
}

/// Reassemble a full chunk set into the original file.
///
/// Chunks may arrive in any order. Reassembly aborts on the first
/// missing, duplicated, inconsistent, or tampered chunk; partial output
/// is never returned.
pub fn decrypt_chunks(key: &SessionKey, chunks: &[EncryptedChunk]) -> Result<Vec<u8>> {
    if chunks.is_empty() {
        return Ok(Vec::new());
    }

    let file_id = &chunks[0].file_id;
    if chunks.iter().any(|c| &c.file_id != file_id) {
        return Err(Error::ChunkReassemblyFailed(
            "Chunks belong to different transfers".into(),
        ));
    }

    let total_chunks = chunks[0].total_chunks;
    if chunks.iter().any(|c| c.total_chunks != total_chunks) {
        return Err(Error::ChunkReassemblyFailed(
            "Chunks disagree on total count".into(),
        ));
    }
    if chunks.len() as u32 != total_chunks {
        return Err(Error::ChunkReassemblyFailed(format!(
            "Expected {} chunks, got {}",
            total_chunks,
            chunks.len()
        )));
    }

    let mut ordered: Vec<&EncryptedChunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.chunk_index);
    for (expected, chunk) in ordered.iter().enumerate() {
        if chunk.chunk_index as usize != expected {
            return Err(Error::ChunkReassemblyFailed(format!(
                "Missing or duplicate chunk at index {}",
                expected
            )));
        }
    }

    let mut data = Vec::with_capacity(ordered.iter().map(|c| c.size).sum());
    for chunk in ordered {
        let ciphertext = BASE64
            .decode(&chunk.ciphertext)
            .map_err(|e| Error::DeserializationError(format!("Invalid chunk body: {}", e)))?;
        let iv_bytes: [u8; IV_SIZE] = BASE64
            .decode(&chunk.iv)
            .map_err(|e| Error::DeserializationError(format!("Invalid chunk iv: {}", e)))?
            .try_into()
            .map_err(|_| Error::DeserializationError("Chunk IV must be 12 bytes".into()))?;
        let tag_bytes: [u8; TAG_SIZE] = BASE64
            .decode(&chunk.auth_tag)
            .map_err(|e| Error::DeserializationError(format!("Invalid chunk tag: {}", e)))?
            .try_into()
            .map_err(|_| Error::DeserializationError("Chunk tag must be 16 bytes".into()))?;

        let plaintext = decrypt(
            key,
            &ciphertext,
            &Iv::from_bytes(iv_bytes),
            &AuthTag::from_bytes(tag_bytes),
            &chunk_aad(&chunk.file_id, chunk.chunk_index, chunk.total_chunks),
        )?;
        data.extend_from_slice(&plaintext);
    }
    Ok(data)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        SessionKey::from_bytes([9u8; 32])
    }

    #[test]
    fn test_round_trip_non_divisible_size() {
        let data: Vec<u8> = (0..2500).map(|i| (i % 251) as u8).collect();
        let chunks = encrypt_chunks(&key(), "f1", &data, 1024).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].size, 2500 - 2048);
        assert_eq!(decrypt_chunks(&key(), &chunks).unwrap(), data);
    }

    #[test]
    fn test_empty_file() {
        let chunks = encrypt_chunks(&key(), "f1", &[], 1024).unwrap();
        assert!(chunks.is_empty());
        assert_eq!(decrypt_chunks(&key(), &chunks).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(encrypt_chunks(&key(), "f1", b"data", 0).is_err());
    }

    #[test]
    fn test_out_of_order_chunks_reassemble() {
        let data = vec![1u8; 3000];
        let mut chunks = encrypt_chunks(&key(), "f1", &data, 1024).unwrap();
        chunks.reverse();
        assert_eq!(decrypt_chunks(&key(), &chunks).unwrap(), data);
    }

    #[test]
    fn test_missing_chunk_aborts() {
        let data = vec![1u8; 3000];
        let mut chunks = encrypt_chunks(&key(), "f1", &data, 1024).unwrap();
        chunks.remove(1);
        let err = decrypt_chunks(&key(), &chunks).unwrap_err();
        assert!(matches!(err, Error::ChunkReassemblyFailed(_)));
    }

    #[test]
    fn test_swapped_indices_fail_authentication() {
        let data = vec![1u8; 2048];
        let mut chunks = encrypt_chunks(&key(), "f1", &data, 1024).unwrap();

        // Relabel the chunks so the set still looks complete; the AAD
        // binding must catch the swap
        chunks[0].chunk_index = 1;
        chunks[1].chunk_index = 0;
        let err = decrypt_chunks(&key(), &chunks).unwrap_err();
        assert!(matches!(err, Error::IntegrityFailure(_)));
    }

    #[test]
    fn test_chunk_from_another_file_fails_authentication() {
        // Two files under the same session key, same shape: a chunk from
        // one cannot be passed off at the same index of the other
        let data_a = vec![1u8; 2048];
        let data_b = vec![2u8; 2048];
        let chunks_a = encrypt_chunks(&key(), "file-a", &data_a, 1024).unwrap();
        let mut chunks_b = encrypt_chunks(&key(), "file-b", &data_b, 1024).unwrap();

        let mut transplanted = chunks_a[1].clone();
        transplanted.file_id = "file-b".into();
        chunks_b[1] = transplanted;

        let err = decrypt_chunks(&key(), &chunks_b).unwrap_err();
        assert!(matches!(err, Error::IntegrityFailure(_)));
    }

    #[test]
    fn test_mixed_file_ids_rejected_before_decrypt() {
        let data = vec![1u8; 2048];
        let mut chunks = encrypt_chunks(&key(), "f1", &data, 1024).unwrap();
        chunks[1].file_id = "f2".into();
        let err = decrypt_chunks(&key(), &chunks).unwrap_err();
        assert!(matches!(err, Error::ChunkReassemblyFailed(_)));
    }

    #[test]
    fn test_corrupt_chunk_aborts() {
        let data = vec![1u8; 3000];
        let mut chunks = encrypt_chunks(&key(), "f1", &data, 1024).unwrap();
        let mut body = BASE64.decode(&chunks[1].ciphertext).unwrap();
        body[0] ^= 0x01;
        chunks[1].ciphertext = BASE64.encode(&body);

        let err = decrypt_chunks(&key(), &chunks).unwrap_err();
        assert!(matches!(err, Error::IntegrityFailure(_)));
    }

    #[test]
    fn test_wrong_key_fails() {
        let data = vec![1u8; 100];
        let chunks = encrypt_chunks(&key(), "f1", &data, 1024).unwrap();
        let other = SessionKey::from_bytes([8u8; 32]);
        assert!(decrypt_chunks(&other, &chunks).is_err());
    }

    #[test]
    fn test_inconsistent_totals_rejected() {
        let data = vec![1u8; 2048];
        let mut chunks = encrypt_chunks(&key(), "f1", &data, 1024).unwrap();
        chunks[1].total_chunks = 5;
        let err = decrypt_chunks(&key(), &chunks).unwrap_err();
        assert!(matches!(err, Error::ChunkReassemblyFailed(_)));
    }

    #[test]
    fn test_distinct_ivs_per_chunk() {
        let data = vec![0u8; 4096];
        let chunks = encrypt_chunks(&key(), "f1", &data, 1024).unwrap();
        let ivs: std::collections::HashSet<_> = chunks.iter().map(|c| c.iv.clone()).collect();
        assert_eq!(ivs.len(), chunks.len());
    }
}
