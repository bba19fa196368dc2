//! Chunked container for protected material artifacts.
//!
//! Layout:
//!
//! ```text
//! "LCTN" | format (1) | chunk_size (u32 BE)
//! repeated: ct_len (u32 BE) | nonce (24) | ciphertext+tag (ct_len)
//! ```
//!
//! Each chunk is sealed with XChaCha20-Poly1305 under the material's content
//! key. The associated data binds the chunk to its material, key version,
//! position and whether it is the final chunk, so chunks cannot be
//! reordered, dropped from the tail, or spliced in from another artifact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{ARTIFACT_FORMAT_VERSION, ARTIFACT_MAGIC, NONCE_SIZE, TAG_SIZE};
use crate::crypto::{generate_nonce, open, seal, ContentKey};
use crate::error::CryptoError;

const HEADER_LEN: usize = 4 + 1 + 4;

/// Descriptive metadata stored next to an artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactManifest {
    pub material_id: Uuid,
    pub key_version: u32,
    pub chunk_size: u32,
    pub total_chunks: u64,
    pub plaintext_size: u64,
    /// BLAKE3 of the source bytes (hex).
    pub plaintext_hash: String,
    /// BLAKE3 of the artifact bytes (hex).
    pub artifact_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EncryptedArtifact {
    pub bytes: Vec<u8>,
    pub manifest: ArtifactManifest,
}

fn chunk_aad(material_id: Uuid, key_version: u32, index: u64, last: bool) -> [u8; 29] {
    let mut aad = [0u8; 29];
    aad[..16].copy_from_slice(material_id.as_bytes());
    aad[16..20].copy_from_slice(&key_version.to_be_bytes());
    aad[20..28].copy_from_slice(&index.to_be_bytes());
    aad[28] = last as u8;
    aad
}

/// Encrypt `plaintext` into a protected artifact. An empty input still
/// yields one (empty) final chunk.
pub fn encrypt_artifact(
    key: &ContentKey,
    material_id: Uuid,
    key_version: u32,
    plaintext: &[u8],
    chunk_size: usize,
) -> Result<EncryptedArtifact, CryptoError> {
    if chunk_size == 0 || chunk_size > u32::MAX as usize {
        return Err(CryptoError::MalformedArtifact("invalid chunk size"));
    }

    let total_chunks = plaintext.len().div_ceil(chunk_size).max(1);
    let mut out = Vec::with_capacity(
        HEADER_LEN + plaintext.len() + total_chunks * (4 + NONCE_SIZE + TAG_SIZE),
    );
    out.extend_from_slice(ARTIFACT_MAGIC);
    out.push(ARTIFACT_FORMAT_VERSION);
    out.extend_from_slice(&(chunk_size as u32).to_be_bytes());

    for index in 0..total_chunks {
        let start = index * chunk_size;
        let end = (start + chunk_size).min(plaintext.len());
        let chunk = &plaintext[start.min(plaintext.len())..end];
        let last = index + 1 == total_chunks;

        let nonce = generate_nonce();
        let aad = chunk_aad(material_id, key_version, index as u64, last);
        let sealed = seal(key.as_bytes(), &nonce, chunk, &aad)?;

        out.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
    }

    let manifest = ArtifactManifest {
        material_id,
        key_version,
        chunk_size: chunk_size as u32,
        total_chunks: total_chunks as u64,
        plaintext_size: plaintext.len() as u64,
        plaintext_hash: blake3::hash(plaintext).to_hex().to_string(),
        artifact_hash: blake3::hash(&out).to_hex().to_string(),
        created_at: Utc::now(),
    };

    Ok(EncryptedArtifact { bytes: out, manifest })
}

/// Inverse of [`encrypt_artifact`]. Any structural or authentication problem
/// is reported as an error; partial plaintext is never returned.
pub fn decrypt_artifact(
    key: &ContentKey,
    material_id: Uuid,
    key_version: u32,
    data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if data.len() < HEADER_LEN {
        return Err(CryptoError::MalformedArtifact("truncated header"));
    }
    if &data[..4] != ARTIFACT_MAGIC {
        return Err(CryptoError::MalformedArtifact("bad magic"));
    }
    if data[4] != ARTIFACT_FORMAT_VERSION {
        return Err(CryptoError::MalformedArtifact("unsupported format"));
    }
    let chunk_size = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) as usize;
    let max_sealed = chunk_size + TAG_SIZE;

    let mut plaintext = Vec::new();
    let mut rest = &data[HEADER_LEN..];
    let mut index: u64 = 0;

    if rest.is_empty() {
        return Err(CryptoError::MalformedArtifact("no chunks"));
    }

    while !rest.is_empty() {
        if rest.len() < 4 + NONCE_SIZE {
            return Err(CryptoError::MalformedArtifact("truncated chunk header"));
        }
        let sealed_len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        if sealed_len < TAG_SIZE || sealed_len > max_sealed {
            return Err(CryptoError::MalformedArtifact("chunk length out of range"));
        }
        let record_len = 4 + NONCE_SIZE + sealed_len;
        if rest.len() < record_len {
            return Err(CryptoError::MalformedArtifact("truncated chunk"));
        }

        let nonce = &rest[4..4 + NONCE_SIZE];
        let sealed = &rest[4 + NONCE_SIZE..record_len];
        let last = rest.len() == record_len;
        let aad = chunk_aad(material_id, key_version, index, last);

        let chunk = open(key.as_bytes(), nonce, sealed, &aad)?;
        plaintext.extend_from_slice(&chunk);

        rest = &rest[record_len..];
        index += 1;
    }

    Ok(plaintext)
}
