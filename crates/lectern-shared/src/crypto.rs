use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{NONCE_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; 32];

/// Plaintext content encryption key. Lives only in memory and is wiped on
/// drop; its `Debug` output never includes key material.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ContentKey([u8; SYMMETRIC_KEY_SIZE]);

impl ContentKey {
    pub fn generate() -> Self {
        Self(generate_symmetric_key())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; SYMMETRIC_KEY_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ContentKey(<redacted>)")
    }
}

impl PartialEq for ContentKey {
    fn eq(&self, other: &Self) -> bool {
        // Only used by tests; production paths never compare keys.
        self.0 == other.0
    }
}

impl Eq for ContentKey {}

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    encrypt_with_aad(key, plaintext, &[])
}

pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    decrypt_with_aad(key, data, &[])
}

/// Same layout as [`encrypt`], with `aad` authenticated but not stored.
pub fn encrypt_with_aad(
    key: &SymmetricKey,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let nonce_bytes = generate_nonce();
    let ciphertext = seal(key, &nonce_bytes, plaintext, aad)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt_with_aad(key: &SymmetricKey, data: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    open(key, nonce_bytes, ciphertext, aad)
}

pub(crate) fn seal(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::EncryptionFailed)
}

pub(crate) fn open(
    key: &SymmetricKey,
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::DecryptionFailed)
}

// BLAKE3 KDF with domain separation
pub fn derive_key(context: &str, material: &[u8]) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(material);
    let hash = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash.as_bytes()[..32]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = generate_symmetric_key();
        let plaintext = b"Chapter 1: The cell membrane";

        let encrypted = encrypt(&key, plaintext).unwrap();
        let decrypted = decrypt(&key, &encrypted).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = generate_symmetric_key();
        let key2 = generate_symmetric_key();

        let encrypted = encrypt(&key1, b"Secret notes").unwrap();
        assert!(decrypt(&key2, &encrypted).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = generate_symmetric_key();

        let mut encrypted = encrypt(&key, b"Important data").unwrap();
        let len = encrypted.len();
        encrypted[len - 1] ^= 0xFF;

        assert!(decrypt(&key, &encrypted).is_err());
    }

    #[test]
    fn test_aad_mismatch_fails() {
        let key = generate_symmetric_key();
        let encrypted = encrypt_with_aad(&key, b"payload", b"row-a").unwrap();

        assert!(decrypt_with_aad(&key, &encrypted, b"row-b").is_err());
        assert_eq!(decrypt_with_aad(&key, &encrypted, b"row-a").unwrap(), b"payload");
    }

    #[test]
    fn test_empty_data_fails() {
        let key = generate_symmetric_key();
        assert!(decrypt(&key, &[]).is_err());
    }

    #[test]
    fn test_derive_key_separates_contexts() {
        let a = derive_key("lectern-test-a", b"secret");
        let b = derive_key("lectern-test-b", b"secret");
        assert_ne!(a, b);
        assert_eq!(a, derive_key("lectern-test-a", b"secret"));
    }

    #[test]
    fn test_content_key_debug_is_redacted() {
        let key = ContentKey::generate();
        let shown = format!("{key:?}");
        assert!(!shown.contains(&hex::encode(key.as_bytes())));
        assert!(shown.contains("redacted"));
    }

    #[test]
    fn test_content_key_rejects_wrong_length() {
        assert_eq!(
            ContentKey::from_slice(&[0u8; 16]),
            Err(CryptoError::InvalidKeyLength)
        );
    }
}
