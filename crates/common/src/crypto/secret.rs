//! Symmetric encryption using ChaCha20-Poly1305
//!
//! A [`Secret`] is one key epoch of a group, or the one-off key protecting a
//! keystore's key list. Ciphertexts carry their random nonce up front and a
//! BLAKE3 digest of the plaintext inside the sealed box, so a wrong key or a
//! damaged blob is always an error rather than garbage output.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use serde::{Deserialize, Serialize};

/// Size of ChaCha20-Poly1305 nonce in bytes
pub const NONCE_SIZE: usize = 12;
/// Size of ChaCha20-Poly1305 key in bytes (256 bits)
pub const SECRET_SIZE: usize = 32;
/// Size of BLAKE3 hash in bytes (256 bits)
pub const BLAKE3_HASH_SIZE: usize = 32;

/// Errors that can occur during encryption/decryption
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret error: {0}")]
    Default(#[from] anyhow::Error),
}

/// A 256-bit symmetric key.
///
/// Ciphertext layout: `nonce (12) || seal(blake3(plaintext) (32) || plaintext) || tag (16)`.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Secret([u8; SECRET_SIZE]);

impl From<[u8; SECRET_SIZE]> for Secret {
    fn from(bytes: [u8; SECRET_SIZE]) -> Self {
        Secret(bytes)
    }
}

impl Secret {
    /// 32 fresh random bytes
    pub fn generate() -> Self {
        let mut buff = [0; SECRET_SIZE];
        getrandom::getrandom(&mut buff).expect("failed to generate random bytes");
        Self(buff)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, SecretError> {
        let bytes: [u8; SECRET_SIZE] = data.try_into().map_err(|_| {
            anyhow::anyhow!(
                "invalid secret size, expected {}, got {}",
                SECRET_SIZE,
                data.len()
            )
        })?;
        Ok(Self(bytes))
    }

    pub fn bytes(&self) -> &[u8] {
        self.0.as_ref()
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(self.bytes()))
    }

    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, SecretError> {
        let mut sealed = Vec::with_capacity(BLAKE3_HASH_SIZE + data.len());
        sealed.extend_from_slice(blake3::hash(data).as_bytes());
        sealed.extend_from_slice(data);

        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce)
            .map_err(|e| anyhow::anyhow!("failed to generate nonce: {}", e))?;

        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), sealed.as_ref())
            .map_err(|_| anyhow::anyhow!("encrypt error"))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Fails on a wrong key, tampering, or a digest mismatch.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, SecretError> {
        if data.len() < NONCE_SIZE {
            return Err(anyhow::anyhow!("data too short for nonce").into());
        }
        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        let opened = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow::anyhow!("decrypt error"))?;

        if opened.len() < BLAKE3_HASH_SIZE {
            return Err(anyhow::anyhow!("decrypted data too short for hash header").into());
        }
        let (digest, plaintext) = opened.split_at(BLAKE3_HASH_SIZE);
        if digest != blake3::hash(plaintext).as_bytes() {
            return Err(anyhow::anyhow!("hash verification failed - data corrupted").into());
        }
        Ok(plaintext.to_vec())
    }
}
