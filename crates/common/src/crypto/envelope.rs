//! Per-recipient key envelopes: ECDH over X25519 plus AES Key Wrap.
//!
//! Sealing draws a throwaway keypair, agrees a shared secret with the
//! recipient's converted public key and wraps a [`Secret`] under it (RFC 3394).
//! Only the holder of the recipient's secret key can redo the agreement.
//!
//! ```text
//! [ ephemeral public key: 32 ][ wrapped secret: 40 ]
//! ```

use aes_kw::KekAes256;
use serde::{Deserialize, Serialize};

use super::keys::{KeyError, PublicKey, SecretKey, PUBLIC_KEY_SIZE};
use super::secret::{Secret, SecretError, SECRET_SIZE};

/// AES-KW integrity block added to the wrapped key
pub const KW_BLOCK_SIZE: usize = 8;
/// Total size of a sealed envelope
pub const ENVELOPE_SIZE: usize = PUBLIC_KEY_SIZE + SECRET_SIZE + KW_BLOCK_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    #[error("secret error: {0}")]
    Secret(#[from] SecretError),
}

/// A [`Secret`] wrapped for exactly one recipient.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope(Vec<u8>);

impl Envelope {
    pub fn seal(secret: &Secret, recipient: &PublicKey) -> Result<Self, EnvelopeError> {
        let ephemeral = SecretKey::generate();
        let shared = ephemeral
            .to_x25519()
            .diffie_hellman(&recipient.to_x25519()?);

        let wrapped = KekAes256::from(*shared.as_bytes())
            .wrap_vec(secret.bytes())
            .map_err(|_| anyhow::anyhow!("AES-KW wrap error"))?;

        let mut sealed = Vec::with_capacity(ENVELOPE_SIZE);
        sealed.extend_from_slice(&ephemeral.public().to_bytes());
        sealed.extend_from_slice(&wrapped);
        if sealed.len() != ENVELOPE_SIZE {
            return Err(anyhow::anyhow!("sealed envelope has unexpected size {}", sealed.len()).into());
        }
        Ok(Self(sealed))
    }

    /// Recover the secret. Any failure means the envelope was sealed for
    /// someone else or has been damaged.
    pub fn open(&self, recipient: &SecretKey) -> Result<Secret, EnvelopeError> {
        if self.0.len() != ENVELOPE_SIZE {
            return Err(anyhow::anyhow!(
                "invalid envelope size, expected {}, got {}",
                ENVELOPE_SIZE,
                self.0.len()
            )
            .into());
        }
        let (ephemeral, wrapped) = self.0.split_at(PUBLIC_KEY_SIZE);
        let ephemeral = PublicKey::try_from(ephemeral)?;
        let shared = recipient.to_x25519().diffie_hellman(&ephemeral.to_x25519()?);

        let unwrapped = KekAes256::from(*shared.as_bytes())
            .unwrap_vec(wrapped)
            .map_err(|_| anyhow::anyhow!("AES-KW unwrap error"))?;
        Ok(Secret::from_slice(&unwrapped)?)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}
