//! Cryptographic primitives for safebox
//!
//! - **Identity**: one Ed25519 keypair per user; the [`UserId`] embeds the public key
//! - **Signatures**: Ed25519 over BLAKE3 digests of group changes, keystores and transactions
//! - **Symmetric encryption**: ChaCha20-Poly1305 [`Secret`]s, one per key epoch
//! - **Envelopes**: X25519 ECDH (after Edwards to Montgomery conversion) plus
//!   AES-KW, wrapping a [`Secret`] for a single recipient
//!
//! # Key distribution
//!
//! A group's key list is encrypted once under a fresh [`Secret`], and that
//! secret is sealed into an [`Envelope`] for every member. Rotating means
//! appending an epoch, drawing a new list secret and resealing for whoever is
//! still a member.

mod envelope;
mod identity;
mod keys;
mod secret;

pub use ed25519_dalek::Signature;
pub use envelope::{Envelope, EnvelopeError};
pub use identity::{Identity, UserId};
pub use keys::{KeyError, PublicKey, SecretKey};
pub use secret::{Secret, SecretError, BLAKE3_HASH_SIZE};

/// Length-prefixed BLAKE3 digest over several fields.
///
/// Prefixing each part with its length keeps `("ab", "c")` and `("a", "bc")`
/// distinct.
pub fn digest(parts: &[&[u8]]) -> [u8; BLAKE3_HASH_SIZE] {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_digest_is_framed() {
        assert_ne!(digest(&[b"ab", b"c"]), digest(&[b"a", b"bc"]));
        assert_eq!(digest(&[b"usr", b"bob"]), digest(&[b"usr", b"bob"]));
    }
}
