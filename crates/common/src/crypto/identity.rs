//! Human-readable user ids bound to a keypair.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::keys::{KeyError, PublicKey, SecretKey, PRIVATE_KEY_SIZE};

const PEM_TAG: &str = "SAFEBOX IDENTITY";

/// Public identity of a user: `<nick>:<hex ed25519 public key>`.
///
/// The same key verifies signatures and, converted to X25519, receives
/// envelopes, so the id alone is enough to share keys with someone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub fn new(nick: &str, key: &PublicKey) -> Result<Self, KeyError> {
        validate_nick(nick)?;
        Ok(Self(format!("{}:{}", nick, key.to_hex())))
    }

    pub fn nick(&self) -> &str {
        self.0.split_once(':').map(|(nick, _)| nick).unwrap_or_default()
    }

    pub fn public_key(&self) -> Result<PublicKey, KeyError> {
        let (_, hex) = self
            .0
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("user id {} has no key part", self.0))?;
        PublicKey::from_hex(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for UserId {
    type Err = KeyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (nick, hex) = s
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("user id must look like nick:key, got {}", s))?;
        Self::new(nick, &PublicKey::from_hex(hex)?)
    }
}

impl TryFrom<String> for UserId {
    type Error = KeyError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

fn validate_nick(nick: &str) -> Result<(), KeyError> {
    let valid = !nick.is_empty()
        && nick
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(anyhow::anyhow!("invalid nickname {:?}", nick).into());
    }
    Ok(())
}

/// A user's full identity, private key included.
#[derive(Debug, Clone)]
pub struct Identity {
    id: UserId,
    secret: SecretKey,
}

impl Identity {
    pub fn generate(nick: &str) -> Result<Self, KeyError> {
        Self::from_secret(nick, SecretKey::generate())
    }

    pub fn from_secret(nick: &str, secret: SecretKey) -> Result<Self, KeyError> {
        let id = UserId::new(nick, &secret.public())?;
        Ok(Self { id, secret })
    }

    pub fn id(&self) -> &UserId {
        &self.id
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret.public()
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    pub fn sign(&self, msg: &[u8]) -> ed25519_dalek::Signature {
        self.secret.sign(msg)
    }

    /// PEM with the raw secret key followed by the nickname.
    pub fn to_pem(&self) -> String {
        let mut contents = self.secret.to_bytes().to_vec();
        contents.extend_from_slice(self.id.nick().as_bytes());
        pem::encode(&pem::Pem::new(PEM_TAG, contents))
    }

    pub fn from_pem(pem_str: &str) -> Result<Self, KeyError> {
        let pem = pem::parse(pem_str).map_err(|e| anyhow::anyhow!("failed to parse PEM: {}", e))?;
        if pem.tag() != PEM_TAG {
            return Err(anyhow::anyhow!("invalid PEM tag, expected {}", PEM_TAG).into());
        }
        let contents = pem.contents();
        if contents.len() <= PRIVATE_KEY_SIZE {
            return Err(anyhow::anyhow!("identity PEM too short").into());
        }
        let (secret, nick) = contents.split_at(PRIVATE_KEY_SIZE);
        let mut bytes = [0u8; PRIVATE_KEY_SIZE];
        bytes.copy_from_slice(secret);
        let nick = std::str::from_utf8(nick).map_err(|e| anyhow::anyhow!("invalid nickname: {}", e))?;
        Self::from_secret(nick, SecretKey::from(bytes))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_user_id_format() {
        let alice = Identity::generate("alice").unwrap();
        let id = alice.id();
        assert_eq!(id.nick(), "alice");
        assert_eq!(id.public_key().unwrap(), alice.public_key());
        assert!(id.as_str().starts_with("alice:"));

        let parsed: UserId = id.as_str().parse().unwrap();
        assert_eq!(&parsed, id);
    }

    #[test]
    fn test_invalid_ids_rejected() {
        assert!(Identity::generate("").is_err());
        assert!(Identity::generate("bad/nick").is_err());
        assert!("alice".parse::<UserId>().is_err());
        assert!("alice:zz".parse::<UserId>().is_err());
    }

    #[test]
    fn test_user_id_serde_validates() {
        let alice = Identity::generate("alice").unwrap();
        let json = serde_json::to_string(alice.id()).unwrap();
        let back: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(&back, alice.id());
        assert!(serde_json::from_str::<UserId>("\"nope\"").is_err());
    }

    #[test]
    fn test_pem_roundtrip() {
        let alice = Identity::generate("alice.smith").unwrap();
        let recovered = Identity::from_pem(&alice.to_pem()).unwrap();
        assert_eq!(recovered.id(), alice.id());
        assert_eq!(
            recovered.secret_key().to_bytes(),
            alice.secret_key().to_bytes()
        );

        let foreign = pem::encode(&pem::Pem::new("PRIVATE KEY", vec![0u8; 40]));
        assert!(Identity::from_pem(&foreign).is_err());
    }
}
