use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::error::SafeError;
use super::group::{GroupName, Groups};
use crate::crypto::{digest, Envelope, Identity, Secret, Signature, UserId};

/// Name of the keystore blob inside `keys/<group>/`
pub const KEYSTORE_FILE: &str = "keystore";

/// One recipient's way into the key list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeEntry {
    /// First epoch this recipient may use
    pub since_epoch: u32,
    pub envelope: Envelope,
}

/// The at-rest form of a group's key list.
///
/// The whole list is encrypted once under a fresh list secret, and that secret
/// is sealed for every recipient. Only admins write keystores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keystore {
    pub group_name: GroupName,
    pub envelope_keys: BTreeMap<UserId, EnvelopeEntry>,
    pub encrypted_key_list: Vec<u8>,
    pub signer: UserId,
    pub signature: Signature,
}

impl Keystore {
    fn payload(
        group_name: &GroupName,
        envelope_keys: &BTreeMap<UserId, EnvelopeEntry>,
        encrypted_key_list: &[u8],
    ) -> Result<[u8; 32], SafeError> {
        let envelopes = bincode::serialize(envelope_keys)?;
        Ok(digest(&[
            group_name.as_str().as_bytes(),
            &envelopes,
            encrypted_key_list,
        ]))
    }

    /// Encrypt `keys` for `recipients`, each paired with its `since_epoch`.
    pub fn seal(
        identity: &Identity,
        group_name: &GroupName,
        keys: &[Secret],
        recipients: impl IntoIterator<Item = (UserId, u32)>,
    ) -> Result<Self, SafeError> {
        let list_secret = Secret::generate();
        let encrypted_key_list = list_secret.encrypt(&bincode::serialize(keys)?)?;

        let mut envelope_keys = BTreeMap::new();
        for (user, since_epoch) in recipients {
            let envelope = Envelope::seal(&list_secret, &user.public_key()?)?;
            envelope_keys.insert(
                user,
                EnvelopeEntry {
                    since_epoch,
                    envelope,
                },
            );
        }

        let payload = Self::payload(group_name, &envelope_keys, &encrypted_key_list)?;
        Ok(Self {
            group_name: group_name.clone(),
            envelope_keys,
            encrypted_key_list,
            signer: identity.id().clone(),
            signature: identity.sign(&payload),
        })
    }

    /// Check the group binding and the signature, without judging the signer.
    pub fn verify_signature(&self, group_name: &GroupName) -> Result<(), SafeError> {
        if &self.group_name != group_name {
            return Err(SafeError::corrupt(
                format!("keys/{}/{}", group_name, KEYSTORE_FILE),
                format!("keystore belongs to group {}", self.group_name),
            ));
        }
        let payload = Self::payload(&self.group_name, &self.envelope_keys, &self.encrypted_key_list)?;
        self.signer
            .public_key()?
            .verify(&payload, &self.signature)
            .map_err(|e| {
                SafeError::SignatureInvalid(format!(
                    "keystore of {} signed by {}: {}",
                    self.group_name, self.signer, e
                ))
            })
    }

    /// Full verification: binding, signature, and an admin signer.
    pub fn verify(&self, group_name: &GroupName, groups: &Groups) -> Result<(), SafeError> {
        self.verify_signature(group_name)?;
        if !groups.is_admin(&self.signer) {
            return Err(SafeError::Authorization(format!(
                "keystore of {} signed by non-admin {}",
                self.group_name, self.signer
            )));
        }
        Ok(())
    }

    /// Recover the full key list and the caller's `since_epoch`.
    pub fn open(&self, identity: &Identity) -> Result<(Vec<Secret>, u32), SafeError> {
        let entry = self.envelope_keys.get(identity.id()).ok_or_else(|| {
            SafeError::Authorization(format!(
                "{} has no envelope in the keystore of {}",
                identity.id(),
                self.group_name
            ))
        })?;
        let list_secret = entry.envelope.open(identity.secret_key())?;
        let plain = list_secret.decrypt(&self.encrypted_key_list)?;
        let keys: Vec<Secret> = bincode::deserialize(&plain)?;
        Ok((keys, entry.since_epoch))
    }

    pub fn recipients(&self) -> impl Iterator<Item = &UserId> {
        self.envelope_keys.keys()
    }

    pub fn since_epoch(&self, user: &UserId) -> Option<u32> {
        self.envelope_keys.get(user).map(|e| e.since_epoch)
    }
}

/// The epochs of a group's key list one user may use.
///
/// `keys[i]` is the key of epoch `first_epoch + i`. Epochs before
/// `first_epoch` exist but are withheld.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRing {
    first_epoch: u32,
    keys: Vec<Secret>,
}

impl KeyRing {
    pub fn new(first_epoch: u32, keys: Vec<Secret>) -> Self {
        Self { first_epoch, keys }
    }

    /// Restrict a full key list to the epochs from `since_epoch` on.
    pub(crate) fn from_history(keys: Vec<Secret>, since_epoch: u32) -> Self {
        let skip = (since_epoch as usize).min(keys.len());
        Self {
            first_epoch: skip as u32,
            keys: keys.into_iter().skip(skip).collect(),
        }
    }

    pub fn get(&self, epoch: u32) -> Option<&Secret> {
        let index = epoch.checked_sub(self.first_epoch)?;
        self.keys.get(index as usize)
    }

    /// Newest epoch and its key.
    pub fn latest(&self) -> Option<(u32, &Secret)> {
        let last = self.keys.last()?;
        Some((self.first_epoch + self.keys.len() as u32 - 1, last))
    }

    /// Total number of epochs of the group, withheld ones included.
    pub fn epochs(&self) -> u32 {
        self.first_epoch + self.keys.len() as u32
    }

    pub fn first_epoch(&self) -> u32 {
        self.first_epoch
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
