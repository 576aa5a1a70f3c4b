use serde::{Deserialize, Serialize};

use super::error::DatabaseError;
use super::value::Args;
use crate::crypto::{digest, Identity, Secret, Signature, UserId};
use crate::safe::{GroupName, SafeError};

/// One statement execution, replayed by every peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub statement_key: String,
    pub args: Args,
    /// Version of the statement definition it was executed with
    pub version: f32,
}

/// A committed batch of updates as stored under `db/<group>/<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub encrypted_updates: Vec<u8>,
    /// Highest statement version among the updates
    pub version: f32,
    pub group_name: GroupName,
    pub key_epoch: u32,
    pub signer: UserId,
    pub signature: Signature,
}

impl Transaction {
    fn payload(
        group_name: &GroupName,
        version: f32,
        key_epoch: u32,
        encrypted_updates: &[u8],
    ) -> [u8; 32] {
        digest(&[
            group_name.as_str().as_bytes(),
            &version.to_le_bytes(),
            &key_epoch.to_le_bytes(),
            encrypted_updates,
        ])
    }

    pub fn seal(
        identity: &Identity,
        group_name: &GroupName,
        key_epoch: u32,
        key: &Secret,
        updates: &[Update],
    ) -> Result<Self, DatabaseError> {
        let version = updates.iter().map(|u| u.version).fold(0.0, f32::max);
        let encrypted_updates = key.encrypt(&bincode::serialize(updates)?)?;
        let payload = Self::payload(group_name, version, key_epoch, &encrypted_updates);
        Ok(Self {
            encrypted_updates,
            version,
            group_name: group_name.clone(),
            key_epoch,
            signer: identity.id().clone(),
            signature: identity.sign(&payload),
        })
    }

    /// Check that the record belongs to `group_name` and that its signer wrote it.
    pub fn verify(&self, name: &str, group_name: &GroupName) -> Result<(), DatabaseError> {
        if &self.group_name != group_name {
            return Err(SafeError::corrupt(
                name,
                format!("transaction belongs to group {}", self.group_name),
            )
            .into());
        }
        let payload = Self::payload(
            &self.group_name,
            self.version,
            self.key_epoch,
            &self.encrypted_updates,
        );
        self.signer
            .public_key()?
            .verify(&payload, &self.signature)
            .map_err(|e| SafeError::SignatureInvalid(format!("{} by {}: {}", name, self.signer, e)))?;
        Ok(())
    }

    pub fn open(&self, key: &Secret) -> Result<Vec<Update>, DatabaseError> {
        let plain = key.decrypt(&self.encrypted_updates)?;
        Ok(bincode::deserialize(&plain)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn updates() -> Vec<Update> {
        vec![
            Update {
                statement_key: "INSERT_NOTE".into(),
                args: crate::args! { "title" => "first" },
                version: 1.0,
            },
            Update {
                statement_key: "TAG_NOTE".into(),
                args: crate::args! { "id" => 1, "tag" => "todo" },
                version: 1.5,
            },
        ]
    }

    #[test]
    fn test_seal_verify_open() {
        let alice = Identity::generate("alice").unwrap();
        let usr = GroupName::users();
        let key = Secret::generate();

        let tx = Transaction::seal(&alice, &usr, 3, &key, &updates()).unwrap();
        assert_eq!(tx.version, 1.5);
        assert_eq!(tx.key_epoch, 3);
        tx.verify("db/usr/1", &usr).unwrap();
        assert_eq!(tx.open(&key).unwrap(), updates());
        assert!(tx.open(&Secret::generate()).is_err());
    }

    #[test]
    fn test_verify_rejects() {
        let alice = Identity::generate("alice").unwrap();
        let usr = GroupName::users();
        let tx = Transaction::seal(&alice, &usr, 0, &Secret::generate(), &updates()).unwrap();

        assert!(matches!(
            tx.verify("db/adm/1", &GroupName::admin()),
            Err(DatabaseError::Safe(SafeError::CorruptRecord { .. }))
        ));

        // Claiming a different epoch breaks the signature
        let mut moved = tx.clone();
        moved.key_epoch = 1;
        assert!(matches!(
            moved.verify("db/usr/1", &usr),
            Err(DatabaseError::Safe(SafeError::SignatureInvalid(_)))
        ));

        let mut forged = tx;
        forged.signer = Identity::generate("mallory").unwrap().id().clone();
        assert!(matches!(
            forged.verify("db/usr/1", &usr),
            Err(DatabaseError::Safe(SafeError::SignatureInvalid(_)))
        ));
    }
}
