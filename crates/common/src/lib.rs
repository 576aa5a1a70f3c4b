/**
 * Configuration: which store, which cache,
 *  and how patient the lock is.
 */
pub mod config;
/**
 * Cryptographic types and operations.
 *  - Identities, signing and verification
 *  - Symmetric secrets and per-recipient envelopes
 */
pub mod crypto;
/**
 * Replicated SQLite databases, one per group,
 *  kept in sync through encrypted transactions
 *  on the store.
 */
pub mod db;
/**
 * Time-ordered ids for transactions.
 */
pub mod id;
/**
 * The safe itself: the group chain, key distribution
 *  and touch markers over a passive blob store.
 */
pub mod safe;
/**
 * SQLite connection helpers shared by the cache
 *  and replicated databases.
 */
pub mod sqlite;

pub mod prelude {
    pub use crate::args;
    pub use crate::config::{ConfigError, SafeConfig};
    pub use crate::crypto::{Identity, PublicKey, SecretKey, UserId};
    pub use crate::db::{Args, Database, DatabaseError, SyncReport, Value};
    pub use crate::id::TxId;
    pub use crate::safe::{
        Cache, ChainStatus, ChangeKind, GroupName, Groups, KeyRing, Safe, SafeError, SafeOptions,
    };
}
