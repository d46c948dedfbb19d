pub mod error;
pub mod manager;
pub mod memory_store;
pub mod records;
pub mod stats;
pub mod store;

pub use error::KeyManagerError;
pub use manager::{KeyManager, PoolConfig};
pub use memory_store::MemoryKeyStore;
pub use records::{
    AccountId, IdentityRecord, KeyBundle, OneTimePreKeyId, OneTimePreKeyRecord, SignedPreKeyId,
    SignedPreKeyRecord,
};
pub use stats::{PoolHealth, PoolStats, SignedPreKeyFreshness};
pub use store::{KeyStore, MarkOutcome, StoreError};
