//! Storage trait consumed by the key manager — abstracts over the actual
//! backend.
//!
//! The host service implements this against its durable datastore; the key
//! crates have zero storage dependency and only define the contract. An
//! in-memory implementation for tests and development lives in
//! [`crate::memory_store`].

use thiserror::Error;

use crate::records::{
    AccountId, IdentityRecord, OneTimePreKeyId, OneTimePreKeyRecord, SignedPreKeyId,
    SignedPreKeyRecord,
};

/// A backend I/O failure. Retryable at the caller's discretion; never used
/// for expected conditions like not-found.
#[derive(Debug, Error)]
#[error("key store error: {0}")]
pub struct StoreError(pub String);

/// Result of an atomic [`KeyStore::mark_prekey_used`] call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MarkOutcome {
    /// This call transitioned the key from unused to used.
    Consumed,
    /// The key was already used. Idempotent outcome, not an error at the
    /// store level; the caller decides whether it is one.
    AlreadyUsed,
    /// No pre-key with that id exists for the account.
    Unknown,
}

/// Durable storage for per-account key material.
///
/// All private key fields inside the records are sealed before they reach
/// the store; implementations never see plaintext secrets.
pub trait KeyStore: Send + Sync {
    /// Load the account's identity bundle, or `None` if never bootstrapped.
    fn load_identity(&self, account: &AccountId) -> Result<Option<IdentityRecord>, StoreError>;

    /// Insert or replace the account's identity bundle.
    ///
    /// Last-writer-wins: if two processes bootstrap the same account
    /// concurrently, both writes are well-formed and the last one is
    /// canonical. In-process the manager prevents this race with a
    /// per-account lock.
    fn upsert_identity(&self, account: &AccountId, record: IdentityRecord)
        -> Result<(), StoreError>;

    /// Load the single active signed pre-key, if any.
    fn load_active_signed_prekey(
        &self,
        account: &AccountId,
    ) -> Result<Option<SignedPreKeyRecord>, StoreError>;

    /// Load a signed pre-key by id, active or superseded.
    ///
    /// Superseded records stay readable so responder handshakes that were
    /// initiated just before a rotation can still complete.
    fn load_signed_prekey(
        &self,
        account: &AccountId,
        id: SignedPreKeyId,
    ) -> Result<Option<SignedPreKeyRecord>, StoreError>;

    /// Store a new signed pre-key, atomically deactivating the prior active
    /// record. After this call exactly one record (the new one) is active.
    fn store_signed_prekey(
        &self,
        account: &AccountId,
        record: SignedPreKeyRecord,
    ) -> Result<(), StoreError>;

    /// Allocate the next monotonic signed pre-key id for the account.
    fn allocate_signed_prekey_id(&self, account: &AccountId)
        -> Result<SignedPreKeyId, StoreError>;

    /// Count one-time pre-keys that are still unused.
    fn count_unused_prekeys(&self, account: &AccountId) -> Result<usize, StoreError>;

    /// Persist a batch of freshly generated one-time pre-keys.
    fn store_prekey_batch(
        &self,
        account: &AccountId,
        records: Vec<OneTimePreKeyRecord>,
    ) -> Result<(), StoreError>;

    /// Allocate `count` monotonic one-time pre-key ids for the account.
    fn allocate_prekey_ids(
        &self,
        account: &AccountId,
        count: usize,
    ) -> Result<Vec<OneTimePreKeyId>, StoreError>;

    /// Load a one-time pre-key by id, regardless of used state.
    fn load_prekey(
        &self,
        account: &AccountId,
        id: OneTimePreKeyId,
    ) -> Result<Option<OneTimePreKeyRecord>, StoreError>;

    /// Load up to `limit` unused one-time pre-keys, lowest id first.
    fn load_unused_prekeys(
        &self,
        account: &AccountId,
        limit: usize,
    ) -> Result<Vec<OneTimePreKeyRecord>, StoreError>;

    /// Atomically mark a pre-key used.
    ///
    /// The check-then-mark must be a single linearizable unit: of any number
    /// of concurrent calls for the same id, exactly one observes
    /// [`MarkOutcome::Consumed`]. Backends without conditional updates must
    /// serialize this per account and document the single-process
    /// limitation. Idempotent: repeat calls return
    /// [`MarkOutcome::AlreadyUsed`] and never double-count.
    fn mark_prekey_used(
        &self,
        account: &AccountId,
        id: OneTimePreKeyId,
    ) -> Result<MarkOutcome, StoreError>;
}
