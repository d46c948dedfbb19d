//! In-memory implementation of the key store trait.
//!
//! Suitable for testing and development. Data is lost on process exit; a
//! production deployment implements [`KeyStore`] against its durable
//! datastore instead.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::records::{
    AccountId, IdentityRecord, OneTimePreKeyId, OneTimePreKeyRecord, SignedPreKeyId,
    SignedPreKeyRecord,
};
use crate::store::{KeyStore, MarkOutcome, StoreError};

#[derive(Default)]
struct AccountRecords {
    identity: Option<IdentityRecord>,
    signed_prekeys: BTreeMap<SignedPreKeyId, SignedPreKeyRecord>,
    next_signed_id: u32,
    prekeys: BTreeMap<OneTimePreKeyId, OneTimePreKeyRecord>,
    next_prekey_id: u32,
}

/// In-memory key store. All operations mutate under a single map lock,
/// which makes `mark_prekey_used` trivially linearizable.
#[derive(Default)]
pub struct MemoryKeyStore {
    accounts: Mutex<HashMap<AccountId, AccountRecords>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_account<T>(
        &self,
        account: &AccountId,
        f: impl FnOnce(&mut AccountRecords) -> T,
    ) -> Result<T, StoreError> {
        let mut accounts = self
            .accounts
            .lock()
            .map_err(|e| StoreError(format!("store mutex poisoned: {e}")))?;
        Ok(f(accounts.entry(account.clone()).or_default()))
    }
}

impl KeyStore for MemoryKeyStore {
    fn load_identity(&self, account: &AccountId) -> Result<Option<IdentityRecord>, StoreError> {
        self.with_account(account, |records| records.identity.clone())
    }

    fn upsert_identity(
        &self,
        account: &AccountId,
        record: IdentityRecord,
    ) -> Result<(), StoreError> {
        self.with_account(account, |records| {
            records.identity = Some(record);
        })
    }

    fn load_active_signed_prekey(
        &self,
        account: &AccountId,
    ) -> Result<Option<SignedPreKeyRecord>, StoreError> {
        self.with_account(account, |records| {
            records
                .signed_prekeys
                .values()
                .find(|record| record.active)
                .cloned()
        })
    }

    fn load_signed_prekey(
        &self,
        account: &AccountId,
        id: SignedPreKeyId,
    ) -> Result<Option<SignedPreKeyRecord>, StoreError> {
        self.with_account(account, |records| records.signed_prekeys.get(&id).cloned())
    }

    fn store_signed_prekey(
        &self,
        account: &AccountId,
        record: SignedPreKeyRecord,
    ) -> Result<(), StoreError> {
        self.with_account(account, |records| {
            for existing in records.signed_prekeys.values_mut() {
                existing.active = false;
            }
            records.signed_prekeys.insert(record.id, record);
        })
    }

    fn allocate_signed_prekey_id(
        &self,
        account: &AccountId,
    ) -> Result<SignedPreKeyId, StoreError> {
        self.with_account(account, |records| {
            records.next_signed_id += 1;
            SignedPreKeyId(records.next_signed_id)
        })
    }

    fn count_unused_prekeys(&self, account: &AccountId) -> Result<usize, StoreError> {
        self.with_account(account, |records| {
            records.prekeys.values().filter(|record| !record.used).count()
        })
    }

    fn store_prekey_batch(
        &self,
        account: &AccountId,
        batch: Vec<OneTimePreKeyRecord>,
    ) -> Result<(), StoreError> {
        self.with_account(account, |records| {
            for record in batch {
                records.prekeys.insert(record.id, record);
            }
        })
    }

    fn allocate_prekey_ids(
        &self,
        account: &AccountId,
        count: usize,
    ) -> Result<Vec<OneTimePreKeyId>, StoreError> {
        self.with_account(account, |records| {
            (0..count)
                .map(|_| {
                    records.next_prekey_id += 1;
                    OneTimePreKeyId(records.next_prekey_id)
                })
                .collect()
        })
    }

    fn load_prekey(
        &self,
        account: &AccountId,
        id: OneTimePreKeyId,
    ) -> Result<Option<OneTimePreKeyRecord>, StoreError> {
        self.with_account(account, |records| records.prekeys.get(&id).cloned())
    }

    fn load_unused_prekeys(
        &self,
        account: &AccountId,
        limit: usize,
    ) -> Result<Vec<OneTimePreKeyRecord>, StoreError> {
        self.with_account(account, |records| {
            records
                .prekeys
                .values()
                .filter(|record| !record.used)
                .take(limit)
                .cloned()
                .collect()
        })
    }

    fn mark_prekey_used(
        &self,
        account: &AccountId,
        id: OneTimePreKeyId,
    ) -> Result<MarkOutcome, StoreError> {
        self.with_account(account, |records| match records.prekeys.get_mut(&id) {
            Some(record) if !record.used => {
                record.used = true;
                MarkOutcome::Consumed
            }
            Some(_) => MarkOutcome::AlreadyUsed,
            None => MarkOutcome::Unknown,
        })
    }
}
