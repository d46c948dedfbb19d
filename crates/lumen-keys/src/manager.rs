//! Key manager: per-account lifecycle of identity, signed pre-key, and the
//! one-time pre-key pool.
//!
//! One manager instance is constructed at service startup and shared by
//! reference; there is no hidden global. Per-account state lives behind a
//! concurrency-safe map, so operations for different accounts never contend
//! beyond a brief map lookup, while mutations for the same account are
//! serialized.
//!
//! The in-memory cache holds decrypted identity and signed pre-key pairs
//! for fast access. Nothing is cached before the store confirms a write.
//! When several stateless manager instances share one store, a cached
//! signed pre-key can go stale after a rotation performed elsewhere;
//! deployments like that should re-verify `next_rotation_at` against the
//! stored record before trusting a cached pair.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use lumen_crypto::{
    factory, CryptoError, IdentityKeyPair, KeyWrap, MasterKey, PreKeyPair,
};

use crate::error::KeyManagerError;
use crate::records::{
    unix_now, AccountId, IdentityRecord, KeyBundle, OneTimePreKeyId, OneTimePreKeyPublic,
    OneTimePreKeyRecord, SignedPreKeyId, SignedPreKeyPublic, SignedPreKeyRecord,
};
use crate::stats::{PoolHealth, PoolStats, SignedPreKeyFreshness};
use crate::store::{KeyStore, MarkOutcome};

/// Pool sizing, publication cap, and rotation schedule.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Pool size replenishment restores the account to.
    pub target_pool_size: usize,
    /// Unused-count threshold below which replenishment triggers.
    pub low_water_mark: usize,
    /// Maximum one-time pre-keys included in a single published bundle.
    /// Deliberately smaller than the pool so one publication round cannot
    /// exhaust it.
    pub publish_cap: usize,
    /// How long a signed pre-key stays current before rotation is due.
    pub rotation_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            target_pool_size: 50,
            low_water_mark: 25,
            publish_cap: 10,
            rotation_interval: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<(), KeyManagerError> {
        if self.target_pool_size == 0 {
            return Err(KeyManagerError::InvalidConfig(
                "target_pool_size must be non-zero".into(),
            ));
        }
        if self.low_water_mark >= self.target_pool_size {
            return Err(KeyManagerError::InvalidConfig(format!(
                "low_water_mark {} must be below target_pool_size {}",
                self.low_water_mark, self.target_pool_size
            )));
        }
        if self.publish_cap == 0 {
            return Err(KeyManagerError::InvalidConfig(
                "publish_cap must be non-zero".into(),
            ));
        }
        if self.rotation_interval.is_zero() {
            return Err(KeyManagerError::InvalidConfig(
                "rotation_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Decrypted signed pre-key held in memory after a confirmed store write.
struct CachedSignedPreKey {
    id: SignedPreKeyId,
    pair: PreKeyPair,
}

#[derive(Default)]
struct AccountCache {
    identity: Option<IdentityKeyPair>,
    signed: Option<CachedSignedPreKey>,
}

/// Per-account lock + cache. The mutex serializes bootstrap, rotation, and
/// replenishment for the account.
#[derive(Default)]
struct AccountState {
    cache: Mutex<AccountCache>,
}

/// Orchestrates key lifecycle for all accounts in the process.
pub struct KeyManager {
    store: Arc<dyn KeyStore>,
    wrap: KeyWrap,
    config: PoolConfig,
    accounts: Mutex<HashMap<AccountId, Arc<AccountState>>>,
}

impl KeyManager {
    pub fn new(
        store: Arc<dyn KeyStore>,
        master_key: MasterKey,
        config: PoolConfig,
    ) -> Result<Self, KeyManagerError> {
        config.validate()?;
        Ok(Self {
            store,
            wrap: KeyWrap::new(master_key),
            config,
            accounts: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Bootstrap-or-load the account's key material.
    ///
    /// Generates the identity only when the store reports none (the
    /// existence check plus the per-account lock make bootstrap
    /// single-flight in this process; across processes the store's upsert
    /// resolves the benign race last-writer-wins). Then ensures an active,
    /// unexpired signed pre-key and a pre-key pool at the target size.
    /// Storage and crypto failures surface to the caller.
    pub fn initialize(&self, account: &AccountId) -> Result<(), KeyManagerError> {
        let state = self.account_state(account);
        let mut cache = state.cache.lock();

        let identity = match self.store.load_identity(account)? {
            Some(record) => {
                tracing::debug!(account = %account, "loaded existing identity bundle");
                self.open_identity(&record)?
            }
            None => {
                let identity = factory::generate_identity_key_pair();
                let record = IdentityRecord {
                    public: identity.public_key(),
                    sealed_private: self.wrap.seal(identity.secret_bytes())?,
                    registration_id: factory::generate_registration_id(),
                    created_at: unix_now(),
                };
                self.store.upsert_identity(account, record)?;
                tracing::info!(
                    account = %account,
                    identity = %identity.public_key().to_hex(),
                    "bootstrapped new identity"
                );
                identity
            }
        };
        cache.identity = Some(identity.clone());

        match self.store.load_active_signed_prekey(account)? {
            Some(record) if !record.due_for_rotation(unix_now()) => {
                cache.signed = Some(self.open_signed(&record)?);
            }
            _ => {
                self.rotate_locked(account, &identity, &mut cache)?;
            }
        }

        self.replenish_inner(account)?;
        Ok(())
    }

    /// The account's identity key pair, from cache or decrypted from the
    /// store. Errors with `NotInitialized` when neither has it — callers
    /// must run `initialize` first; accessors never bootstrap.
    pub fn get_identity_key_pair(
        &self,
        account: &AccountId,
    ) -> Result<IdentityKeyPair, KeyManagerError> {
        let state = self.account_state(account);
        let mut cache = state.cache.lock();
        if let Some(identity) = &cache.identity {
            return Ok(identity.clone());
        }
        match self.store.load_identity(account)? {
            Some(record) => {
                let identity = self.open_identity(&record)?;
                cache.identity = Some(identity.clone());
                Ok(identity)
            }
            None => Err(KeyManagerError::NotInitialized(account.clone())),
        }
    }

    /// The active signed pre-key pair, from cache or decrypted from the
    /// store. Same contract as [`KeyManager::get_identity_key_pair`].
    pub fn get_signed_prekey_pair(
        &self,
        account: &AccountId,
    ) -> Result<(SignedPreKeyId, PreKeyPair), KeyManagerError> {
        let state = self.account_state(account);
        let mut cache = state.cache.lock();
        if let Some(cached) = &cache.signed {
            return Ok((cached.id, cached.pair.clone()));
        }
        match self.store.load_active_signed_prekey(account)? {
            Some(record) => {
                let cached = self.open_signed(&record)?;
                let result = (cached.id, cached.pair.clone());
                cache.signed = Some(cached);
                Ok(result)
            }
            None => Err(KeyManagerError::NotInitialized(account.clone())),
        }
    }

    /// A signed pre-key pair by id, active or superseded.
    ///
    /// Responder handshakes reference the signed pre-key id from the bundle
    /// they fetched, which may have been rotated since — superseded records
    /// stay readable for exactly this case.
    pub fn get_signed_prekey_pair_by_id(
        &self,
        account: &AccountId,
        id: SignedPreKeyId,
    ) -> Result<PreKeyPair, KeyManagerError> {
        match self.store.load_signed_prekey(account, id)? {
            Some(record) => Ok(self.open_signed(&record)?.pair),
            None => Err(KeyManagerError::SignedPreKeyNotFound(id)),
        }
    }

    /// Compose the public bundle for publication.
    ///
    /// All-or-nothing: a missing identity or signed pre-key yields
    /// `BundleUnavailable`, never a partial bundle, since a counterpart
    /// cannot authenticate an incomplete one. Includes at most
    /// `publish_cap` unused one-time pre-keys and does not consume them.
    pub fn get_public_bundle(&self, account: &AccountId) -> Result<KeyBundle, KeyManagerError> {
        let identity = self
            .store
            .load_identity(account)?
            .ok_or(KeyManagerError::BundleUnavailable("identity bundle missing"))?;
        let signed = self
            .store
            .load_active_signed_prekey(account)?
            .ok_or(KeyManagerError::BundleUnavailable("no active signed pre-key"))?;

        let one_time_prekeys = self
            .store
            .load_unused_prekeys(account, self.config.publish_cap)?
            .into_iter()
            .map(|record| OneTimePreKeyPublic {
                id: record.id,
                public_key: record.public,
            })
            .collect();

        Ok(KeyBundle {
            identity_key: identity.public,
            registration_id: identity.registration_id,
            signed_prekey: SignedPreKeyPublic {
                id: signed.id,
                public_key: signed.public,
                signature: signed.signature,
            },
            one_time_prekeys,
        })
    }

    /// Generate, sign, and persist a new signed pre-key, deactivating the
    /// previous one.
    ///
    /// Safe to call before the current key expires (forced rotation) and
    /// idempotent under retry: every call produces a valid signed key and
    /// the store keeps a single source of truth for "active".
    pub fn rotate_signed_prekey(
        &self,
        account: &AccountId,
    ) -> Result<SignedPreKeyId, KeyManagerError> {
        let state = self.account_state(account);
        let mut cache = state.cache.lock();

        let identity = match cache.identity.clone() {
            Some(identity) => identity,
            None => match self.store.load_identity(account)? {
                Some(record) => {
                    let identity = self.open_identity(&record)?;
                    cache.identity = Some(identity.clone());
                    identity
                }
                None => return Err(KeyManagerError::IdentityNotFound(account.clone())),
            },
        };

        self.rotate_locked(account, &identity, &mut cache)
    }

    /// Whether the active signed pre-key has passed its rotation deadline.
    /// A missing signed pre-key counts as due.
    pub fn signed_prekey_due_for_rotation(
        &self,
        account: &AccountId,
    ) -> Result<bool, KeyManagerError> {
        Ok(match self.store.load_active_signed_prekey(account)? {
            Some(record) => record.due_for_rotation(unix_now()),
            None => true,
        })
    }

    /// Top the pool back up to the target size if the unused count has
    /// fallen below the low-water mark. Returns the number of pre-keys
    /// generated; a pool at or above the mark is a no-op, not an error.
    pub fn replenish_prekeys_if_needed(
        &self,
        account: &AccountId,
    ) -> Result<usize, KeyManagerError> {
        let state = self.account_state(account);
        let _guard = state.cache.lock();
        self.replenish_inner(account)
    }

    /// Consume a one-time pre-key on behalf of a responder-side handshake:
    /// load, decrypt, and atomically mark it used.
    ///
    /// The mark is the last step, so a decryption or storage failure leaves
    /// the key's used-state unchanged. Two concurrent calls for the same id
    /// resolve at the store's atomic mark: exactly one gets the key pair,
    /// the other gets `PreKeyAlreadyUsed`.
    pub fn consume_prekey(
        &self,
        account: &AccountId,
        id: OneTimePreKeyId,
    ) -> Result<PreKeyPair, KeyManagerError> {
        let record = self
            .store
            .load_prekey(account, id)?
            .ok_or(KeyManagerError::PreKeyUnknown(id))?;
        if record.used {
            return Err(KeyManagerError::PreKeyAlreadyUsed(id));
        }

        let pair = self.open_prekey_pair(&record.sealed_private, &record.public)?;

        match self.store.mark_prekey_used(account, id)? {
            MarkOutcome::Consumed => {
                tracing::debug!(account = %account, prekey_id = id.0, "one-time pre-key consumed");
                Ok(pair)
            }
            MarkOutcome::AlreadyUsed => Err(KeyManagerError::PreKeyAlreadyUsed(id)),
            MarkOutcome::Unknown => Err(KeyManagerError::PreKeyUnknown(id)),
        }
    }

    /// Snapshot of the account's key state for operators and the rotation
    /// scheduler. Contains no secrets.
    pub fn stats(&self, account: &AccountId) -> Result<PoolStats, KeyManagerError> {
        let has_identity = self.store.load_identity(account)?.is_some();
        let unused_prekeys = self.store.count_unused_prekeys(account)?;
        let signed_prekey = match self.store.load_active_signed_prekey(account)? {
            Some(record) if record.due_for_rotation(unix_now()) => {
                SignedPreKeyFreshness::DueForRotation
            }
            Some(_) => SignedPreKeyFreshness::Current,
            None => SignedPreKeyFreshness::Missing,
        };
        let pool_health = if unused_prekeys < self.config.low_water_mark {
            PoolHealth::Low
        } else {
            PoolHealth::Healthy
        };

        Ok(PoolStats {
            has_identity,
            unused_prekeys,
            target_pool_size: self.config.target_pool_size,
            low_water_mark: self.config.low_water_mark,
            pool_health,
            signed_prekey,
        })
    }

    fn account_state(&self, account: &AccountId) -> Arc<AccountState> {
        let mut accounts = self.accounts.lock();
        Arc::clone(accounts.entry(account.clone()).or_default())
    }

    /// Caller must hold the account's cache lock.
    fn rotate_locked(
        &self,
        account: &AccountId,
        identity: &IdentityKeyPair,
        cache: &mut AccountCache,
    ) -> Result<SignedPreKeyId, KeyManagerError> {
        // Drop the stale pair first; re-cache only after the store confirms.
        cache.signed = None;

        let id = self.store.allocate_signed_prekey_id(account)?;
        let pair = factory::generate_pre_key();
        let signature = factory::sign_pre_key(identity, &pair.public_key());
        let now = unix_now();
        let interval = self.config.rotation_interval.as_secs();

        let record = SignedPreKeyRecord {
            id,
            public: pair.public_key(),
            sealed_private: self.wrap.seal(&pair.secret_bytes())?,
            signature,
            created_at: now,
            rotation_interval_secs: interval,
            next_rotation_at: now + interval,
            active: true,
        };
        self.store.store_signed_prekey(account, record)?;

        cache.signed = Some(CachedSignedPreKey { id, pair });
        tracing::info!(account = %account, signed_prekey_id = id.0, "signed pre-key rotated");
        Ok(id)
    }

    /// Caller must hold the account's cache lock (or be inside
    /// `initialize`); serializes against concurrent replenishment so two
    /// overlapping calls cannot both generate a shortfall.
    fn replenish_inner(&self, account: &AccountId) -> Result<usize, KeyManagerError> {
        let current = self.store.count_unused_prekeys(account)?;
        if current >= self.config.low_water_mark {
            return Ok(0);
        }

        let shortfall = self.config.target_pool_size - current;
        let ids = self.store.allocate_prekey_ids(account, shortfall)?;
        let now = unix_now();
        let records = ids
            .into_iter()
            .map(|id| {
                let pair = factory::generate_pre_key();
                Ok(OneTimePreKeyRecord {
                    id,
                    public: pair.public_key(),
                    sealed_private: self.wrap.seal(&pair.secret_bytes())?,
                    used: false,
                    created_at: now,
                })
            })
            .collect::<Result<Vec<_>, KeyManagerError>>()?;
        self.store.store_prekey_batch(account, records)?;

        tracing::info!(
            account = %account,
            generated = shortfall,
            pool = self.config.target_pool_size,
            "replenished one-time pre-key pool"
        );
        Ok(shortfall)
    }

    fn open_identity(&self, record: &IdentityRecord) -> Result<IdentityKeyPair, KeyManagerError> {
        let secret = self.wrap.open(&record.sealed_private)?;
        let bytes: [u8; 32] = secret.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKey("sealed identity secret has wrong length".into())
        })?;
        let identity = IdentityKeyPair::from_secret_bytes(&bytes);
        if identity.public_key() != record.public {
            return Err(CryptoError::InvalidKey(
                "stored identity public key does not match sealed private key".into(),
            )
            .into());
        }
        Ok(identity)
    }

    fn open_signed(
        &self,
        record: &SignedPreKeyRecord,
    ) -> Result<CachedSignedPreKey, KeyManagerError> {
        let pair = self.open_prekey_pair(&record.sealed_private, &record.public)?;
        Ok(CachedSignedPreKey {
            id: record.id,
            pair,
        })
    }

    fn open_prekey_pair(
        &self,
        sealed: &lumen_crypto::SealedKey,
        expected_public: &lumen_crypto::PreKeyPublic,
    ) -> Result<PreKeyPair, KeyManagerError> {
        let secret = self.wrap.open(sealed)?;
        let bytes: [u8; 32] = secret
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("sealed pre-key secret has wrong length".into()))?;
        let pair = PreKeyPair::from_secret_bytes(bytes);
        if pair.public_key() != *expected_public {
            return Err(CryptoError::InvalidKey(
                "stored pre-key public key does not match sealed private key".into(),
            )
            .into());
        }
        Ok(pair)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use super::*;
    use crate::memory_store::MemoryKeyStore;
    use crate::store::StoreError;
    use lumen_crypto::SealedKey;

    fn new_manager() -> (KeyManager, Arc<MemoryKeyStore>) {
        let store = Arc::new(MemoryKeyStore::new());
        let manager = KeyManager::new(
            Arc::clone(&store) as Arc<dyn KeyStore>,
            MasterKey::generate(),
            PoolConfig::default(),
        )
        .unwrap();
        (manager, store)
    }

    fn account() -> AccountId {
        AccountId::new("alice")
    }

    #[test]
    fn invalid_configs_rejected() {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
        let bad = [
            PoolConfig {
                target_pool_size: 0,
                ..PoolConfig::default()
            },
            PoolConfig {
                low_water_mark: 50,
                ..PoolConfig::default()
            },
            PoolConfig {
                publish_cap: 0,
                ..PoolConfig::default()
            },
            PoolConfig {
                rotation_interval: Duration::ZERO,
                ..PoolConfig::default()
            },
        ];
        for config in bad {
            assert!(matches!(
                KeyManager::new(Arc::clone(&store), MasterKey::generate(), config),
                Err(KeyManagerError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn initialize_establishes_invariants() {
        let (manager, store) = new_manager();
        let account = account();
        manager.initialize(&account).unwrap();

        assert!(store.load_identity(&account).unwrap().is_some());
        let signed = store.load_active_signed_prekey(&account).unwrap().unwrap();
        assert!(signed.active);
        assert_eq!(store.count_unused_prekeys(&account).unwrap(), 50);

        let stats = manager.stats(&account).unwrap();
        assert!(stats.has_identity);
        assert_eq!(stats.pool_health, PoolHealth::Healthy);
        assert_eq!(stats.signed_prekey, SignedPreKeyFreshness::Current);
    }

    #[test]
    fn initialize_is_idempotent() {
        let (manager, store) = new_manager();
        let account = account();
        manager.initialize(&account).unwrap();

        let identity_before = store.load_identity(&account).unwrap().unwrap();
        let signed_before = store.load_active_signed_prekey(&account).unwrap().unwrap();

        manager.initialize(&account).unwrap();

        let identity_after = store.load_identity(&account).unwrap().unwrap();
        let signed_after = store.load_active_signed_prekey(&account).unwrap().unwrap();
        assert_eq!(identity_before.public, identity_after.public);
        assert_eq!(signed_before.id, signed_after.id);
        assert_eq!(store.count_unused_prekeys(&account).unwrap(), 50);
    }

    #[test]
    fn initialize_rotates_an_expired_signed_prekey() {
        let (manager, store) = new_manager();
        let account = account();
        manager.initialize(&account).unwrap();
        let stale = store.load_active_signed_prekey(&account).unwrap().unwrap();

        // Push the active record past its deadline.
        store
            .store_signed_prekey(
                &account,
                SignedPreKeyRecord {
                    next_rotation_at: unix_now() - 10,
                    ..stale.clone()
                },
            )
            .unwrap();
        assert!(manager.signed_prekey_due_for_rotation(&account).unwrap());

        manager.initialize(&account).unwrap();
        let fresh = store.load_active_signed_prekey(&account).unwrap().unwrap();
        assert_ne!(fresh.id, stale.id);
        assert!(!manager.signed_prekey_due_for_rotation(&account).unwrap());
    }

    #[test]
    fn accessors_fail_before_initialize() {
        let (manager, _) = new_manager();
        let account = account();

        assert!(matches!(
            manager.get_identity_key_pair(&account),
            Err(KeyManagerError::NotInitialized(_))
        ));
        assert!(matches!(
            manager.get_signed_prekey_pair(&account),
            Err(KeyManagerError::NotInitialized(_))
        ));
    }

    #[test]
    fn identity_survives_manager_restart() {
        let store = Arc::new(MemoryKeyStore::new());
        let account = account();
        let key_bytes = [9u8; 32];

        let manager = KeyManager::new(
            Arc::clone(&store) as Arc<dyn KeyStore>,
            MasterKey::from_bytes(key_bytes),
            PoolConfig::default(),
        )
        .unwrap();
        manager.initialize(&account).unwrap();
        let public_before = manager.get_identity_key_pair(&account).unwrap().public_key();
        drop(manager);

        // A fresh instance with the same injected master key loads and
        // decrypts the same identity instead of bootstrapping a new one.
        let restarted = KeyManager::new(
            Arc::clone(&store) as Arc<dyn KeyStore>,
            MasterKey::from_bytes(key_bytes),
            PoolConfig::default(),
        )
        .unwrap();
        let public_after = restarted.get_identity_key_pair(&account).unwrap().public_key();
        assert_eq!(public_before, public_after);
    }

    #[test]
    fn wrong_master_key_cannot_open_identity() {
        let store = Arc::new(MemoryKeyStore::new());
        let account = account();

        let manager = KeyManager::new(
            Arc::clone(&store) as Arc<dyn KeyStore>,
            MasterKey::from_bytes([1u8; 32]),
            PoolConfig::default(),
        )
        .unwrap();
        manager.initialize(&account).unwrap();

        let other = KeyManager::new(
            Arc::clone(&store) as Arc<dyn KeyStore>,
            MasterKey::from_bytes([2u8; 32]),
            PoolConfig::default(),
        )
        .unwrap();
        assert!(matches!(
            other.get_identity_key_pair(&account),
            Err(KeyManagerError::Crypto(CryptoError::Authentication(_)))
        ));
    }

    #[test]
    fn bundle_is_complete_and_verifies() {
        let (manager, store) = new_manager();
        let account = account();
        manager.initialize(&account).unwrap();

        let bundle = manager.get_public_bundle(&account).unwrap();
        assert!(bundle.verify().is_ok());
        assert_eq!(bundle.one_time_prekeys.len(), 10);
        assert!(bundle.registration_id.value() >= 1);

        // Every published one-time key is unused.
        for entry in &bundle.one_time_prekeys {
            let record = store.load_prekey(&account, entry.id).unwrap().unwrap();
            assert!(!record.used);
        }

        // Publication is not consumption.
        manager.get_public_bundle(&account).unwrap();
        assert_eq!(store.count_unused_prekeys(&account).unwrap(), 50);
    }

    #[test]
    fn no_partial_bundle_for_uninitialized_account() {
        let (manager, _) = new_manager();
        assert!(matches!(
            manager.get_public_bundle(&account()),
            Err(KeyManagerError::BundleUnavailable(_))
        ));
    }

    #[test]
    fn rotation_swaps_active_and_keeps_old_readable() {
        let (manager, store) = new_manager();
        let account = account();
        manager.initialize(&account).unwrap();
        let (old_id, old_pair) = manager.get_signed_prekey_pair(&account).unwrap();

        let new_id = manager.rotate_signed_prekey(&account).unwrap();
        assert_ne!(new_id, old_id);

        let old_record = store.load_signed_prekey(&account, old_id).unwrap().unwrap();
        assert!(!old_record.active);
        let new_record = store.load_active_signed_prekey(&account).unwrap().unwrap();
        assert_eq!(new_record.id, new_id);
        assert!(new_record.active);

        // Accessor reflects the rotation immediately.
        let (current_id, _) = manager.get_signed_prekey_pair(&account).unwrap();
        assert_eq!(current_id, new_id);

        // Grace window: the superseded pair is still retrievable by id for
        // in-flight handshakes.
        let grace_pair = manager
            .get_signed_prekey_pair_by_id(&account, old_id)
            .unwrap();
        assert_eq!(grace_pair.public_key(), old_pair.public_key());
    }

    #[test]
    fn rotation_is_safe_under_retry() {
        let (manager, store) = new_manager();
        let account = account();
        manager.initialize(&account).unwrap();

        let first = manager.rotate_signed_prekey(&account).unwrap();
        let second = manager.rotate_signed_prekey(&account).unwrap();
        assert_ne!(first, second);

        // Exactly one active record, and it is the latest.
        let active = store.load_active_signed_prekey(&account).unwrap().unwrap();
        assert_eq!(active.id, second);
        assert!(!store
            .load_signed_prekey(&account, first)
            .unwrap()
            .unwrap()
            .active);
    }

    #[test]
    fn rotation_requires_an_identity() {
        let (manager, _) = new_manager();
        assert!(matches!(
            manager.rotate_signed_prekey(&account()),
            Err(KeyManagerError::IdentityNotFound(_))
        ));
    }

    #[test]
    fn rotated_prekey_signature_verifies() {
        let (manager, store) = new_manager();
        let account = account();
        manager.initialize(&account).unwrap();
        manager.rotate_signed_prekey(&account).unwrap();

        let identity = store.load_identity(&account).unwrap().unwrap();
        let signed = store.load_active_signed_prekey(&account).unwrap().unwrap();
        assert!(factory::verify_pre_key_signature(
            &identity.public,
            &signed.public,
            &signed.signature
        )
        .is_ok());
    }

    #[test]
    fn replenish_is_exact_and_noop_above_low_water() {
        let (manager, store) = new_manager();
        let account = account();
        manager.initialize(&account).unwrap();

        // At target: no-op.
        assert_eq!(manager.replenish_prekeys_if_needed(&account).unwrap(), 0);

        // Drain to 40 — still above the low-water mark of 25: no-op.
        for id in 1..=10u32 {
            manager.consume_prekey(&account, OneTimePreKeyId(id)).unwrap();
        }
        assert_eq!(manager.replenish_prekeys_if_needed(&account).unwrap(), 0);
        assert_eq!(store.count_unused_prekeys(&account).unwrap(), 40);

        // Drain to 20 — below the mark: exactly target - current generated.
        for id in 11..=30u32 {
            manager.consume_prekey(&account, OneTimePreKeyId(id)).unwrap();
        }
        assert_eq!(store.count_unused_prekeys(&account).unwrap(), 20);
        assert_eq!(manager.replenish_prekeys_if_needed(&account).unwrap(), 30);
        assert_eq!(store.count_unused_prekeys(&account).unwrap(), 50);

        let stats = manager.stats(&account).unwrap();
        assert_eq!(stats.pool_health, PoolHealth::Healthy);
    }

    #[test]
    fn heavy_consumption_then_replenish_cycle() {
        let (manager, store) = new_manager();
        let account = account();
        manager.initialize(&account).unwrap();

        for id in 1..=40u32 {
            manager.consume_prekey(&account, OneTimePreKeyId(id)).unwrap();
        }
        assert_eq!(store.count_unused_prekeys(&account).unwrap(), 10);
        assert_eq!(manager.stats(&account).unwrap().pool_health, PoolHealth::Low);

        assert_eq!(manager.replenish_prekeys_if_needed(&account).unwrap(), 40);
        assert_eq!(store.count_unused_prekeys(&account).unwrap(), 50);
    }

    #[test]
    fn consume_matches_published_public_key() {
        let (manager, _) = new_manager();
        let account = account();
        manager.initialize(&account).unwrap();

        let bundle = manager.get_public_bundle(&account).unwrap();
        let entry = &bundle.one_time_prekeys[0];
        let pair = manager.consume_prekey(&account, entry.id).unwrap();
        assert_eq!(pair.public_key(), entry.public_key);
    }

    #[test]
    fn consume_twice_fails_definitively() {
        let (manager, _) = new_manager();
        let account = account();
        manager.initialize(&account).unwrap();

        let id = OneTimePreKeyId(1);
        manager.consume_prekey(&account, id).unwrap();
        assert!(matches!(
            manager.consume_prekey(&account, id),
            Err(KeyManagerError::PreKeyAlreadyUsed(_))
        ));
        assert!(matches!(
            manager.consume_prekey(&account, OneTimePreKeyId(9_999)),
            Err(KeyManagerError::PreKeyUnknown(_))
        ));
    }

    #[test]
    fn concurrent_consume_has_exactly_one_winner() {
        let (manager, _) = new_manager();
        let manager = Arc::new(manager);
        let account = account();
        manager.initialize(&account).unwrap();

        let id = OneTimePreKeyId(1);
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let account = account.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    manager.consume_prekey(&account, id)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let successes = results.iter().filter(|r| r.is_ok()).count();
        let already_used = results
            .iter()
            .filter(|r| matches!(r, Err(KeyManagerError::PreKeyAlreadyUsed(_))))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(already_used, 1);
    }

    #[test]
    fn tampered_sealed_prekey_is_rejected_and_not_consumed() {
        let (manager, store) = new_manager();
        let account = account();
        manager.initialize(&account).unwrap();

        let id = OneTimePreKeyId(1);
        let mut record = store.load_prekey(&account, id).unwrap().unwrap();
        let mut blob = record.sealed_private.as_bytes().to_vec();
        blob[20] ^= 0x01;
        record.sealed_private = SealedKey::from_bytes(blob);
        store.store_prekey_batch(&account, vec![record]).unwrap();

        let before = store.count_unused_prekeys(&account).unwrap();
        assert!(matches!(
            manager.consume_prekey(&account, id),
            Err(KeyManagerError::Crypto(CryptoError::Authentication(_)))
        ));
        // The failed consumption left the used-state unchanged.
        assert_eq!(store.count_unused_prekeys(&account).unwrap(), before);
    }

    #[test]
    fn mismatched_public_key_is_rejected() {
        let (manager, store) = new_manager();
        let account = account();
        manager.initialize(&account).unwrap();

        // Swap the stored public key for a different one; the sealed private
        // no longer matches and must be refused.
        let id = OneTimePreKeyId(2);
        let mut record = store.load_prekey(&account, id).unwrap().unwrap();
        record.public = factory::generate_pre_key().public_key();
        store.store_prekey_batch(&account, vec![record]).unwrap();

        assert!(matches!(
            manager.consume_prekey(&account, id),
            Err(KeyManagerError::Crypto(CryptoError::InvalidKey(_)))
        ));
    }

    #[test]
    fn stats_for_unknown_account() {
        let (manager, _) = new_manager();
        let stats = manager.stats(&AccountId::new("nobody")).unwrap();
        assert!(!stats.has_identity);
        assert_eq!(stats.unused_prekeys, 0);
        assert_eq!(stats.pool_health, PoolHealth::Low);
        assert_eq!(stats.signed_prekey, SignedPreKeyFreshness::Missing);
    }

    #[test]
    fn storage_failures_surface_as_retryable_errors() {
        struct FailingStore;
        impl KeyStore for FailingStore {
            fn load_identity(
                &self,
                _: &AccountId,
            ) -> Result<Option<IdentityRecord>, StoreError> {
                Err(StoreError("backend unavailable".into()))
            }
            fn upsert_identity(
                &self,
                _: &AccountId,
                _: IdentityRecord,
            ) -> Result<(), StoreError> {
                Err(StoreError("backend unavailable".into()))
            }
            fn load_active_signed_prekey(
                &self,
                _: &AccountId,
            ) -> Result<Option<SignedPreKeyRecord>, StoreError> {
                Err(StoreError("backend unavailable".into()))
            }
            fn load_signed_prekey(
                &self,
                _: &AccountId,
                _: SignedPreKeyId,
            ) -> Result<Option<SignedPreKeyRecord>, StoreError> {
                Err(StoreError("backend unavailable".into()))
            }
            fn store_signed_prekey(
                &self,
                _: &AccountId,
                _: SignedPreKeyRecord,
            ) -> Result<(), StoreError> {
                Err(StoreError("backend unavailable".into()))
            }
            fn allocate_signed_prekey_id(
                &self,
                _: &AccountId,
            ) -> Result<SignedPreKeyId, StoreError> {
                Err(StoreError("backend unavailable".into()))
            }
            fn count_unused_prekeys(&self, _: &AccountId) -> Result<usize, StoreError> {
                Err(StoreError("backend unavailable".into()))
            }
            fn store_prekey_batch(
                &self,
                _: &AccountId,
                _: Vec<OneTimePreKeyRecord>,
            ) -> Result<(), StoreError> {
                Err(StoreError("backend unavailable".into()))
            }
            fn allocate_prekey_ids(
                &self,
                _: &AccountId,
                _: usize,
            ) -> Result<Vec<OneTimePreKeyId>, StoreError> {
                Err(StoreError("backend unavailable".into()))
            }
            fn load_prekey(
                &self,
                _: &AccountId,
                _: OneTimePreKeyId,
            ) -> Result<Option<OneTimePreKeyRecord>, StoreError> {
                Err(StoreError("backend unavailable".into()))
            }
            fn load_unused_prekeys(
                &self,
                _: &AccountId,
                _: usize,
            ) -> Result<Vec<OneTimePreKeyRecord>, StoreError> {
                Err(StoreError("backend unavailable".into()))
            }
            fn mark_prekey_used(
                &self,
                _: &AccountId,
                _: OneTimePreKeyId,
            ) -> Result<MarkOutcome, StoreError> {
                Err(StoreError("backend unavailable".into()))
            }
        }

        let manager = KeyManager::new(
            Arc::new(FailingStore),
            MasterKey::generate(),
            PoolConfig::default(),
        )
        .unwrap();
        assert!(matches!(
            manager.initialize(&account()),
            Err(KeyManagerError::Storage(_))
        ));
        assert!(matches!(
            manager.consume_prekey(&account(), OneTimePreKeyId(1)),
            Err(KeyManagerError::Storage(_))
        ));
    }
}
