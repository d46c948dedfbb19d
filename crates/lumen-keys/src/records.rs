//! Persisted record shapes and the published `KeyBundle`.
//!
//! Records are what the store adapter persists per account; private halves
//! are always sealed by the key-encryption unit before they get here. The
//! bundle is derived on demand for publication and is never stored.

use serde::{Deserialize, Serialize};

use lumen_crypto::{
    factory, CryptoError, IdentityPublicKey, PreKeyPublic, PreKeySignature, RegistrationId,
    SealedKey,
};

/// Opaque per-account handle used to key all storage and manager state.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AccountId({})", self.0)
    }
}

/// Monotonic per-account id of a signed pre-key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignedPreKeyId(pub u32);

/// Monotonic per-account id of a one-time pre-key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OneTimePreKeyId(pub u32);

/// The per-account identity bundle: created exactly once at bootstrap,
/// loaded thereafter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub public: IdentityPublicKey,
    /// Identity private key, sealed under the master key.
    pub sealed_private: SealedKey,
    pub registration_id: RegistrationId,
    pub created_at: u64,
}

/// A medium-lived signed pre-key. At most one record per account is active;
/// superseded records stay readable for in-flight handshakes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKeyRecord {
    pub id: SignedPreKeyId,
    pub public: PreKeyPublic,
    pub sealed_private: SealedKey,
    /// Signature of `public` under the account's identity key.
    pub signature: PreKeySignature,
    pub created_at: u64,
    pub rotation_interval_secs: u64,
    pub next_rotation_at: u64,
    pub active: bool,
}

impl SignedPreKeyRecord {
    /// Whether the rotation deadline has passed at `now` (unix seconds).
    pub fn due_for_rotation(&self, now: u64) -> bool {
        now >= self.next_rotation_at
    }
}

/// A single-use pre-key from the pool. `used` flips to true exactly once.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKeyRecord {
    pub id: OneTimePreKeyId,
    pub public: PreKeyPublic,
    pub sealed_private: SealedKey,
    pub used: bool,
    pub created_at: u64,
}

/// Public half of the active signed pre-key as it appears in a bundle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKeyPublic {
    pub id: SignedPreKeyId,
    pub public_key: PreKeyPublic,
    pub signature: PreKeySignature,
}

/// Public half of a one-time pre-key as it appears in a bundle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKeyPublic {
    pub id: OneTimePreKeyId,
    pub public_key: PreKeyPublic,
}

/// The public bundle published for counterparts to initiate X3DH.
///
/// Derived on demand, never persisted. Every field is public material and
/// safe to send over an untrusted channel; receivers call
/// [`KeyBundle::verify`] before trusting the signed pre-key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundle {
    pub identity_key: IdentityPublicKey,
    pub registration_id: RegistrationId,
    pub signed_prekey: SignedPreKeyPublic,
    pub one_time_prekeys: Vec<OneTimePreKeyPublic>,
}

impl KeyBundle {
    /// Verify the signed pre-key signature against the bundle's identity
    /// key. Counterparts must not perform X3DH against a bundle that fails
    /// this check.
    pub fn verify(&self) -> Result<(), CryptoError> {
        factory::verify_pre_key_signature(
            &self.identity_key,
            &self.signed_prekey.public_key,
            &self.signed_prekey.signature,
        )
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
