use thiserror::Error;

use lumen_crypto::CryptoError;

use crate::records::{AccountId, OneTimePreKeyId, SignedPreKeyId};
use crate::store::StoreError;

/// Errors surfaced by the key manager.
///
/// Two classes matter to callers: `Crypto` failures (generation or
/// authentication) mean the record or process is broken and retrying is
/// pointless; `Storage` failures are transient and retryable at the
/// caller's discretion with backoff. The remaining variants are expected
/// protocol conditions, not faults.
#[derive(Debug, Error)]
pub enum KeyManagerError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Storage(#[from] StoreError),

    /// An accessor was called before `initialize` for this account. This is
    /// a contract violation by the caller, never silently auto-bootstrapped.
    #[error("account {0} is not initialized — call initialize first")]
    NotInitialized(AccountId),

    #[error("no identity key pair stored for account {0}")]
    IdentityNotFound(AccountId),

    #[error("no signed pre-key {0:?} stored for this account")]
    SignedPreKeyNotFound(SignedPreKeyId),

    #[error("one-time pre-key {0:?} is unknown for this account")]
    PreKeyUnknown(OneTimePreKeyId),

    /// The pre-key was already consumed by an earlier handshake. The caller
    /// should request a different pre-key or fall back to a signed-pre-key
    /// only handshake.
    #[error("one-time pre-key {0:?} was already used")]
    PreKeyAlreadyUsed(OneTimePreKeyId),

    /// Identity or signed pre-key is missing, so no bundle can be composed.
    /// Partial bundles are never published.
    #[error("cannot compose a publishable bundle: {0}")]
    BundleUnavailable(&'static str),

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}
