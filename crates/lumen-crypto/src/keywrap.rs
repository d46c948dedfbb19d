//! Key Encryption Unit: AES-256-GCM wrapping of private key bytes at rest.
//!
//! A process-wide master key seals every private key before it reaches the
//! store and opens it on the way back. The master key itself is injected at
//! startup — in production it comes from an HSM or external secret store,
//! never from this crate.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;
use crate::keys::SealedKey;

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;
/// AES-GCM authentication tag length in bytes.
const TAG_LEN: usize = 16;

/// The process-wide symmetric master key protecting key material at rest.
///
/// Read-only after startup. Never logged, never serialized.
#[derive(ZeroizeOnDrop)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    /// Wrap an externally sourced 32-byte master key.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a random master key.
    ///
    /// Development and test convenience only: keys sealed under a generated
    /// master key are unrecoverable after process exit. Production services
    /// must inject the key via [`MasterKey::from_bytes`] and fail startup if
    /// none is available.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Authenticated encryption of private key bytes under the master key.
pub struct KeyWrap {
    master: MasterKey,
}

impl KeyWrap {
    pub fn new(master: MasterKey) -> Self {
        Self { master }
    }

    /// Seal private key bytes for storage.
    ///
    /// A fresh random nonce is drawn per call and prepended to the
    /// ciphertext, so the blob is self-contained for [`KeyWrap::open`].
    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedKey, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(&self.master.0)
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(SealedKey::from_bytes(blob))
    }

    /// Open a sealed blob back into private key bytes.
    ///
    /// Fails with [`CryptoError::Authentication`] if the tag does not
    /// verify — tampered or corrupted blobs never yield plaintext.
    pub fn open(&self, sealed: &SealedKey) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let data = sealed.as_bytes();
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Authentication(format!(
                "sealed blob too short: {} bytes",
                data.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.master.0)
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;

        let nonce = Nonce::from_slice(&data[..NONCE_LEN]);
        let plaintext = cipher
            .decrypt(nonce, &data[NONCE_LEN..])
            .map_err(|_| CryptoError::Authentication("tag verification failed".into()))?;

        Ok(Zeroizing::new(plaintext))
    }
}
