use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("signature verification failed: {0}")]
    Verification(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    /// The authentication tag did not verify on decrypt. This means the
    /// stored blob was tampered with or corrupted — it is never safe to
    /// treat the output as key material, so there is no partial result.
    #[error("authentication failed on decrypt: {0}")]
    Authentication(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),
}
