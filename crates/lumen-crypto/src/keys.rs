//! Typed wrappers for all key material handled by the subsystem.
//!
//! Every key is a fixed-purpose type rather than a raw byte buffer, so an
//! identity secret can never be handed to a pre-key operation by accident.
//! The curve family is Curve25519 throughout: Ed25519 for the signing
//! identity, X25519 for the medium- and short-lived agreement keys.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// An account's long-term Ed25519 identity key pair.
///
/// Created exactly once per account and never rotated for the account's
/// lifetime. The private half only exists in memory — at rest it is sealed
/// by [`crate::keywrap::KeyWrap`].
#[derive(Clone, ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    /// Generate a fresh identity key pair from the OS entropy source.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Restore an identity from its 32-byte secret key.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    /// The public half, used by counterparts to verify signed pre-keys.
    pub fn public_key(&self) -> IdentityPublicKey {
        IdentityPublicKey(self.signing_key.verifying_key().to_bytes())
    }

    /// The secret key bytes, exposed only so they can be sealed for storage.
    pub fn secret_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    /// Sign a message with the identity private key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Public half of an account's identity key pair (Ed25519).
#[derive(Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPublicKey([u8; 32]);

impl IdentityPublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verify `signature` over `message` under this identity key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let verifying_key = VerifyingKey::from_bytes(&self.0)
            .map_err(|e| CryptoError::InvalidKey(format!("identity public key: {e}")))?;
        let signature = Signature::from_slice(signature)
            .map_err(|e| CryptoError::Verification(format!("malformed signature: {e}")))?;
        verifying_key
            .verify(message, &signature)
            .map_err(|e| CryptoError::Verification(e.to_string()))
    }
}

impl std::fmt::Debug for IdentityPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentityPublicKey({})", self.to_hex())
    }
}

/// An X25519 key pair used as a signed pre-key or one-time pre-key.
///
/// `x25519_dalek::StaticSecret` zeroizes itself on drop.
#[derive(Clone)]
pub struct PreKeyPair {
    secret: x25519_dalek::StaticSecret,
    public: x25519_dalek::PublicKey,
}

impl PreKeyPair {
    /// Generate a fresh X25519 key pair from the OS entropy source.
    pub fn generate() -> Self {
        let secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let public = x25519_dalek::PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Restore a pre-key pair from its 32-byte secret.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = x25519_dalek::StaticSecret::from(bytes);
        let public = x25519_dalek::PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> PreKeyPublic {
        PreKeyPublic(self.public.to_bytes())
    }

    /// The secret bytes, exposed only for sealing at rest and for the
    /// session layer's Diffie-Hellman computation.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

impl std::fmt::Debug for PreKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreKeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Public half of an X25519 pre-key.
#[derive(Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyPublic([u8; 32]);

impl PreKeyPublic {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for PreKeyPublic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PreKeyPublic({})", self.to_hex())
    }
}

/// Ed25519 signature over a signed pre-key's public bytes.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeySignature(Vec<u8>);

impl PreKeySignature {
    pub fn from_signature(signature: &Signature) -> Self {
        Self(signature.to_bytes().to_vec())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != SIGNATURE_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "signature must be {SIGNATURE_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for PreKeySignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PreKeySignature({})", hex::encode(&self.0))
    }
}

/// An encrypted private key blob as produced by [`crate::keywrap::KeyWrap`].
///
/// Self-contained: 12-byte nonce, then ciphertext with the 16-byte GCM tag
/// appended. Safe to persist and to hand back for decryption as-is.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKey(Vec<u8>);

impl SealedKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SealedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SealedKey({} bytes)", self.0.len())
    }
}

/// Small per-account random identifier, generated once at bootstrap.
///
/// Counterparts use it to distinguish session state across device
/// re-registration. Bounded to the 14-bit range `1..=0x3FFF`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationId(u16);

impl RegistrationId {
    /// Largest valid registration id (14 bits).
    pub const MAX: u16 = 0x3FFF;

    pub fn from_value(value: u16) -> Result<Self, CryptoError> {
        if value == 0 || value > Self::MAX {
            return Err(CryptoError::InvalidKey(format!(
                "registration id {value} outside 1..={}",
                Self::MAX
            )));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
