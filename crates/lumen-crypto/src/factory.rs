//! Key Material Factory: fresh Curve25519 key pairs and pre-key signatures.
//!
//! Pure functions — no I/O, no state. Entropy comes from the OS CSPRNG;
//! if that fails the process cannot proceed safely, so generation aborts
//! rather than returning degraded key material.

use rand::rngs::OsRng;
use rand::Rng;

use crate::error::CryptoError;
use crate::keys::{
    IdentityKeyPair, IdentityPublicKey, PreKeyPair, PreKeyPublic, PreKeySignature, RegistrationId,
};

/// Generate a fresh long-term identity key pair (Ed25519).
pub fn generate_identity_key_pair() -> IdentityKeyPair {
    IdentityKeyPair::generate()
}

/// Generate a fresh agreement key pair (X25519), used for both signed
/// pre-keys and one-time pre-keys.
pub fn generate_pre_key() -> PreKeyPair {
    PreKeyPair::generate()
}

/// Generate `count` fresh pre-key pairs for pool replenishment.
pub fn generate_pre_key_batch(count: usize) -> Vec<PreKeyPair> {
    (0..count).map(|_| PreKeyPair::generate()).collect()
}

/// Sign a pre-key's public bytes with the identity private key.
///
/// This is the binding that lets counterparts reject substituted pre-keys:
/// they verify the signature against the published identity key before
/// trusting the signed pre-key.
pub fn sign_pre_key(identity: &IdentityKeyPair, pre_key: &PreKeyPublic) -> PreKeySignature {
    let signature = identity.sign(pre_key.as_bytes());
    PreKeySignature::from_signature(&signature)
}

/// Verify a pre-key signature against an identity public key.
pub fn verify_pre_key_signature(
    identity: &IdentityPublicKey,
    pre_key: &PreKeyPublic,
    signature: &PreKeySignature,
) -> Result<(), CryptoError> {
    identity.verify(pre_key.as_bytes(), signature.as_bytes())
}

/// Generate a random registration id in the 14-bit range `1..=0x3FFF`.
pub fn generate_registration_id() -> RegistrationId {
    let value = OsRng.gen_range(1..=RegistrationId::MAX);
    RegistrationId::from_value(value).unwrap_or_else(|_| unreachable!("value sampled in range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify() {
        let identity = generate_identity_key_pair();
        let pre_key = generate_pre_key();

        let signature = sign_pre_key(&identity, &pre_key.public_key());
        assert!(
            verify_pre_key_signature(&identity.public_key(), &pre_key.public_key(), &signature)
                .is_ok()
        );
    }

    #[test]
    fn tampered_pre_key_fails_verification() {
        let identity = generate_identity_key_pair();
        let pre_key = generate_pre_key();
        let signature = sign_pre_key(&identity, &pre_key.public_key());

        let mut tampered = *pre_key.public_key().as_bytes();
        tampered[0] ^= 0x01;
        let tampered = PreKeyPublic::from_bytes(tampered);

        assert!(matches!(
            verify_pre_key_signature(&identity.public_key(), &tampered, &signature),
            Err(CryptoError::Verification(_))
        ));
    }

    #[test]
    fn wrong_identity_fails_verification() {
        let identity = generate_identity_key_pair();
        let other = generate_identity_key_pair();
        let pre_key = generate_pre_key();

        let signature = sign_pre_key(&identity, &pre_key.public_key());
        assert!(
            verify_pre_key_signature(&other.public_key(), &pre_key.public_key(), &signature)
                .is_err()
        );
    }

    #[test]
    fn batch_generates_distinct_keys() {
        let batch = generate_pre_key_batch(16);
        assert_eq!(batch.len(), 16);

        for (i, a) in batch.iter().enumerate() {
            for b in &batch[i + 1..] {
                assert_ne!(a.public_key(), b.public_key());
            }
        }
    }

    #[test]
    fn batch_of_zero_is_empty() {
        assert!(generate_pre_key_batch(0).is_empty());
    }

    #[test]
    fn registration_id_in_range() {
        for _ in 0..64 {
            let id = generate_registration_id();
            assert!(id.value() >= 1 && id.value() <= RegistrationId::MAX);
        }
    }
}
