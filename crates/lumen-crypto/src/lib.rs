pub mod error;
pub mod factory;
pub mod keys;
pub mod keywrap;

pub use error::CryptoError;
pub use keys::{
    IdentityKeyPair, IdentityPublicKey, PreKeyPair, PreKeyPublic, PreKeySignature,
    RegistrationId, SealedKey,
};
pub use keywrap::{KeyWrap, MasterKey};
