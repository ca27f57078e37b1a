//! E2EE Cryptography
//!
//! Key material and the opaque encryption primitive used by the client,
//! built on vodozemac.
//!
//! - **Megolm**: group sessions that encrypt room events
//! - **Olm account**: long-term device identity and one-time keys
//! - **Pickle keys**: wrapping of everything persisted on disk
//! - **Secret bundles**: versioned, authenticated export of private keys

pub mod backup;
pub mod cipher;
pub mod error;
pub mod megolm;
pub mod olm;
pub mod pickle;
pub mod signing;

pub use backup::{BackupKey, SecretBundle, SECRET_BUNDLE_ALGORITHM, SECRET_BUNDLE_VERSION};
pub use cipher::StoreCipher;
pub use error::{CryptoError, Result};
pub use megolm::{DecryptedGroupMessage, MegolmInboundSession, MegolmOutboundSession};
pub use olm::{IdentityKeyPair, OlmAccount};
pub use pickle::{EncryptedPickleKey, PickleKey};
pub use signing::{canonical_json, verify_json_signature, verify_signature, SigningKey};

/// Re-export vodozemac types that are commonly needed.
pub mod types {
    pub use vodozemac::Curve25519PublicKey;
    pub use vodozemac::Ed25519PublicKey;
    pub use vodozemac::Ed25519Signature;
    pub use vodozemac::KeyId;
}

/// Fill a buffer from the operating system RNG.
pub(crate) fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut bytes = [0u8; N];
    getrandom::getrandom(&mut bytes).map_err(|e| CryptoError::Random(e.to_string()))?;
    Ok(bytes)
}
