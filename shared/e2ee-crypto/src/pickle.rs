//! Pickle Keys
//!
//! The symmetric key that wraps every secret the key store writes to disk,
//! and its passphrase-protected form.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{random_bytes, CryptoError, Result};

const PASSPHRASE_SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// A 32-byte key used to encrypt pickles and store records.
///
/// Zeroized on drop. The store never persists it in cleartext.
#[derive(Clone)]
pub struct PickleKey {
    key: Zeroizing<[u8; 32]>,
}

impl PickleKey {
    /// Generate a fresh random key.
    pub fn new() -> Result<Self> {
        Ok(Self {
            key: Zeroizing::new(random_bytes::<32>()?),
        })
    }

    /// Wrap existing key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            key: Zeroizing::new(bytes),
        }
    }

    /// Parse key bytes from a slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(Self::from_bytes(key))
    }

    /// Borrow the raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    /// Wrap this key with a passphrase.
    pub fn encrypt_with_passphrase(&self, passphrase: &str) -> Result<EncryptedPickleKey> {
        EncryptedPickleKey::seal(self, passphrase)
    }
}

impl fmt::Debug for PickleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PickleKey([REDACTED])")
    }
}

/// A [`PickleKey`] encrypted under an Argon2id passphrase key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPickleKey {
    /// Argon2id salt (base64).
    pub salt: String,
    /// AES-GCM nonce (base64).
    pub nonce: String,
    /// Encrypted key bytes (base64).
    pub ciphertext: String,
}

impl EncryptedPickleKey {
    /// Encrypt `key` with a key derived from `passphrase`.
    pub fn seal(key: &PickleKey, passphrase: &str) -> Result<Self> {
        let salt = random_bytes::<PASSPHRASE_SALT_LEN>()?;
        let nonce = random_bytes::<NONCE_LEN>()?;
        let cipher = passphrase_cipher(passphrase, &salt)?;

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), key.as_bytes().as_slice())
            .map_err(|e| CryptoError::InvalidKey(format!("Pickle key encryption failed: {e}")))?;

        Ok(Self {
            salt: STANDARD.encode(salt),
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
        })
    }

    /// Recover the pickle key.
    ///
    /// Fails with [`CryptoError::Passphrase`] when the passphrase is wrong.
    pub fn unseal(&self, passphrase: &str) -> Result<PickleKey> {
        let salt = decode_field("salt", &self.salt)?;
        let nonce = decode_field("nonce", &self.nonce)?;
        let ciphertext = decode_field("ciphertext", &self.ciphertext)?;
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::Malformed("nonce has the wrong length".to_owned()));
        }

        let cipher = passphrase_cipher(passphrase, &salt)?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
                .map_err(|_| CryptoError::Passphrase)?,
        );
        PickleKey::from_slice(&plaintext)
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|e| CryptoError::Malformed(format!("{name}: {e}")))
}

fn passphrase_cipher(passphrase: &str, salt: &[u8]) -> Result<Aes256Gcm> {
    let mut derived = Zeroizing::new([0u8; 32]);
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut *derived)
        .map_err(|e| CryptoError::InvalidKey(format!("Passphrase key derivation failed: {e}")))?;

    Aes256Gcm::new_from_slice(&*derived)
        .map_err(|e| CryptoError::InvalidKey(format!("Invalid derived key: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passphrase_roundtrip() {
        let key = PickleKey::new().unwrap();
        let sealed = key.encrypt_with_passphrase("correct horse").unwrap();

        let unsealed = sealed.unseal("correct horse").unwrap();
        assert_eq!(unsealed.as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let key = PickleKey::new().unwrap();
        let sealed = key.encrypt_with_passphrase("correct horse").unwrap();

        let result = sealed.unseal("battery staple");
        assert!(matches!(result, Err(CryptoError::Passphrase)));
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = PickleKey::from_bytes([7u8; 32]);
        assert_eq!(format!("{key:?}"), "PickleKey([REDACTED])");
    }
}
