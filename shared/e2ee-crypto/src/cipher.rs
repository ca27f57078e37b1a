//! Store Cipher
//!
//! Encrypts record blobs and derives opaque lookup keys for the key store,
//! so neither secrets nor the communication graph appear on disk in plaintext.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{random_bytes, CryptoError, PickleKey, Result};

const NONCE_LEN: usize = 12;

/// Record encryption derived from a [`PickleKey`].
#[derive(Clone)]
pub struct StoreCipher {
    value_key: Zeroizing<[u8; 32]>,
    hash_key: Zeroizing<[u8; 32]>,
}

impl StoreCipher {
    const VALUE_ENCRYPTION_DOMAIN: &'static [u8] = b"e2ee-client:value_encryption:v1";
    const KEYED_HASH_DOMAIN: &'static [u8] = b"e2ee-client:keyed_hash:v1";

    /// Derive the cipher from a pickle key.
    #[must_use]
    pub fn new(pickle_key: &PickleKey) -> Self {
        Self {
            value_key: derive_subkey(pickle_key.as_bytes(), Self::VALUE_ENCRYPTION_DOMAIN),
            hash_key: derive_subkey(pickle_key.as_bytes(), Self::KEYED_HASH_DOMAIN),
        }
    }

    /// Encrypt a value as `nonce || ciphertext`.
    pub fn encrypt_value(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher()?;
        let nonce_bytes = random_bytes::<NONCE_LEN>()?;

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| CryptoError::InvalidKey(format!("Value encryption failed: {e}")))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(combined)
    }

    /// Decrypt a value produced by [`Self::encrypt_value`].
    pub fn decrypt_value(&self, encrypted: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if encrypted.len() <= NONCE_LEN {
            return Err(CryptoError::DecryptionFailed(
                "Encrypted value is too short".to_owned(),
            ));
        }

        let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed("Value authentication failed".to_owned()))?;
        Ok(Zeroizing::new(plaintext))
    }

    /// Derive a deterministic keyed hash of a lookup value.
    #[must_use]
    pub fn hash_key(&self, domain: &str, value: &str) -> String {
        let mut mac = hmac_sha256(self.hash_key.as_slice());
        mac.update(domain.as_bytes());
        mac.update(&[0u8]);
        mac.update(value.as_bytes());
        STANDARD.encode(mac.finalize().into_bytes())
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(self.value_key.as_slice())
            .map_err(|e| CryptoError::InvalidKey(format!("Invalid value key: {e}")))
    }
}

fn hmac_sha256(key: &[u8]) -> Hmac<Sha256> {
    match <Hmac<Sha256> as Mac>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC-SHA256 accepts keys of any length"),
    }
}

fn derive_subkey(key: &[u8; 32], domain: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut mac = hmac_sha256(key);
    mac.update(domain);
    let mut subkey = Zeroizing::new([0u8; 32]);
    subkey.copy_from_slice(&mac.finalize().into_bytes());
    subkey
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_roundtrip() {
        let cipher = StoreCipher::new(&PickleKey::from_bytes([1u8; 32]));
        let encrypted = cipher.encrypt_value(b"secret session").unwrap();

        assert_ne!(&encrypted[NONCE_LEN..], b"secret session");
        let decrypted = cipher.decrypt_value(&encrypted).unwrap();
        assert_eq!(decrypted.as_slice(), b"secret session");
    }

    #[test]
    fn test_wrong_key_fails() {
        let cipher = StoreCipher::new(&PickleKey::from_bytes([1u8; 32]));
        let other = StoreCipher::new(&PickleKey::from_bytes([2u8; 32]));

        let encrypted = cipher.encrypt_value(b"secret").unwrap();
        assert!(other.decrypt_value(&encrypted).is_err());
    }

    #[test]
    fn test_hash_key_is_deterministic_and_domain_separated() {
        let cipher = StoreCipher::new(&PickleKey::from_bytes([1u8; 32]));

        let a = cipher.hash_key("session", "curve");
        assert_eq!(a, cipher.hash_key("session", "curve"));
        assert_ne!(a, cipher.hash_key("device", "curve"));
        assert_ne!(a, "curve");
    }
}
