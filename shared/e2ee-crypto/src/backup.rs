//! Secret Bundles and Backup Keys
//!
//! A [`SecretBundle`] is the versioned, authenticated envelope
//! `{version, algorithm, ciphertext, mac}` used to hand private key material
//! to an escrow or backup collaborator. A [`BackupKey`] is the symmetric key
//! protecting server-side key backups, shown to users as a recovery key.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{random_bytes, CryptoError, PickleKey, Result};

/// Current secret bundle format version.
pub const SECRET_BUNDLE_VERSION: u32 = 1;

/// Algorithm identifier of the current secret bundle format.
pub const SECRET_BUNDLE_ALGORITHM: &str = "m.secret_bundle.v1.aes-gcm-hmac-sha2";

const BUNDLE_KDF_INFO: &[u8] = b"e2ee-crypto:secret_bundle:v1";
const NONCE_LEN: usize = 12;

const RECOVERY_KEY_PREFIX: [u8; 2] = [0x8B, 0x01];
const RECOVERY_KEY_LEN: usize = RECOVERY_KEY_PREFIX.len() + 32 + 1;

/// Encrypted, authenticated secret payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretBundle {
    /// Format version.
    pub version: u32,
    /// Algorithm identifier.
    pub algorithm: String,
    /// `nonce || ciphertext` (base64).
    pub ciphertext: String,
    /// HMAC-SHA256 over version, algorithm and ciphertext (base64).
    pub mac: String,
}

struct BundleKeys {
    encryption: Zeroizing<[u8; 32]>,
    mac: Zeroizing<[u8; 32]>,
}

impl BundleKeys {
    fn derive(key: &PickleKey) -> Result<Self> {
        let hkdf = Hkdf::<Sha256>::new(None, key.as_bytes());
        let mut okm = Zeroizing::new([0u8; 64]);
        hkdf.expand(BUNDLE_KDF_INFO, &mut *okm)
            .map_err(|e| CryptoError::InvalidKey(format!("Bundle key derivation failed: {e}")))?;

        let mut encryption = Zeroizing::new([0u8; 32]);
        let mut mac = Zeroizing::new([0u8; 32]);
        encryption.copy_from_slice(&okm[..32]);
        mac.copy_from_slice(&okm[32..]);
        Ok(Self { encryption, mac })
    }

    fn mac(&self, version: u32, algorithm: &str, ciphertext: &[u8]) -> Hmac<Sha256> {
        let mut mac = match <Hmac<Sha256> as Mac>::new_from_slice(self.mac.as_slice()) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC-SHA256 accepts keys of any length"),
        };
        mac.update(&version.to_be_bytes());
        mac.update(algorithm.as_bytes());
        mac.update(&[0u8]);
        mac.update(ciphertext);
        mac
    }
}

impl SecretBundle {
    /// Encrypt and authenticate `plaintext` under `key`.
    pub fn seal(plaintext: &[u8], key: &PickleKey) -> Result<Self> {
        let keys = BundleKeys::derive(key)?;
        let cipher = Aes256Gcm::new_from_slice(keys.encryption.as_slice())
            .map_err(|e| CryptoError::InvalidKey(format!("Invalid bundle key: {e}")))?;

        let nonce = random_bytes::<NONCE_LEN>()?;
        let encrypted = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CryptoError::InvalidKey(format!("Bundle encryption failed: {e}")))?;

        let mut ciphertext = Vec::with_capacity(NONCE_LEN + encrypted.len());
        ciphertext.extend_from_slice(&nonce);
        ciphertext.extend_from_slice(&encrypted);

        let mac = keys
            .mac(SECRET_BUNDLE_VERSION, SECRET_BUNDLE_ALGORITHM, &ciphertext)
            .finalize()
            .into_bytes();

        Ok(Self {
            version: SECRET_BUNDLE_VERSION,
            algorithm: SECRET_BUNDLE_ALGORITHM.to_owned(),
            ciphertext: STANDARD.encode(ciphertext),
            mac: STANDARD.encode(mac),
        })
    }

    /// Verify and decrypt the bundle.
    ///
    /// The MAC is checked before any decryption is attempted.
    pub fn open(&self, key: &PickleKey) -> Result<Zeroizing<Vec<u8>>> {
        if self.version != SECRET_BUNDLE_VERSION {
            return Err(CryptoError::UnsupportedVersion(self.version));
        }
        if self.algorithm != SECRET_BUNDLE_ALGORITHM {
            return Err(CryptoError::UnsupportedAlgorithm(self.algorithm.clone()));
        }

        let ciphertext = STANDARD
            .decode(&self.ciphertext)
            .map_err(|e| CryptoError::Malformed(format!("ciphertext: {e}")))?;
        let tag = STANDARD
            .decode(&self.mac)
            .map_err(|e| CryptoError::Malformed(format!("mac: {e}")))?;

        let keys = BundleKeys::derive(key)?;
        keys.mac(self.version, &self.algorithm, &ciphertext)
            .verify_slice(&tag)
            .map_err(|_| CryptoError::InvalidMac)?;

        if ciphertext.len() <= NONCE_LEN {
            return Err(CryptoError::Malformed("ciphertext is too short".to_owned()));
        }
        let (nonce, encrypted) = ciphertext.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new_from_slice(keys.encryption.as_slice())
            .map_err(|e| CryptoError::InvalidKey(format!("Invalid bundle key: {e}")))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), encrypted)
            .map_err(|_| CryptoError::DecryptionFailed("Bundle decryption failed".to_owned()))?;

        Ok(Zeroizing::new(plaintext))
    }
}

/// Symmetric key protecting server-side room key backups.
#[derive(Clone)]
pub struct BackupKey {
    key: Zeroizing<[u8; 32]>,
}

impl BackupKey {
    /// Generate a fresh backup key.
    pub fn new() -> Result<Self> {
        Ok(Self {
            key: Zeroizing::new(random_bytes::<32>()?),
        })
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    /// Export as base64.
    #[must_use]
    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(STANDARD.encode(self.key.as_slice()))
    }

    /// Import from base64.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let decoded = Zeroizing::new(
            STANDARD
                .decode(encoded)
                .map_err(|e| CryptoError::InvalidKey(format!("Invalid backup key: {e}")))?,
        );
        Self::from_slice(&decoded)
    }

    fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("backup key must be 32 bytes".to_owned()))?;
        Ok(Self {
            key: Zeroizing::new(key),
        })
    }

    /// Encode as a human-readable recovery key.
    ///
    /// Base58 over `prefix || key || parity`, split into groups of four.
    #[must_use]
    pub fn to_recovery_key(&self) -> Zeroizing<String> {
        let mut bytes = Zeroizing::new(Vec::with_capacity(RECOVERY_KEY_LEN));
        bytes.extend_from_slice(&RECOVERY_KEY_PREFIX);
        bytes.extend_from_slice(self.key.as_slice());
        let parity = bytes.iter().fold(0u8, |acc, b| acc ^ b);
        bytes.push(parity);

        let encoded = Zeroizing::new(bs58::encode(bytes.as_slice()).into_string());
        let grouped: Vec<String> = encoded
            .as_bytes()
            .chunks(4)
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect();
        Zeroizing::new(grouped.join(" "))
    }

    /// Decode a recovery key produced by [`Self::to_recovery_key`].
    pub fn from_recovery_key(recovery_key: &str) -> Result<Self> {
        let compact: Zeroizing<String> = Zeroizing::new(
            recovery_key
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect(),
        );
        let bytes = Zeroizing::new(
            bs58::decode(compact.as_str())
                .into_vec()
                .map_err(|e| CryptoError::InvalidRecoveryKey(e.to_string()))?,
        );

        if bytes.len() != RECOVERY_KEY_LEN {
            return Err(CryptoError::InvalidRecoveryKey(format!(
                "expected {RECOVERY_KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        if bytes[..2] != RECOVERY_KEY_PREFIX {
            return Err(CryptoError::InvalidRecoveryKey("wrong prefix".to_owned()));
        }
        if bytes.iter().fold(0u8, |acc, b| acc ^ b) != 0 {
            return Err(CryptoError::InvalidRecoveryKey("parity check failed".to_owned()));
        }

        Self::from_slice(&bytes[2..RECOVERY_KEY_LEN - 1])
    }
}

impl fmt::Debug for BackupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BackupKey([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_roundtrip() {
        let key = PickleKey::from_bytes([5u8; 32]);
        let bundle = SecretBundle::seal(b"{\"secret\":true}", &key).unwrap();

        assert_eq!(bundle.version, SECRET_BUNDLE_VERSION);
        let opened = bundle.open(&key).unwrap();
        assert_eq!(opened.as_slice(), b"{\"secret\":true}");
    }

    #[test]
    fn test_bundle_wrong_key_fails_mac() {
        let bundle = SecretBundle::seal(b"secret", &PickleKey::from_bytes([5u8; 32])).unwrap();
        let result = bundle.open(&PickleKey::from_bytes([6u8; 32]));
        assert!(matches!(result, Err(CryptoError::InvalidMac)));
    }

    #[test]
    fn test_bundle_rejects_unknown_version_and_algorithm() {
        let key = PickleKey::from_bytes([5u8; 32]);
        let mut bundle = SecretBundle::seal(b"secret", &key).unwrap();

        bundle.version = 2;
        assert!(matches!(bundle.open(&key), Err(CryptoError::UnsupportedVersion(2))));

        bundle.version = SECRET_BUNDLE_VERSION;
        bundle.algorithm = "m.other".to_owned();
        assert!(matches!(bundle.open(&key), Err(CryptoError::UnsupportedAlgorithm(_))));
    }

    #[test]
    fn test_recovery_key_roundtrip() {
        let key = BackupKey::new().unwrap();
        let recovery = key.to_recovery_key();

        assert!(recovery.contains(' '));
        let decoded = BackupKey::from_recovery_key(&recovery).unwrap();
        assert_eq!(decoded.as_bytes(), key.as_bytes());
    }

    #[test]
    fn test_recovery_key_detects_typos() {
        let key = BackupKey::from_bytes_for_test([0x11; 32]);
        let recovery = key.to_recovery_key();
        let mut corrupted: Vec<char> = recovery.chars().collect();
        let last = corrupted.len() - 1;
        corrupted[last] = if corrupted[last] == '2' { '3' } else { '2' };
        let corrupted: String = corrupted.into_iter().collect();

        assert!(BackupKey::from_recovery_key(&corrupted).is_err());
    }

    impl BackupKey {
        fn from_bytes_for_test(bytes: [u8; 32]) -> Self {
            Self {
                key: Zeroizing::new(bytes),
            }
        }
    }
}
