//! Olm Account
//!
//! The long-term device identity: Curve25519/Ed25519 identity keys and the
//! pool of one-time keys published for session establishment.

use serde::{Deserialize, Serialize};
use vodozemac::olm::{Account, AccountPickle};

use crate::{CryptoError, PickleKey, Result};

/// Public identity keys of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeyPair {
    /// Ed25519 signing key (base64).
    pub ed25519: String,
    /// Curve25519 identity key (base64).
    pub curve25519: String,
}

/// User's Olm account containing identity keys.
pub struct OlmAccount {
    account: Account,
}

impl OlmAccount {
    /// Create a new account with fresh identity keys.
    #[must_use]
    pub fn new() -> Self {
        Self {
            account: Account::new(),
        }
    }

    /// The account's public identity keys.
    #[must_use]
    pub fn identity_keys(&self) -> IdentityKeyPair {
        let keys = self.account.identity_keys();
        IdentityKeyPair {
            ed25519: keys.ed25519.to_base64(),
            curve25519: keys.curve25519.to_base64(),
        }
    }

    /// Curve25519 identity key (base64).
    #[must_use]
    pub fn curve25519_key(&self) -> String {
        self.account.curve25519_key().to_base64()
    }

    /// Ed25519 identity key (base64).
    #[must_use]
    pub fn ed25519_key(&self) -> String {
        self.account.ed25519_key().to_base64()
    }

    /// Generate `count` new one-time keys.
    pub fn generate_one_time_keys(&mut self, count: usize) {
        self.account.generate_one_time_keys(count);
    }

    /// Unpublished one-time keys as `(key_id, public_key)` pairs, sorted by id.
    #[must_use]
    pub fn one_time_keys(&self) -> Vec<(String, String)> {
        let mut keys: Vec<(String, String)> = self
            .account
            .one_time_keys()
            .into_iter()
            .map(|(id, key)| (id.to_base64(), key.to_base64()))
            .collect();
        keys.sort();
        keys
    }

    /// Mark the current one-time keys as published.
    pub fn mark_keys_as_published(&mut self) {
        self.account.mark_keys_as_published();
    }

    /// Sign a message with the account's Ed25519 key (base64 signature).
    #[must_use]
    pub fn sign(&self, message: &str) -> String {
        self.account.sign(message).to_base64()
    }

    /// Serialize the account, encrypted with `key`.
    #[must_use]
    pub fn pickle(&self, key: &PickleKey) -> String {
        self.account.pickle().encrypt(key.as_bytes())
    }

    /// Restore an account pickled with [`Self::pickle`].
    pub fn from_pickle(pickle: &str, key: &PickleKey) -> Result<Self> {
        let pickle = AccountPickle::from_encrypted(pickle, key.as_bytes())
            .map_err(|e| CryptoError::Pickle(e.to_string()))?;
        Ok(Self {
            account: Account::from(pickle),
        })
    }
}

impl std::fmt::Debug for OlmAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OlmAccount")
            .field("curve25519_key", &self.curve25519_key())
            .finish_non_exhaustive()
    }
}

impl Default for OlmAccount {
    fn default() -> Self {
        Self::new()
    }
}
