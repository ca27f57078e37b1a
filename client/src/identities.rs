//! Devices and Cross-Signing Identities
//!
//! Public device keys as uploaded by their owners, the locally tracked
//! [`Device`] record, and the master/self-signing/user-signing key triplet
//! that establishes trust chains.

use std::collections::BTreeMap;

use e2ee_common::{DeviceId, UserId, MEGOLM_V1_AES_SHA2};
use e2ee_crypto::{verify_json_signature, CryptoError, OlmAccount, SigningKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Signatures keyed by signing user, then by `ed25519:<key id>`.
pub type Signatures = BTreeMap<UserId, BTreeMap<String, String>>;

/// Olm algorithm advertised by device uploads.
pub const OLM_V1_CURVE25519_AES_SHA2: &str = "m.olm.v1.curve25519-aes-sha2";

fn to_signed_json<T: Serialize>(value: &T) -> Result<Value, CryptoError> {
    Ok(serde_json::to_value(value)?)
}

fn signature_of<'a>(signatures: &'a Signatures, user: &UserId, key_id: &str) -> Option<&'a str> {
    signatures
        .get(user)
        .and_then(|by_key| by_key.get(key_id))
        .map(String::as_str)
}

/// Unsigned, server-supplied device metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedDeviceInfo {
    /// Human readable device name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_display_name: Option<String>,
}

/// Device keys as uploaded by the owning device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKeys {
    /// Owning user.
    pub user_id: UserId,
    /// Device id.
    pub device_id: DeviceId,
    /// Supported encryption algorithms.
    #[serde(default)]
    pub algorithms: Vec<String>,
    /// Public keys keyed by `<algorithm>:<device_id>`.
    pub keys: BTreeMap<String, String>,
    /// Signatures over the canonical form of this object.
    #[serde(default)]
    pub signatures: Signatures,
    /// Unsigned metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<UnsignedDeviceInfo>,
}

impl DeviceKeys {
    /// Build and self-sign the key upload of our own device.
    ///
    /// # Errors
    ///
    /// Returns an error if the keys cannot be serialized for signing.
    pub fn for_account(
        user_id: UserId,
        device_id: DeviceId,
        account: &OlmAccount,
    ) -> Result<Self, CryptoError> {
        let identity = account.identity_keys();
        let mut keys = BTreeMap::new();
        keys.insert(format!("curve25519:{device_id}"), identity.curve25519);
        keys.insert(format!("ed25519:{device_id}"), identity.ed25519);

        let mut device_keys = Self {
            user_id,
            device_id,
            algorithms: vec![
                OLM_V1_CURVE25519_AES_SHA2.to_owned(),
                MEGOLM_V1_AES_SHA2.to_owned(),
            ],
            keys,
            signatures: Signatures::new(),
            unsigned: None,
        };

        let canonical = e2ee_crypto::canonical_json(&device_keys.to_json()?);
        let signature = account.sign(&canonical);
        device_keys.add_signature(
            device_keys.user_id.clone(),
            format!("ed25519:{}", device_keys.device_id),
            signature,
        );
        Ok(device_keys)
    }

    /// Curve25519 identity key.
    #[must_use]
    pub fn curve25519_key(&self) -> Option<&str> {
        self.keys
            .get(&format!("curve25519:{}", self.device_id))
            .map(String::as_str)
    }

    /// Ed25519 signing key.
    #[must_use]
    pub fn ed25519_key(&self) -> Option<&str> {
        self.keys
            .get(&format!("ed25519:{}", self.device_id))
            .map(String::as_str)
    }

    /// The JSON form that signatures cover.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Serialization`] if the keys do not serialize.
    pub fn to_json(&self) -> Result<Value, CryptoError> {
        to_signed_json(self)
    }

    /// Attach a signature.
    pub fn add_signature(&mut self, signer: UserId, key_id: String, signature: String) {
        self.signatures
            .entry(signer)
            .or_default()
            .insert(key_id, signature);
    }

    /// Check the device's signature over its own keys.
    pub fn verify_self_signature(&self) -> Result<(), CryptoError> {
        let ed25519 = self
            .ed25519_key()
            .ok_or_else(|| CryptoError::InvalidKey("device has no ed25519 key".to_owned()))?;
        if self.curve25519_key().is_none() {
            return Err(CryptoError::InvalidKey(
                "device has no curve25519 key".to_owned(),
            ));
        }
        let signature = signature_of(
            &self.signatures,
            &self.user_id,
            &format!("ed25519:{}", self.device_id),
        )
        .ok_or_else(|| CryptoError::InvalidSignature("missing self signature".to_owned()))?;

        verify_json_signature(ed25519, &self.to_json()?, signature)
    }

    /// Whether `signer` has a valid signature over these keys.
    #[must_use]
    pub fn is_signed_by(&self, signer: &CrossSigningKey) -> bool {
        let Some(sig) = signature_of(&self.signatures, &signer.user_id, &signer.key_id()) else {
            return false;
        };
        self.to_json()
            .and_then(|json| verify_json_signature(&signer.public_key, &json, sig))
            .is_ok()
    }
}

/// Local trust decision about a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalTrust {
    /// No decision was made.
    #[default]
    Unset,
    /// Verified out of band by the local user.
    Verified,
    /// Explicitly distrusted; overrides cross-signing.
    BlackListed,
    /// Warnings about this device are silenced, but it is not trusted.
    Ignored,
}

/// Identity keys a device used before a re-upload rotated them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviousDeviceKeys {
    /// Old Curve25519 key.
    pub curve25519: String,
    /// Old Ed25519 key.
    pub ed25519: String,
    /// When the rotation was observed (unix millis).
    pub rotated_at: i64,
}

/// A device as tracked by the key store.
///
/// Devices are never removed; devices no longer listed by their owner are
/// marked deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// The device's current signed keys.
    pub keys: DeviceKeys,
    /// Local trust decision.
    #[serde(default)]
    pub local_trust: LocalTrust,
    /// The owner no longer lists this device.
    #[serde(default)]
    pub deleted: bool,
    /// Keys replaced by re-uploads, oldest first.
    #[serde(default)]
    pub previous_keys: Vec<PreviousDeviceKeys>,
    /// First time we saw the device (unix millis).
    pub first_seen_ts: i64,
}

impl Device {
    /// Start tracking a device.
    #[must_use]
    pub fn new(keys: DeviceKeys) -> Self {
        Self {
            keys,
            local_trust: LocalTrust::Unset,
            deleted: false,
            previous_keys: Vec::new(),
            first_seen_ts: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Owning user.
    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        &self.keys.user_id
    }

    /// Device id.
    #[must_use]
    pub const fn device_id(&self) -> &DeviceId {
        &self.keys.device_id
    }

    /// Current Curve25519 key.
    #[must_use]
    pub fn curve25519_key(&self) -> Option<&str> {
        self.keys.curve25519_key()
    }

    /// Current Ed25519 key.
    #[must_use]
    pub fn ed25519_key(&self) -> Option<&str> {
        self.keys.ed25519_key()
    }

    /// Display name from the unsigned section.
    #[must_use]
    pub fn display_name(&self) -> Option<&str> {
        self.keys
            .unsigned
            .as_ref()
            .and_then(|u| u.device_display_name.as_deref())
    }

    /// Whether `curve25519` is one of the device's rotated-out keys.
    #[must_use]
    pub fn had_curve25519_key(&self, curve25519: &str) -> bool {
        self.previous_keys.iter().any(|k| k.curve25519 == curve25519)
    }

    /// Whether `ed25519` is one of the device's rotated-out keys.
    #[must_use]
    pub fn had_ed25519_key(&self, ed25519: &str) -> bool {
        self.previous_keys.iter().any(|k| k.ed25519 == ed25519)
    }

    /// Apply a re-upload.
    ///
    /// When the identity keys differ, the old pair moves to
    /// `previous_keys` and local trust resets. Returns whether anything
    /// changed.
    pub fn update(&mut self, keys: DeviceKeys) -> bool {
        if self.keys == keys && !self.deleted {
            return false;
        }

        let rotated = self.curve25519_key() != keys.curve25519_key()
            || self.ed25519_key() != keys.ed25519_key();
        if rotated {
            let old_keys = self
                .curve25519_key()
                .zip(self.ed25519_key())
                .map(|(curve, ed)| (curve.to_owned(), ed.to_owned()));
            if let Some((curve25519, ed25519)) = old_keys {
                self.previous_keys.push(PreviousDeviceKeys {
                    curve25519,
                    ed25519,
                    rotated_at: chrono::Utc::now().timestamp_millis(),
                });
            }
            self.local_trust = LocalTrust::Unset;
        }

        self.keys = keys;
        self.deleted = false;
        true
    }
}

/// What a cross-signing key is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyUsage {
    /// Root of a user's identity.
    Master,
    /// Signs the user's own devices.
    SelfSigning,
    /// Signs other users' master keys.
    UserSigning,
}

/// A public cross-signing key with its signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossSigningKey {
    /// Owning user.
    pub user_id: UserId,
    /// Key usage.
    pub usage: KeyUsage,
    /// Ed25519 public key (base64).
    pub public_key: String,
    /// Signatures over the canonical form of this object.
    #[serde(default)]
    pub signatures: Signatures,
}

impl CrossSigningKey {
    /// A new unsigned key.
    #[must_use]
    pub fn new(user_id: UserId, usage: KeyUsage, public_key: String) -> Self {
        Self {
            user_id,
            usage,
            public_key,
            signatures: Signatures::new(),
        }
    }

    /// Key id used in signature maps.
    #[must_use]
    pub fn key_id(&self) -> String {
        format!("ed25519:{}", self.public_key)
    }

    /// Sign this key with `signer`, who owns `signer_key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be serialized for signing.
    pub fn sign_with(
        &mut self,
        signer_key: &CrossSigningKey,
        signer: &SigningKey,
    ) -> Result<(), CryptoError> {
        let signature = signer.sign_json(&to_signed_json(self)?);
        self.signatures
            .entry(signer_key.user_id.clone())
            .or_default()
            .insert(signer_key.key_id(), signature);
        Ok(())
    }

    /// Whether `signer` has a valid signature over this key.
    #[must_use]
    pub fn is_signed_by(&self, signer: &Self) -> bool {
        let Some(sig) = signature_of(&self.signatures, &signer.user_id, &signer.key_id()) else {
            return false;
        };
        to_signed_json(self)
            .and_then(|json| verify_json_signature(&signer.public_key, &json, sig))
            .is_ok()
    }
}

/// A user's public cross-signing identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    /// Owning user.
    pub user_id: UserId,
    /// Master key.
    pub master_key: CrossSigningKey,
    /// Self-signing key, signed by the master key.
    pub self_signing_key: CrossSigningKey,
    /// User-signing key; only known for our own identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_signing_key: Option<CrossSigningKey>,
}

impl UserIdentity {
    /// Check key usages, owners, and that sub-keys carry master signatures.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let owners_match = self.master_key.user_id == self.user_id
            && self.self_signing_key.user_id == self.user_id
            && self
                .user_signing_key
                .as_ref()
                .is_none_or(|k| k.user_id == self.user_id);
        let usages_match = self.master_key.usage == KeyUsage::Master
            && self.self_signing_key.usage == KeyUsage::SelfSigning
            && self
                .user_signing_key
                .as_ref()
                .is_none_or(|k| k.usage == KeyUsage::UserSigning);
        let signed = self.self_signing_key.is_signed_by(&self.master_key)
            && self
                .user_signing_key
                .as_ref()
                .is_none_or(|k| k.is_signed_by(&self.master_key));

        owners_match && usages_match && signed
    }

    /// Keep signatures we already added locally when the owner re-publishes
    /// the same master key.
    pub fn merge_local_signatures(&mut self, previous: &Self) {
        if self.master_key.public_key != previous.master_key.public_key {
            return;
        }
        for (user, by_key) in &previous.master_key.signatures {
            let entry = self.master_key.signatures.entry(user.clone()).or_default();
            for (key_id, signature) in by_key {
                entry
                    .entry(key_id.clone())
                    .or_insert_with(|| signature.clone());
            }
        }
    }
}

/// Private cross-signing keys in exportable form (base64).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct CrossSigningKeyExport {
    /// Master private key.
    pub master_key: String,
    /// Self-signing private key.
    pub self_signing_key: String,
    /// User-signing private key.
    pub user_signing_key: String,
}

impl std::fmt::Debug for CrossSigningKeyExport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CrossSigningKeyExport([REDACTED])")
    }
}

/// Our own private cross-signing keys.
#[derive(Clone)]
pub struct PrivateCrossSigningIdentity {
    user_id: UserId,
    master: SigningKey,
    self_signing: SigningKey,
    user_signing: SigningKey,
}

impl std::fmt::Debug for PrivateCrossSigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateCrossSigningIdentity")
            .field("user_id", &self.user_id)
            .field("master_key", &self.master.public_key())
            .finish_non_exhaustive()
    }
}

impl PrivateCrossSigningIdentity {
    /// Generate a fresh key triplet.
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            master: SigningKey::new(),
            self_signing: SigningKey::new(),
            user_signing: SigningKey::new(),
        }
    }

    /// Owning user.
    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Master public key (base64).
    #[must_use]
    pub fn master_public_key(&self) -> String {
        self.master.public_key()
    }

    /// The public identity matching these private keys, with sub-keys
    /// signed by the master key.
    ///
    /// # Errors
    ///
    /// Returns an error if a sub-key cannot be serialized for signing.
    pub fn to_public_identity(&self) -> Result<UserIdentity, CryptoError> {
        let master_key =
            CrossSigningKey::new(self.user_id.clone(), KeyUsage::Master, self.master.public_key());
        let mut self_signing_key = CrossSigningKey::new(
            self.user_id.clone(),
            KeyUsage::SelfSigning,
            self.self_signing.public_key(),
        );
        let mut user_signing_key = CrossSigningKey::new(
            self.user_id.clone(),
            KeyUsage::UserSigning,
            self.user_signing.public_key(),
        );
        self_signing_key.sign_with(&master_key, &self.master)?;
        user_signing_key.sign_with(&master_key, &self.master)?;

        Ok(UserIdentity {
            user_id: self.user_id.clone(),
            master_key,
            self_signing_key,
            user_signing_key: Some(user_signing_key),
        })
    }

    /// Whether `identity` publishes exactly our public keys.
    #[must_use]
    pub fn matches(&self, identity: &UserIdentity) -> bool {
        identity.user_id == self.user_id
            && identity.master_key.public_key == self.master.public_key()
            && identity.self_signing_key.public_key == self.self_signing.public_key()
            && identity
                .user_signing_key
                .as_ref()
                .is_none_or(|k| k.public_key == self.user_signing.public_key())
    }

    /// Sign one of our own devices with the self-signing key.
    ///
    /// # Errors
    ///
    /// Returns an error if the device keys cannot be serialized.
    pub fn sign_device(&self, device_keys: &mut DeviceKeys) -> Result<(), CryptoError> {
        let signature = self.self_signing.sign_json(&device_keys.to_json()?);
        device_keys.add_signature(
            self.user_id.clone(),
            format!("ed25519:{}", self.self_signing.public_key()),
            signature,
        );
        Ok(())
    }

    /// Sign another user's master key with our user-signing key.
    ///
    /// # Errors
    ///
    /// Returns an error if the master key cannot be serialized.
    pub fn sign_user(&self, identity: &mut UserIdentity) -> Result<(), CryptoError> {
        let signer = CrossSigningKey::new(
            self.user_id.clone(),
            KeyUsage::UserSigning,
            self.user_signing.public_key(),
        );
        identity
            .master_key
            .sign_with(&signer, &self.user_signing)
    }

    /// Export the private keys.
    #[must_use]
    pub fn export(&self) -> CrossSigningKeyExport {
        CrossSigningKeyExport {
            master_key: self.master.to_base64().to_string(),
            self_signing_key: self.self_signing.to_base64().to_string(),
            user_signing_key: self.user_signing.to_base64().to_string(),
        }
    }

    /// Rebuild from exported private keys.
    pub fn from_export(user_id: UserId, export: &CrossSigningKeyExport) -> Result<Self, CryptoError> {
        Ok(Self {
            user_id,
            master: SigningKey::from_base64(&export.master_key)?,
            self_signing: SigningKey::from_base64(&export.self_signing_key)?,
            user_signing: SigningKey::from_base64(&export.user_signing_key)?,
        })
    }
}
