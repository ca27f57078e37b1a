//! Key Store
//!
//! The [`KeyStore`] trait is the persistence contract for all cryptographic
//! state: the olm account, tracked devices, cross-signing identities,
//! inbound and outbound group sessions and the backup key. Every mutation
//! goes through [`KeyStore::save_changes`], which applies a [`Changes`]
//! bundle all-or-nothing.
//!
//! [`EncryptedStore`] implements the contract over any [`RecordBackend`],
//! encrypting values and hashing lookup keys with the pickle key before
//! they reach the backend.

pub mod backend;
mod encrypted;
pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use e2ee_common::{DeviceId, RoomId, UserId};
use e2ee_crypto::{BackupKey, CryptoError, OlmAccount, PickleKey, SecretBundle};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use zeroize::Zeroize;

use crate::identities::{CrossSigningKeyExport, Device, PrivateCrossSigningIdentity, UserIdentity};
use crate::session::{InboundSession, OutboundSession, SharedInboundSession, SharedOutboundSession};

pub use backend::{BackendError, RecordBackend, RecordKey, RecordType, StoredRecord};
pub use encrypted::{EncryptedStore, MemoryStore, SqliteStore};
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// Key store errors.
#[derive(Debug, Error)]
pub enum CryptoStoreError {
    /// A stored record could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend failed.
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// A record could not be encrypted, decrypted or unpickled.
    #[error("Encryption error: {0}")]
    Encryption(#[from] CryptoError),

    /// The store was opened with a different pickle key than it was created with.
    #[error("The pickle key does not match this store")]
    WrongPickleKey,

    /// A changeset from an older sync batch arrived after a newer one committed.
    #[error("Stale changeset for sync batch {attempted}, batch {committed} already committed")]
    ConsistencyViolation {
        /// Last committed batch token.
        committed: u64,
        /// Token of the rejected changeset.
        attempted: u64,
    },
}

/// Key store result type.
pub type Result<T> = std::result::Result<T, CryptoStoreError>;

/// Errors importing a secret bundle.
#[derive(Debug, Error)]
pub enum SecretImportError {
    /// The bundle uses a format version we cannot read.
    #[error("Unsupported secret bundle version {0}")]
    UnsupportedVersion(u32),

    /// The bundle uses an unknown algorithm.
    #[error("Unsupported secret bundle algorithm {0}")]
    UnsupportedAlgorithm(String),

    /// Wrong key, or the bundle was tampered with.
    #[error("Secret bundle MAC check failed")]
    InvalidMac,

    /// The bundle or its payload could not be parsed.
    #[error("Malformed secret bundle: {0}")]
    Malformed(String),

    /// The imported private keys do not belong to the stored public identity.
    #[error("Imported cross-signing keys do not match the known public identity")]
    MismatchedPublicKeys,

    /// Invalid key material inside the payload.
    #[error("Invalid key material: {0}")]
    Key(CryptoError),

    /// Persisting the import failed.
    #[error("Store error: {0}")]
    Store(#[from] CryptoStoreError),
}

impl From<CryptoError> for SecretImportError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::UnsupportedVersion(version) => Self::UnsupportedVersion(version),
            CryptoError::UnsupportedAlgorithm(algorithm) => Self::UnsupportedAlgorithm(algorithm),
            CryptoError::InvalidMac => Self::InvalidMac,
            CryptoError::Malformed(reason) => Self::Malformed(reason),
            other => Self::Key(other),
        }
    }
}

/// Device mutations in a changeset.
#[derive(Debug, Clone, Default)]
pub struct DeviceChanges {
    /// Devices seen for the first time.
    pub new: Vec<Device>,
    /// Devices whose keys, trust or metadata changed.
    pub changed: Vec<Device>,
    /// Devices their owner no longer lists, already flagged deleted.
    pub deleted: Vec<Device>,
}

impl DeviceChanges {
    /// Whether nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }

    fn len(&self) -> usize {
        self.new.len() + self.changed.len() + self.deleted.len()
    }
}

/// Cross-signing identity mutations in a changeset.
#[derive(Debug, Clone, Default)]
pub struct IdentityChanges {
    /// Identities seen for the first time.
    pub new: Vec<UserIdentity>,
    /// Identities whose keys or signatures changed.
    pub changed: Vec<UserIdentity>,
}

impl IdentityChanges {
    /// Whether nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty()
    }

    fn len(&self) -> usize {
        self.new.len() + self.changed.len()
    }
}

/// An atomic bundle of store mutations.
///
/// Live objects are pickled when the store commits, so sessions must not be
/// locked by the caller while [`KeyStore::save_changes`] runs.
#[derive(Debug, Default)]
pub struct Changes {
    /// Our olm account.
    pub account: Option<Arc<Mutex<OlmAccount>>>,
    /// Our private cross-signing keys.
    pub private_identity: Option<PrivateCrossSigningIdentity>,
    /// Room key backup key.
    pub backup_key: Option<BackupKey>,
    /// New or advanced inbound group sessions.
    pub inbound_sessions: Vec<SharedInboundSession>,
    /// New or advanced outbound group sessions.
    pub outbound_sessions: Vec<SharedOutboundSession>,
    /// Device mutations.
    pub devices: DeviceChanges,
    /// Identity mutations.
    pub identities: IdentityChanges,
    /// Sync batch this changeset belongs to; `None` for local mutations.
    pub sync_token: Option<u64>,
}

impl Changes {
    /// Whether the changeset carries no records. The sync token alone does
    /// not count.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.account.is_none()
            && self.private_identity.is_none()
            && self.backup_key.is_none()
            && self.inbound_sessions.is_empty()
            && self.outbound_sessions.is_empty()
            && self.devices.is_empty()
            && self.identities.is_empty()
    }

    /// Number of records the changeset writes, excluding the sync token.
    #[must_use]
    pub fn record_count(&self) -> usize {
        usize::from(self.account.is_some())
            + usize::from(self.private_identity.is_some())
            + usize::from(self.backup_key.is_some())
            + self.inbound_sessions.len()
            + self.outbound_sessions.len()
            + self.devices.len()
            + self.identities.len()
    }
}

/// Private material carried inside a [`SecretBundle`].
#[derive(Serialize, Deserialize)]
pub struct SecretsPayload {
    /// Owner of the secrets.
    pub user_id: UserId,
    /// Private cross-signing keys.
    #[serde(default)]
    pub cross_signing: Option<CrossSigningKeyExport>,
    /// Backup key (base64).
    #[serde(default)]
    pub backup_key: Option<String>,
}

impl Drop for SecretsPayload {
    fn drop(&mut self) {
        if let Some(key) = self.backup_key.as_mut() {
            key.zeroize();
        }
    }
}

/// Persistence contract for cryptographic state.
///
/// Secret-bearing records are encrypted at rest; reads decrypt
/// transparently. [`Self::save_changes`] is transactional: no reader ever
/// observes part of a changeset.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Load our olm account, if one was saved.
    async fn load_account(&self) -> Result<Option<OlmAccount>>;

    /// Apply a changeset all-or-nothing.
    ///
    /// # Errors
    ///
    /// [`CryptoStoreError::ConsistencyViolation`] if the changeset belongs
    /// to a sync batch older than the last committed one; backend,
    /// serialization or encryption errors otherwise. Nothing is written on
    /// error.
    async fn save_changes(&self, changes: Changes) -> Result<()>;

    /// Look up an inbound group session.
    async fn get_session(&self, sender_key: &str, session_id: &str) -> Result<Option<InboundSession>>;

    /// Every stored inbound group session.
    async fn get_inbound_sessions(&self) -> Result<Vec<InboundSession>>;

    /// The outbound group session for a room.
    async fn get_outbound_session(&self, room_id: &RoomId) -> Result<Option<OutboundSession>>;

    /// Look up a device.
    async fn get_device(&self, user_id: &UserId, device_id: &DeviceId) -> Result<Option<Device>>;

    /// Every device of a user, deleted ones included.
    async fn get_user_devices(&self, user_id: &UserId) -> Result<BTreeMap<DeviceId, Device>>;

    /// A user's public cross-signing identity.
    async fn get_user_identity(&self, user_id: &UserId) -> Result<Option<UserIdentity>>;

    /// Our private cross-signing keys.
    async fn load_private_identity(&self) -> Result<Option<PrivateCrossSigningIdentity>>;

    /// The room key backup key.
    async fn load_backup_key(&self) -> Result<Option<BackupKey>>;

    /// Token of the last committed sync changeset.
    async fn last_sync_token(&self) -> Result<Option<u64>>;

    /// Export our private cross-signing keys, if we have any.
    async fn export_cross_signing_keys(&self) -> Result<Option<CrossSigningKeyExport>> {
        Ok(self
            .load_private_identity()
            .await?
            .map(|identity| identity.export()))
    }

    /// Seal our private cross-signing keys and backup key into a
    /// [`SecretBundle`] under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if loading from the store or sealing fails.
    async fn export_secrets(&self, user_id: &UserId, key: &PickleKey) -> Result<SecretBundle> {
        let payload = SecretsPayload {
            user_id: user_id.clone(),
            cross_signing: self.export_cross_signing_keys().await?,
            backup_key: self
                .load_backup_key()
                .await?
                .map(|key| key.to_base64().to_string()),
        };
        let plaintext = zeroize::Zeroizing::new(serde_json::to_vec(&payload)?);
        Ok(SecretBundle::seal(&plaintext, key)?)
    }

    /// Verify, decrypt and persist a [`SecretBundle`].
    ///
    /// Everything is validated before the single write; on any error the
    /// store is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`SecretImportError`] describing why the bundle was refused.
    async fn import_secrets(
        &self,
        bundle: &SecretBundle,
        key: &PickleKey,
    ) -> std::result::Result<(), SecretImportError> {
        let plaintext = bundle.open(key)?;
        let payload: SecretsPayload = serde_json::from_slice(&plaintext)
            .map_err(|e| SecretImportError::Malformed(e.to_string()))?;

        let mut changes = Changes::default();

        if let Some(export) = payload.cross_signing.as_ref() {
            let private = PrivateCrossSigningIdentity::from_export(payload.user_id.clone(), export)
                .map_err(SecretImportError::Key)?;

            if let Some(existing) = self.load_private_identity().await? {
                if existing.user_id() != private.user_id() {
                    return Err(SecretImportError::MismatchedPublicKeys);
                }
            }
            if let Some(public) = self.get_user_identity(&payload.user_id).await? {
                if !private.matches(&public) {
                    return Err(SecretImportError::MismatchedPublicKeys);
                }
            } else {
                changes
                    .identities
                    .new
                    .push(private.to_public_identity().map_err(SecretImportError::Key)?);
            }
            changes.private_identity = Some(private);
        }

        if let Some(encoded) = payload.backup_key.as_deref() {
            changes.backup_key = Some(BackupKey::from_base64(encoded).map_err(SecretImportError::Key)?);
        }

        if changes.is_empty() {
            return Ok(());
        }
        self.save_changes(changes).await?;
        Ok(())
    }
}
