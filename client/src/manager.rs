//! Crypto Manager
//!
//! High-level API over the key store: account and device bookkeeping,
//! cross-signing, secret and room key import/export, outgoing encryption
//! and sync processing.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use e2ee_common::{
    AmbiguityChanges, DecryptedPayload, DeviceId, EncryptedEnvelope, InvitedRoom, JoinedRoom,
    LeftRoom, RawEvent, RoomId, Rooms, SyncPayload, SyncResponse, UnreadNotificationsCount, UserId,
    MEGOLM_V1_AES_SHA2, ROOM_ENCRYPTED,
};
use e2ee_crypto::{BackupKey, CryptoError, IdentityKeyPair, OlmAccount, PickleKey, SecretBundle};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use crate::ambiguity::{AmbiguityTracker, StagedMembers};
use crate::cache::{CacheError, SessionCache};
use crate::changes::{ChangeRecorder, CommitOutcome};
use crate::config::{ClientConfig, StoreBackend};
use crate::identities::{
    CrossSigningKeyExport, Device, DeviceKeys, LocalTrust, PrivateCrossSigningIdentity,
    UserIdentity,
};
use crate::pipeline::{DecryptionPipeline, PipelineConfig};
use crate::session::{
    ExportedRoomKey, InboundSession, OutboundSession, RotationSettings, SharedOutboundSession,
};
use crate::store::{
    CryptoStoreError, DeviceChanges, KeyStore, MemoryStore, SecretImportError, SqliteStore,
};
use crate::verification::VerificationResolver;

/// One-time keys generated for a fresh account.
pub const INITIAL_ONE_TIME_KEYS: usize = 50;

/// Crypto manager errors.
#[derive(Debug, Error)]
pub enum CryptoManagerError {
    /// Key store error.
    #[error("Key store error: {0}")]
    Store(#[from] CryptoStoreError),

    /// Session cache error.
    #[error("Session cache error: {0}")]
    Cache(#[from] CacheError),

    /// Crypto error from e2ee-crypto.
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Secret or cross-signing key import refused.
    #[error("Secret import failed: {0}")]
    SecretImport(#[from] SecretImportError),

    /// Invalid identifier or event.
    #[error("Invalid input: {0}")]
    Common(#[from] e2ee_common::Error),

    /// No account has been created in this store.
    #[error("Crypto account not initialized")]
    NotInitialized,

    /// The persistent store needs a passphrase to unwrap its pickle key.
    #[error("A store passphrase is required for the sqlite backend")]
    MissingPassphrase,

    /// The operation needs our private cross-signing keys.
    #[error("Cross-signing keys have not been set up")]
    MissingCrossSigningKeys,

    /// A device or identity upload was refused.
    #[error("Invalid key upload for {user_id}: {reason}")]
    InvalidKeyUpload {
        /// Owner of the refused keys.
        user_id: UserId,
        /// Why the upload was refused.
        reason: String,
    },

    /// A room key claims a sender key its device rotated out.
    #[error("Room key from {user_id} uses the rotated-out key {sender_key}")]
    StaleDeviceKey {
        /// Claimed sender.
        user_id: UserId,
        /// The stale Curve25519 key.
        sender_key: String,
    },

    /// A room key's keys do not belong to the claimed sender's device.
    #[error("Room key keys do not match any device of {0}")]
    MismatchedSender(UserId),

    /// Device not tracked.
    #[error("Unknown device {device_id} of {user_id}")]
    DeviceNotFound {
        /// Owner.
        user_id: UserId,
        /// Device id.
        device_id: DeviceId,
    },

    /// No public identity stored for this user.
    #[error("No cross-signing identity known for {0}")]
    IdentityNotFound(UserId),
}

/// Crypto manager result type.
pub type Result<T> = std::result::Result<T, CryptoManagerError>;

/// A room key to share with room members, the content of `m.room_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyShare {
    /// Encryption algorithm.
    pub algorithm: String,
    /// Room id.
    pub room_id: RoomId,
    /// Session id.
    pub session_id: String,
    /// Session key at the current message index (base64).
    pub session_key: String,
}

/// Outcome of [`CryptoManager::import_room_keys`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomKeyImportResult {
    /// Keys that were stored.
    pub imported_count: usize,
    /// Keys offered.
    pub total_count: usize,
    /// Imported session ids by room, then sender key.
    pub keys: BTreeMap<RoomId, BTreeMap<String, BTreeSet<String>>>,
}

/// Which private cross-signing keys we hold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossSigningStatus {
    /// The master key is known and matches our published identity.
    pub has_master: bool,
    /// The self-signing key is known and matches our published identity.
    pub has_self_signing: bool,
    /// The user-signing key is known and matches our published identity.
    pub has_user_signing: bool,
}

impl CrossSigningStatus {
    /// Whether all three keys are usable.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.has_master && self.has_self_signing && self.has_user_signing
    }
}

/// Manages E2EE state for one of our devices.
pub struct CryptoManager {
    user_id: UserId,
    device_id: DeviceId,
    store: Arc<dyn KeyStore>,
    account: Arc<Mutex<OlmAccount>>,
    cache: Arc<SessionCache>,
    resolver: Arc<VerificationResolver>,
    pipeline: DecryptionPipeline,
    ambiguity: AmbiguityTracker,
    recorder: ChangeRecorder,
    outbound: Mutex<HashMap<RoomId, SharedOutboundSession>>,
    unread: DashMap<RoomId, UnreadNotificationsCount>,
    rotation: RotationSettings,
}

impl std::fmt::Debug for CryptoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoManager")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl CryptoManager {
    /// Initialize the crypto manager.
    ///
    /// Loads the olm account from `store`, or creates one with
    /// [`INITIAL_ONE_TIME_KEYS`] one-time keys and persists it together
    /// with our own device in one changeset.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    #[instrument(skip(store, config))]
    pub async fn new(
        user_id: UserId,
        device_id: DeviceId,
        store: Arc<dyn KeyStore>,
        config: PipelineConfig,
    ) -> Result<Self> {
        let (account, created) = match store.load_account().await? {
            Some(account) => (account, false),
            None => {
                let mut account = OlmAccount::new();
                account.generate_one_time_keys(INITIAL_ONE_TIME_KEYS);
                (account, true)
            }
        };
        let manager = Self::with_account(user_id, device_id, store, account, config).await?;

        let own_device_stored = manager
            .store
            .get_device(&manager.user_id, &manager.device_id)
            .await?
            .is_some();
        if created || !own_device_stored {
            let keys = manager.device_keys().await?;
            let batch = manager.recorder.begin_local();
            batch.update(|changes| {
                changes.account = Some(Arc::clone(&manager.account));
            });
            if !own_device_stored {
                batch.add_new_device(Device::new(keys));
            }
            manager.recorder.commit(batch).await?;
        }

        if created {
            info!(user_id = %manager.user_id, device_id = %manager.device_id, "Created new crypto account");
        } else {
            debug!(user_id = %manager.user_id, device_id = %manager.device_id, "Loaded crypto account");
        }
        Ok(manager)
    }

    /// Load an existing crypto manager without creating an account.
    ///
    /// # Errors
    ///
    /// [`CryptoManagerError::NotInitialized`] if the store has no account.
    pub async fn load(
        user_id: UserId,
        device_id: DeviceId,
        store: Arc<dyn KeyStore>,
        config: PipelineConfig,
    ) -> Result<Self> {
        let account = store
            .load_account()
            .await?
            .ok_or(CryptoManagerError::NotInitialized)?;
        Self::with_account(user_id, device_id, store, account, config).await
    }

    /// Open the store described by `config` and initialize a manager on it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened, e.g.
    /// [`CryptoStoreError::WrongPickleKey`] for a wrong passphrase.
    pub async fn open(user_id: UserId, device_id: DeviceId, config: &ClientConfig) -> Result<Self> {
        let store: Arc<dyn KeyStore> = match &config.store {
            StoreBackend::Memory => Arc::new(MemoryStore::in_memory(PickleKey::new()?).await?),
            StoreBackend::Sqlite(path) => {
                let passphrase = config
                    .store_passphrase
                    .as_deref()
                    .ok_or(CryptoManagerError::MissingPassphrase)?;
                Arc::new(SqliteStore::open_with_passphrase(path, passphrase).await?)
            }
        };
        Self::new(user_id, device_id, store, config.pipeline.clone()).await
    }

    async fn with_account(
        user_id: UserId,
        device_id: DeviceId,
        store: Arc<dyn KeyStore>,
        account: OlmAccount,
        config: PipelineConfig,
    ) -> Result<Self> {
        let cache = Arc::new(SessionCache::new(Arc::clone(&store)));
        let resolver = Arc::new(VerificationResolver::new(
            Arc::clone(&store),
            user_id.clone(),
            device_id.clone(),
        ));
        let pipeline = DecryptionPipeline::new(Arc::clone(&cache), Arc::clone(&resolver), config);
        let recorder = ChangeRecorder::new(Arc::clone(&store)).await?;

        Ok(Self {
            user_id,
            device_id,
            store,
            account: Arc::new(Mutex::new(account)),
            cache,
            resolver,
            pipeline,
            ambiguity: AmbiguityTracker::new(),
            recorder,
            outbound: Mutex::new(HashMap::new()),
            unread: DashMap::new(),
            rotation: RotationSettings::default(),
        })
    }

    /// Override when outbound sessions are replaced.
    #[must_use]
    pub fn with_rotation_settings(mut self, rotation: RotationSettings) -> Self {
        self.rotation = rotation;
        self
    }

    /// Our user id.
    #[must_use]
    pub const fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Our device id.
    #[must_use]
    pub const fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The key store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn KeyStore> {
        &self.store
    }

    /// The session cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    /// The verification resolver.
    #[must_use]
    pub fn resolver(&self) -> &Arc<VerificationResolver> {
        &self.resolver
    }

    // =========================================================================
    // Account
    // =========================================================================

    /// Our Curve25519 and Ed25519 identity keys.
    pub async fn identity_keys(&self) -> IdentityKeyPair {
        self.account.lock().await.identity_keys()
    }

    /// Our signed device key upload, cross-signed when we have
    /// cross-signing keys.
    ///
    /// # Errors
    ///
    /// Returns an error if the private identity cannot be loaded or the
    /// keys cannot be signed.
    pub async fn device_keys(&self) -> Result<DeviceKeys> {
        let mut keys = {
            let account = self.account.lock().await;
            DeviceKeys::for_account(self.user_id.clone(), self.device_id.clone(), &account)?
        };
        if let Some(private) = self.store.load_private_identity().await? {
            private.sign_device(&mut keys)?;
        }
        Ok(keys)
    }

    /// Unpublished one-time keys as `(key_id, public_key)`.
    pub async fn one_time_keys(&self) -> Vec<(String, String)> {
        self.account.lock().await.one_time_keys()
    }

    /// Generate `count` new one-time keys and persist the account.
    ///
    /// # Errors
    ///
    /// Returns an error if the account cannot be saved.
    pub async fn generate_one_time_keys(&self, count: usize) -> Result<()> {
        self.account.lock().await.generate_one_time_keys(count);
        self.save_account().await
    }

    /// Mark one-time keys as uploaded and persist the account.
    ///
    /// # Errors
    ///
    /// Returns an error if the account cannot be saved.
    pub async fn mark_keys_as_published(&self) -> Result<()> {
        self.account.lock().await.mark_keys_as_published();
        self.save_account().await
    }

    async fn save_account(&self) -> Result<()> {
        let batch = self.recorder.begin_local();
        batch.update(|changes| changes.account = Some(Arc::clone(&self.account)));
        self.recorder.commit(batch).await?;
        Ok(())
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Process one synchronization payload.
    ///
    /// Every timeline event comes back, decrypted where possible. Session
    /// advances and rotations from the whole batch are persisted with one
    /// changeset; if a newer batch already committed, that changeset is
    /// dropped and the response is still returned.
    ///
    /// Member lists and unread counters only move forward once the
    /// changeset is written, so a failed batch can be replayed and reports
    /// the same ambiguity changes.
    ///
    /// # Errors
    ///
    /// Returns an error only if committing the batch fails in the store.
    #[instrument(skip_all, fields(next_batch = %payload.next_batch))]
    pub async fn receive_sync(&self, payload: SyncPayload) -> Result<SyncResponse> {
        let batch = self.recorder.begin_sync_batch();
        let SyncPayload { next_batch, rooms } = payload;

        let mut staged = StagedMembers::default();
        let mut ambiguity_changes = AmbiguityChanges::default();
        for (room_id, room) in &rooms.joined {
            ambiguity_changes.extend(self.ambiguity.stage_room(
                &mut staged,
                room_id,
                room.state.iter().chain(&room.timeline),
            ));
        }
        for (room_id, room) in &rooms.invited {
            ambiguity_changes.extend(self.ambiguity.stage_room(&mut staged, room_id, &room.state));
        }
        for room_id in rooms.left.keys() {
            staged.forget(room_id);
        }

        let mut joined_state = BTreeMap::new();
        let mut joined_timelines = Vec::with_capacity(rooms.joined.len());
        for (room_id, room) in rooms.joined {
            joined_state.insert(room_id.clone(), (room.state, room.unread_notifications));
            joined_timelines.push((room_id, room.timeline));
        }

        let mut left_state = BTreeMap::new();
        let mut left_timelines = Vec::with_capacity(rooms.left.len());
        for (room_id, room) in rooms.left {
            left_state.insert(room_id.clone(), room.state);
            left_timelines.push((room_id, room.timeline));
        }

        let (mut joined_events, mut left_events) = futures::join!(
            self.pipeline.decrypt_rooms(joined_timelines, &batch),
            self.pipeline.decrypt_rooms(left_timelines, &batch),
        );

        let mut response = SyncResponse {
            next_batch,
            rooms: Rooms::default(),
            ambiguity_changes,
        };
        for (room_id, (state, unread_notifications)) in joined_state {
            let timeline = joined_events.remove(&room_id).unwrap_or_default();
            response.rooms.joined.insert(
                room_id,
                JoinedRoom {
                    timeline,
                    state,
                    unread_notifications,
                },
            );
        }
        for (room_id, state) in left_state {
            let timeline = left_events.remove(&room_id).unwrap_or_default();
            response
                .rooms
                .left
                .insert(room_id, LeftRoom { timeline, state });
        }
        for (room_id, room) in rooms.invited {
            response
                .rooms
                .invited
                .insert(room_id, InvitedRoom { state: room.state });
        }

        match self.recorder.commit(batch).await? {
            CommitOutcome::Committed { sync_token, records } => {
                debug!(?sync_token, records, events = response.timeline_len(), "Processed sync batch");
            }
            // A newer batch already moved the room state forward.
            CommitOutcome::Rejected { .. } => return Ok(response),
            CommitOutcome::Skipped => {}
        }

        self.ambiguity.apply(staged);
        for (room_id, room) in &response.rooms.joined {
            self.unread.insert(room_id.clone(), room.unread_notifications);
        }
        for room_id in response.rooms.left.keys() {
            self.unread.remove(room_id);
        }
        Ok(response)
    }

    /// Notification counters from the most recent sync of a joined room.
    pub fn unread_notifications(&self, room_id: &RoomId) -> Option<UnreadNotificationsCount> {
        self.unread.get(room_id).map(|entry| *entry.value())
    }

    // =========================================================================
    // Devices
    // =========================================================================

    /// Apply device key uploads fetched from the server.
    ///
    /// Uploads with a bad self signature are skipped. For every user in
    /// `uploads`, tracked devices missing from the list are marked deleted.
    /// Returns what changed.
    ///
    /// # Errors
    ///
    /// [`CryptoManagerError::InvalidKeyUpload`] if the list changes our own
    /// device's identity keys; store errors otherwise. Nothing is written
    /// on error.
    #[instrument(skip_all, fields(uploads = uploads.len()))]
    pub async fn receive_device_keys(&self, uploads: Vec<DeviceKeys>) -> Result<DeviceChanges> {
        let mut by_user: BTreeMap<UserId, Vec<DeviceKeys>> = BTreeMap::new();
        for keys in uploads {
            by_user.entry(keys.user_id.clone()).or_default().push(keys);
        }
        let own_keys = self.identity_keys().await;

        let mut summary = DeviceChanges::default();
        for (user_id, uploads) in by_user {
            let mut known = self.store.get_user_devices(&user_id).await?;

            for keys in uploads {
                let device_id = keys.device_id.clone();
                let is_own = user_id == self.user_id && device_id == self.device_id;

                if let Err(e) = keys.verify_self_signature() {
                    warn!(%user_id, %device_id, error = %e, "Skipping device keys with an invalid self signature");
                    known.remove(&device_id);
                    continue;
                }
                if is_own
                    && (keys.curve25519_key() != Some(own_keys.curve25519.as_str())
                        || keys.ed25519_key() != Some(own_keys.ed25519.as_str()))
                {
                    return Err(CryptoManagerError::InvalidKeyUpload {
                        user_id,
                        reason: format!("device {device_id} is ours and its identity keys differ"),
                    });
                }

                match known.remove(&device_id) {
                    Some(mut device) => {
                        let rotated = device.curve25519_key() != keys.curve25519_key()
                            || device.ed25519_key() != keys.ed25519_key();
                        if device.update(keys) {
                            if rotated {
                                info!(%user_id, %device_id, "Device identity keys rotated");
                            }
                            summary.changed.push(device);
                        }
                    }
                    None => summary.new.push(Device::new(keys)),
                }
            }

            for (device_id, mut device) in known {
                let is_own = user_id == self.user_id && device_id == self.device_id;
                if !device.deleted && !is_own {
                    device.deleted = true;
                    summary.deleted.push(device);
                }
            }
        }

        if !summary.is_empty() {
            let batch = self.recorder.begin_local();
            let changes = summary.clone();
            batch.update(|pending| pending.devices = changes);
            self.recorder.commit(batch).await?;
        }
        Ok(summary)
    }

    /// Set our local trust decision for a device.
    ///
    /// # Errors
    ///
    /// [`CryptoManagerError::DeviceNotFound`] for an untracked device.
    pub async fn set_local_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust: LocalTrust,
    ) -> Result<()> {
        let mut device = self.store.get_device(user_id, device_id).await?.ok_or_else(|| {
            CryptoManagerError::DeviceNotFound {
                user_id: user_id.clone(),
                device_id: device_id.clone(),
            }
        })?;
        if device.local_trust == trust {
            return Ok(());
        }
        device.local_trust = trust;

        let batch = self.recorder.begin_local();
        batch.add_changed_device(device);
        self.recorder.commit(batch).await?;
        debug!(%user_id, %device_id, ?trust, "Local trust changed");
        Ok(())
    }

    /// A tracked device.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lookup fails.
    pub async fn device(&self, user_id: &UserId, device_id: &DeviceId) -> Result<Option<Device>> {
        Ok(self.store.get_device(user_id, device_id).await?)
    }

    /// All tracked devices of a user, deleted ones included.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lookup fails.
    pub async fn user_devices(&self, user_id: &UserId) -> Result<BTreeMap<DeviceId, Device>> {
        Ok(self.store.get_user_devices(user_id).await?)
    }

    // =========================================================================
    // Cross-signing
    // =========================================================================

    /// Create our cross-signing keys and sign our device with them.
    ///
    /// Returns the existing public identity if the keys already exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    #[instrument(skip(self))]
    pub async fn bootstrap_cross_signing(&self) -> Result<UserIdentity> {
        if let Some(private) = self.store.load_private_identity().await? {
            return Ok(private.to_public_identity()?);
        }

        let private = PrivateCrossSigningIdentity::new(self.user_id.clone());
        let identity = private.to_public_identity()?;

        let mut own_device = match self.store.get_device(&self.user_id, &self.device_id).await? {
            Some(device) => device,
            None => Device::new(self.device_keys().await?),
        };
        private.sign_device(&mut own_device.keys)?;

        let is_new = self.store.get_user_identity(&self.user_id).await?.is_none();
        let batch = self.recorder.begin_local();
        batch.add_changed_device(own_device);
        batch.add_identity(identity.clone(), is_new);
        batch.update(|changes| changes.private_identity = Some(private));
        self.recorder.commit(batch).await?;

        info!(user_id = %self.user_id, "Bootstrapped cross-signing");
        Ok(identity)
    }

    /// Store another user's (or our own) public cross-signing identity.
    ///
    /// Signatures we added locally to a re-published master key are kept.
    ///
    /// # Errors
    ///
    /// [`CryptoManagerError::InvalidKeyUpload`] if the sub-keys do not
    /// carry valid master signatures.
    pub async fn receive_cross_signing_keys(&self, mut identity: UserIdentity) -> Result<()> {
        if !identity.is_consistent() {
            return Err(CryptoManagerError::InvalidKeyUpload {
                user_id: identity.user_id,
                reason: "cross-signing sub-keys are not signed by the master key".to_owned(),
            });
        }

        let previous = self.store.get_user_identity(&identity.user_id).await?;
        if let Some(previous) = previous.as_ref() {
            if previous == &identity {
                return Ok(());
            }
            identity.merge_local_signatures(previous);
            if previous.master_key.public_key != identity.master_key.public_key {
                warn!(user_id = %identity.user_id, "Master key changed");
            }
        }

        let batch = self.recorder.begin_local();
        batch.add_identity(identity, previous.is_none());
        self.recorder.commit(batch).await?;
        Ok(())
    }

    /// Sign a user's master key with our user-signing key.
    ///
    /// # Errors
    ///
    /// [`CryptoManagerError::MissingCrossSigningKeys`] without private
    /// keys, [`CryptoManagerError::IdentityNotFound`] for an unknown user.
    #[instrument(skip(self))]
    pub async fn verify_user(&self, user_id: &UserId) -> Result<()> {
        let private = self
            .store
            .load_private_identity()
            .await?
            .ok_or(CryptoManagerError::MissingCrossSigningKeys)?;
        let mut identity = self
            .store
            .get_user_identity(user_id)
            .await?
            .ok_or_else(|| CryptoManagerError::IdentityNotFound(user_id.clone()))?;
        if user_id == &self.user_id {
            return Ok(());
        }

        private.sign_user(&mut identity)?;
        let batch = self.recorder.begin_local();
        batch.add_identity(identity, false);
        self.recorder.commit(batch).await?;
        info!(%user_id, "User verified");
        Ok(())
    }

    /// Which of our private cross-signing keys are available.
    ///
    /// A key counts only if its public half matches our stored public
    /// identity; keys orphaned by a reset elsewhere are reported missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lookup fails.
    pub async fn cross_signing_status(&self) -> Result<CrossSigningStatus> {
        let Some(private) = self.store.load_private_identity().await? else {
            return Ok(CrossSigningStatus::default());
        };
        let ours = private.to_public_identity()?;
        let Some(public) = self.store.get_user_identity(&self.user_id).await? else {
            return Ok(CrossSigningStatus {
                has_master: true,
                has_self_signing: true,
                has_user_signing: true,
            });
        };

        let master_matches = public.master_key.public_key == ours.master_key.public_key;
        Ok(CrossSigningStatus {
            has_master: master_matches,
            has_self_signing: master_matches
                && public.self_signing_key.public_key == ours.self_signing_key.public_key,
            has_user_signing: master_matches
                && public
                    .user_signing_key
                    .as_ref()
                    .zip(ours.user_signing_key.as_ref())
                    .is_some_and(|(theirs, mine)| theirs.public_key == mine.public_key),
        })
    }

    /// Export our private cross-signing keys.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lookup fails.
    pub async fn export_cross_signing_keys(&self) -> Result<Option<CrossSigningKeyExport>> {
        Ok(self.store.export_cross_signing_keys().await?)
    }

    /// Import private cross-signing keys.
    ///
    /// # Errors
    ///
    /// [`SecretImportError::MismatchedPublicKeys`] if the keys do not match
    /// our stored public identity, [`SecretImportError::Key`] for invalid
    /// key material.
    #[instrument(skip_all)]
    pub async fn import_cross_signing_keys(&self, export: &CrossSigningKeyExport) -> Result<()> {
        let private = PrivateCrossSigningIdentity::from_export(self.user_id.clone(), export)
            .map_err(SecretImportError::Key)?;
        let public = self.store.get_user_identity(&self.user_id).await?;
        if public.as_ref().is_some_and(|public| !private.matches(public)) {
            return Err(SecretImportError::MismatchedPublicKeys.into());
        }

        let batch = self.recorder.begin_local();
        if public.is_none() {
            batch.add_identity(private.to_public_identity()?, true);
        }
        batch.update(|changes| changes.private_identity = Some(private));
        self.recorder.commit(batch).await?;
        Ok(())
    }

    // =========================================================================
    // Secrets and backup
    // =========================================================================

    /// Seal our private cross-signing keys and backup key under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if loading or sealing fails.
    pub async fn export_secrets(&self, key: &PickleKey) -> Result<SecretBundle> {
        Ok(self.store.export_secrets(&self.user_id, key).await?)
    }

    /// Import a bundle produced by [`Self::export_secrets`].
    ///
    /// # Errors
    ///
    /// Returns [`SecretImportError`] when the bundle is refused; the store
    /// is left untouched then.
    pub async fn import_secrets(&self, bundle: &SecretBundle, key: &PickleKey) -> Result<()> {
        self.store.import_secrets(bundle, key).await?;
        Ok(())
    }

    /// Make sure a backup key exists and return its recovery key.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be generated or stored.
    pub async fn enable_backup(&self) -> Result<Zeroizing<String>> {
        if let Some(existing) = self.store.load_backup_key().await? {
            return Ok(existing.to_recovery_key());
        }
        let key = BackupKey::new()?;
        let recovery_key = key.to_recovery_key();

        let batch = self.recorder.begin_local();
        batch.update(|changes| changes.backup_key = Some(key));
        self.recorder.commit(batch).await?;
        info!("Room key backup enabled");
        Ok(recovery_key)
    }

    // =========================================================================
    // Room keys
    // =========================================================================

    /// Add an inbound group session received over a secure channel.
    ///
    /// Returns `false` when a copy of the session that reaches as far back
    /// is already known, or the known copy has advanced further.
    ///
    /// # Errors
    ///
    /// [`CryptoManagerError::StaleDeviceKey`] if `sender_key` is a key the
    /// sender's device rotated out, [`CryptoManagerError::MismatchedSender`]
    /// if the keys belong to no device of `sender`.
    #[instrument(skip(self, signing_key, session_key))]
    pub async fn receive_room_key(
        &self,
        sender: &UserId,
        sender_key: &str,
        signing_key: &str,
        room_id: &RoomId,
        session_key: &str,
    ) -> Result<bool> {
        if let Some(resolved) = self.resolver.find_device(sender, None, sender_key).await? {
            match VerificationResolver::key_state(&resolved.device, sender, sender, sender_key, signing_key) {
                None => {}
                Some(_) if !resolved.current_key => {
                    return Err(CryptoManagerError::StaleDeviceKey {
                        user_id: sender.clone(),
                        sender_key: sender_key.to_owned(),
                    });
                }
                Some(_) => return Err(CryptoManagerError::MismatchedSender(sender.clone())),
            }
        }

        let mut session = InboundSession::new(
            room_id.clone(),
            sender.clone(),
            sender_key,
            signing_key,
            session_key,
        )?;
        let key = session.key();
        if !self.supersedes_known(&mut session).await? {
            debug!(session_id = %key.session_id, "Room key already known");
            return Ok(false);
        }
        let handle = match self.cache.insert(session).await {
            Ok(handle) => handle,
            Err(CacheError::AlreadyKnown { .. } | CacheError::Rollback { .. }) => {
                debug!(session_id = %key.session_id, "Room key already known");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let batch = self.recorder.begin_local();
        batch.add_inbound_session(key, handle);
        self.recorder.commit(batch).await?;
        Ok(true)
    }

    /// Whether `session` reaches further back than the known copy, if any.
    /// The known copy's message counter carries over to `session`.
    async fn supersedes_known(&self, session: &mut InboundSession) -> Result<bool> {
        let Some(existing) = self
            .cache
            .get_or_load(session.sender_key(), session.session_id())
            .await?
        else {
            return Ok(true);
        };
        let existing = existing.lock().await;
        if existing.first_known_index() <= session.first_known_index() {
            return Ok(false);
        }
        session.raise_counter(existing.message_counter());
        Ok(true)
    }

    /// Start a new outbound group session for a room, replacing the
    /// current one.
    ///
    /// The matching inbound session is installed so our own messages
    /// decrypt. Returns the key to share with room members.
    ///
    /// # Errors
    ///
    /// Returns an error if the sessions cannot be stored.
    #[instrument(skip(self))]
    pub async fn create_outbound_group_session(&self, room_id: &RoomId) -> Result<RoomKeyShare> {
        let mut outbound = self.outbound.lock().await;
        let (_, share) = self.rotate_outbound(&mut outbound, room_id).await?;
        Ok(share)
    }

    async fn rotate_outbound(
        &self,
        outbound: &mut HashMap<RoomId, SharedOutboundSession>,
        room_id: &RoomId,
    ) -> Result<(SharedOutboundSession, RoomKeyShare)> {
        let session = OutboundSession::new(room_id.clone());
        let share = RoomKeyShare {
            algorithm: MEGOLM_V1_AES_SHA2.to_owned(),
            room_id: room_id.clone(),
            session_id: session.session_id(),
            session_key: session.session_key(),
        };

        let own = self.identity_keys().await;
        let inbound = InboundSession::new(
            room_id.clone(),
            self.user_id.clone(),
            own.curve25519,
            own.ed25519,
            &share.session_key,
        )?;
        let key = inbound.key();
        let inbound = self.cache.insert(inbound).await?;

        let shared = Arc::new(Mutex::new(session));
        let batch = self.recorder.begin_local();
        batch.add_inbound_session(key, inbound);
        batch.add_outbound_session(Arc::clone(&shared));
        self.recorder.commit(batch).await?;

        outbound.insert(room_id.clone(), Arc::clone(&shared));
        debug!(%room_id, session_id = %share.session_id, "Created outbound group session");
        Ok((shared, share))
    }

    /// Encrypt an event for a room.
    ///
    /// Uses the room's outbound session, replacing it first when it is
    /// missing or expired.
    ///
    /// # Errors
    ///
    /// Returns an error if a session cannot be created or saved.
    #[instrument(skip(self, content))]
    pub async fn encrypt_room_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
    ) -> Result<EncryptedEnvelope> {
        let mut outbound = self.outbound.lock().await;

        let current = self.current_outbound(&mut outbound, room_id).await?;
        let expired = match current.as_ref() {
            Some(session) => {
                let session = session.lock().await;
                session.invalidated() || session.expired(self.rotation)
            }
            None => true,
        };
        let session = match current {
            Some(session) if !expired => session,
            _ => self.rotate_outbound(&mut outbound, room_id).await?.0,
        };
        drop(outbound);

        let payload = DecryptedPayload {
            event_type: event_type.to_owned(),
            content,
            room_id: room_id.clone(),
        };
        let plaintext = Zeroizing::new(serde_json::to_string(&payload).map_err(e2ee_common::Error::from)?);

        let (session_id, ciphertext) = {
            let mut guard = session.lock().await;
            (guard.session_id(), guard.encrypt(&plaintext))
        };

        let batch = self.recorder.begin_local();
        batch.add_outbound_session(session);
        self.recorder.commit(batch).await?;

        Ok(EncryptedEnvelope {
            algorithm: MEGOLM_V1_AES_SHA2.to_owned(),
            sender_key: self.identity_keys().await.curve25519,
            device_id: Some(self.device_id.clone()),
            session_id,
            ciphertext,
        })
    }

    async fn current_outbound(
        &self,
        outbound: &mut HashMap<RoomId, SharedOutboundSession>,
        room_id: &RoomId,
    ) -> Result<Option<SharedOutboundSession>> {
        if let Some(session) = outbound.get(room_id) {
            return Ok(Some(Arc::clone(session)));
        }
        let Some(stored) = self.store.get_outbound_session(room_id).await? else {
            return Ok(None);
        };
        let shared = Arc::new(Mutex::new(stored));
        outbound.insert(room_id.clone(), Arc::clone(&shared));
        Ok(Some(shared))
    }

    /// Retire the room's outbound group session.
    ///
    /// The next [`Self::encrypt_room_event`] for the room starts a new
    /// session. Returns `false` if there was no live session to retire.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be loaded or saved.
    #[instrument(skip(self))]
    pub async fn invalidate_group_session(&self, room_id: &RoomId) -> Result<bool> {
        let mut outbound = self.outbound.lock().await;
        let Some(session) = self.current_outbound(&mut outbound, room_id).await? else {
            return Ok(false);
        };
        {
            let mut guard = session.lock().await;
            if guard.invalidated() {
                return Ok(false);
            }
            guard.invalidate();
        }

        let batch = self.recorder.begin_local();
        batch.add_outbound_session(session);
        self.recorder.commit(batch).await?;
        info!(%room_id, "Invalidated outbound group session");
        Ok(true)
    }

    /// Build an `m.room.encrypted` event from one of our envelopes.
    #[must_use]
    pub fn encrypted_event(&self, envelope: &EncryptedEnvelope) -> RawEvent {
        RawEvent::new(serde_json::json!({
            "type": ROOM_ENCRYPTED,
            "sender": self.user_id,
            "content": envelope,
        }))
    }

    /// Export inbound sessions matching `predicate` at their first known
    /// index.
    ///
    /// # Errors
    ///
    /// Returns an error if the sessions cannot be loaded.
    pub async fn export_room_keys(
        &self,
        predicate: impl Fn(&InboundSession) -> bool,
    ) -> Result<Vec<ExportedRoomKey>> {
        Ok(self
            .store
            .get_inbound_sessions()
            .await?
            .into_iter()
            .filter(|session| predicate(session))
            .map(|session| session.export())
            .collect())
    }

    /// Import exported room keys.
    ///
    /// A key replaces a known session only if it reaches further back. All
    /// accepted sessions are persisted in one changeset. Keys restored
    /// `from_backup` are marked as backed up so they are not uploaded again.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written; invalid
    /// keys are skipped.
    #[instrument(skip(self, keys), fields(total = keys.len()))]
    pub async fn import_room_keys(
        &self,
        keys: Vec<ExportedRoomKey>,
        from_backup: bool,
    ) -> Result<RoomKeyImportResult> {
        let mut result = RoomKeyImportResult {
            total_count: keys.len(),
            ..RoomKeyImportResult::default()
        };
        let batch = self.recorder.begin_local();

        for exported in keys {
            let mut session = match InboundSession::import(&exported) {
                Ok(session) => session,
                Err(e) => {
                    warn!(session_id = %exported.session_id, error = %e, "Skipping invalid room key");
                    continue;
                }
            };

            if !self.supersedes_known(&mut session).await? {
                continue;
            }
            if from_backup {
                session.mark_backed_up();
            }

            let key = session.key();
            let handle = match self.cache.insert(session).await {
                Ok(handle) => handle,
                Err(CacheError::AlreadyKnown { .. } | CacheError::Rollback { .. }) => continue,
                Err(e) => return Err(e.into()),
            };
            batch.add_inbound_session(key.clone(), handle);

            result.imported_count += 1;
            result
                .keys
                .entry(exported.room_id.clone())
                .or_default()
                .entry(key.sender_key)
                .or_default()
                .insert(key.session_id);
        }

        self.recorder.commit(batch).await?;
        info!(imported = result.imported_count, total = result.total_count, "Imported room keys");
        Ok(result)
    }
}
