//! Encrypted key store over a record backend.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use e2ee_common::{DeviceId, RoomId, UserId};
use e2ee_crypto::{BackupKey, CryptoError, OlmAccount, PickleKey, StoreCipher};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use zeroize::Zeroizing;

use super::backend::{self, BackendError, RecordBackend, RecordKey, RecordType, StoredRecord};
use super::memory::MemoryBackend;
use super::sqlite::SqliteBackend;
use super::{Changes, CryptoStoreError, KeyStore, Result};
use crate::identities::{CrossSigningKeyExport, Device, PrivateCrossSigningIdentity, UserIdentity};
use crate::session::{
    InboundSession, OutboundSession, PickledInboundSession, PickledOutboundSession,
};

const CANARY: &[u8] = b"e2ee-client:canary:v1";
const SINGLETON: &str = "self";
const OUTBOUND_ID: &str = "outbound";

/// Key store over the in-memory backend.
pub type MemoryStore = EncryptedStore<MemoryBackend>;

/// Key store over the `SQLite` backend.
pub type SqliteStore = EncryptedStore<SqliteBackend>;

#[derive(Serialize, Deserialize)]
struct StoredPrivateIdentity {
    user_id: UserId,
    keys: CrossSigningKeyExport,
}

/// [`KeyStore`] that encrypts every value and hashes every lookup key with
/// a [`StoreCipher`] derived from the pickle key.
pub struct EncryptedStore<B> {
    backend: Arc<B>,
    pickle_key: PickleKey,
    cipher: StoreCipher,
    // Serializes commits and holds the last committed sync token.
    write_lock: Mutex<Option<u64>>,
}

impl<B> std::fmt::Debug for EncryptedStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedStore")
            .field("backend", &std::any::type_name::<B>())
            .finish_non_exhaustive()
    }
}

impl EncryptedStore<MemoryBackend> {
    /// Open a fresh, non-persistent store.
    ///
    /// # Errors
    ///
    /// Returns an error if the canary record cannot be written.
    pub async fn in_memory(pickle_key: PickleKey) -> Result<Self> {
        Self::open(MemoryBackend::new(), pickle_key).await
    }
}

impl EncryptedStore<SqliteBackend> {
    /// Create or open a `SQLite` store with an explicit pickle key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoStoreError::WrongPickleKey`] if the database was
    /// created with a different key, or a backend error.
    pub async fn open_sqlite(path: impl AsRef<Path>, pickle_key: PickleKey) -> Result<Self> {
        let backend = open_sqlite_backend(path.as_ref()).await?;
        Self::open(backend, pickle_key).await
    }

    /// Create or open a `SQLite` store whose pickle key is kept in the
    /// database, wrapped by `passphrase`.
    ///
    /// The pickle key is generated on first open.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoStoreError::WrongPickleKey`] for a wrong passphrase,
    /// or a backend error.
    #[instrument(skip_all)]
    pub async fn open_with_passphrase(path: impl AsRef<Path>, passphrase: &str) -> Result<Self> {
        let backend = Arc::new(open_sqlite_backend(path.as_ref()).await?);

        let stored = {
            let backend = Arc::clone(&backend);
            run_blocking(move || backend.load_pickle_key()).await?
        };
        let pickle_key = if let Some(wrapped) = stored {
            let passphrase = Zeroizing::new(passphrase.to_owned());
            tokio::task::spawn_blocking(move || wrapped.unseal(&passphrase))
                .await
                .map_err(|e| BackendError::Task(e.to_string()))?
                .map_err(|e| match e {
                    CryptoError::Passphrase => CryptoStoreError::WrongPickleKey,
                    other => CryptoStoreError::Encryption(other),
                })?
        } else {
            let pickle_key = PickleKey::new()?;
            let wrapped = {
                let pickle_key = pickle_key.clone();
                let passphrase = Zeroizing::new(passphrase.to_owned());
                tokio::task::spawn_blocking(move || pickle_key.encrypt_with_passphrase(&passphrase))
                    .await
                    .map_err(|e| BackendError::Task(e.to_string()))??
            };
            let backend = Arc::clone(&backend);
            run_blocking(move || backend.save_pickle_key(&wrapped)).await?;
            debug!("Generated new pickle key");
            pickle_key
        };

        Self::with_backend(backend, pickle_key).await
    }
}

async fn open_sqlite_backend(path: &Path) -> Result<SqliteBackend> {
    let path = path.to_path_buf();
    run_blocking(move || SqliteBackend::open(&path)).await
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> backend::Result<T> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackendError::Task(e.to_string()))??)
}

impl<B: RecordBackend> EncryptedStore<B> {
    /// Open a store over `backend`.
    ///
    /// A new store gets a canary record encrypted under `pickle_key`; an
    /// existing one must decrypt its canary with it.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoStoreError::WrongPickleKey`] if the canary does not
    /// decrypt, or a backend error.
    pub async fn open(backend: B, pickle_key: PickleKey) -> Result<Self> {
        Self::with_backend(Arc::new(backend), pickle_key).await
    }

    async fn with_backend(backend: Arc<B>, pickle_key: PickleKey) -> Result<Self> {
        let cipher = StoreCipher::new(&pickle_key);
        let store = Self {
            backend,
            pickle_key,
            cipher,
            write_lock: Mutex::new(None),
        };

        let canary_key = RecordKey::new(RecordType::Canary, SINGLETON, SINGLETON);
        match store.get_raw(canary_key.clone()).await? {
            Some(encrypted) => {
                let matches = store
                    .cipher
                    .decrypt_value(&encrypted)
                    .is_ok_and(|plaintext| plaintext.as_slice() == CANARY);
                if !matches {
                    warn!("Key store opened with the wrong pickle key");
                    return Err(CryptoStoreError::WrongPickleKey);
                }
            }
            None => {
                let record = StoredRecord {
                    key: canary_key,
                    value: store.cipher.encrypt_value(CANARY)?,
                };
                store.write(vec![record]).await?;
            }
        }

        let token = store.read_token().await?;
        *store.write_lock.lock().await = token;
        Ok(store)
    }

    /// The underlying backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn key(&self, record_type: RecordType, owner: &str, id: &str) -> RecordKey {
        let domain = record_type.as_str();
        RecordKey::new(
            record_type,
            self.cipher.hash_key(domain, owner),
            self.cipher.hash_key(domain, &format!("{owner}\u{0}{id}")),
        )
    }

    fn owner(&self, record_type: RecordType, owner: &str) -> String {
        self.cipher.hash_key(record_type.as_str(), owner)
    }

    fn encode<T: Serialize>(&self, key: RecordKey, value: &T) -> Result<StoredRecord> {
        let plaintext = Zeroizing::new(serde_json::to_vec(value)?);
        Ok(StoredRecord {
            key,
            value: self.cipher.encrypt_value(&plaintext)?,
        })
    }

    fn decode<T: DeserializeOwned>(&self, encrypted: &[u8]) -> Result<T> {
        let plaintext = self.cipher.decrypt_value(encrypted)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    async fn get_raw(&self, key: RecordKey) -> Result<Option<Vec<u8>>> {
        let backend = Arc::clone(&self.backend);
        run_blocking(move || backend.get(&key)).await
    }

    async fn get_record<T: DeserializeOwned>(&self, key: RecordKey) -> Result<Option<T>> {
        self.get_raw(key)
            .await?
            .map(|encrypted| self.decode(&encrypted))
            .transpose()
    }

    async fn scan_records<T: DeserializeOwned>(
        &self,
        record_type: RecordType,
        owner: Option<String>,
    ) -> Result<Vec<T>> {
        let backend = Arc::clone(&self.backend);
        let records = run_blocking(move || backend.scan(record_type, owner.as_deref())).await?;
        records
            .iter()
            .map(|record| self.decode(&record.value))
            .collect()
    }

    async fn write(&self, records: Vec<StoredRecord>) -> Result<()> {
        let backend = Arc::clone(&self.backend);
        run_blocking(move || backend.write_batch(records)).await
    }

    async fn read_token(&self) -> Result<Option<u64>> {
        self.get_record(self.key(RecordType::SyncToken, SINGLETON, SINGLETON))
            .await
    }

    async fn encode_changes(&self, changes: &Changes) -> Result<Vec<StoredRecord>> {
        let mut records = Vec::with_capacity(changes.record_count() + 1);

        if let Some(account) = &changes.account {
            let pickle = account.lock().await.pickle(&self.pickle_key);
            records.push(self.encode(self.key(RecordType::Account, SINGLETON, SINGLETON), &pickle)?);
        }

        if let Some(identity) = &changes.private_identity {
            let stored = StoredPrivateIdentity {
                user_id: identity.user_id().clone(),
                keys: identity.export(),
            };
            records.push(self.encode(
                self.key(RecordType::PrivateIdentity, SINGLETON, SINGLETON),
                &stored,
            )?);
        }

        if let Some(backup_key) = &changes.backup_key {
            records.push(self.encode(
                self.key(RecordType::BackupKey, SINGLETON, SINGLETON),
                &*backup_key.to_base64(),
            )?);
        }

        for session in &changes.inbound_sessions {
            let pickled = session.lock().await.pickle(&self.pickle_key);
            let key = self.key(RecordType::InboundSession, &pickled.sender_key, &pickled.session_id);
            records.push(self.encode(key, &pickled)?);
        }

        for session in &changes.outbound_sessions {
            let pickled = session.lock().await.pickle(&self.pickle_key);
            let key = self.key(RecordType::OutboundSession, pickled.room_id.as_str(), OUTBOUND_ID);
            records.push(self.encode(key, &pickled)?);
        }

        let devices = changes
            .devices
            .new
            .iter()
            .chain(&changes.devices.changed)
            .chain(&changes.devices.deleted);
        for device in devices {
            let key = self.key(
                RecordType::Device,
                device.user_id().as_str(),
                device.device_id().as_str(),
            );
            records.push(self.encode(key, device)?);
        }

        for identity in changes.identities.new.iter().chain(&changes.identities.changed) {
            let key = self.key(RecordType::UserIdentity, identity.user_id.as_str(), SINGLETON);
            records.push(self.encode(key, identity)?);
        }

        if let Some(token) = changes.sync_token {
            records.push(self.encode(self.key(RecordType::SyncToken, SINGLETON, SINGLETON), &token)?);
        }

        Ok(records)
    }
}

#[async_trait]
impl<B: RecordBackend> KeyStore for EncryptedStore<B> {
    async fn load_account(&self) -> Result<Option<OlmAccount>> {
        let pickle: Option<String> = self
            .get_record(self.key(RecordType::Account, SINGLETON, SINGLETON))
            .await?;
        pickle
            .map(|pickle| OlmAccount::from_pickle(&pickle, &self.pickle_key))
            .transpose()
            .map_err(Into::into)
    }

    #[instrument(skip_all, fields(records = changes.record_count(), sync_token = ?changes.sync_token))]
    async fn save_changes(&self, changes: Changes) -> Result<()> {
        let mut committed = self.write_lock.lock().await;

        if let (Some(attempted), Some(last)) = (changes.sync_token, *committed) {
            if attempted <= last {
                return Err(CryptoStoreError::ConsistencyViolation {
                    committed: last,
                    attempted,
                });
            }
        }

        let records = self.encode_changes(&changes).await?;
        let count = records.len();
        self.write(records).await?;

        if let Some(token) = changes.sync_token {
            *committed = Some(token);
        }
        debug!(records = count, "Changes saved");
        Ok(())
    }

    async fn get_session(&self, sender_key: &str, session_id: &str) -> Result<Option<InboundSession>> {
        let pickled: Option<PickledInboundSession> = self
            .get_record(self.key(RecordType::InboundSession, sender_key, session_id))
            .await?;
        pickled
            .map(|pickled| InboundSession::from_pickle(pickled, &self.pickle_key))
            .transpose()
            .map_err(Into::into)
    }

    async fn get_inbound_sessions(&self) -> Result<Vec<InboundSession>> {
        let pickled: Vec<PickledInboundSession> =
            self.scan_records(RecordType::InboundSession, None).await?;
        pickled
            .into_iter()
            .map(|pickled| InboundSession::from_pickle(pickled, &self.pickle_key))
            .collect::<std::result::Result<_, _>>()
            .map_err(Into::into)
    }

    async fn get_outbound_session(&self, room_id: &RoomId) -> Result<Option<OutboundSession>> {
        let pickled: Option<PickledOutboundSession> = self
            .get_record(self.key(RecordType::OutboundSession, room_id.as_str(), OUTBOUND_ID))
            .await?;
        pickled
            .map(|pickled| OutboundSession::from_pickle(pickled, &self.pickle_key))
            .transpose()
            .map_err(Into::into)
    }

    async fn get_device(&self, user_id: &UserId, device_id: &DeviceId) -> Result<Option<Device>> {
        self.get_record(self.key(RecordType::Device, user_id.as_str(), device_id.as_str()))
            .await
    }

    async fn get_user_devices(&self, user_id: &UserId) -> Result<BTreeMap<DeviceId, Device>> {
        let owner = self.owner(RecordType::Device, user_id.as_str());
        let devices: Vec<Device> = self.scan_records(RecordType::Device, Some(owner)).await?;
        Ok(devices
            .into_iter()
            .map(|device| (device.device_id().clone(), device))
            .collect())
    }

    async fn get_user_identity(&self, user_id: &UserId) -> Result<Option<UserIdentity>> {
        self.get_record(self.key(RecordType::UserIdentity, user_id.as_str(), SINGLETON))
            .await
    }

    async fn load_private_identity(&self) -> Result<Option<PrivateCrossSigningIdentity>> {
        let stored: Option<StoredPrivateIdentity> = self
            .get_record(self.key(RecordType::PrivateIdentity, SINGLETON, SINGLETON))
            .await?;
        stored
            .map(|stored| PrivateCrossSigningIdentity::from_export(stored.user_id.clone(), &stored.keys))
            .transpose()
            .map_err(Into::into)
    }

    async fn load_backup_key(&self) -> Result<Option<BackupKey>> {
        let encoded: Option<String> = self
            .get_record(self.key(RecordType::BackupKey, SINGLETON, SINGLETON))
            .await?;
        encoded
            .map(|encoded| BackupKey::from_base64(&Zeroizing::new(encoded)))
            .transpose()
            .map_err(Into::into)
    }

    async fn last_sync_token(&self) -> Result<Option<u64>> {
        Ok(*self.write_lock.lock().await)
    }
}
