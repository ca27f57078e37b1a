//! Record Backends
//!
//! The raw persistence layer below the key store: opaque blobs keyed by
//! `(record_type, owner, record_id)` with an all-or-nothing batch write.
//! Backends never see plaintext; [`super::EncryptedStore`] hashes keys and
//! encrypts values before they reach this layer.

use e2ee_crypto::EncryptedPickleKey;
use thiserror::Error;

/// Backend I/O errors.
#[derive(Debug, Error)]
pub enum BackendError {
    /// `SQLite` error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A lock was poisoned by a panicking writer.
    #[error("Backend lock poisoned")]
    Poisoned,

    /// A record failed backend validation.
    #[error("Invalid record: {0}")]
    Invalid(String),

    /// The blocking task running the operation failed.
    #[error("Backend task failed: {0}")]
    Task(String),
}

/// Backend result type.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Kinds of records the key store persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordType {
    /// Our olm account.
    Account,
    /// A tracked device.
    Device,
    /// A user's public cross-signing identity.
    UserIdentity,
    /// An inbound group session.
    InboundSession,
    /// An outbound group session.
    OutboundSession,
    /// Our private cross-signing keys.
    PrivateIdentity,
    /// The room key backup key.
    BackupKey,
    /// Last committed sync batch token.
    SyncToken,
    /// Value encrypted under the pickle key to detect a wrong key.
    Canary,
}

impl RecordType {
    /// Stable on-disk name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Device => "device",
            Self::UserIdentity => "user_identity",
            Self::InboundSession => "inbound_session",
            Self::OutboundSession => "outbound_session",
            Self::PrivateIdentity => "private_identity",
            Self::BackupKey => "backup_key",
            Self::SyncToken => "sync_token",
            Self::Canary => "canary",
        }
    }
}

/// Address of one record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    /// Record kind.
    pub record_type: RecordType,
    /// Owner (user id, sender key, room id), usually hashed.
    pub owner: String,
    /// Record id within the owner, usually hashed.
    pub id: String,
}

impl RecordKey {
    /// Build a key.
    pub fn new(record_type: RecordType, owner: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            record_type,
            owner: owner.into(),
            id: id.into(),
        }
    }
}

/// One record in a batch write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    /// Address.
    pub key: RecordKey,
    /// Encrypted value.
    pub value: Vec<u8>,
}

/// Raw key-value persistence with atomic multi-record writes.
///
/// Implementations are synchronous; the key store calls them from
/// `spawn_blocking`.
pub trait RecordBackend: Send + Sync + 'static {
    /// Fetch one record.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn get(&self, key: &RecordKey) -> Result<Option<Vec<u8>>>;

    /// All records of a type, optionally restricted to one owner.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn scan(&self, record_type: RecordType, owner: Option<&str>) -> Result<Vec<StoredRecord>>;

    /// Write every record or none of them.
    ///
    /// # Errors
    ///
    /// Returns an error if any record is rejected; nothing is written then.
    fn write_batch(&self, records: Vec<StoredRecord>) -> Result<()>;

    /// The passphrase-wrapped pickle key, if one was stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn load_pickle_key(&self) -> Result<Option<EncryptedPickleKey>>;

    /// Persist the passphrase-wrapped pickle key.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage fails.
    fn save_pickle_key(&self, key: &EncryptedPickleKey) -> Result<()>;
}

pub(crate) fn validate(record: &StoredRecord) -> Result<()> {
    if record.key.owner.is_empty() || record.key.id.is_empty() {
        return Err(BackendError::Invalid(format!(
            "{} record with empty owner or id",
            record.key.record_type.as_str()
        )));
    }
    Ok(())
}
