//! Room Key Sessions
//!
//! Inbound group sessions annotated with where they came from, outbound
//! sessions with their rotation bookkeeping, and the pickled forms the key
//! store persists.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use e2ee_common::{RoomId, UserId, MEGOLM_V1_AES_SHA2};
use e2ee_crypto::megolm::DecryptedGroupMessage;
use e2ee_crypto::{CryptoError, MegolmInboundSession, MegolmOutboundSession, PickleKey};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// An inbound session behind its per-session lock.
pub type SharedInboundSession = Arc<Mutex<InboundSession>>;

/// An outbound session behind its lock.
pub type SharedOutboundSession = Arc<Mutex<OutboundSession>>;

/// Lookup key of an inbound session.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SessionKey {
    /// Curve25519 key of the sending device (base64).
    pub sender_key: String,
    /// Group session id.
    pub session_id: String,
}

impl SessionKey {
    /// Build a key from its parts.
    pub fn new(sender_key: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            sender_key: sender_key.into(),
            session_id: session_id.into(),
        }
    }
}

/// Inbound group session used to decrypt one sender's room events.
pub struct InboundSession {
    room_id: RoomId,
    sender: UserId,
    sender_key: String,
    signing_key: String,
    session_id: String,
    inner: MegolmInboundSession,
    message_counter: u32,
    imported: bool,
    backed_up: bool,
}

impl fmt::Debug for InboundSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundSession")
            .field("room_id", &self.room_id)
            .field("sender", &self.sender)
            .field("sender_key", &self.sender_key)
            .field("session_id", &self.session_id)
            .field("message_counter", &self.message_counter)
            .field("imported", &self.imported)
            .finish_non_exhaustive()
    }
}

impl InboundSession {
    /// Create a session from a room key shared by `sender`.
    pub fn new(
        room_id: RoomId,
        sender: UserId,
        sender_key: impl Into<String>,
        signing_key: impl Into<String>,
        session_key: &str,
    ) -> Result<Self, CryptoError> {
        let inner = MegolmInboundSession::new(session_key)?;
        Ok(Self::from_parts(
            room_id,
            sender,
            sender_key.into(),
            signing_key.into(),
            inner,
            false,
        ))
    }

    /// Create a session from an exported room key.
    pub fn import(key: &ExportedRoomKey) -> Result<Self, CryptoError> {
        let inner = MegolmInboundSession::import(&key.session_key)?;
        if inner.session_id() != key.session_id {
            return Err(CryptoError::InvalidKey(format!(
                "exported key is for session {}, not {}",
                inner.session_id(),
                key.session_id
            )));
        }
        let signing_key = key
            .sender_claimed_keys
            .get("ed25519")
            .cloned()
            .unwrap_or_default();
        Ok(Self::from_parts(
            key.room_id.clone(),
            key.sender.clone(),
            key.sender_key.clone(),
            signing_key,
            inner,
            true,
        ))
    }

    fn from_parts(
        room_id: RoomId,
        sender: UserId,
        sender_key: String,
        signing_key: String,
        inner: MegolmInboundSession,
        imported: bool,
    ) -> Self {
        Self {
            room_id,
            sender,
            sender_key,
            signing_key,
            session_id: inner.session_id(),
            message_counter: inner.first_known_index(),
            inner,
            imported,
            backed_up: false,
        }
    }

    /// Cache/store key.
    #[must_use]
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.sender_key.clone(), self.session_id.clone())
    }

    /// Room this session encrypts for.
    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// User that shared the session.
    #[must_use]
    pub const fn sender(&self) -> &UserId {
        &self.sender
    }

    /// Curve25519 key of the sending device.
    #[must_use]
    pub fn sender_key(&self) -> &str {
        &self.sender_key
    }

    /// Ed25519 key the sender claimed when sharing the session.
    #[must_use]
    pub fn signing_key(&self) -> &str {
        &self.signing_key
    }

    /// Group session id.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// First ratchet index this session can decrypt.
    #[must_use]
    pub fn first_known_index(&self) -> u32 {
        self.inner.first_known_index()
    }

    /// Highest ratchet index observed through this session.
    ///
    /// Never decreases.
    #[must_use]
    pub const fn message_counter(&self) -> u32 {
        self.message_counter
    }

    /// Whether the session came from a key import rather than its sender.
    #[must_use]
    pub const fn imported(&self) -> bool {
        self.imported
    }

    /// Whether the session was uploaded to a key backup.
    #[must_use]
    pub const fn backed_up(&self) -> bool {
        self.backed_up
    }

    /// Mark the session as uploaded to a key backup.
    pub fn mark_backed_up(&mut self) {
        self.backed_up = true;
    }

    /// Keys the sender claimed, keyed by algorithm.
    #[must_use]
    pub fn sender_claimed_keys(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("ed25519".to_owned(), self.signing_key.clone())])
    }

    /// Decrypt a ciphertext and advance the observed counter.
    pub fn decrypt(&mut self, ciphertext: &str) -> Result<DecryptedGroupMessage, CryptoError> {
        let decrypted = self.inner.decrypt(ciphertext)?;
        self.message_counter = self.message_counter.max(decrypted.message_index);
        Ok(decrypted)
    }

    /// Raise the observed counter, e.g. when replacing a session that had
    /// already seen later messages.
    pub fn raise_counter(&mut self, at_least: u32) {
        self.message_counter = self.message_counter.max(at_least);
    }

    /// Export at the first known index.
    #[must_use]
    pub fn export(&self) -> ExportedRoomKey {
        ExportedRoomKey {
            algorithm: MEGOLM_V1_AES_SHA2.to_owned(),
            room_id: self.room_id.clone(),
            sender: self.sender.clone(),
            sender_key: self.sender_key.clone(),
            session_id: self.session_id.clone(),
            session_key: self.inner.export(),
            sender_claimed_keys: self.sender_claimed_keys(),
        }
    }

    /// Pickle for storage.
    #[must_use]
    pub fn pickle(&self, key: &PickleKey) -> PickledInboundSession {
        PickledInboundSession {
            room_id: self.room_id.clone(),
            sender: self.sender.clone(),
            sender_key: self.sender_key.clone(),
            signing_key: self.signing_key.clone(),
            session_id: self.session_id.clone(),
            pickle: self.inner.pickle(key),
            message_counter: self.message_counter,
            imported: self.imported,
            backed_up: self.backed_up,
        }
    }

    /// Restore from a pickle.
    pub fn from_pickle(pickled: PickledInboundSession, key: &PickleKey) -> Result<Self, CryptoError> {
        let inner = MegolmInboundSession::from_pickle(&pickled.pickle, key)?;
        Ok(Self {
            room_id: pickled.room_id,
            sender: pickled.sender,
            sender_key: pickled.sender_key,
            signing_key: pickled.signing_key,
            session_id: pickled.session_id,
            inner,
            message_counter: pickled.message_counter,
            imported: pickled.imported,
            backed_up: pickled.backed_up,
        })
    }
}

/// Persisted form of an [`InboundSession`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickledInboundSession {
    /// Room id.
    pub room_id: RoomId,
    /// Sharing user.
    pub sender: UserId,
    /// Sender Curve25519 key.
    pub sender_key: String,
    /// Claimed Ed25519 key.
    pub signing_key: String,
    /// Session id.
    pub session_id: String,
    /// vodozemac pickle encrypted with the pickle key.
    pub pickle: String,
    /// Observed counter.
    pub message_counter: u32,
    /// Imported flag.
    pub imported: bool,
    /// Backed-up flag.
    pub backed_up: bool,
}

/// A room key in the portable export format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedRoomKey {
    /// Encryption algorithm.
    pub algorithm: String,
    /// Room id.
    pub room_id: RoomId,
    /// User that originally shared the key.
    pub sender: UserId,
    /// Curve25519 key of the originating device.
    pub sender_key: String,
    /// Session id.
    pub session_id: String,
    /// Exported session key (base64).
    pub session_key: String,
    /// Keys the originating device claimed.
    #[serde(default)]
    pub sender_claimed_keys: BTreeMap<String, String>,
}

/// When an outbound session must be replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationSettings {
    /// Maximum messages per session.
    pub max_messages: u32,
    /// Maximum session age in milliseconds.
    pub max_age_ms: i64,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            max_messages: 100,
            max_age_ms: 7 * 24 * 60 * 60 * 1000,
        }
    }
}

/// Outbound group session for one room.
pub struct OutboundSession {
    room_id: RoomId,
    inner: MegolmOutboundSession,
    created_at: i64,
    invalidated: bool,
}

impl fmt::Debug for OutboundSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundSession")
            .field("room_id", &self.room_id)
            .field("session_id", &self.inner.session_id())
            .field("message_index", &self.inner.message_index())
            .field("invalidated", &self.invalidated)
            .finish_non_exhaustive()
    }
}

impl OutboundSession {
    /// Start a new session for `room_id`.
    #[must_use]
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            inner: MegolmOutboundSession::new(),
            created_at: chrono::Utc::now().timestamp_millis(),
            invalidated: false,
        }
    }

    /// Room id.
    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Session id.
    #[must_use]
    pub fn session_id(&self) -> String {
        self.inner.session_id()
    }

    /// Current session key for sharing with room members.
    #[must_use]
    pub fn session_key(&self) -> String {
        self.inner.session_key()
    }

    /// Messages encrypted so far.
    #[must_use]
    pub fn message_index(&self) -> u32 {
        self.inner.message_index()
    }

    /// Whether the session exceeded its message count or age.
    #[must_use]
    pub fn expired(&self, settings: RotationSettings) -> bool {
        let age = chrono::Utc::now().timestamp_millis() - self.created_at;
        self.inner.message_index() >= settings.max_messages || age >= settings.max_age_ms
    }

    /// Retire the session; the next encryption in the room starts a new one.
    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }

    /// Whether [`Self::invalidate`] was called.
    #[must_use]
    pub const fn invalidated(&self) -> bool {
        self.invalidated
    }

    /// Encrypt a plaintext payload.
    pub fn encrypt(&mut self, plaintext: &str) -> String {
        self.inner.encrypt(plaintext)
    }

    /// Pickle for storage.
    #[must_use]
    pub fn pickle(&self, key: &PickleKey) -> PickledOutboundSession {
        PickledOutboundSession {
            room_id: self.room_id.clone(),
            pickle: self.inner.pickle(key),
            created_at: self.created_at,
            invalidated: self.invalidated,
        }
    }

    /// Restore from a pickle.
    pub fn from_pickle(pickled: PickledOutboundSession, key: &PickleKey) -> Result<Self, CryptoError> {
        Ok(Self {
            room_id: pickled.room_id,
            inner: MegolmOutboundSession::from_pickle(&pickled.pickle, key)?,
            created_at: pickled.created_at,
            invalidated: pickled.invalidated,
        })
    }
}

/// Persisted form of an [`OutboundSession`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickledOutboundSession {
    /// Room id.
    pub room_id: RoomId,
    /// vodozemac pickle encrypted with the pickle key.
    pub pickle: String,
    /// Creation time (unix millis).
    pub created_at: i64,
    /// Retired by the user; absent in older pickles.
    #[serde(default)]
    pub invalidated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomId {
        RoomId::parse("!room:example.org").unwrap()
    }

    fn alice() -> UserId {
        UserId::parse("@alice:example.org").unwrap()
    }

    #[test]
    fn test_counter_tracks_highest_index() {
        let mut outbound = OutboundSession::new(room());
        let mut inbound =
            InboundSession::new(room(), alice(), "curve", "ed", &outbound.session_key()).unwrap();

        let first = outbound.encrypt("one");
        let second = outbound.encrypt("two");

        inbound.decrypt(&second).unwrap();
        assert_eq!(inbound.message_counter(), 1);
        inbound.decrypt(&first).unwrap();
        assert_eq!(inbound.message_counter(), 1);
        inbound.decrypt(&second).unwrap();
        assert_eq!(inbound.message_counter(), 1);
    }

    #[test]
    fn test_export_import_marks_imported() {
        let outbound = OutboundSession::new(room());
        let inbound =
            InboundSession::new(room(), alice(), "curve", "ed", &outbound.session_key()).unwrap();

        let exported = inbound.export();
        assert_eq!(exported.sender_claimed_keys["ed25519"], "ed");
        let imported = InboundSession::import(&exported).unwrap();
        assert!(imported.imported());
        assert_eq!(imported.key(), inbound.key());
        assert_eq!(imported.signing_key(), "ed");
    }

    #[test]
    fn test_import_rejects_mismatched_session_id() {
        let outbound = OutboundSession::new(room());
        let inbound =
            InboundSession::new(room(), alice(), "curve", "ed", &outbound.session_key()).unwrap();
        let mut exported = inbound.export();
        exported.session_id = "other".into();
        assert!(InboundSession::import(&exported).is_err());
    }

    #[test]
    fn test_pickle_roundtrip_keeps_metadata() {
        let key = PickleKey::from_bytes([4u8; 32]);
        let outbound = OutboundSession::new(room());
        let mut inbound =
            InboundSession::new(room(), alice(), "curve", "ed", &outbound.session_key()).unwrap();
        inbound.raise_counter(7);
        inbound.mark_backed_up();

        let restored = InboundSession::from_pickle(inbound.pickle(&key), &key).unwrap();
        assert_eq!(restored.message_counter(), 7);
        assert!(restored.backed_up());
        assert_eq!(restored.room_id(), &room());
    }

    #[test]
    fn test_outbound_expiry() {
        let mut outbound = OutboundSession::new(room());
        let settings = RotationSettings {
            max_messages: 2,
            max_age_ms: i64::MAX,
        };
        assert!(!outbound.expired(settings));
        outbound.encrypt("a");
        outbound.encrypt("b");
        assert!(outbound.expired(settings));
    }

    #[test]
    fn test_invalidated_outbound_survives_pickle() {
        let key = PickleKey::from_bytes([7u8; 32]);
        let mut outbound = OutboundSession::new(room());
        assert!(!outbound.invalidated());
        outbound.invalidate();

        let restored = OutboundSession::from_pickle(outbound.pickle(&key), &key).unwrap();
        assert!(restored.invalidated());
        assert_eq!(restored.session_id(), outbound.session_id());
    }
}
