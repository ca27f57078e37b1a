//! Megolm Session Management
//!
//! Group encryption for room events. Sessions are persisted as pickles
//! encrypted under the store's [`PickleKey`].

use vodozemac::megolm::{
    DecryptionError, ExportedSessionKey, GroupSession, GroupSessionPickle, InboundGroupSession,
    InboundGroupSessionPickle, MegolmMessage, SessionConfig, SessionKey,
};

use crate::{CryptoError, PickleKey, Result};

/// Outbound Megolm session for encrypting messages to a room.
pub struct MegolmOutboundSession {
    session: GroupSession,
}

impl MegolmOutboundSession {
    /// Create a new outbound session.
    #[must_use]
    pub fn new() -> Self {
        Self {
            session: GroupSession::new(SessionConfig::version_1()),
        }
    }

    /// Get the session key (to share with room members over a secure channel).
    /// Returns a base64 encoded string representing the exportable key.
    #[must_use]
    pub fn session_key(&self) -> String {
        self.session.session_key().to_base64()
    }

    /// Get the unique session ID.
    #[must_use]
    pub fn session_id(&self) -> String {
        self.session.session_id()
    }

    /// Get the current message index for ratcheting.
    #[must_use]
    pub fn message_index(&self) -> u32 {
        self.session.message_index()
    }

    /// Encrypt a message payload.
    /// Returns the ciphertext as a base64 string.
    pub fn encrypt(&mut self, plaintext: &str) -> String {
        self.session.encrypt(plaintext).to_base64()
    }

    /// Serialize the session, encrypted with `key`.
    #[must_use]
    pub fn pickle(&self, key: &PickleKey) -> String {
        self.session.pickle().encrypt(key.as_bytes())
    }

    /// Restore a session pickled with [`Self::pickle`].
    pub fn from_pickle(pickle: &str, key: &PickleKey) -> Result<Self> {
        let pickle = GroupSessionPickle::from_encrypted(pickle, key.as_bytes())
            .map_err(|e| CryptoError::Pickle(e.to_string()))?;
        Ok(Self {
            session: GroupSession::from(pickle),
        })
    }
}

impl Default for MegolmOutboundSession {
    fn default() -> Self {
        Self::new()
    }
}

/// A successfully decrypted group message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedGroupMessage {
    /// UTF-8 plaintext.
    pub plaintext: String,
    /// Ratchet index the message was encrypted at.
    pub message_index: u32,
}

/// Inbound Megolm session for decrypting messages from a room member.
pub struct MegolmInboundSession {
    session: InboundGroupSession,
}

impl MegolmInboundSession {
    /// Create an inbound session from a base64 encoded session key.
    pub fn new(session_key_b64: &str) -> Result<Self> {
        let session_key = SessionKey::from_base64(session_key_b64)
            .map_err(|e| CryptoError::InvalidKey(format!("Invalid megolm session key: {e}")))?;

        Ok(Self {
            session: InboundGroupSession::new(&session_key, SessionConfig::version_1()),
        })
    }

    /// Import a session from an exported key (see [`Self::export`]).
    pub fn import(exported_key_b64: &str) -> Result<Self> {
        let exported = ExportedSessionKey::from_base64(exported_key_b64)
            .map_err(|e| CryptoError::InvalidKey(format!("Invalid exported session key: {e}")))?;

        Ok(Self {
            session: InboundGroupSession::import(&exported, SessionConfig::version_1()),
        })
    }

    /// Export the session at its first known index.
    #[must_use]
    pub fn export(&self) -> String {
        self.session.export_at_first_known_index().to_base64()
    }

    /// Get the unique session ID.
    #[must_use]
    pub fn session_id(&self) -> String {
        self.session.session_id()
    }

    /// Get the first known message index for this inbound session.
    #[must_use]
    pub fn first_known_index(&self) -> u32 {
        self.session.first_known_index()
    }

    /// Decrypt a base64-encoded ciphertext message.
    pub fn decrypt(&mut self, ciphertext_b64: &str) -> Result<DecryptedGroupMessage> {
        let message = MegolmMessage::from_base64(ciphertext_b64)
            .map_err(|e| CryptoError::DecryptionFailed(format!("Malformed Megolm message: {e}")))?;

        let first_known = self.session.first_known_index();
        let decrypted = self.session.decrypt(&message).map_err(|e| match e {
            DecryptionError::UnknownMessageIndex(..) => CryptoError::UnknownMessageIndex {
                first_known,
                requested: message.message_index(),
            },
            other => CryptoError::DecryptionFailed(format!("Megolm decryption failed: {other}")),
        })?;

        let plaintext = String::from_utf8(decrypted.plaintext).map_err(|e| {
            CryptoError::DecryptionFailed(format!("Decrypted payload is not valid UTF-8: {e}"))
        })?;

        Ok(DecryptedGroupMessage {
            plaintext,
            message_index: decrypted.message_index,
        })
    }

    /// Serialize the session, encrypted with `key`.
    #[must_use]
    pub fn pickle(&self, key: &PickleKey) -> String {
        self.session.pickle().encrypt(key.as_bytes())
    }

    /// Restore a session pickled with [`Self::pickle`].
    pub fn from_pickle(pickle: &str, key: &PickleKey) -> Result<Self> {
        let pickle = InboundGroupSessionPickle::from_encrypted(pickle, key.as_bytes())
            .map_err(|e| CryptoError::Pickle(e.to_string()))?;
        Ok(Self {
            session: InboundGroupSession::from(pickle),
        })
    }
}
