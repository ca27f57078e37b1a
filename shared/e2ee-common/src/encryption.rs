//! Encryption Metadata
//!
//! What the pipeline attaches to each event it tried to decrypt.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{DeviceId, UserId};

/// Trust tier of the device that sent a decrypted event.
///
/// Computed at decryption time and never revised for events already emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    /// Device is cross-signed by a trusted identity, or locally verified.
    Verified,
    /// Device is known but no trust chain reaches it.
    Unverified,
    /// No device with this key is known.
    UnknownDevice,
    /// The claimed sender key does not match the recorded device key.
    MismatchedSender,
}

impl VerificationState {
    /// Whether the sender is verified.
    #[must_use]
    pub const fn is_verified(self) -> bool {
        matches!(self, Self::Verified)
    }
}

/// Algorithm-specific metadata of a decrypted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm")]
pub enum AlgorithmInfo {
    /// `m.megolm.v1.aes-sha2`.
    #[serde(rename = "m.megolm.v1.aes-sha2")]
    MegolmV1AesSha2 {
        /// Curve25519 key of the sending device.
        curve25519_key: String,
        /// Keys the sender claimed when the session was shared, by algorithm.
        sender_claimed_keys: BTreeMap<String, String>,
        /// Group session id.
        session_id: String,
        /// Ratchet index of this message.
        message_index: u32,
    },
}

/// Encryption metadata attached to a decrypted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionInfo {
    /// User that sent the event.
    pub sender: UserId,
    /// Device that sent the event, if it could be resolved.
    pub sender_device: Option<DeviceId>,
    /// Algorithm details.
    pub algorithm_info: AlgorithmInfo,
    /// Trust of the sending device at decryption time.
    pub verification_state: VerificationState,
}

/// Why an encrypted event could not be decrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecryptionFailure {
    /// The sending device is not in the key store.
    UnknownDevice,
    /// No group session with this id is known for the sender key.
    SessionNotFound,
    /// The session does not cover this message index.
    UnknownMessageIndex,
    /// Ciphertext authentication failed.
    MacMismatch,
    /// Sender key does not match the resolved device.
    MismatchedSender,
    /// The decrypted payload targets a different room.
    RoomMismatch,
    /// The event uses an encryption algorithm we do not support.
    UnsupportedAlgorithm,
    /// The encrypted envelope or decrypted payload is not well formed.
    MalformedEvent,
    /// The key store could not be read.
    StoreUnavailable,
}

impl fmt::Display for DecryptionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::UnknownDevice => "unknown device",
            Self::SessionNotFound => "session not found",
            Self::UnknownMessageIndex => "unknown message index",
            Self::MacMismatch => "MAC mismatch",
            Self::MismatchedSender => "mismatched sender",
            Self::RoomMismatch => "room mismatch",
            Self::UnsupportedAlgorithm => "unsupported algorithm",
            Self::MalformedEvent => "malformed event",
            Self::StoreUnavailable => "store unavailable",
        };
        f.write_str(text)
    }
}

/// Error marker attached to an event left undecrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnableToDecrypt {
    /// Failure kind.
    pub failure: DecryptionFailure,
    /// Session the event referenced, when the envelope was readable.
    pub session_id: Option<String>,
    /// Sender key the event referenced, when the envelope was readable.
    pub sender_key: Option<String>,
}
