//! Sync Payloads
//!
//! The raw synchronization payload handed over by the transport and the
//! normalized response returned to the room/timeline consumer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{AmbiguityChanges, EncryptionInfo, RawEvent, RoomId, UnableToDecrypt};

/// Per-room notification counters.
///
/// Each sync replaces the previous value wholesale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadNotificationsCount {
    /// Highlighted (mention) notifications.
    #[serde(default)]
    pub highlight_count: u64,
    /// All notifications.
    #[serde(default)]
    pub notification_count: u64,
}

/// A joined room's delta as received from the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinedRoomPayload {
    /// Timeline events in server order.
    #[serde(default)]
    pub timeline: Vec<RawEvent>,
    /// State events preceding the timeline.
    #[serde(default)]
    pub state: Vec<RawEvent>,
    /// Notification counters.
    #[serde(default)]
    pub unread_notifications: UnreadNotificationsCount,
}

/// A left room's delta as received from the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeftRoomPayload {
    /// Timeline events in server order.
    #[serde(default)]
    pub timeline: Vec<RawEvent>,
    /// State events preceding the timeline.
    #[serde(default)]
    pub state: Vec<RawEvent>,
}

/// An invited room's stripped state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvitedRoomPayload {
    /// Stripped state events describing the invite.
    #[serde(default, alias = "invite_state")]
    pub state: Vec<RawEvent>,
}

/// Room deltas keyed by room id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomsPayload {
    /// Joined rooms.
    #[serde(default, alias = "join")]
    pub joined: BTreeMap<RoomId, JoinedRoomPayload>,
    /// Rooms left since the last sync.
    #[serde(default, alias = "leave")]
    pub left: BTreeMap<RoomId, LeftRoomPayload>,
    /// Pending invites.
    #[serde(default, alias = "invite")]
    pub invited: BTreeMap<RoomId, InvitedRoomPayload>,
}

/// A synchronization payload from the transport collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    /// Opaque server token for the next sync request.
    #[serde(default)]
    pub next_batch: String,
    /// Room deltas.
    #[serde(default)]
    pub rooms: RoomsPayload,
}

/// A timeline event after the decryption pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRoomEvent {
    /// The event, decrypted when decryption succeeded.
    pub event: RawEvent,
    /// Encryption metadata for successfully decrypted events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_info: Option<EncryptionInfo>,
    /// Failure marker for encrypted events left undecrypted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unable_to_decrypt: Option<UnableToDecrypt>,
}

impl SyncRoomEvent {
    /// A plaintext event passed through unchanged.
    #[must_use]
    pub const fn plain(event: RawEvent) -> Self {
        Self {
            event,
            encryption_info: None,
            unable_to_decrypt: None,
        }
    }

    /// A decrypted event with its encryption metadata.
    #[must_use]
    pub const fn decrypted(event: RawEvent, info: EncryptionInfo) -> Self {
        Self {
            event,
            encryption_info: Some(info),
            unable_to_decrypt: None,
        }
    }

    /// An encrypted event that could not be decrypted.
    #[must_use]
    pub const fn undecrypted(event: RawEvent, failure: UnableToDecrypt) -> Self {
        Self {
            event,
            encryption_info: None,
            unable_to_decrypt: Some(failure),
        }
    }

    /// Whether the event still carries ciphertext.
    #[must_use]
    pub const fn is_undecrypted(&self) -> bool {
        self.unable_to_decrypt.is_some()
    }
}

/// A joined room after processing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinedRoom {
    /// Timeline in the order received.
    pub timeline: Vec<SyncRoomEvent>,
    /// State events, unchanged.
    pub state: Vec<RawEvent>,
    /// Notification counters from this sync.
    pub unread_notifications: UnreadNotificationsCount,
}

/// A left room after processing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeftRoom {
    /// Timeline in the order received.
    pub timeline: Vec<SyncRoomEvent>,
    /// State events, unchanged.
    pub state: Vec<RawEvent>,
}

/// An invited room after processing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvitedRoom {
    /// Stripped state events.
    pub state: Vec<RawEvent>,
}

/// Processed rooms keyed by room id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rooms {
    /// Joined rooms.
    pub joined: BTreeMap<RoomId, JoinedRoom>,
    /// Left rooms.
    pub left: BTreeMap<RoomId, LeftRoom>,
    /// Invited rooms.
    pub invited: BTreeMap<RoomId, InvitedRoom>,
}

/// The normalized result of processing one [`SyncPayload`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Token for the next sync request.
    pub next_batch: String,
    /// Processed rooms.
    pub rooms: Rooms,
    /// Display-name ambiguity flips caused by this batch.
    pub ambiguity_changes: AmbiguityChanges,
}

impl SyncResponse {
    /// Total number of timeline events across all rooms.
    #[must_use]
    pub fn timeline_len(&self) -> usize {
        self.rooms
            .joined
            .values()
            .map(|room| room.timeline.len())
            .chain(self.rooms.left.values().map(|room| room.timeline.len()))
            .sum()
    }
}
