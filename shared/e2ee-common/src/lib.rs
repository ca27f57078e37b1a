//! E2EE Common Library
//!
//! Protocol-facing types shared by the crypto primitives and the client:
//! identifiers, raw and decrypted sync events, encryption metadata and
//! display-name ambiguity deltas.

pub mod ambiguity;
pub mod encryption;
pub mod error;
pub mod events;
pub mod ids;
pub mod sync;

pub use ambiguity::{AmbiguityChange, AmbiguityChanges};
pub use encryption::{
    AlgorithmInfo, DecryptionFailure, EncryptionInfo, UnableToDecrypt, VerificationState,
};
pub use error::{Error, Result};
pub use events::{
    DecryptedPayload, EncryptedEnvelope, RawEvent, MEGOLM_V1_AES_SHA2, ROOM_ENCRYPTED, ROOM_KEY,
    ROOM_MEMBER,
};
pub use ids::{DeviceId, RoomId, UserId};
pub use sync::{
    InvitedRoom, InvitedRoomPayload, JoinedRoom, JoinedRoomPayload, LeftRoom, LeftRoomPayload,
    Rooms, RoomsPayload, SyncPayload, SyncResponse, SyncRoomEvent, UnreadNotificationsCount,
};
