//! Display-name ambiguity deltas.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{RoomId, UserId};

/// One user's ambiguity flip in one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguityChange {
    /// The member whose status flipped.
    pub user_id: UserId,
    /// The display name that is now (un)ambiguous.
    pub display_name: String,
    /// Whether the name is now shared with another member.
    pub ambiguous: bool,
}

/// Ambiguity flips of one sync batch, per room and user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguityChanges {
    /// Changes keyed by room, then user.
    pub changes: BTreeMap<RoomId, BTreeMap<UserId, AmbiguityChange>>,
}

impl AmbiguityChanges {
    /// Record a change, replacing any earlier change for the same user.
    pub fn insert(&mut self, room_id: RoomId, change: AmbiguityChange) {
        self.changes
            .entry(room_id)
            .or_default()
            .insert(change.user_id.clone(), change);
    }

    /// Merge another set of changes into this one.
    pub fn extend(&mut self, other: Self) {
        for (room_id, users) in other.changes {
            self.changes.entry(room_id).or_default().extend(users);
        }
    }

    /// Changes for a single room.
    #[must_use]
    pub fn room(&self, room_id: &RoomId) -> Option<&BTreeMap<UserId, AmbiguityChange>> {
        self.changes.get(room_id)
    }

    /// Whether no user flipped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.values().all(BTreeMap::is_empty)
    }
}
