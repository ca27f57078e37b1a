//! Display-Name Ambiguity Tracking
//!
//! Keeps, per room, the display name of every joined or invited member and
//! reports the members whose name became shared with (or stopped being
//! shared with) another member during a sync batch.
//!
//! State lives only in memory. After a restart the first batch of a room
//! compares against an empty map, which can report members as newly
//! ambiguous once.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use e2ee_common::{AmbiguityChange, AmbiguityChanges, RawEvent, RoomId, UserId};
use serde::Deserialize;
use tracing::trace;

#[derive(Debug, Deserialize)]
struct MemberContent {
    membership: String,
    #[serde(default)]
    displayname: Option<String>,
}

/// A membership change extracted from an `m.room.member` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberUpdate {
    /// Affected user.
    pub user_id: UserId,
    /// Display name while the user is in the room, `None` once they left.
    pub display_name: Option<String>,
}

impl MemberUpdate {
    /// Parse a membership event. Returns `None` for anything else.
    #[must_use]
    pub fn from_event(event: &RawEvent) -> Option<Self> {
        if !event.is_membership() {
            return None;
        }
        let user_id = UserId::parse(event.state_key()?).ok()?;
        let content = MemberContent::deserialize(event.content()?).ok()?;

        let display_name = match content.membership.as_str() {
            "join" | "invite" => Some(
                content
                    .displayname
                    .filter(|name| !name.is_empty())
                    .unwrap_or_else(|| user_id.to_string()),
            ),
            _ => None,
        };
        Some(Self {
            user_id,
            display_name,
        })
    }
}

type RoomMembers = HashMap<UserId, String>;

/// Member lists computed for a sync batch but not applied yet.
///
/// Produced by [`AmbiguityTracker::stage_room`] and applied with
/// [`AmbiguityTracker::apply`] once the batch is committed. Dropping it
/// leaves the tracker untouched, so the batch can be replayed.
#[derive(Debug, Default)]
pub struct StagedMembers {
    rooms: HashMap<RoomId, Option<RoomMembers>>,
}

impl StagedMembers {
    /// Forget `room_id` when applied, e.g. after leaving it.
    pub fn forget(&mut self, room_id: &RoomId) {
        self.rooms.insert(room_id.clone(), None);
    }

    /// Whether nothing was staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

/// Derives [`AmbiguityChanges`] from membership events.
#[derive(Debug, Default)]
pub struct AmbiguityTracker {
    rooms: Mutex<HashMap<RoomId, RoomMembers>>,
}

fn ambiguous_names(members: &RoomMembers) -> HashSet<&str> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for name in members.values() {
        *counts.entry(name.as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(name, _)| name)
        .collect()
}

impl AmbiguityTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one room's membership events, state first, then timeline.
    ///
    /// Emits a change for every current member whose ambiguity flipped.
    /// Members that left are not reported.
    pub fn process_room<'a>(
        &self,
        room_id: &RoomId,
        events: impl IntoIterator<Item = &'a RawEvent>,
    ) -> AmbiguityChanges {
        let mut staged = StagedMembers::default();
        let changes = self.stage_room(&mut staged, room_id, events);
        self.apply(staged);
        changes
    }

    /// Like [`Self::process_room`], but the new member list goes into
    /// `staged` instead of the tracker.
    ///
    /// A room staged earlier in the same batch builds on its staged list.
    pub fn stage_room<'a>(
        &self,
        staged: &mut StagedMembers,
        room_id: &RoomId,
        events: impl IntoIterator<Item = &'a RawEvent>,
    ) -> AmbiguityChanges {
        let updates: Vec<MemberUpdate> = events
            .into_iter()
            .filter_map(MemberUpdate::from_event)
            .collect();
        let mut changes = AmbiguityChanges::default();
        if updates.is_empty() {
            return changes;
        }

        let mut members = match staged.rooms.get(room_id) {
            Some(members) => members.clone().unwrap_or_default(),
            None => self
                .rooms
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(room_id)
                .cloned()
                .unwrap_or_default(),
        };

        let before: HashMap<UserId, bool> = {
            let ambiguous = ambiguous_names(&members);
            members
                .iter()
                .map(|(user, name)| (user.clone(), ambiguous.contains(name.as_str())))
                .collect()
        };

        for update in updates {
            match update.display_name {
                Some(name) => {
                    members.insert(update.user_id, name);
                }
                None => {
                    members.remove(&update.user_id);
                }
            }
        }

        let ambiguous = ambiguous_names(&members);
        let flipped: BTreeMap<&UserId, (&String, bool)> = members
            .iter()
            .filter_map(|(user, name)| {
                let now = ambiguous.contains(name.as_str());
                let was = before.get(user).copied().unwrap_or(false);
                (now != was).then_some((user, (name, now)))
            })
            .collect();

        for (user, (name, now)) in flipped {
            trace!(%room_id, user_id = %user, ambiguous = now, "Display name ambiguity changed");
            changes.insert(
                room_id.clone(),
                AmbiguityChange {
                    user_id: user.clone(),
                    display_name: name.clone(),
                    ambiguous: now,
                },
            );
        }

        staged.rooms.insert(room_id.clone(), Some(members));
        changes
    }

    /// Make staged member lists current.
    pub fn apply(&self, staged: StagedMembers) {
        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        for (room_id, members) in staged.rooms {
            match members {
                Some(members) => {
                    rooms.insert(room_id, members);
                }
                None => {
                    rooms.remove(&room_id);
                }
            }
        }
    }

    /// The tracked display name of a member.
    #[must_use]
    pub fn display_name(&self, room_id: &RoomId, user_id: &UserId) -> Option<String> {
        self.rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(room_id)
            .and_then(|members| members.get(user_id).cloned())
    }
}
