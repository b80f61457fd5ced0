// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

use crate::base::{PlayerId, Rating, TimestampMs};

/// Identity of a session principal as handed to the core by the outer
/// authentication layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerProfile {
    pub player_id: PlayerId,
    pub display_name: String,
    pub rating: Rating,
}

impl PlayerProfile {
    pub fn new(display_name: impl Into<String>, rating: Rating) -> Self {
        Self {
            player_id: PlayerId::generate(),
            display_name: display_name.into(),
            rating,
        }
    }
}

/// A player's seat inside a match. The runtime is the only writer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlayerSlot {
    pub profile: PlayerProfile,
    pub connected: bool,
    pub ready: bool,
    pub last_seen_at: TimestampMs,
    /// Set when the player left or was ejected; a forfeited slot scores
    /// zero for the remaining rounds but stays in the standings.
    pub forfeited: bool,
    /// Running total across closed rounds.
    pub total: u32,
    /// Timestamp of the last accepted submission; standings tie-break.
    pub last_submitted_at: Option<TimestampMs>,
}

impl PlayerSlot {
    pub fn new(profile: PlayerProfile, now: TimestampMs) -> Self {
        Self {
            profile,
            connected: true,
            ready: false,
            last_seen_at: now,
            forfeited: false,
            total: 0,
            last_submitted_at: None,
        }
    }

    pub fn player_id(&self) -> PlayerId {
        self.profile.player_id
    }

    /// An active slot still competes: it is counted for the all-submitted
    /// fast path and may still score.
    pub fn is_active(&self) -> bool {
        !self.forfeited
    }
}

/// Public view of a seat, safe to broadcast to the room.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerView {
    pub player_id: PlayerId,
    pub display_name: String,
    pub rating: Rating,
    pub connected: bool,
    pub ready: bool,
    pub total: u32,
}

impl From<&PlayerSlot> for PlayerView {
    fn from(slot: &PlayerSlot) -> Self {
        Self {
            player_id: slot.profile.player_id,
            display_name: slot.profile.display_name.clone(),
            rating: slot.profile.rating,
            connected: slot.connected,
            ready: slot.ready,
            total: slot.total,
        }
    }
}
