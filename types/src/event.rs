// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

//! Server-to-client events.
//!
//! Match-scoped events carry the aggregate `version` at emission time;
//! a subscriber observing versions that skip can detect the gap and ask
//! for a resync.

use serde::{Deserialize, Serialize};

use crate::base::{MatchId, PlayerId, RoundIndex, SubmissionId, TimestampMs, Version};
use crate::error::ErrorCode;
use crate::grade::GradeReport;
use crate::match_state::{EndReason, MatchSnapshot, Standing};
use crate::mode::MatchMode;
use crate::player::{PlayerView, PlayerProfile};
use crate::problem::ProblemView;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    MatchFound {
        match_id: MatchId,
        mode: MatchMode,
        players: Vec<PlayerProfile>,
    },
    MatchmakingStatus {
        mode: MatchMode,
        position_in_queue: usize,
    },
    MatchmakingCancelled {},
    /// Reply to `create_custom`: the lobby is allocated and joinable.
    CustomCreated {
        match_id: MatchId,
    },
    PlayerJoined {
        match_id: MatchId,
        version: Version,
        player: PlayerView,
    },
    PlayerLeft {
        match_id: MatchId,
        version: Version,
        player_id: PlayerId,
        reason: LeaveReason,
    },
    MatchStarting {
        match_id: MatchId,
        version: Version,
        countdown_ms: u64,
    },
    RoundStart {
        match_id: MatchId,
        version: Version,
        round_index: RoundIndex,
        problem: ProblemView,
        deadline_at: TimestampMs,
    },
    SubmissionAck {
        match_id: MatchId,
        version: Version,
        round_index: RoundIndex,
        submission_id: SubmissionId,
    },
    /// Sent to the rest of the room when a player's solution is accepted;
    /// never includes the code.
    PlayerSubmitted {
        match_id: MatchId,
        version: Version,
        round_index: RoundIndex,
        player_id: PlayerId,
    },
    RoundResult {
        match_id: MatchId,
        version: Version,
        round_index: RoundIndex,
        per_player: Vec<PlayerRoundResult>,
        grading_degraded: bool,
    },
    MatchEnd {
        match_id: MatchId,
        version: Version,
        standings: Vec<Standing>,
        reason: EndReason,
    },
    SpectatorUpdate {
        match_id: MatchId,
        spectator_count: usize,
    },
    ChatMessage {
        match_id: MatchId,
        from: PlayerId,
        display_name: String,
        text: String,
        ts: TimestampMs,
    },
    UserTyping {
        match_id: MatchId,
        from: PlayerId,
        is_typing: bool,
    },
    Resync {
        snapshot: MatchSnapshot,
    },
    ServerStats {
        online_connections: usize,
        active_matches: usize,
        queued_players: usize,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    Left,
    Disconnected,
    Forfeited,
    ConfirmTimeout,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlayerRoundResult {
    pub player_id: PlayerId,
    pub display_name: String,
    pub score: u32,
    pub total: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<GradeReport>,
}

impl ServerEvent {
    /// The aggregate version stamped on match-scoped events; `None` for
    /// connection- or queue-scoped ones.
    pub fn version(&self) -> Option<Version> {
        match self {
            ServerEvent::PlayerJoined { version, .. }
            | ServerEvent::PlayerLeft { version, .. }
            | ServerEvent::MatchStarting { version, .. }
            | ServerEvent::RoundStart { version, .. }
            | ServerEvent::SubmissionAck { version, .. }
            | ServerEvent::PlayerSubmitted { version, .. }
            | ServerEvent::RoundResult { version, .. }
            | ServerEvent::MatchEnd { version, .. } => Some(*version),
            ServerEvent::Resync { snapshot } => Some(snapshot.version),
            _ => None,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let event = ServerEvent::MatchStarting {
            match_id: MatchId::generate(),
            version: 7,
            countdown_ms: 3_000,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "match_starting");
        assert_eq!(json["countdown_ms"], 3_000);
        assert_eq!(event.version(), Some(7));
    }
}
