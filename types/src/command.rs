// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

//! Client-to-server commands.
//!
//! This is a closed set: the transport deserializes into
//! [`ClientCommand`] and an unknown `type` tag is a validation error, not
//! something to pass through.

use serde::{Deserialize, Serialize};

use crate::base::{MatchId, RoundIndex};
use crate::mode::MatchMode;
use crate::problem::Difficulty;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    FindMatch {
        mode: MatchMode,
        #[serde(default)]
        preferences: MatchPreferences,
    },
    CancelMatchmaking {},
    CreateCustom {
        config: CustomGameOptions,
    },
    JoinGame {
        match_id: MatchId,
    },
    LeaveGame {
        match_id: MatchId,
    },
    Ready {
        match_id: MatchId,
    },
    StartGame {
        match_id: MatchId,
    },
    SubmitSolution {
        match_id: MatchId,
        round_index: RoundIndex,
        code: String,
        language: String,
    },
    SpectateGame {
        match_id: MatchId,
    },
    StopSpectating {
        match_id: MatchId,
    },
    GetGameState {
        match_id: MatchId,
    },
    SendChatMessage {
        match_id: MatchId,
        text: String,
    },
    UserTyping {
        match_id: MatchId,
        is_typing: bool,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchPreferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Owner-supplied lobby settings; everything optional, clamped by the
/// core configuration when the lobby is created.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomGameOptions {
    #[serde(default)]
    pub max_players: Option<usize>,
    #[serde(default)]
    pub round_count: Option<u32>,
    #[serde(default)]
    pub round_time_limit_s: Option<u64>,
    #[serde(default)]
    pub is_private: Option<bool>,
    #[serde(default)]
    pub allow_spectators: Option<bool>,
    #[serde(default)]
    pub language_whitelist: Option<Vec<String>>,
    #[serde(default)]
    pub invited: Vec<crate::base::PlayerId>,
}
