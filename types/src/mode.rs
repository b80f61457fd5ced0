// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{EnumIter, IntoStaticStr};

use crate::grade::CriteriaWeights;

/// Arena game modes. The mode determines round count, per-round time
/// limit, seat count, the scoring curve and the problem source.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    IntoStaticStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MatchMode {
    Casual,
    Ranked,
    Blitz,
    Practice,
    Trivia,
    Debug,
    Custom,
}

impl MatchMode {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// Matched modes go through the queue; custom lobbies are joined by id.
    pub fn is_matchmade(&self) -> bool {
        !matches!(self, MatchMode::Custom)
    }

    pub fn profile(&self) -> ModeProfile {
        match self {
            MatchMode::Casual => ModeProfile {
                round_count: 3,
                round_time_limit: Duration::from_secs(300),
                min_players: 2,
                max_players: 2,
                ranked: false,
                weights: CriteriaWeights::default_scale(),
            },
            MatchMode::Ranked => ModeProfile {
                round_count: 3,
                round_time_limit: Duration::from_secs(300),
                min_players: 2,
                max_players: 2,
                ranked: true,
                weights: CriteriaWeights::default_scale(),
            },
            MatchMode::Blitz => ModeProfile {
                round_count: 10,
                round_time_limit: Duration::from_secs(60),
                min_players: 2,
                max_players: 2,
                ranked: false,
                weights: CriteriaWeights::default_scale(),
            },
            MatchMode::Practice => ModeProfile {
                round_count: 1,
                round_time_limit: Duration::from_secs(300),
                min_players: 1,
                max_players: 1,
                ranked: false,
                weights: CriteriaWeights::default_scale(),
            },
            // Trivia and debug rounds flow through the same pipeline with
            // their own problem payloads; only correctness counts.
            MatchMode::Trivia => ModeProfile {
                round_count: 5,
                round_time_limit: Duration::from_secs(30),
                min_players: 2,
                max_players: 4,
                ranked: false,
                weights: CriteriaWeights::correctness_only(),
            },
            MatchMode::Debug => ModeProfile {
                round_count: 3,
                round_time_limit: Duration::from_secs(300),
                min_players: 2,
                max_players: 2,
                ranked: false,
                weights: CriteriaWeights::correctness_only(),
            },
            MatchMode::Custom => ModeProfile {
                round_count: 3,
                round_time_limit: Duration::from_secs(300),
                min_players: 2,
                max_players: 2,
                ranked: false,
                weights: CriteriaWeights::default_scale(),
            },
        }
    }
}

/// Per-mode parameterization of a match. Custom lobbies start from
/// `MatchMode::Custom.profile()` and apply the owner's clamped overrides.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModeProfile {
    pub round_count: u32,
    pub round_time_limit: Duration,
    pub min_players: usize,
    pub max_players: usize,
    pub ranked: bool,
    pub weights: CriteriaWeights,
}
