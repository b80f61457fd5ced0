// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::base::Rating;

/// Operational configuration of the match core.
///
/// All fields have serde defaults, so operators only specify what they
/// want to change. Per-mode values (round counts, time limits) live in
/// [`crate::mode::ModeProfile`]; these are the process-wide knobs.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Parameters {
    /// Countdown between `starting` and the first round.
    #[serde(default = "Parameters::default_starting_countdown")]
    pub starting_countdown: Duration,

    /// Auto-start delay once a lobby reaches its minimum seat count.
    #[serde(default = "Parameters::default_auto_start_after")]
    pub auto_start_after: Duration,

    /// How long a paired player has to confirm before the pairing is
    /// abandoned and the opponent re-queued at the head.
    #[serde(default = "Parameters::default_confirmation_window")]
    pub confirmation_window: Duration,

    /// How long an unstarted lobby may sit in `waiting` before it is
    /// cancelled.
    #[serde(default = "Parameters::default_waiting_timeout")]
    pub waiting_timeout: Duration,

    /// Slot retention for a disconnected player during a live match.
    #[serde(default = "Parameters::default_grace_disconnect")]
    pub grace_disconnect: Duration,

    /// Wall budget for the whole grading pass of one round.
    #[serde(default = "Parameters::default_grading_time_budget")]
    pub grading_time_budget: Duration,

    /// How long terminal match state stays resyncable before cleanup.
    #[serde(default = "Parameters::default_retention_window")]
    pub retention_window: Duration,

    /// Matchmaking: rating width before the first widening step.
    #[serde(default = "Parameters::default_initial_rating_width")]
    pub initial_rating_width: Rating,

    /// Matchmaking: width added per widening interval of waiting.
    #[serde(default = "Parameters::default_rating_widen_step")]
    pub rating_widen_step: Rating,

    /// Matchmaking: how often the allowed width widens.
    #[serde(default = "Parameters::default_rating_widen_interval")]
    pub rating_widen_interval: Duration,

    /// Matchmaking: the width never exceeds this cap.
    #[serde(default = "Parameters::default_max_rating_width")]
    pub max_rating_width: Rating,

    /// Matchmaking: deadline to fill a multi-seat lobby before starting
    /// with the largest group of at least two.
    #[serde(default = "Parameters::default_fill_deadline")]
    pub fill_deadline: Duration,

    /// Matchmaking: queue sweep cadence.
    #[serde(default = "Parameters::default_sweep_interval")]
    pub sweep_interval: Duration,

    /// Upper bound on accepted solution size, in bytes.
    #[serde(default = "Parameters::default_max_code_len")]
    pub max_code_len: usize,

    /// Languages accepted when a lobby does not narrow the set further.
    #[serde(default = "Parameters::default_language_whitelist")]
    pub language_whitelist: Vec<String>,

    /// Chat messages allowed per connection per ten seconds.
    #[serde(default = "Parameters::default_chat_rate_per_10s")]
    pub chat_rate_per_10s: u32,

    /// Chat messages kept per match for late joiners.
    #[serde(default = "Parameters::default_chat_history_size")]
    pub chat_history_size: usize,

    /// Upper bound on one chat message, in characters.
    #[serde(default = "Parameters::default_chat_max_len")]
    pub chat_max_len: usize,

    /// Custom lobbies: seat cap an owner cannot exceed.
    #[serde(default = "Parameters::default_custom_max_players")]
    pub custom_max_players: usize,

    /// Custom lobbies: round cap an owner cannot exceed.
    #[serde(default = "Parameters::default_custom_max_rounds")]
    pub custom_max_rounds: u32,

    /// Custom lobbies: per-round time limit cap.
    #[serde(default = "Parameters::default_custom_max_round_time")]
    pub custom_max_round_time: Duration,

    /// Live matches one process will host before pushing back on the
    /// matchmaker.
    #[serde(default = "Parameters::default_max_live_matches")]
    pub max_live_matches: usize,

    /// Capacity of every actor mailbox.
    #[serde(default = "Parameters::default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    /// State store retry policy: first backoff delay.
    #[serde(default = "Parameters::default_store_retry_initial")]
    pub store_retry_initial: Duration,

    /// State store retry policy: backoff ceiling.
    #[serde(default = "Parameters::default_store_retry_max")]
    pub store_retry_max: Duration,

    /// State store retry policy: attempts before a match escalates to
    /// cancellation.
    #[serde(default = "Parameters::default_store_retry_attempts")]
    pub store_retry_attempts: u32,
}

impl Parameters {
    fn default_starting_countdown() -> Duration {
        Duration::from_secs(3)
    }

    fn default_auto_start_after() -> Duration {
        Duration::from_secs(10)
    }

    fn default_confirmation_window() -> Duration {
        Duration::from_secs(10)
    }

    fn default_waiting_timeout() -> Duration {
        Duration::from_secs(30 * 60)
    }

    fn default_grace_disconnect() -> Duration {
        Duration::from_secs(60)
    }

    fn default_grading_time_budget() -> Duration {
        Duration::from_secs(30)
    }

    fn default_retention_window() -> Duration {
        Duration::from_secs(5 * 60)
    }

    fn default_initial_rating_width() -> Rating {
        50
    }

    fn default_rating_widen_step() -> Rating {
        100
    }

    fn default_rating_widen_interval() -> Duration {
        Duration::from_secs(5)
    }

    fn default_max_rating_width() -> Rating {
        500
    }

    fn default_fill_deadline() -> Duration {
        Duration::from_secs(30)
    }

    fn default_sweep_interval() -> Duration {
        Duration::from_secs(1)
    }

    fn default_max_code_len() -> usize {
        50_000
    }

    fn default_language_whitelist() -> Vec<String> {
        ["python", "javascript", "java", "cpp", "c", "rust"]
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    fn default_chat_rate_per_10s() -> u32 {
        10
    }

    fn default_chat_history_size() -> usize {
        200
    }

    fn default_chat_max_len() -> usize {
        200
    }

    fn default_custom_max_players() -> usize {
        8
    }

    fn default_custom_max_rounds() -> u32 {
        10
    }

    fn default_custom_max_round_time() -> Duration {
        Duration::from_secs(7_200)
    }

    fn default_max_live_matches() -> usize {
        1_024
    }

    fn default_mailbox_capacity() -> usize {
        256
    }

    fn default_store_retry_initial() -> Duration {
        Duration::from_millis(100)
    }

    fn default_store_retry_max() -> Duration {
        Duration::from_secs(5)
    }

    fn default_store_retry_attempts() -> u32 {
        5
    }
}

impl Default for Parameters {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(Default::default()))
            .expect("empty object deserializes via field defaults")
    }
}
