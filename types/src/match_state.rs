// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

//! The match aggregate and its transition rules.
//!
//! `MatchState` is pure data plus invariant-enforcing mutations; it never
//! performs IO. The per-match runtime task is the only writer; everything
//! else observes the aggregate through versioned [`MatchSnapshot`]s. Every
//! successful mutation bumps `version`, which is the CAS key for snapshot
//! persistence and the gap-detection cursor for event streams.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::IntoStaticStr;

use crate::base::{MatchId, PlayerId, RoundIndex, SubmissionId, TimestampMs, Version};
use crate::ensure;
use crate::error::{ArenaError, ArenaResult};
use crate::grade::{CriteriaWeights, GradeReport};
use crate::mode::MatchMode;
use crate::player::{PlayerProfile, PlayerSlot, PlayerView};
use crate::problem::{Problem, ProblemView};
use crate::round::{Round, RoundStatus};
use crate::submission::Submission;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Waiting,
    Starting,
    InProgress,
    Completed,
    Cancelled,
}

impl MatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, MatchStatus::Completed | MatchStatus::Cancelled)
    }

    /// Forward-only transitions; `Cancelled` is reachable from any
    /// pre-terminal state.
    fn can_advance_to(self, next: MatchStatus) -> bool {
        match (self, next) {
            (MatchStatus::Waiting, MatchStatus::Starting)
            | (MatchStatus::Starting, MatchStatus::InProgress)
            | (MatchStatus::InProgress, MatchStatus::Completed) => true,
            (from, MatchStatus::Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Why a match reached a terminal state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Completed,
    Forfeit { winner: PlayerId },
    Cancelled { reason: CancelReason },
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    OwnerCancelled,
    WaitTimeout,
    ConfirmTimeout,
    PlayerDropped,
    AllDisconnected,
    StoreUnavailable,
    Shutdown,
    Internal,
}

/// Frozen parameterization of one match.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchConfig {
    pub mode: MatchMode,
    pub round_count: u32,
    pub round_time_limit: Duration,
    pub min_players: usize,
    pub max_players: usize,
    pub is_private: bool,
    pub is_ranked: bool,
    pub allow_spectators: bool,
    pub language_whitelist: Vec<String>,
    /// Spectator allow-list for private lobbies.
    pub invited: Vec<PlayerId>,
    pub weights: CriteriaWeights,
}

impl MatchConfig {
    pub fn for_mode(mode: MatchMode, language_whitelist: Vec<String>) -> Self {
        let profile = mode.profile();
        Self {
            mode,
            round_count: profile.round_count,
            round_time_limit: profile.round_time_limit,
            min_players: profile.min_players,
            max_players: profile.max_players,
            is_private: false,
            is_ranked: profile.ranked,
            allow_spectators: true,
            language_whitelist,
            invited: Vec::new(),
            weights: profile.weights,
        }
    }
}

/// Final placement of one player.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Standing {
    pub rank: u32,
    pub player_id: PlayerId,
    pub display_name: String,
    pub total: u32,
    pub forfeited: bool,
}

/// Per-player outcome of one closed round, used to build the round
/// result broadcast.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoundOutcome {
    pub player_id: PlayerId,
    pub score: u32,
    pub total: u32,
    pub grade: Option<GradeReport>,
}

/// The match aggregate. Exclusively owned by its runtime task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MatchState {
    pub match_id: MatchId,
    pub config: MatchConfig,
    pub owner: Option<PlayerId>,
    pub players: Vec<PlayerSlot>,
    pub spectators: Vec<PlayerId>,
    pub rounds: Vec<Round>,
    pub cursor: RoundIndex,
    pub status: MatchStatus,
    pub created_at: TimestampMs,
    pub started_at: Option<TimestampMs>,
    pub ended_at: Option<TimestampMs>,
    pub end_reason: Option<EndReason>,
    pub version: Version,
}

impl MatchState {
    pub fn new(
        match_id: MatchId,
        config: MatchConfig,
        owner: Option<PlayerId>,
        now: TimestampMs,
    ) -> Self {
        Self {
            match_id,
            config,
            owner,
            players: Vec::new(),
            spectators: Vec::new(),
            rounds: Vec::new(),
            cursor: 0,
            status: MatchStatus::Waiting,
            created_at: now,
            started_at: None,
            ended_at: None,
            end_reason: None,
            version: 0,
        }
    }

    fn touch(&mut self) {
        self.version += 1;
    }

    fn advance(&mut self, next: MatchStatus) -> ArenaResult<()> {
        if !self.status.can_advance_to(next) {
            return Err(ArenaError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn slot(&self, player_id: PlayerId) -> Option<&PlayerSlot> {
        self.players.iter().find(|s| s.player_id() == player_id)
    }

    fn slot_mut(&mut self, player_id: PlayerId) -> ArenaResult<&mut PlayerSlot> {
        self.players
            .iter_mut()
            .find(|s| s.player_id() == player_id)
            .ok_or(ArenaError::UnknownPlayer(player_id))
    }

    pub fn is_player(&self, player_id: PlayerId) -> bool {
        self.slot(player_id).is_some()
    }

    pub fn is_spectator(&self, player_id: PlayerId) -> bool {
        self.spectators.contains(&player_id)
    }

    pub fn active_players(&self) -> impl Iterator<Item = &PlayerSlot> {
        self.players.iter().filter(|s| s.is_active())
    }

    pub fn connected_players(&self) -> usize {
        self.players.iter().filter(|s| s.connected).count()
    }

    /// Everyone who has not forfeited has marked themselves ready.
    pub fn all_ready(&self) -> bool {
        self.players.len() >= self.config.min_players
            && self.active_players().all(|s| s.ready)
    }

    // ---- roster ---------------------------------------------------------

    pub fn add_player(&mut self, profile: PlayerProfile, now: TimestampMs) -> ArenaResult<()> {
        ensure!(
            self.status == MatchStatus::Waiting,
            ArenaError::InvalidTransition {
                from: self.status,
                to: MatchStatus::Waiting,
            }
        );
        ensure!(
            !self.is_player(profile.player_id),
            ArenaError::DuplicatePlayer(profile.player_id)
        );
        ensure!(
            self.players.len() < self.config.max_players,
            ArenaError::Rejected(crate::error::Reject::new(
                crate::error::ErrorCode::MatchFull,
                "match is full",
            ))
        );
        self.players.push(PlayerSlot::new(profile, now));
        self.touch();
        Ok(())
    }

    /// Remove a seat before the match starts. Post-start departures are
    /// forfeits, not removals.
    pub fn remove_player(&mut self, player_id: PlayerId) -> ArenaResult<PlayerSlot> {
        let idx = self
            .players
            .iter()
            .position(|s| s.player_id() == player_id)
            .ok_or(ArenaError::UnknownPlayer(player_id))?;
        let slot = self.players.remove(idx);
        self.touch();
        Ok(slot)
    }

    pub fn mark_ready(&mut self, player_id: PlayerId) -> ArenaResult<()> {
        self.slot_mut(player_id)?.ready = true;
        self.touch();
        Ok(())
    }

    pub fn set_connected(
        &mut self,
        player_id: PlayerId,
        connected: bool,
        now: TimestampMs,
    ) -> ArenaResult<()> {
        let slot = self.slot_mut(player_id)?;
        slot.connected = connected;
        slot.last_seen_at = now;
        self.touch();
        Ok(())
    }

    pub fn mark_forfeited(&mut self, player_id: PlayerId) -> ArenaResult<()> {
        let slot = self.slot_mut(player_id)?;
        slot.forfeited = true;
        slot.connected = false;
        self.touch();
        Ok(())
    }

    pub fn add_spectator(&mut self, player_id: PlayerId) {
        if !self.spectators.contains(&player_id) {
            self.spectators.push(player_id);
            self.touch();
        }
    }

    pub fn remove_spectator(&mut self, player_id: PlayerId) -> bool {
        let before = self.spectators.len();
        self.spectators.retain(|id| *id != player_id);
        if self.spectators.len() != before {
            self.touch();
            true
        } else {
            false
        }
    }

    // ---- lifecycle ------------------------------------------------------

    pub fn begin_starting(&mut self) -> ArenaResult<()> {
        self.advance(MatchStatus::Starting)?;
        self.touch();
        Ok(())
    }

    pub fn begin(&mut self, now: TimestampMs) -> ArenaResult<()> {
        self.advance(MatchStatus::InProgress)?;
        self.started_at = Some(now);
        self.touch();
        Ok(())
    }

    /// Append the round at the cursor position in `pending` state.
    pub fn push_round(&mut self, problem: Problem) -> ArenaResult<()> {
        ensure!(
            self.status == MatchStatus::InProgress || self.status == MatchStatus::Starting,
            ArenaError::InvalidTransition {
                from: self.status,
                to: MatchStatus::InProgress,
            }
        );
        ensure!(
            self.rounds.len() == self.cursor as usize && self.cursor < self.config.round_count,
            ArenaError::NoSuchRound(self.cursor)
        );
        self.rounds.push(Round::new(self.cursor, problem));
        self.touch();
        Ok(())
    }

    pub fn current_round(&self) -> ArenaResult<&Round> {
        self.rounds
            .get(self.cursor as usize)
            .ok_or(ArenaError::NoSuchRound(self.cursor))
    }

    pub fn current_round_mut(&mut self) -> ArenaResult<&mut Round> {
        let cursor = self.cursor;
        self.rounds
            .get_mut(cursor as usize)
            .ok_or(ArenaError::NoSuchRound(cursor))
    }

    pub fn open_round(&mut self, now: TimestampMs, deadline: TimestampMs) -> ArenaResult<()> {
        self.current_round_mut()?.open(now, deadline)?;
        self.touch();
        Ok(())
    }

    pub fn accept_submission(&mut self, submission: Submission) -> ArenaResult<SubmissionId> {
        let player_id = submission.player_id;
        let submitted_at = submission.submitted_at;
        ensure!(
            self.slot(player_id).is_some_and(|s| s.is_active()),
            ArenaError::UnknownPlayer(player_id)
        );
        let id = self.current_round_mut()?.accept_submission(submission)?;
        self.slot_mut(player_id)?.last_submitted_at = Some(submitted_at);
        self.touch();
        Ok(id)
    }

    /// All players still competing have a retained submission for the
    /// current round.
    pub fn all_submitted(&self) -> bool {
        match self.current_round() {
            Ok(round) => self
                .active_players()
                .all(|s| round.submissions.contains_key(&s.player_id())),
            Err(_) => false,
        }
    }

    pub fn begin_grading(&mut self) -> ArenaResult<()> {
        self.current_round_mut()?.begin_grading()?;
        self.touch();
        Ok(())
    }

    pub fn record_grade(&mut self, report: GradeReport) -> ArenaResult<()> {
        self.current_round_mut()?.record_grade(report);
        self.touch();
        Ok(())
    }

    /// Score and close the current round, advance the cursor, and complete
    /// the match when this was the last round. Absent or ungraded players
    /// score zero.
    pub fn close_round(&mut self, now: TimestampMs) -> ArenaResult<Vec<RoundOutcome>> {
        let weights = self.config.weights;
        let round = self.current_round_mut()?;
        let mut outcomes = Vec::new();
        let mut scored: Vec<(PlayerId, u32, Option<GradeReport>)> = Vec::new();
        for (player_id, submission) in &round.submissions {
            let grade = round.grades.get(&submission.submission_id).cloned();
            let score = grade
                .as_ref()
                .map(|g| g.weighted_score(&weights))
                .unwrap_or(0);
            scored.push((*player_id, score, grade));
        }
        for (player_id, score, _) in &scored {
            round.scores.insert(*player_id, *score);
        }
        round.close()?;

        let player_ids: Vec<PlayerId> = self.players.iter().map(|s| s.player_id()).collect();
        for player_id in player_ids {
            let (score, grade) = scored
                .iter()
                .find(|(id, _, _)| *id == player_id)
                .map(|(_, score, grade)| (*score, grade.clone()))
                .unwrap_or((0, None));
            let slot = self.slot_mut(player_id)?;
            slot.total += score;
            outcomes.push(RoundOutcome {
                player_id,
                score,
                total: slot.total,
                grade,
            });
        }

        self.cursor += 1;
        if self.cursor == self.config.round_count {
            self.advance(MatchStatus::Completed)?;
            self.ended_at = Some(now);
            self.end_reason = Some(EndReason::Completed);
        }
        self.touch();
        Ok(outcomes)
    }

    pub fn complete_by_forfeit(&mut self, winner: PlayerId, now: TimestampMs) -> ArenaResult<()> {
        self.advance(MatchStatus::Completed)?;
        self.ended_at = Some(now);
        self.end_reason = Some(EndReason::Forfeit { winner });
        self.touch();
        Ok(())
    }

    pub fn cancel(&mut self, reason: CancelReason, now: TimestampMs) -> ArenaResult<()> {
        self.advance(MatchStatus::Cancelled)?;
        self.ended_at = Some(now);
        self.end_reason = Some(EndReason::Cancelled { reason });
        self.touch();
        Ok(())
    }

    // ---- views ----------------------------------------------------------

    /// Final placements: total descending, earliest last submission wins
    /// ties, forfeited players sink below everyone with the same total.
    pub fn standings(&self) -> Vec<Standing> {
        let mut entries: Vec<&PlayerSlot> = self.players.iter().collect();
        entries.sort_by_key(|s| {
            (
                std::cmp::Reverse(s.total),
                s.forfeited,
                s.last_submitted_at.unwrap_or(TimestampMs::MAX),
            )
        });
        entries
            .into_iter()
            .enumerate()
            .map(|(i, slot)| Standing {
                rank: i as u32 + 1,
                player_id: slot.player_id(),
                display_name: slot.profile.display_name.clone(),
                total: slot.total,
                forfeited: slot.forfeited,
            })
            .collect()
    }

    pub fn snapshot(&self) -> MatchSnapshot {
        let current_round = self.rounds.get(self.cursor as usize).map(|round| RoundView {
            round_index: round.round_index,
            status: round.status,
            // The problem is only revealed once the round opens.
            problem: (round.status != RoundStatus::Pending).then(|| round.problem.public_view()),
            deadline_at: round.deadline_at,
            submitted: round.submitted_players(),
        });
        MatchSnapshot {
            match_id: self.match_id,
            version: self.version,
            status: self.status,
            mode: self.config.mode,
            cursor: self.cursor,
            round_count: self.config.round_count,
            players: self.players.iter().map(PlayerView::from).collect(),
            spectator_count: self.spectators.len(),
            current_round,
            end_reason: self.end_reason.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}

/// Immutable, versioned copy of match state suitable for transport and
/// recovery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchSnapshot {
    pub match_id: MatchId,
    pub version: Version,
    pub status: MatchStatus,
    pub mode: MatchMode,
    pub cursor: RoundIndex,
    pub round_count: u32,
    pub players: Vec<PlayerView>,
    pub spectator_count: usize,
    pub current_round: Option<RoundView>,
    pub end_reason: Option<EndReason>,
    pub created_at: TimestampMs,
    pub started_at: Option<TimestampMs>,
    pub ended_at: Option<TimestampMs>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundView {
    pub round_index: RoundIndex,
    pub status: RoundStatus,
    pub problem: Option<ProblemView>,
    pub deadline_at: Option<TimestampMs>,
    pub submitted: Vec<PlayerId>,
}
