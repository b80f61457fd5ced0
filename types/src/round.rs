// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum_macros::IntoStaticStr;

use crate::base::{PlayerId, RoundIndex, SubmissionId, TimestampMs};
use crate::error::{ArenaError, ArenaResult};
use crate::grade::GradeReport;
use crate::problem::Problem;
use crate::submission::Submission;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Pending,
    Open,
    Grading,
    Closed,
}

impl RoundStatus {
    fn can_advance_to(self, next: RoundStatus) -> bool {
        matches!(
            (self, next),
            (RoundStatus::Pending, RoundStatus::Open)
                | (RoundStatus::Open, RoundStatus::Grading)
                | (RoundStatus::Grading, RoundStatus::Closed)
        )
    }
}

/// One problem within a match, with its own deadline and grading pass.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Round {
    pub round_index: RoundIndex,
    pub problem: Problem,
    pub status: RoundStatus,
    pub started_at: Option<TimestampMs>,
    pub deadline_at: Option<TimestampMs>,
    pub submissions: HashMap<PlayerId, Submission>,
    pub grades: HashMap<SubmissionId, GradeReport>,
    pub scores: HashMap<PlayerId, u32>,
    /// Set when any grade in the round came from the fallback path.
    pub grading_degraded: bool,
}

impl Round {
    pub fn new(round_index: RoundIndex, problem: Problem) -> Self {
        Self {
            round_index,
            problem,
            status: RoundStatus::Pending,
            started_at: None,
            deadline_at: None,
            submissions: HashMap::new(),
            grades: HashMap::new(),
            scores: HashMap::new(),
            grading_degraded: false,
        }
    }

    fn advance(&mut self, next: RoundStatus) -> ArenaResult<()> {
        if !self.status.can_advance_to(next) {
            return Err(ArenaError::InvalidRoundTransition {
                round: self.round_index,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn open(&mut self, now: TimestampMs, deadline: TimestampMs) -> ArenaResult<()> {
        self.advance(RoundStatus::Open)?;
        self.started_at = Some(now);
        self.deadline_at = Some(deadline);
        Ok(())
    }

    pub fn begin_grading(&mut self) -> ArenaResult<()> {
        self.advance(RoundStatus::Grading)
    }

    pub fn close(&mut self) -> ArenaResult<()> {
        self.advance(RoundStatus::Closed)
    }

    /// Retain a submission, superseding any earlier one from the same
    /// player. Only legal while the round is open; the deadline itself is
    /// enforced by the runtime's timer.
    pub fn accept_submission(&mut self, submission: Submission) -> ArenaResult<SubmissionId> {
        if self.status != RoundStatus::Open {
            return Err(ArenaError::InvalidRoundTransition {
                round: self.round_index,
                from: self.status,
                to: RoundStatus::Open,
            });
        }
        let id = submission.submission_id;
        self.submissions.insert(submission.player_id, submission);
        Ok(id)
    }

    pub fn record_grade(&mut self, report: GradeReport) {
        if report.is_degraded() {
            self.grading_degraded = true;
        }
        self.grades.insert(report.submission_id, report);
    }

    pub fn graded_count(&self) -> usize {
        self.grades.len()
    }

    pub fn submitted_players(&self) -> Vec<PlayerId> {
        self.submissions.keys().copied().collect()
    }
}
