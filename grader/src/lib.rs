// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

//! The grading boundary of the match core.
//!
//! The core never inspects code itself; it hands every retained
//! submission to a [`GraderClient`] with an absolute deadline and turns
//! whatever comes back (a report, an error, or silence) into exactly one
//! [`GradeReport`] per submission. When the grader is unavailable the
//! heuristic fallback keeps the match progressing.

mod fallback;
mod mock;
mod sandbox;

pub use fallback::fallback_report;
pub use mock::{GradeScript, MockGrader};
pub use sandbox::{MockSandbox, SandboxClient, SandboxError};

use async_trait::async_trait;
use thiserror::Error;

use types::base::{MatchId, RoundIndex, SubmissionId};
use types::grade::GradeReport;
use types::problem::Problem;
use types::submission::TestOutcome;

#[derive(Clone, Debug, Error)]
pub enum GraderError {
    #[error("grader unavailable: {0}")]
    Unavailable(String),

    #[error("grader rejected the submission: {0}")]
    Invalid(String),
}

/// One grading request. `test_outcome` is the sandbox result when the
/// problem ships executable tests; the fallback verdict derives
/// correctness from it.
#[derive(Clone, Debug)]
pub struct GradeRequest {
    pub submission_id: SubmissionId,
    pub match_id: MatchId,
    pub round_index: RoundIndex,
    pub problem: Problem,
    pub code: String,
    pub language: String,
    pub test_outcome: Option<TestOutcome>,
}

/// Narrow async interface to the external grader.
///
/// Implementations must be idempotent on `submission_id` within a match
/// lifetime: the runtime may re-issue a request it believes was lost and
/// expects the same report back. Criterion points are absolute on the
/// default scales and sum to at most 100; the core does not re-normalize.
#[async_trait]
pub trait GraderClient: Send + Sync + 'static {
    async fn grade(&self, request: GradeRequest) -> Result<GradeReport, GraderError>;
}
