// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use types::base::{MatchId, PlayerId, TimestampMs};
use types::match_state::{EndReason, Standing};
use types::mode::MatchMode;
use types::problem::{Difficulty, Problem};

#[derive(Clone, Debug, Error)]
pub enum RecordError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),

    #[error("no problems available for {mode:?}")]
    NoProblems { mode: MatchMode },
}

/// Durable record of a finished match, written once at termination.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MatchRecord {
    pub match_id: MatchId,
    pub mode: MatchMode,
    pub ranked: bool,
    pub standings: Vec<Standing>,
    /// Per-round scores, one map per closed round.
    pub round_scores: Vec<HashMap<PlayerId, u32>>,
    pub end_reason: EndReason,
    pub started_at: Option<TimestampMs>,
    pub ended_at: TimestampMs,
}

/// Persistence boundary for users, problems and final results. Rating
/// updates for ranked matches happen behind this interface, not in the
/// core.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Pick a problem for a round. Implementations fall back to any
    /// difficulty rather than failing when the requested one is empty.
    async fn fetch_problem(
        &self,
        mode: MatchMode,
        difficulty: Option<Difficulty>,
    ) -> Result<Problem, RecordError>;

    async fn save_match_record(&self, record: MatchRecord) -> Result<(), RecordError>;
}

/// In-memory problem bank plus a log of saved records, for tests and
/// single-process runs.
pub struct MemoryRecordStore {
    problems: Mutex<Vec<Problem>>,
    saved: Mutex<Vec<MatchRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self {
            problems: Mutex::new(Vec::new()),
            saved: Mutex::new(Vec::new()),
        }
    }

    pub fn with_problems(problems: Vec<Problem>) -> Self {
        let store = Self::new();
        *store.problems.lock() = problems;
        store
    }

    pub fn seed_problem(&self, problem: Problem) {
        self.problems.lock().push(problem);
    }

    pub fn saved_records(&self) -> Vec<MatchRecord> {
        self.saved.lock().clone()
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn fetch_problem(
        &self,
        mode: MatchMode,
        difficulty: Option<Difficulty>,
    ) -> Result<Problem, RecordError> {
        let problems = self.problems.lock();
        let matching: Vec<&Problem> = match difficulty {
            Some(wanted) => problems.iter().filter(|p| p.difficulty == wanted).collect(),
            None => problems.iter().collect(),
        };
        let pool = if matching.is_empty() {
            problems.iter().collect()
        } else {
            matching
        };
        pool.choose(&mut rand::thread_rng())
            .map(|p| (*p).clone())
            .ok_or(RecordError::NoProblems { mode })
    }

    async fn save_match_record(&self, record: MatchRecord) -> Result<(), RecordError> {
        self.saved.lock().push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problem(id: &str, difficulty: Difficulty) -> Problem {
        Problem {
            problem_id: id.into(),
            title: id.to_string(),
            statement: "s".to_string(),
            difficulty,
            example: None,
            reference: None,
        }
    }

    #[tokio::test]
    async fn falls_back_to_any_difficulty() {
        let store =
            MemoryRecordStore::with_problems(vec![problem("easy-1", Difficulty::Easy)]);
        let picked = store
            .fetch_problem(MatchMode::Casual, Some(Difficulty::Hard))
            .await
            .unwrap();
        assert_eq!(picked.problem_id, "easy-1".into());
    }

    #[tokio::test]
    async fn empty_bank_is_an_error() {
        let store = MemoryRecordStore::new();
        let err = store.fetch_problem(MatchMode::Blitz, None).await.unwrap_err();
        assert!(matches!(err, RecordError::NoProblems { mode: MatchMode::Blitz }));
    }
}
