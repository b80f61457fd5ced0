// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use strum_macros::IntoStaticStr;

use crate::base::ProblemId;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

/// A problem loaded for a round. Immutable once served; the core only
/// looks at the id and difficulty, the payload is mode-specific.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub problem_id: ProblemId,
    pub title: String,
    pub statement: String,
    pub difficulty: Difficulty,
    pub example: Option<String>,
    /// Reference solution and hidden tests; never leaves the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<serde_json::Value>,
}

impl Problem {
    /// The view broadcast in `round_start`: everything except the
    /// reference material.
    pub fn public_view(&self) -> ProblemView {
        ProblemView {
            problem_id: self.problem_id.clone(),
            title: self.title.clone(),
            statement: self.statement.clone(),
            difficulty: self.difficulty,
            example: self.example.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProblemView {
    pub problem_id: ProblemId,
    pub title: String,
    pub statement: String,
    pub difficulty: Difficulty,
    pub example: Option<String>,
}
