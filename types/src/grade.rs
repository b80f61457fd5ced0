// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

//! Grade reports and the criteria arithmetic behind round scores.
//!
//! A grader scores five criteria in absolute points on fixed default
//! scales (correctness 0–40, efficiency 0–25, readability 0–20, style
//! 0–10, innovation 0–5, at most 100 in total). Modes re-weight the
//! criteria; the default weights equal the default scales, so an
//! unmodified report scores its own total.

use serde::{Deserialize, Serialize};
use strum_macros::IntoStaticStr;

use crate::base::SubmissionId;

/// Absolute criterion points, on the default scales above.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CriteriaScores {
    pub correctness: f64,
    pub efficiency: f64,
    pub readability: f64,
    pub style: f64,
    pub innovation: f64,
}

impl CriteriaScores {
    pub const ZERO: CriteriaScores = CriteriaScores {
        correctness: 0.0,
        efficiency: 0.0,
        readability: 0.0,
        style: 0.0,
        innovation: 0.0,
    };

    pub fn new(
        correctness: f64,
        efficiency: f64,
        readability: f64,
        style: f64,
        innovation: f64,
    ) -> Self {
        Self {
            correctness,
            efficiency,
            readability,
            style,
            innovation,
        }
    }

    pub fn total(&self) -> f64 {
        self.correctness + self.efficiency + self.readability + self.style + self.innovation
    }

    /// Clamp every criterion into its scale so a misbehaving grader cannot
    /// push a round score above the cap.
    pub fn clamped(&self) -> Self {
        let scale = CriteriaWeights::default_scale();
        Self {
            correctness: self.correctness.clamp(0.0, scale.correctness),
            efficiency: self.efficiency.clamp(0.0, scale.efficiency),
            readability: self.readability.clamp(0.0, scale.readability),
            style: self.style.clamp(0.0, scale.style),
            innovation: self.innovation.clamp(0.0, scale.innovation),
        }
    }
}

/// Mode weighting of the criteria; weights sum to 100.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CriteriaWeights {
    pub correctness: f64,
    pub efficiency: f64,
    pub readability: f64,
    pub style: f64,
    pub innovation: f64,
}

impl CriteriaWeights {
    /// The default weights double as the grading scales.
    pub const fn default_scale() -> Self {
        Self {
            correctness: 40.0,
            efficiency: 25.0,
            readability: 20.0,
            style: 10.0,
            innovation: 5.0,
        }
    }

    pub const fn correctness_only() -> Self {
        Self {
            correctness: 100.0,
            efficiency: 0.0,
            readability: 0.0,
            style: 0.0,
            innovation: 0.0,
        }
    }

    pub fn total(&self) -> f64 {
        self.correctness + self.efficiency + self.readability + self.style + self.innovation
    }
}

impl Default for CriteriaWeights {
    fn default() -> Self {
        Self::default_scale()
    }
}

/// Outcome class of one grading attempt.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
pub enum GradeVerdict {
    /// Grader produced a full report.
    Ok,
    /// Grader call failed; criteria carry the heuristic fallback.
    GraderError,
    /// Grader did not answer before the grading deadline.
    Timeout,
    /// Submission could not be graded at all (e.g. rejected payload).
    Invalid,
}

/// One report per retained submission, produced exactly once and cached
/// for the match lifetime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GradeReport {
    pub submission_id: SubmissionId,
    pub verdict: GradeVerdict,
    pub scores: CriteriaScores,
    pub feedback: String,
}

impl GradeReport {
    pub fn score_total(&self) -> f64 {
        self.scores.total()
    }

    /// Whether the report came from the heuristic fallback path rather
    /// than the grader ("AI offline — heuristic score").
    pub fn is_degraded(&self) -> bool {
        self.verdict != GradeVerdict::Ok
    }

    /// Convert criterion points into a round score under mode weights,
    /// rounded half away from zero to an integer.
    pub fn weighted_score(&self, weights: &CriteriaWeights) -> u32 {
        let scale = CriteriaWeights::default_scale();
        let scores = self.scores.clamped();
        let fraction = |points: f64, max: f64| if max > 0.0 { points / max } else { 0.0 };
        let raw = fraction(scores.correctness, scale.correctness) * weights.correctness
            + fraction(scores.efficiency, scale.efficiency) * weights.efficiency
            + fraction(scores.readability, scale.readability) * weights.readability
            + fraction(scores.style, scale.style) * weights.style
            + fraction(scores.innovation, scale.innovation) * weights.innovation;
        raw.round() as u32
    }
}
