// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

use types::base::SubmissionId;
use types::grade::{CriteriaScores, CriteriaWeights, GradeReport, GradeVerdict};
use types::submission::TestOutcome;

const FALLBACK_FEEDBACK: &str = "AI offline — heuristic score";

/// Build the calibrated substitute report used when the grader times out
/// or fails.
///
/// Correctness is derived from the test pass ratio when a sandbox run is
/// available, zero otherwise. Efficiency, readability and style land on
/// the mid-point of their scales; innovation gets nothing, since a
/// heuristic cannot judge it.
pub fn fallback_report(
    submission_id: SubmissionId,
    test_outcome: Option<TestOutcome>,
    verdict: GradeVerdict,
) -> GradeReport {
    debug_assert!(verdict != GradeVerdict::Ok);
    let scale = CriteriaWeights::default_scale();
    let pass_ratio = test_outcome.map(|t| t.pass_ratio()).unwrap_or(0.0);
    GradeReport {
        submission_id,
        verdict,
        scores: CriteriaScores {
            correctness: pass_ratio * scale.correctness,
            efficiency: 0.5 * scale.efficiency,
            readability: 0.5 * scale.readability,
            style: 0.5 * scale.style,
            innovation: 0.0,
        },
        feedback: FALLBACK_FEEDBACK.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_ratio_drives_correctness() {
        // Three of four tests passing: 30 + 12.5 + 10 + 5 + 0 = 57.5.
        let report = fallback_report(
            SubmissionId::generate(),
            Some(TestOutcome { passed: 3, total: 4 }),
            GradeVerdict::GraderError,
        );
        assert!((report.score_total() - 57.5).abs() < 1e-9);
        assert_eq!(report.weighted_score(&CriteriaWeights::default_scale()), 58);
        assert!(report.is_degraded());

        // All four passing: 40 + 12.5 + 10 + 5 + 0 = 67.5.
        let report = fallback_report(
            SubmissionId::generate(),
            Some(TestOutcome { passed: 4, total: 4 }),
            GradeVerdict::GraderError,
        );
        assert_eq!(report.weighted_score(&CriteriaWeights::default_scale()), 68);
    }

    #[test]
    fn no_test_outcome_means_zero_correctness() {
        let report = fallback_report(
            SubmissionId::generate(),
            None,
            GradeVerdict::Timeout,
        );
        assert!((report.scores.correctness - 0.0).abs() < 1e-9);
        assert!((report.score_total() - 27.5).abs() < 1e-9);
    }
}
