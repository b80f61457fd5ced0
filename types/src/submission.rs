// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

use crate::base::{MatchId, PlayerId, RoundIndex, SubmissionId, TimestampMs};

/// One accepted solution upload. Immutable; a later upload by the same
/// player in the same round supersedes it entirely.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub submission_id: SubmissionId,
    pub match_id: MatchId,
    pub round_index: RoundIndex,
    pub player_id: PlayerId,
    pub code: String,
    pub language: String,
    pub submitted_at: TimestampMs,
}

/// Sandbox test-run outcome attached to a submission when available; the
/// fallback verdict derives correctness from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub passed: u32,
    pub total: u32,
}

impl TestOutcome {
    pub fn pass_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            f64::from(self.passed) / f64::from(self.total)
        }
    }
}

/// Validate a code payload before intake: bounded size, valid UTF-8 is
/// guaranteed by the type, and no control characters beyond tab/newline.
pub fn validate_code(code: &str, max_len: usize) -> Result<(), CodeRejection> {
    if code.trim().is_empty() {
        return Err(CodeRejection::Empty);
    }
    if code.len() > max_len {
        return Err(CodeRejection::TooLong {
            len: code.len(),
            max: max_len,
        });
    }
    if let Some(ch) = code
        .chars()
        .find(|c| c.is_control() && !matches!(c, '\t' | '\n' | '\r'))
    {
        return Err(CodeRejection::ControlCharacter(ch));
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodeRejection {
    Empty,
    TooLong { len: usize, max: usize },
    ControlCharacter(char),
}

impl std::fmt::Display for CodeRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodeRejection::Empty => write!(f, "code must not be empty"),
            CodeRejection::TooLong { len, max } => {
                write!(f, "code is {len} bytes, limit is {max}")
            }
            CodeRejection::ControlCharacter(ch) => {
                write!(f, "code contains control character {:?}", ch)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_code() {
        assert_eq!(validate_code("def solve():\n\treturn 42\n", 50_000), Ok(()));
    }

    #[test]
    fn rejects_empty_and_oversized_and_control_chars() {
        assert_eq!(validate_code("   \n", 100), Err(CodeRejection::Empty));
        assert!(matches!(
            validate_code("x = 1", 3),
            Err(CodeRejection::TooLong { len: 5, max: 3 })
        ));
        assert_eq!(
            validate_code("print('hi')\u{7}", 100),
            Err(CodeRejection::ControlCharacter('\u{7}'))
        );
    }

    #[test]
    fn zero_test_total_means_zero_pass_ratio() {
        let outcome = TestOutcome { passed: 0, total: 0 };
        assert_eq!(outcome.pass_ratio(), 0.0);
    }
}
