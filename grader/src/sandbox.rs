// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use types::problem::Problem;
use types::submission::TestOutcome;

#[derive(Clone, Debug, Error)]
pub enum SandboxError {
    #[error("sandbox unavailable: {0}")]
    Unavailable(String),

    #[error("submission could not be executed: {0}")]
    ExecutionFailed(String),
}

/// Narrow interface to the container sandbox that runs a submission
/// against a problem's test set. The core only consumes the aggregate
/// outcome; a failure here degrades grading, it never blocks a round.
#[async_trait]
pub trait SandboxClient: Send + Sync + 'static {
    async fn run_tests(
        &self,
        code: &str,
        language: &str,
        problem: &Problem,
    ) -> Result<TestOutcome, SandboxError>;
}

/// Scripted sandbox for tests: outcomes are keyed by exact code payload,
/// with an optional default for everything else.
pub struct MockSandbox {
    by_code: Mutex<HashMap<String, TestOutcome>>,
    default: Mutex<Option<TestOutcome>>,
}

impl MockSandbox {
    pub fn new() -> Self {
        Self {
            by_code: Mutex::new(HashMap::new()),
            default: Mutex::new(None),
        }
    }

    pub fn with_default(outcome: TestOutcome) -> Self {
        let sandbox = Self::new();
        *sandbox.default.lock() = Some(outcome);
        sandbox
    }

    pub fn script_code(&self, code: impl Into<String>, outcome: TestOutcome) {
        self.by_code.lock().insert(code.into(), outcome);
    }
}

impl Default for MockSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxClient for MockSandbox {
    async fn run_tests(
        &self,
        code: &str,
        _language: &str,
        _problem: &Problem,
    ) -> Result<TestOutcome, SandboxError> {
        if let Some(outcome) = self.by_code.lock().get(code) {
            return Ok(*outcome);
        }
        self.default
            .lock()
            .ok_or_else(|| SandboxError::Unavailable("no scripted outcome".to_string()))
    }
}
