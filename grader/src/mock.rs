// Copyright (c) Arena Contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use types::base::SubmissionId;
use types::grade::{CriteriaScores, GradeReport, GradeVerdict};

use crate::{GradeRequest, GraderClient, GraderError};

/// What the mock should do for one submission.
#[derive(Clone, Debug)]
pub enum GradeScript {
    /// Return a report with these criterion points.
    Score(CriteriaScores),
    /// Fail the call.
    Fail(String),
    /// Never answer; the caller's deadline has to fire.
    Hang,
}

/// Scripted grader for tests.
///
/// Honors the idempotence contract: once a report has been served for a
/// submission id, the same report is served again regardless of later
/// script changes.
pub struct MockGrader {
    default_script: Mutex<GradeScript>,
    scripts: Mutex<HashMap<SubmissionId, GradeScript>>,
    /// Scripts keyed by exact code payload, for callers that do not know
    /// the submission id ahead of time.
    code_scripts: Mutex<HashMap<String, GradeScript>>,
    served: Mutex<HashMap<SubmissionId, GradeReport>>,
    latency: Mutex<Duration>,
    calls: Mutex<u32>,
}

impl MockGrader {
    pub fn new() -> Self {
        Self {
            default_script: Mutex::new(GradeScript::Score(CriteriaScores::new(
                32.0, 20.0, 16.0, 8.0, 4.0,
            ))),
            scripts: Mutex::new(HashMap::new()),
            code_scripts: Mutex::new(HashMap::new()),
            served: Mutex::new(HashMap::new()),
            latency: Mutex::new(Duration::ZERO),
            calls: Mutex::new(0),
        }
    }

    pub fn with_default(script: GradeScript) -> Self {
        let grader = Self::new();
        *grader.default_script.lock() = script;
        grader
    }

    pub fn set_default(&self, script: GradeScript) {
        *self.default_script.lock() = script;
    }

    pub fn script(&self, submission_id: SubmissionId, script: GradeScript) {
        self.scripts.lock().insert(submission_id, script);
    }

    pub fn script_code(&self, code: impl Into<String>, script: GradeScript) {
        self.code_scripts.lock().insert(code.into(), script);
    }

    /// Artificial per-call latency, useful under paused test time.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn call_count(&self) -> u32 {
        *self.calls.lock()
    }
}

impl Default for MockGrader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraderClient for MockGrader {
    async fn grade(&self, request: GradeRequest) -> Result<GradeReport, GraderError> {
        *self.calls.lock() += 1;

        // Idempotence: a re-issued request gets the cached report.
        if let Some(report) = self.served.lock().get(&request.submission_id) {
            return Ok(report.clone());
        }

        let latency = *self.latency.lock();
        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }

        let script = self
            .scripts
            .lock()
            .get(&request.submission_id)
            .cloned()
            .or_else(|| self.code_scripts.lock().get(&request.code).cloned())
            .unwrap_or_else(|| self.default_script.lock().clone());

        match script {
            GradeScript::Score(scores) => {
                let report = GradeReport {
                    submission_id: request.submission_id,
                    verdict: GradeVerdict::Ok,
                    scores,
                    feedback: format!("graded {} solution", request.language),
                };
                self.served
                    .lock()
                    .insert(request.submission_id, report.clone());
                Ok(report)
            }
            GradeScript::Fail(message) => Err(GraderError::Unavailable(message)),
            GradeScript::Hang => {
                futures_never().await;
                unreachable!("futures_never never resolves")
            }
        }
    }
}

async fn futures_never() {
    // Pending forever without depending on a timer.
    std::future::pending::<()>().await
}
