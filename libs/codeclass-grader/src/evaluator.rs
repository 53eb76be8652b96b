//! Test Evaluator - turns sandbox outcomes into per-test verdicts
//!
//! **Properties:**
//! - Knows nothing about containers, processes or Redis
//! - Pure: (fixture, outcome) -> test outcome
//!
//! **Comparison Rules:**
//! - Trailing whitespace (including a final newline or `\r\n`) is ignored
//! - Leading whitespace is significant
//! - Case sensitive, exact match otherwise
//!
//! **Verdict Rules:**
//! - Passed only if every test passed and there was at least one test

use crate::sandbox::ExecutionOutcome;
use codeclass_common::types::{Fixture, GradingResult, TestOutcome, Verdict};

pub const NO_TESTS_REASON: &str = "challenge has no hidden tests";
pub const TIMEOUT_REASON: &str = "time limit exceeded";
pub const MEMORY_REASON: &str = "memory limit exceeded";
pub const WRONG_ANSWER_REASON: &str = "wrong answer";

fn normalize_output(output: &str) -> &str {
    output.trim_end()
}

/// Whether `actual` stdout matches the expected output.
pub fn compare(actual: &str, expected: &str) -> bool {
    normalize_output(actual) == normalize_output(expected)
}

pub fn evaluate_test(fixture: &Fixture, outcome: &ExecutionOutcome) -> TestOutcome {
    let (user_output, failure_reason) = match outcome {
        ExecutionOutcome::Completed { stdout, .. } => {
            let reason = if compare(stdout, &fixture.output) {
                None
            } else {
                Some(WRONG_ANSWER_REASON.to_string())
            };
            (stdout.clone(), reason)
        }
        ExecutionOutcome::TimedOut => (String::new(), Some(TIMEOUT_REASON.to_string())),
        ExecutionOutcome::MemoryExceeded => (String::new(), Some(MEMORY_REASON.to_string())),
        ExecutionOutcome::RuntimeError { message } => {
            (String::new(), Some(format!("runtime error: {}", message)))
        }
        // The grader aborts before it gets here; kept total for callers that don't.
        ExecutionOutcome::SetupError { .. } => {
            (String::new(), Some("sandbox setup failed".to_string()))
        }
    };

    TestOutcome {
        input: fixture.input.clone(),
        expected: fixture.output.clone(),
        user_output,
        passed: failure_reason.is_none(),
        failure_reason,
    }
}

/// Fold per-test outcomes into the overall verdict.
pub fn aggregate(results: Vec<TestOutcome>) -> GradingResult {
    if results.is_empty() {
        return GradingResult {
            status: Verdict::Failed,
            results,
            reason: Some(NO_TESTS_REASON.to_string()),
        };
    }

    let status = if results.iter().all(|r| r.passed) {
        Verdict::Passed
    } else {
        Verdict::Failed
    };

    GradingResult {
        status,
        results,
        reason: None,
    }
}
