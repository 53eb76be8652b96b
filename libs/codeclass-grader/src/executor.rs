//! Grade Orchestrator
//!
//! Runs a submission against every hidden fixture, in order, through the
//! sandbox and folds the outcomes into a [`GradingResult`].
//!
//! This is the glue layer. It knows nothing about:
//! - How code executes (the sandbox's job)
//! - How output is judged (the evaluator's job)
//! - Points (the scoring policy's job)

use crate::error::GradeError;
use crate::evaluator;
use crate::languages::LanguageConfigManager;
use crate::sandbox::{ExecutionOutcome, Sandbox};
use codeclass_common::types::{ExecutionLimits, Fixture, GradingResult, Language};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

pub const DEFAULT_MAX_SOURCE_BYTES: usize = 64 * 1024;
pub const DEFAULT_MAX_INPUT_BYTES: usize = 1024 * 1024;

/// Resolve a declared language. A missing value means the platform default;
/// an unrecognised one is rejected.
pub fn resolve_language(declared: Option<&str>) -> Result<Language, GradeError> {
    match declared.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(Language::default()),
        Some(value) => Language::from_str(value)
            .ok_or_else(|| GradeError::Validation(format!("unsupported language '{}'", value))),
    }
}

/// Checks that need no sandbox: non-empty code of sane size in an enabled language.
pub fn validate_submission(
    code: &str,
    language: Language,
    languages: &LanguageConfigManager,
    max_source_bytes: usize,
) -> Result<(), GradeError> {
    if code.trim().is_empty() {
        return Err(GradeError::Validation("code is required".to_string()));
    }
    if code.len() > max_source_bytes {
        return Err(GradeError::Validation(format!(
            "code exceeds maximum size of {} bytes",
            max_source_bytes
        )));
    }
    if !languages.is_enabled(language) {
        return Err(GradeError::Validation(format!(
            "language '{}' is not enabled",
            language
        )));
    }
    Ok(())
}

/// A fixture input the sandbox would refuse is a problem with the challenge,
/// not with the grading infrastructure, so no retry can fix it.
pub fn validate_fixtures(fixtures: &[Fixture], max_input_bytes: usize) -> Result<(), GradeError> {
    match fixtures.iter().position(|f| f.input.len() > max_input_bytes) {
        Some(idx) => Err(GradeError::Validation(format!(
            "test {} input exceeds maximum size of {} bytes",
            idx + 1,
            max_input_bytes
        ))),
        None => Ok(()),
    }
}

pub struct Grader {
    sandbox: Arc<dyn Sandbox>,
    languages: LanguageConfigManager,
    /// Operator ceiling; requested limits are clamped to it.
    ceiling: ExecutionLimits,
    max_source_bytes: usize,
    max_input_bytes: usize,
}

impl Grader {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        languages: LanguageConfigManager,
        ceiling: ExecutionLimits,
    ) -> Self {
        Self {
            sandbox,
            languages,
            ceiling,
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
        }
    }

    pub fn with_max_source_bytes(mut self, max_source_bytes: usize) -> Self {
        self.max_source_bytes = max_source_bytes;
        self
    }

    pub fn with_max_input_bytes(mut self, max_input_bytes: usize) -> Self {
        self.max_input_bytes = max_input_bytes;
        self
    }

    pub fn languages(&self) -> &LanguageConfigManager {
        &self.languages
    }

    pub fn validate(&self, code: &str, language: Language) -> Result<(), GradeError> {
        validate_submission(code, language, &self.languages, self.max_source_bytes)
    }

    /// Grade `code` against `fixtures`.
    ///
    /// Tests run sequentially in fixture order and the result lists them in
    /// that order. Per-test failures are verdicts; only a sandbox that
    /// cannot start aborts the whole grade with `Infrastructure`.
    #[instrument(
        skip(self, code, fixtures, limits),
        fields(submission_id = %submission_id, language = %language, test_count = fixtures.len())
    )]
    pub async fn grade(
        &self,
        submission_id: Uuid,
        code: &str,
        language: Language,
        fixtures: &[Fixture],
        limits: &ExecutionLimits,
    ) -> Result<GradingResult, GradeError> {
        self.validate(code, language)?;
        validate_fixtures(fixtures, self.max_input_bytes)?;

        let limits = limits.clamp_to(&self.ceiling);
        let start = Instant::now();
        let mut outcomes = Vec::with_capacity(fixtures.len());

        for (idx, fixture) in fixtures.iter().enumerate() {
            let outcome = self
                .sandbox
                .run(code, language, &fixture.input, &limits)
                .await;

            if let ExecutionOutcome::SetupError { message } = &outcome {
                error!(
                    test_num = idx + 1,
                    sandbox = self.sandbox.name(),
                    error = %message,
                    "Sandbox could not run the submission"
                );
                return Err(GradeError::Infrastructure(message.clone()));
            }

            let result = evaluator::evaluate_test(fixture, &outcome);
            debug!(
                test_num = idx + 1,
                passed = result.passed,
                reason = result.failure_reason.as_deref().unwrap_or(""),
                "Test evaluated"
            );
            outcomes.push(result);
        }

        let result = evaluator::aggregate(outcomes);
        info!(
            status = ?result.status,
            passed = result.results.iter().filter(|r| r.passed).count(),
            total = result.results.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Grading completed"
        );
        Ok(result)
    }

    /// Same pipeline as [`Grader::grade`] for author-supplied tests. No
    /// submission exists, so nothing downstream records or rewards it.
    pub async fn dry_run(
        &self,
        code: &str,
        language: Language,
        fixtures: &[Fixture],
        limits: &ExecutionLimits,
    ) -> Result<GradingResult, GradeError> {
        self.grade(Uuid::new_v4(), code, language, fixtures, limits)
            .await
    }
}
