// Public grading operations: open an attempt, grade it, reward it.

use crate::error::GradeError;
use crate::executor::Grader;
use crate::pool::GradingPool;
use crate::scoring::ScoringPolicy;
use codeclass_common::types::{
    Award, ChallengeId, ExecutionLimits, Fixture, GradeReport, GradingResult, JobMode, JobState,
    Language, Submission, UserId,
};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

pub struct GradingService {
    grader: Arc<Grader>,
    scoring: ScoringPolicy,
    pool: GradingPool,
}

impl GradingService {
    pub fn new(grader: Grader, scoring: ScoringPolicy, pool: GradingPool) -> Self {
        Self {
            grader: Arc::new(grader),
            scoring,
            pool,
        }
    }

    pub fn grader(&self) -> &Grader {
        &self.grader
    }

    pub fn scoring(&self) -> &ScoringPolicy {
        &self.scoring
    }

    pub fn pool(&self) -> &GradingPool {
        &self.pool
    }

    /// Validate the code and allocate the next attempt number. Nothing runs yet.
    pub async fn open_submission(
        &self,
        user_id: UserId,
        challenge_id: ChallengeId,
        code: String,
        language: Language,
    ) -> Result<Submission, GradeError> {
        self.grader.validate(&code, language)?;
        let attempt = self
            .scoring
            .next_attempt_number(user_id, challenge_id)
            .await?;
        Ok(Submission::pending(
            user_id,
            challenge_id,
            code,
            language,
            attempt,
        ))
    }

    /// Grade a pending submission, decide its reward and finalize it.
    ///
    /// On error the submission stays pending; nothing was rewarded unless the
    /// error came after the claim, and a retried claim is idempotent.
    #[instrument(
        skip(self, submission, fixtures, limits),
        fields(submission_id = %submission.id, user_id = submission.user_id, challenge_id = submission.challenge_id)
    )]
    pub async fn complete_submission(
        &self,
        mut submission: Submission,
        fixtures: Vec<Fixture>,
        challenge_points: u32,
        limits: ExecutionLimits,
    ) -> Result<GradeReport, GradeError> {
        let result = self
            .run_graded(
                submission.id,
                submission.code.clone(),
                submission.language,
                fixtures,
                limits,
            )
            .await?;

        let award = self
            .compute_award(&submission, &result, challenge_points)
            .await?;
        submission.finalize(result.status, award.points_awarded)?;

        info!(
            attempt = submission.attempt_number,
            status = ?submission.status,
            points_awarded = award.points_awarded,
            "Submission finalized"
        );

        Ok(GradeReport {
            job_id: submission.id,
            mode: JobMode::Submit,
            state: JobState::Completed,
            submission: Some(submission),
            result: Some(result),
            award: Some(award),
            error: None,
        })
    }

    /// Open, grade and reward in one call.
    #[allow(clippy::too_many_arguments)]
    pub async fn grade_submission(
        &self,
        user_id: UserId,
        challenge_id: ChallengeId,
        code: String,
        language: Language,
        fixtures: Vec<Fixture>,
        challenge_points: u32,
        limits: ExecutionLimits,
    ) -> Result<GradeReport, GradeError> {
        let submission = self
            .open_submission(user_id, challenge_id, code, language)
            .await?;
        self.complete_submission(submission, fixtures, challenge_points, limits)
            .await
    }

    /// Grade author-supplied tests. No submission, no attempt, no points.
    pub async fn dry_run_tests(
        &self,
        code: String,
        language: Language,
        fixtures: Vec<Fixture>,
        limits: ExecutionLimits,
    ) -> Result<GradingResult, GradeError> {
        self.run_graded(Uuid::new_v4(), code, language, fixtures, limits)
            .await
    }

    pub async fn compute_award(
        &self,
        submission: &Submission,
        result: &GradingResult,
        challenge_points: u32,
    ) -> Result<Award, GradeError> {
        self.scoring
            .award(
                submission.user_id,
                submission.challenge_id,
                submission.id,
                result,
                challenge_points,
            )
            .await
    }

    pub async fn total_points(&self, user_id: UserId) -> Result<u64, GradeError> {
        self.scoring.total_points(user_id).await
    }

    async fn run_graded(
        &self,
        id: Uuid,
        code: String,
        language: Language,
        fixtures: Vec<Fixture>,
        limits: ExecutionLimits,
    ) -> Result<GradingResult, GradeError> {
        let grader = self.grader.clone();
        self.pool
            .run(async move { grader.grade(id, &code, language, &fixtures, &limits).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tests::{ScriptedSandbox, SquaringSandbox};
    use crate::languages::LanguageConfigManager;
    use crate::ledger::MemoryLedger;
    use crate::sandbox::{ExecutionOutcome, Sandbox};
    use codeclass_common::types::{SubmissionStatus, Verdict};
    use std::time::Duration;

    fn service(sandbox: Arc<dyn Sandbox>) -> GradingService {
        let grader = Grader::new(
            sandbox,
            LanguageConfigManager::builtin(),
            ExecutionLimits::default(),
        );
        let scoring = ScoringPolicy::new(Arc::new(MemoryLedger::new()))
            .with_backoff(Duration::from_millis(1));
        GradingService::new(grader, scoring, GradingPool::new(4, 16))
    }

    const SQUARE: &str = "n = int(input())\nprint(n * n)\n";

    #[tokio::test]
    async fn test_first_pass_earns_points_second_does_not() {
        let service = service(Arc::new(SquaringSandbox));
        let fixtures = vec![Fixture::new("3", "9")];

        let first = service
            .grade_submission(1, 42, SQUARE.into(), Language::Python, fixtures.clone(), 20, ExecutionLimits::default())
            .await
            .unwrap();
        let submission = first.submission.unwrap();
        assert_eq!(submission.status, SubmissionStatus::Passed);
        assert_eq!(submission.attempt_number, 1);
        assert_eq!(submission.points_awarded, 20);
        let award = first.award.unwrap();
        assert_eq!(award.points_awarded, 20);
        assert!(!award.already_rewarded);
        let result = first.result.unwrap();
        assert_eq!(result.status, Verdict::Passed);
        assert!(result.results[0].passed);

        let second = service
            .grade_submission(1, 42, SQUARE.into(), Language::Python, fixtures, 20, ExecutionLimits::default())
            .await
            .unwrap();
        assert_eq!(second.submission.unwrap().attempt_number, 2);
        let award = second.award.unwrap();
        assert_eq!(award.points_awarded, 0);
        assert!(award.already_rewarded);
        assert_eq!(service.total_points(1).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_failed_attempt_is_recorded_without_points() {
        let service = service(Arc::new(ScriptedSandbox::new(vec![
            ExecutionOutcome::TimedOut,
        ])));
        let report = service
            .grade_submission(
                5,
                6,
                "while True: pass".into(),
                Language::Python,
                vec![Fixture::new("", "1")],
                10,
                ExecutionLimits::default(),
            )
            .await
            .unwrap();

        let submission = report.submission.unwrap();
        assert_eq!(submission.status, SubmissionStatus::Failed);
        assert_eq!(submission.points_awarded, 0);
        assert_eq!(
            report.result.unwrap().results[0].failure_reason.as_deref(),
            Some("time limit exceeded")
        );
    }

    #[tokio::test]
    async fn test_infrastructure_error_leaves_submission_pending() {
        let service = service(Arc::new(ScriptedSandbox::new(vec![
            ExecutionOutcome::SetupError {
                message: "image pull failed".into(),
            },
        ])));
        let submission = service
            .open_submission(1, 1, SQUARE.into(), Language::Python)
            .await
            .unwrap();
        let err = service
            .complete_submission(submission, vec![Fixture::new("3", "9")], 10, ExecutionLimits::default())
            .await
            .unwrap_err();

        assert!(matches!(err, GradeError::Infrastructure(_)));
        assert_eq!(err.user_message(), crate::error::RETRY_MESSAGE);
        assert_eq!(service.total_points(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_code_consumes_no_attempt() {
        let service = service(Arc::new(SquaringSandbox));
        let err = service
            .open_submission(1, 1, "   ".into(), Language::Python)
            .await
            .unwrap_err();
        assert!(matches!(err, GradeError::Validation(_)));

        let submission = service
            .open_submission(1, 1, SQUARE.into(), Language::Python)
            .await
            .unwrap();
        assert_eq!(submission.attempt_number, 1);
    }

    #[tokio::test]
    async fn test_concurrent_submissions_get_distinct_attempts() {
        let service = Arc::new(service(Arc::new(SquaringSandbox)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move {
                    service
                        .grade_submission(
                            9,
                            9,
                            SQUARE.into(),
                            Language::Python,
                            vec![Fixture::new("2", "4")],
                            10,
                            ExecutionLimits::default(),
                        )
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut attempts = Vec::new();
        let mut awarded = 0;
        for handle in handles {
            let report = handle.await.unwrap();
            attempts.push(report.submission.unwrap().attempt_number);
            awarded += report.award.unwrap().points_awarded;
        }
        attempts.sort_unstable();
        assert_eq!(attempts, (1..=8).collect::<Vec<u32>>());
        assert_eq!(awarded, 10);
    }

    #[tokio::test]
    async fn test_dry_run_touches_no_ledger() {
        let service = service(Arc::new(SquaringSandbox));
        let result = service
            .dry_run_tests(
                SQUARE.into(),
                Language::Python,
                vec![Fixture::new("3", "9"), Fixture::new("4", "15")],
                ExecutionLimits::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.status, Verdict::Failed);
        assert!(result.results[0].passed);
        assert!(!result.results[1].passed);

        let submission = service
            .open_submission(1, 1, SQUARE.into(), Language::Python)
            .await
            .unwrap();
        assert_eq!(submission.attempt_number, 1);
        assert_eq!(service.total_points(1).await.unwrap(), 0);
    }
}
