// Reward policy: the first passing submission per (user, challenge) earns
// the challenge's points; everything else earns zero.

use crate::error::{GradeError, LedgerError};
use crate::ledger::{RewardClaim, SubmissionLedger};
use codeclass_common::types::{Award, ChallengeId, GradingResult, UserId};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub const MAX_LEDGER_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct ScoringPolicy {
    ledger: Arc<dyn SubmissionLedger>,
    max_attempts: u32,
    backoff: Duration,
}

impl ScoringPolicy {
    pub fn new(ledger: Arc<dyn SubmissionLedger>) -> Self {
        Self {
            ledger,
            max_attempts: MAX_LEDGER_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn next_attempt_number(
        &self,
        user_id: UserId,
        challenge_id: ChallengeId,
    ) -> Result<u32, GradeError> {
        self.with_retries("next_attempt_number", || {
            self.ledger.next_attempt_number(user_id, challenge_id)
        })
        .await
    }

    pub async fn total_points(&self, user_id: UserId) -> Result<u64, GradeError> {
        self.with_retries("total_points", || self.ledger.total_points(user_id))
            .await
    }

    /// Decide the points for a finished grade.
    ///
    /// `points` is the challenge's value at grading time. Failing grades and
    /// zero-point challenges never touch the ledger.
    #[instrument(skip(self, result), fields(passed = result.passed()))]
    pub async fn award(
        &self,
        user_id: UserId,
        challenge_id: ChallengeId,
        submission_id: Uuid,
        result: &GradingResult,
        points: u32,
    ) -> Result<Award, GradeError> {
        if !result.passed() || points == 0 {
            return Ok(Award {
                points_awarded: 0,
                already_rewarded: false,
                total_points: None,
            });
        }

        let claim = self
            .with_retries("claim_reward", || {
                self.ledger
                    .claim_reward(user_id, challenge_id, submission_id, points)
            })
            .await?;

        let award = match claim {
            RewardClaim::Claimed { total_points } => Award {
                points_awarded: points,
                already_rewarded: false,
                total_points: Some(total_points),
            },
            RewardClaim::AlreadyRewarded { total_points } => Award {
                points_awarded: 0,
                already_rewarded: true,
                total_points: Some(total_points),
            },
        };
        info!(
            points_awarded = award.points_awarded,
            already_rewarded = award.already_rewarded,
            total_points = ?award.total_points,
            "Reward decided"
        );
        Ok(award)
    }

    async fn with_retries<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, GradeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(LedgerError::Conflict(reason)) if attempt < self.max_attempts => {
                    warn!(operation, attempt, reason = %reason, "Ledger conflict, retrying");
                    tokio::time::sleep(self.backoff * attempt).await;
                    attempt += 1;
                }
                Err(LedgerError::Conflict(_)) => {
                    return Err(GradeError::Concurrency { attempts: attempt })
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use async_trait::async_trait;
    use codeclass_common::types::{TestOutcome, Verdict};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn grade(status: Verdict) -> GradingResult {
        GradingResult {
            status,
            results: vec![TestOutcome {
                input: "3".into(),
                expected: "9".into(),
                user_output: "9\n".into(),
                passed: status == Verdict::Passed,
                failure_reason: None,
            }],
            reason: None,
        }
    }

    fn policy(ledger: Arc<dyn SubmissionLedger>) -> ScoringPolicy {
        ScoringPolicy::new(ledger).with_backoff(Duration::from_millis(1))
    }

    /// Conflicts on the first `failures` calls, then delegates.
    struct FlakyLedger {
        inner: MemoryLedger,
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyLedger {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryLedger::new(),
                failures,
                calls: AtomicU32::new(0),
            }
        }

        fn trip(&self) -> Result<(), LedgerError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                Err(LedgerError::Conflict("write conflict".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl SubmissionLedger for FlakyLedger {
        async fn next_attempt_number(
            &self,
            user_id: UserId,
            challenge_id: ChallengeId,
        ) -> Result<u32, LedgerError> {
            self.trip()?;
            self.inner.next_attempt_number(user_id, challenge_id).await
        }

        async fn claim_reward(
            &self,
            user_id: UserId,
            challenge_id: ChallengeId,
            submission_id: Uuid,
            points: u32,
        ) -> Result<RewardClaim, LedgerError> {
            self.trip()?;
            self.inner
                .claim_reward(user_id, challenge_id, submission_id, points)
                .await
        }

        async fn total_points(&self, user_id: UserId) -> Result<u64, LedgerError> {
            self.trip()?;
            self.inner.total_points(user_id).await
        }
    }

    #[tokio::test]
    async fn test_first_pass_rewarded_then_zero() {
        let scoring = policy(Arc::new(MemoryLedger::new()));
        let passed = grade(Verdict::Passed);

        let first = scoring.award(1, 5, Uuid::new_v4(), &passed, 20).await.unwrap();
        assert_eq!(first.points_awarded, 20);
        assert!(!first.already_rewarded);
        assert_eq!(first.total_points, Some(20));

        let second = scoring.award(1, 5, Uuid::new_v4(), &passed, 20).await.unwrap();
        assert_eq!(second.points_awarded, 0);
        assert!(second.already_rewarded);
        assert_eq!(second.total_points, Some(20));
    }

    #[tokio::test]
    async fn test_failed_grade_earns_nothing() {
        let scoring = policy(Arc::new(MemoryLedger::new()));
        let award = scoring
            .award(1, 5, Uuid::new_v4(), &grade(Verdict::Failed), 20)
            .await
            .unwrap();
        assert_eq!(award.points_awarded, 0);
        assert!(!award.already_rewarded);

        // The failure left the reward available.
        let award = scoring
            .award(1, 5, Uuid::new_v4(), &grade(Verdict::Passed), 20)
            .await
            .unwrap();
        assert_eq!(award.points_awarded, 20);
    }

    #[tokio::test]
    async fn test_failed_grade_survives_unavailable_ledger() {
        let ledger = Arc::new(FlakyLedger::new(u32::MAX));
        let scoring = policy(ledger.clone());

        let award = scoring
            .award(1, 5, Uuid::new_v4(), &grade(Verdict::Failed), 20)
            .await
            .unwrap();
        assert_eq!(award.points_awarded, 0);
        assert_eq!(award.total_points, None);
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_zero_point_challenge_does_not_consume_reward() {
        let scoring = policy(Arc::new(MemoryLedger::new()));
        let passed = grade(Verdict::Passed);

        let free = scoring.award(2, 8, Uuid::new_v4(), &passed, 0).await.unwrap();
        assert_eq!(free.points_awarded, 0);
        assert!(!free.already_rewarded);

        let later = scoring.award(2, 8, Uuid::new_v4(), &passed, 30).await.unwrap();
        assert_eq!(later.points_awarded, 30);
    }

    #[tokio::test]
    async fn test_concurrent_passes_award_once() {
        let scoring = policy(Arc::new(MemoryLedger::new()));
        let passed = grade(Verdict::Passed);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let scoring = scoring.clone();
                let passed = passed.clone();
                tokio::spawn(async move {
                    scoring.award(3, 3, Uuid::new_v4(), &passed, 25).await.unwrap()
                })
            })
            .collect();

        let mut total_awarded = 0;
        let mut rewarded = 0;
        for handle in handles {
            let award = handle.await.unwrap();
            total_awarded += award.points_awarded;
            if award.already_rewarded {
                rewarded += 1;
            }
        }
        assert_eq!(total_awarded, 25);
        assert_eq!(rewarded, 9);
        assert_eq!(scoring.total_points(3).await.unwrap(), 25);
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let ledger = Arc::new(FlakyLedger::new(2));
        let scoring = policy(ledger.clone());

        assert_eq!(scoring.next_attempt_number(1, 1).await.unwrap(), 1);
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_persistent_conflict_surfaces_concurrency_error() {
        let scoring = policy(Arc::new(FlakyLedger::new(u32::MAX)));
        let err = scoring
            .award(1, 1, Uuid::new_v4(), &grade(Verdict::Passed), 10)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GradeError::Concurrency {
                attempts: MAX_LEDGER_ATTEMPTS
            }
        ));
        assert!(err.is_retryable());
    }
}
