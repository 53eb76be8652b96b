// Attempt numbering and reward bookkeeping.
//
// Both operations must be atomic per (user, challenge): two concurrent
// submissions never share an attempt number, and a challenge is rewarded
// at most once no matter how many passing submissions race.

use crate::error::LedgerError;
use async_trait::async_trait;
use codeclass_common::redis::{attempts_key, points_key, rewarded_key};
use codeclass_common::types::{ChallengeId, UserId};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ErrorKind, RedisError, Script};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewardClaim {
    /// This submission earned the reward. Repeating the claim for the same
    /// submission returns this again without adding points twice.
    Claimed { total_points: u64 },
    AlreadyRewarded { total_points: u64 },
}

#[async_trait]
pub trait SubmissionLedger: Send + Sync {
    /// Next attempt number for the pair, starting at 1, with no gaps.
    async fn next_attempt_number(
        &self,
        user_id: UserId,
        challenge_id: ChallengeId,
    ) -> Result<u32, LedgerError>;

    /// Record `submission_id` as the rewarded submission for the pair and add
    /// `points` to the user's total, unless another submission got there first.
    async fn claim_reward(
        &self,
        user_id: UserId,
        challenge_id: ChallengeId,
        submission_id: Uuid,
        points: u32,
    ) -> Result<RewardClaim, LedgerError>;

    async fn total_points(&self, user_id: UserId) -> Result<u64, LedgerError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    attempts: HashMap<(UserId, ChallengeId), u32>,
    rewarded: HashMap<(UserId, ChallengeId), Uuid>,
    points: HashMap<UserId, u64>,
}

/// In-process ledger for the CLI and tests.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<MemoryState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, LedgerError> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Backend("ledger lock poisoned".to_string()))
    }
}

#[async_trait]
impl SubmissionLedger for MemoryLedger {
    async fn next_attempt_number(
        &self,
        user_id: UserId,
        challenge_id: ChallengeId,
    ) -> Result<u32, LedgerError> {
        let mut state = self.lock()?;
        let counter = state.attempts.entry((user_id, challenge_id)).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn claim_reward(
        &self,
        user_id: UserId,
        challenge_id: ChallengeId,
        submission_id: Uuid,
        points: u32,
    ) -> Result<RewardClaim, LedgerError> {
        let mut state = self.lock()?;
        if let Some(winner) = state.rewarded.get(&(user_id, challenge_id)).copied() {
            let total_points = state.points.get(&user_id).copied().unwrap_or(0);
            return Ok(if winner == submission_id {
                RewardClaim::Claimed { total_points }
            } else {
                RewardClaim::AlreadyRewarded { total_points }
            });
        }

        state.rewarded.insert((user_id, challenge_id), submission_id);
        let total = state.points.entry(user_id).or_insert(0);
        *total += points as u64;
        Ok(RewardClaim::Claimed {
            total_points: *total,
        })
    }

    async fn total_points(&self, user_id: UserId) -> Result<u64, LedgerError> {
        Ok(self.lock()?.points.get(&user_id).copied().unwrap_or(0))
    }
}

// KEYS[1] rewarded marker, KEYS[2] points total; ARGV[1] submission id, ARGV[2] points.
// Returns {claimed, total}. A retried claim by the winning submission is a no-op.
const CLAIM_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX') then
  return {1, redis.call('INCRBY', KEYS[2], ARGV[2])}
end
local total = tonumber(redis.call('GET', KEYS[2]) or '0')
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return {1, total}
end
return {0, total}
"#;

/// Ledger shared by every API and worker process.
#[derive(Clone)]
pub struct RedisLedger {
    conn: ConnectionManager,
    claim: Script,
}

impl RedisLedger {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            claim: Script::new(CLAIM_SCRIPT),
        }
    }
}

/// Errors where the command certainly did not run are retryable.
fn map_redis_error(err: RedisError) -> LedgerError {
    let transient = err.is_connection_refusal()
        || matches!(err.kind(), ErrorKind::TryAgain | ErrorKind::BusyLoadingError);
    if transient {
        LedgerError::Conflict(err.to_string())
    } else {
        LedgerError::Backend(err.to_string())
    }
}

#[async_trait]
impl SubmissionLedger for RedisLedger {
    async fn next_attempt_number(
        &self,
        user_id: UserId,
        challenge_id: ChallengeId,
    ) -> Result<u32, LedgerError> {
        let mut conn = self.conn.clone();
        let attempt: i64 = conn
            .incr(attempts_key(user_id, challenge_id), 1)
            .await
            .map_err(map_redis_error)?;
        u32::try_from(attempt)
            .map_err(|_| LedgerError::Backend(format!("attempt counter out of range: {}", attempt)))
    }

    async fn claim_reward(
        &self,
        user_id: UserId,
        challenge_id: ChallengeId,
        submission_id: Uuid,
        points: u32,
    ) -> Result<RewardClaim, LedgerError> {
        let mut conn = self.conn.clone();
        let (claimed, total): (i64, i64) = self
            .claim
            .key(rewarded_key(user_id, challenge_id))
            .key(points_key(user_id))
            .arg(submission_id.to_string())
            .arg(points)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                // The script is idempotent, so ambiguous failures are safe to retry too.
                if e.is_timeout() || e.is_connection_dropped() {
                    LedgerError::Conflict(e.to_string())
                } else {
                    map_redis_error(e)
                }
            })?;

        let total_points = total.max(0) as u64;
        Ok(if claimed == 1 {
            RewardClaim::Claimed { total_points }
        } else {
            RewardClaim::AlreadyRewarded { total_points }
        })
    }

    async fn total_points(&self, user_id: UserId) -> Result<u64, LedgerError> {
        let mut conn = self.conn.clone();
        let total: Option<i64> = conn.get(points_key(user_id)).await.map_err(map_redis_error)?;
        Ok(total.unwrap_or(0).max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_attempt_numbers_are_per_pair() {
        let ledger = MemoryLedger::new();
        assert_eq!(ledger.next_attempt_number(1, 1).await.unwrap(), 1);
        assert_eq!(ledger.next_attempt_number(1, 1).await.unwrap(), 2);
        assert_eq!(ledger.next_attempt_number(1, 2).await.unwrap(), 1);
        assert_eq!(ledger.next_attempt_number(2, 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_attempts_have_no_gaps_or_duplicates() {
        let ledger = Arc::new(MemoryLedger::new());
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.next_attempt_number(7, 3).await.unwrap() })
            })
            .collect();

        let mut numbers = Vec::new();
        for handle in handles {
            numbers.push(handle.await.unwrap());
        }
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=32).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_reward_claimed_once() {
        let ledger = MemoryLedger::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert_eq!(
            ledger.claim_reward(1, 9, first, 20).await.unwrap(),
            RewardClaim::Claimed { total_points: 20 }
        );
        assert_eq!(
            ledger.claim_reward(1, 9, second, 20).await.unwrap(),
            RewardClaim::AlreadyRewarded { total_points: 20 }
        );
        // Same submission again, e.g. a redelivered job.
        assert_eq!(
            ledger.claim_reward(1, 9, first, 20).await.unwrap(),
            RewardClaim::Claimed { total_points: 20 }
        );
        assert_eq!(ledger.total_points(1).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_concurrent_claims_reward_exactly_once() {
        let ledger = Arc::new(MemoryLedger::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger.claim_reward(4, 2, Uuid::new_v4(), 15).await.unwrap()
                })
            })
            .collect();

        let mut claimed = 0;
        for handle in handles {
            if let RewardClaim::Claimed { .. } = handle.await.unwrap() {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
        assert_eq!(ledger.total_points(4).await.unwrap(), 15);
    }

    #[tokio::test]
    #[ignore] // requires a running Redis at REDIS_URL
    async fn test_redis_ledger_claims_once() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let client = redis::Client::open(url).unwrap();
        let conn = ConnectionManager::new(client).await.unwrap();
        let ledger = RedisLedger::new(conn);

        let user = (Uuid::new_v4().as_u128() % 1_000_000_000) as i64;
        let winner = Uuid::new_v4();
        assert_eq!(ledger.next_attempt_number(user, 1).await.unwrap(), 1);
        assert_eq!(ledger.next_attempt_number(user, 1).await.unwrap(), 2);
        assert_eq!(
            ledger.claim_reward(user, 1, winner, 20).await.unwrap(),
            RewardClaim::Claimed { total_points: 20 }
        );
        assert_eq!(
            ledger.claim_reward(user, 1, winner, 20).await.unwrap(),
            RewardClaim::Claimed { total_points: 20 }
        );
        assert_eq!(
            ledger.claim_reward(user, 1, Uuid::new_v4(), 20).await.unwrap(),
            RewardClaim::AlreadyRewarded { total_points: 20 }
        );
        assert_eq!(ledger.total_points(user).await.unwrap(), 20);
    }
}
