use crate::types::{ChallengeId, GradeJob, GradeReport, Language, UserId};
use redis::{AsyncCommands, RedisResult, Script};

/// Redis key semantics shared by the API, the worker and the ledger.
/// Keys are deterministic so every process agrees on where things live.

pub const QUEUE_PREFIX: &str = "codeclass:queue";
pub const RESULT_PREFIX: &str = "codeclass:result";
pub const STATUS_PREFIX: &str = "codeclass:status";
pub const ATTEMPTS_PREFIX: &str = "codeclass:attempts";
pub const REWARDED_PREFIX: &str = "codeclass:rewarded";
pub const POINTS_PREFIX: &str = "codeclass:points";

/// Queue name for a language
pub fn queue_name(language: &Language) -> String {
    format!("{}:{}", QUEUE_PREFIX, language)
}

pub fn result_key(job_id: &uuid::Uuid) -> String {
    format!("{}:{}", RESULT_PREFIX, job_id)
}

pub fn status_key(job_id: &uuid::Uuid) -> String {
    format!("{}:{}", STATUS_PREFIX, job_id)
}

/// Attempt counter for one (user, challenge) pair
pub fn attempts_key(user_id: UserId, challenge_id: ChallengeId) -> String {
    format!("{}:{}:{}", ATTEMPTS_PREFIX, user_id, challenge_id)
}

/// Marker set once the first passing submission has been rewarded
pub fn rewarded_key(user_id: UserId, challenge_id: ChallengeId) -> String {
    format!("{}:{}:{}", REWARDED_PREFIX, user_id, challenge_id)
}

pub fn points_key(user_id: UserId) -> String {
    format!("{}:{}", POINTS_PREFIX, user_id)
}

fn serialization_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
}

/// Push a job to its language queue (RPUSH, FIFO)
pub async fn push_job(
    conn: &mut redis::aio::ConnectionManager,
    job: &GradeJob,
) -> RedisResult<()> {
    let queue = queue_name(&job.language);
    let payload = serde_json::to_string(job).map_err(serialization_error)?;

    conn.rpush(&queue, payload).await
}

/// Serialized form of the not-yet-assigned attempt number in a submit job.
pub const ATTEMPT_PLACEHOLDER: &str = "\"attempt_number\":0";

// KEYS[1] attempt counter, KEYS[2] queue; ARGV[1] job with ATTEMPT_PLACEHOLDER.
// Every check runs before the first write, so a rejected job leaves the counter untouched.
const ENQUEUE_SUBMISSION_SCRIPT: &str = r#"
local kind = redis.call('TYPE', KEYS[2]).ok
if kind ~= 'none' and kind ~= 'list' then
  return redis.error_reply('WRONGTYPE queue key holds a ' .. kind)
end
local placeholder = '"attempt_number":0'
local at = string.find(ARGV[1], placeholder, 1, true)
if not at then
  return redis.error_reply('job has no unassigned attempt number')
end
local attempt = redis.call('INCR', KEYS[1])
local job = string.sub(ARGV[1], 1, at - 1) .. '"attempt_number":' .. attempt
  .. string.sub(ARGV[1], at + #placeholder)
redis.call('RPUSH', KEYS[2], job)
return attempt
"#;

/// Allocate the submission's attempt number and queue its job in one step,
/// so a job that never reaches the queue never consumes a number.
/// The job's submission must carry attempt number 0; the stored copy gets
/// the allocated one, which is returned.
pub async fn enqueue_submission(
    conn: &mut redis::aio::ConnectionManager,
    job: &GradeJob,
) -> RedisResult<u32> {
    let submission = job.submission.as_ref().ok_or_else(|| {
        redis::RedisError::from((redis::ErrorKind::ClientError, "submit job carries no submission"))
    })?;
    let attempts = attempts_key(submission.user_id, submission.challenge_id);
    enqueue_numbered(conn, &attempts, &queue_name(&job.language), job).await
}

async fn enqueue_numbered(
    conn: &mut redis::aio::ConnectionManager,
    attempts: &str,
    queue: &str,
    job: &GradeJob,
) -> RedisResult<u32> {
    let payload = numbered_payload(job)?;
    Script::new(ENQUEUE_SUBMISSION_SCRIPT)
        .key(attempts)
        .key(queue)
        .arg(payload)
        .invoke_async(conn)
        .await
}

fn numbered_payload(job: &GradeJob) -> RedisResult<String> {
    let payload = serde_json::to_string(job).map_err(serialization_error)?;
    if payload.matches(ATTEMPT_PLACEHOLDER).count() != 1 {
        return Err(redis::RedisError::from((
            redis::ErrorKind::ClientError,
            "job must carry exactly one unassigned attempt number",
        )));
    }
    Ok(payload)
}

/// Pop a job from a language queue.
/// BLPOP with a timeout so the worker loop can observe shutdown.
pub async fn pop_job(
    conn: &mut redis::aio::ConnectionManager,
    language: &Language,
    timeout_seconds: f64,
) -> RedisResult<Option<GradeJob>> {
    let queue = queue_name(language);
    let result: Option<(String, String)> = conn.blpop(&queue, timeout_seconds).await?;

    match result {
        Some((_key, payload)) => {
            let job: GradeJob = serde_json::from_str(&payload).map_err(serialization_error)?;
            Ok(Some(job))
        }
        None => Ok(None),
    }
}

/// Store a finished report with a TTL, plus its state under the status key
pub async fn store_report(
    conn: &mut redis::aio::ConnectionManager,
    report: &GradeReport,
    ttl_seconds: u64,
) -> RedisResult<()> {
    let key = result_key(&report.job_id);
    let payload = serde_json::to_string(report).map_err(serialization_error)?;
    let _: () = conn.set_ex(&key, payload, ttl_seconds).await?;

    let state = serde_json::to_string(&report.state).map_err(serialization_error)?;
    let _: () = conn.set_ex(status_key(&report.job_id), state, ttl_seconds).await?;

    Ok(())
}

pub async fn get_report(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &uuid::Uuid,
) -> RedisResult<Option<GradeReport>> {
    let payload: Option<String> = conn.get(result_key(job_id)).await?;

    match payload {
        Some(data) => {
            let report: GradeReport = serde_json::from_str(&data).map_err(serialization_error)?;
            Ok(Some(report))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionLimits, JobMode, Submission};
    use uuid::Uuid;

    fn submit_job(user_id: UserId, code: &str) -> GradeJob {
        let submission = Submission::pending(user_id, 1, code.to_string(), Language::Python, 0);
        GradeJob {
            id: submission.id,
            mode: JobMode::Submit,
            submission: Some(submission),
            language: Language::Python,
            source_code: code.to_string(),
            fixtures: Vec::new(),
            challenge_points: 10,
            limits: ExecutionLimits::default(),
            delivery: 0,
        }
    }

    #[test]
    fn test_queue_naming() {
        assert_eq!(queue_name(&Language::Python), "codeclass:queue:python");
        assert_eq!(queue_name(&Language::JavaScript), "codeclass:queue:javascript");
    }

    #[test]
    fn test_result_key_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(result_key(&id), result_key(&id));
        assert!(result_key(&id).starts_with("codeclass:result:"));
        assert!(status_key(&id).contains(&id.to_string()));
    }

    #[test]
    fn test_ledger_keys_are_scoped_per_pair() {
        assert_eq!(attempts_key(3, 9), "codeclass:attempts:3:9");
        assert_eq!(rewarded_key(3, 9), "codeclass:rewarded:3:9");
        assert_ne!(attempts_key(3, 9), attempts_key(9, 3));
        assert_eq!(points_key(3), "codeclass:points:3");
    }

    #[test]
    fn test_code_cannot_forge_attempt_placeholder() {
        let job = submit_job(1, "print('\"attempt_number\":0')");
        let payload = numbered_payload(&job).unwrap();
        assert_eq!(payload.matches(ATTEMPT_PLACEHOLDER).count(), 1);

        let mut numbered = submit_job(1, "print(1)");
        if let Some(submission) = numbered.submission.as_mut() {
            submission.attempt_number = 4;
        }
        assert!(numbered_payload(&numbered).is_err());
    }

    #[tokio::test]
    #[ignore] // requires a running Redis at REDIS_URL
    async fn test_failed_enqueue_leaves_no_gap() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let client = redis::Client::open(url).unwrap();
        let mut conn = redis::aio::ConnectionManager::new(client).await.unwrap();

        let user = (Uuid::new_v4().as_u128() % 1_000_000_000) as i64;
        let attempts = attempts_key(user, 1);
        let queue = format!("{}:test:{}", QUEUE_PREFIX, Uuid::new_v4());

        // A queue key of the wrong type makes the push impossible.
        let _: () = conn.set(&queue, "not a list").await.unwrap();
        assert!(enqueue_numbered(&mut conn, &attempts, &queue, &submit_job(user, "print(1)"))
            .await
            .is_err());
        let counter: Option<i64> = conn.get(&attempts).await.unwrap();
        assert_eq!(counter, None);

        let _: () = conn.del(&queue).await.unwrap();
        for expected in 1..=3 {
            let attempt = enqueue_numbered(&mut conn, &attempts, &queue, &submit_job(user, "print(1)"))
                .await
                .unwrap();
            assert_eq!(attempt, expected);
        }

        let stored: Vec<String> = conn.lrange(&queue, 0, -1).await.unwrap();
        let numbers: Vec<u32> = stored
            .iter()
            .map(|payload| {
                let job: GradeJob = serde_json::from_str(payload).unwrap();
                job.submission.unwrap().attempt_number
            })
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);

        let _: () = conn.del(vec![queue, attempts]).await.unwrap();
    }
}
