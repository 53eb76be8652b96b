// HTTP route handlers for the CodeClass grading API

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use codeclass_common::redis as queue;
use codeclass_common::types::{
    ChallengeId, ExecutionLimits, Fixture, GradeJob, JobMode, Language, Level, Submission,
    SubmissionStatus, UserId,
};
use codeclass_grader::error::RETRY_MESSAGE;
use codeclass_grader::executor::{resolve_language, validate_fixtures, validate_submission};
use codeclass_grader::GradeError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::metrics;
use crate::AppState;

fn default_points() -> u32 {
    10
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub user_id: UserId,
    pub challenge_id: ChallengeId,
    /// Challenge value at submission time.
    #[serde(default = "default_points")]
    pub challenge_points: u32,
    /// Languages the challenge accepts; empty means any enabled one.
    #[serde(default)]
    pub allowed_languages: Vec<Language>,
    #[serde(default)]
    pub language: Option<String>,
    pub code: String,
    pub fixtures: Vec<Fixture>,
    #[serde(default)]
    pub limits: Option<ExecutionLimits>,
}

#[derive(Debug, Deserialize)]
pub struct DryRunRequest {
    #[serde(default)]
    pub language: Option<String>,
    pub code: String,
    pub fixtures: Vec<Fixture>,
    #[serde(default)]
    pub limits: Option<ExecutionLimits>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    /// Also the job id to poll.
    pub submission_id: Uuid,
    pub attempt_number: u32,
    pub status: SubmissionStatus,
}

#[derive(Debug, Serialize)]
pub struct DryRunResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct PointsResponse {
    pub user_id: UserId,
    pub total_points: u64,
    pub level: Level,
}

/// Map a grading error onto a status code and a body safe to show users.
pub fn error_response(err: &GradeError) -> Response {
    let (status, reason) = match err {
        GradeError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
        GradeError::Transition(_) => (StatusCode::CONFLICT, "transition"),
        GradeError::Busy => (StatusCode::SERVICE_UNAVAILABLE, "busy"),
        GradeError::Concurrency { .. } => (StatusCode::SERVICE_UNAVAILABLE, "concurrency"),
        GradeError::Infrastructure(_) => (StatusCode::SERVICE_UNAVAILABLE, "infrastructure"),
    };
    metrics::REQUESTS_REJECTED.with_label_values(&[reason]).inc();

    (
        status,
        Json(serde_json::json!({ "error": err.user_message() })),
    )
        .into_response()
}

fn resolve_and_validate(
    state: &AppState,
    declared: Option<&str>,
    code: &str,
    fixtures: &[Fixture],
) -> Result<Language, GradeError> {
    let language = resolve_language(declared)?;
    validate_submission(code, language, &state.languages, state.max_source_bytes)?;
    validate_fixtures(fixtures, state.max_input_bytes)?;
    Ok(language)
}

fn effective_limits(state: &AppState, requested: Option<ExecutionLimits>) -> ExecutionLimits {
    requested
        .unwrap_or(state.settings.limits)
        .clamp_to(&state.settings.limits)
}

async fn enqueue(state: &AppState, job: &GradeJob) -> Result<(), GradeError> {
    let mut conn = state.redis.clone();
    queue::push_job(&mut conn, job).await.map_err(|e| {
        error!(job_id = %job.id, error = %e, "Failed to queue job");
        GradeError::Infrastructure(e.to_string())
    })?;

    record_queued(job);
    Ok(())
}

fn record_queued(job: &GradeJob) {
    let mode = match job.mode {
        JobMode::Submit => "submit",
        JobMode::DryRun => "dry_run",
    };
    metrics::JOBS_QUEUED
        .with_label_values(&[mode, &job.language.to_string()])
        .inc();
}

/// POST /submissions - Record an attempt and queue it for grading
pub async fn submit_submission(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SubmitRequest>,
) -> Response {
    let language = match resolve_and_validate(
        &state,
        payload.language.as_deref(),
        &payload.code,
        &payload.fixtures,
    ) {
        Ok(language) => language,
        Err(e) => return error_response(&e),
    };
    if !payload.allowed_languages.is_empty() && !payload.allowed_languages.contains(&language) {
        return error_response(&GradeError::Validation(format!(
            "challenge does not accept {}",
            language
        )));
    }

    // Attempt 0 is a placeholder; Redis assigns the real number as it queues the job.
    let submission = Submission::pending(
        payload.user_id,
        payload.challenge_id,
        payload.code.clone(),
        language,
        0,
    );
    let job = GradeJob {
        id: submission.id,
        mode: JobMode::Submit,
        submission: Some(submission),
        language,
        source_code: payload.code,
        fixtures: payload.fixtures,
        challenge_points: payload.challenge_points,
        limits: effective_limits(&state, payload.limits),
        delivery: 0,
    };

    let mut conn = state.redis.clone();
    let attempt = match queue::enqueue_submission(&mut conn, &job).await {
        Ok(attempt) => attempt,
        Err(e) => {
            error!(job_id = %job.id, error = %e, "Failed to queue submission");
            return error_response(&GradeError::Infrastructure(e.to_string()));
        }
    };
    record_queued(&job);

    info!(
        job_id = %job.id,
        user_id = payload.user_id,
        challenge_id = payload.challenge_id,
        attempt,
        language = %language,
        tests = job.fixtures.len(),
        "Submission queued"
    );

    (
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            submission_id: job.id,
            attempt_number: attempt,
            status: SubmissionStatus::Pending,
        }),
    )
        .into_response()
}

/// POST /dry-run - Grade author-supplied tests without recording anything
pub async fn submit_dry_run(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<DryRunRequest>,
) -> Response {
    let language = match resolve_and_validate(
        &state,
        payload.language.as_deref(),
        &payload.code,
        &payload.fixtures,
    ) {
        Ok(language) => language,
        Err(e) => return error_response(&e),
    };

    let job = GradeJob {
        id: Uuid::new_v4(),
        mode: JobMode::DryRun,
        submission: None,
        language,
        source_code: payload.code,
        fixtures: payload.fixtures,
        challenge_points: 0,
        limits: effective_limits(&state, payload.limits),
        delivery: 0,
    };

    if let Err(e) = enqueue(&state, &job).await {
        return error_response(&e);
    }
    info!(job_id = %job.id, language = %language, tests = job.fixtures.len(), "Dry run queued");

    (StatusCode::ACCEPTED, Json(DryRunResponse { job_id: job.id })).into_response()
}

/// GET /jobs/{job_id} - Fetch a grading report
pub async fn get_job_report(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Response {
    let job_uuid = match Uuid::parse_str(&job_id) {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "Invalid job ID format" })),
            )
                .into_response();
        }
    };

    let mut conn = state.redis.clone();
    match queue::get_report(&mut conn, &job_uuid).await {
        Ok(Some(report)) => {
            info!(job_id = %job_id, state = ?report.state, "Report retrieved");
            (StatusCode::OK, Json(report)).into_response()
        }
        Ok(None) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "job_id": job_id,
                "status": "pending",
                "message": "Job is queued or still grading"
            })),
        )
            .into_response(),
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Failed to fetch report");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": RETRY_MESSAGE })),
            )
                .into_response()
        }
    }
}

/// GET /users/{user_id}/points - Total points and level
pub async fn get_user_points(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<UserId>,
) -> Response {
    match state.scoring.total_points(user_id).await {
        Ok(total_points) => (
            StatusCode::OK,
            Json(PointsResponse {
                user_id,
                total_points,
                level: Level::from_points(total_points),
            }),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /status - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus exposition
pub async fn metrics() -> impl IntoResponse {
    (StatusCode::OK, metrics::render())
}
