mod config;

use codeclass_common::redis as queue;
use codeclass_common::types::{GradeJob, GradeReport, JobMode, JobState, Language};
use codeclass_grader::sandbox::build_sandbox;
use codeclass_grader::{
    GradeError, Grader, GradingPool, GradingService, LanguageConfigManager, RedisLedger,
    ScoringPolicy,
};
use config::WorkerConfig;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};

/// Deliveries before an infrastructure failure becomes a stored error.
const MAX_DELIVERIES: u32 = 3;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("CodeClass worker booting...");

    let config = WorkerConfig::from_env()?;

    let languages = LanguageConfigManager::load_or_builtin(&config.languages_path).map_err(|e| {
        error!("Failed to load language configurations: {:#}", e);
        e
    })?;
    info!("Loaded language configurations for: {:?}", languages.list_languages());

    if !languages.is_enabled(config.language) {
        error!(
            "Language '{}' is not enabled. Available: {:?}",
            config.language,
            languages.list_languages()
        );
        anyhow::bail!("worker language {} is not enabled", config.language);
    }

    let sandbox = build_sandbox(config.backend, &languages, config.sandbox.clone())?;
    info!(
        language = %config.language,
        sandbox = sandbox.name(),
        workers = config.workers,
        queue_depth = config.queue_depth,
        queue = %queue::queue_name(&config.language),
        "Worker configured"
    );

    let client = redis::Client::open(config.settings.redis_url.as_str())?;
    let redis_conn = ConnectionManager::new(client).await?;
    info!("Connected to Redis: {}", config.settings.redis_url);

    let grader = Grader::new(sandbox, languages, config.settings.limits)
        .with_max_source_bytes(config.sandbox.max_source_bytes)
        .with_max_input_bytes(config.sandbox.max_input_bytes);
    let scoring = ScoringPolicy::new(Arc::new(RedisLedger::new(redis_conn.clone())));
    let pool = GradingPool::new(config.workers, config.queue_depth);
    let service = Arc::new(GradingService::new(grader, scoring, pool));

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            // Keep the sender alive so the loop never sees a closed channel.
            std::future::pending::<()>().await;
        }
        warn!("Received shutdown signal, no longer taking jobs");
        let _ = stop_tx.send(true);
    });

    let mut jobs = JoinSet::new();
    worker_loop(
        service,
        redis_conn,
        config.language,
        config.settings.result_ttl_seconds,
        stop_rx,
        &mut jobs,
    )
    .await;

    info!(in_flight = jobs.len(), "Waiting for in-flight jobs");
    let abandoned = drain_jobs(&mut jobs, config.shutdown_grace).await;
    if abandoned > 0 {
        warn!(abandoned, "Shutdown grace expired with jobs still grading");
    }

    info!("Worker shutdown complete");
    Ok(())
}

/// Pops jobs until `stop` flips. A job that has been popped always runs to
/// completion on `jobs`; only the wait for a slot is ever cancelled.
#[instrument(skip(service, redis_conn, ttl_seconds, stop, jobs), fields(language = %language))]
async fn worker_loop(
    service: Arc<GradingService>,
    mut redis_conn: ConnectionManager,
    language: Language,
    ttl_seconds: u64,
    mut stop: watch::Receiver<bool>,
    jobs: &mut JoinSet<()>,
) {
    loop {
        while jobs.try_join_next().is_some() {}
        if *stop.borrow() {
            return;
        }

        // Only take a job off the queue when there is room to grade it.
        tokio::select! {
            slot = service.pool().wait_for_slot() => {
                if slot.is_err() {
                    error!("Grading pool closed");
                    return;
                }
            }
            _ = stop.changed() => continue,
        }

        // BLPOP with a timeout so shutdown is observed between jobs
        match queue::pop_job(&mut redis_conn, &language, 5.0).await {
            Ok(Some(job)) => {
                info!(
                    job_id = %job.id,
                    mode = ?job.mode,
                    tests = job.fixtures.len(),
                    source_size = job.source_code.len(),
                    delivery = job.delivery + 1,
                    "Received job"
                );
                jobs.spawn(process_job(service.clone(), redis_conn.clone(), job, ttl_seconds));
            }
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Wait up to `grace` for every job to finish; returns how many were still
/// running and got aborted.
async fn drain_jobs(jobs: &mut JoinSet<()>, grace: Duration) -> usize {
    let drained = tokio::time::timeout(grace, async {
        while let Some(joined) = jobs.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Grading task failed");
            }
        }
    })
    .await;

    if drained.is_ok() {
        return 0;
    }
    let abandoned = jobs.len();
    jobs.abort_all();
    while jobs.join_next().await.is_some() {}
    abandoned
}

#[instrument(skip_all, fields(job_id = %job.id, mode = ?job.mode))]
async fn process_job(
    service: Arc<GradingService>,
    mut redis_conn: ConnectionManager,
    mut job: GradeJob,
    ttl_seconds: u64,
) {
    job.delivery += 1;
    let start = Instant::now();

    let outcome = match job.mode {
        JobMode::Submit => match job.submission.clone() {
            Some(submission) => {
                service
                    .complete_submission(
                        submission,
                        job.fixtures.clone(),
                        job.challenge_points,
                        job.limits,
                    )
                    .await
            }
            None => Err(GradeError::Validation(
                "submit job carries no submission".to_string(),
            )),
        },
        JobMode::DryRun => service
            .dry_run_tests(
                job.source_code.clone(),
                job.language,
                job.fixtures.clone(),
                job.limits,
            )
            .await
            .map(|result| GradeReport {
                job_id: job.id,
                mode: JobMode::DryRun,
                state: JobState::Completed,
                submission: None,
                result: Some(result),
                award: None,
                error: None,
            }),
    };

    let report = match outcome {
        Ok(report) => {
            info!(elapsed_ms = start.elapsed().as_millis() as u64, "Job completed");
            report
        }
        Err(e) if e.is_retryable() && job.delivery < MAX_DELIVERIES => {
            warn!(error = %e, delivery = job.delivery, "Grading unavailable, requeueing job");
            tokio::time::sleep(Duration::from_millis(250 * job.delivery as u64)).await;
            match queue::push_job(&mut redis_conn, &job).await {
                Ok(()) => return,
                Err(push_err) => {
                    error!(error = %push_err, "Failed to requeue job");
                    errored_report(&job, &e)
                }
            }
        }
        Err(e) => {
            error!(error = %e, delivery = job.delivery, "Job failed");
            errored_report(&job, &e)
        }
    };

    match queue::store_report(&mut redis_conn, &report, ttl_seconds).await {
        Ok(()) => info!("Report persisted to Redis"),
        Err(e) => error!(error = %e, "Failed to persist report"),
    }
}

/// The submission, if any, stays pending so a later regrade can finalize it.
fn errored_report(job: &GradeJob, err: &GradeError) -> GradeReport {
    GradeReport {
        job_id: job.id,
        mode: job.mode,
        state: JobState::Errored,
        submission: job.submission.clone(),
        result: None,
        award: None,
        error: Some(err.user_message()),
    }
}
