mod handlers;
mod metrics;
mod routes;

use anyhow::Context;
use axum::Router;
use codeclass_common::config::Settings;
use codeclass_grader::executor::{DEFAULT_MAX_INPUT_BYTES, DEFAULT_MAX_SOURCE_BYTES};
use codeclass_grader::languages::DEFAULT_CONFIG_PATH;
use codeclass_grader::{LanguageConfigManager, RedisLedger, ScoringPolicy};
use redis::aio::ConnectionManager;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

pub struct AppState {
    pub redis: ConnectionManager,
    pub languages: LanguageConfigManager,
    pub settings: Settings,
    pub scoring: ScoringPolicy,
    pub max_source_bytes: usize,
    pub max_input_bytes: usize,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("CodeClass API booting...");

    let settings = Settings::from_env();
    let languages_path = std::env::var("LANGUAGES_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let languages = LanguageConfigManager::load_or_builtin(&languages_path)?;
    info!("Enabled languages: {:?}", languages.list_languages());

    let client = redis::Client::open(settings.redis_url.as_str())
        .context("Failed to create Redis client")?;
    let redis_conn = ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;
    info!("Connected to Redis: {}", settings.redis_url);

    let state = Arc::new(AppState {
        scoring: ScoringPolicy::new(Arc::new(RedisLedger::new(redis_conn.clone()))),
        redis: redis_conn,
        languages,
        settings,
        max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
        max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
    });

    let app = Router::new().merge(routes::routes()).with_state(state);

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
