// Worker configuration, read from the environment
use anyhow::{bail, Result};
use codeclass_common::config::Settings;
use codeclass_common::types::Language;
use codeclass_grader::languages::DEFAULT_CONFIG_PATH;
use codeclass_grader::sandbox::{SandboxBackend, SandboxSettings};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub language: Language,
    pub backend: SandboxBackend,
    /// Concurrent grades; defaults to the number of cores.
    pub workers: usize,
    /// Grades allowed to wait for a slot before the pool reports busy.
    pub queue_depth: usize,
    /// How long in-flight jobs get to finish after a shutdown signal.
    pub shutdown_grace: Duration,
    pub languages_path: PathBuf,
    pub settings: Settings,
    pub sandbox: SandboxSettings,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let language = match lookup("WORKER_LANGUAGE") {
            None => Language::default(),
            Some(value) => match Language::from_str(&value) {
                Some(language) => language,
                None => bail!(
                    "Invalid WORKER_LANGUAGE '{}'. Valid options: {:?}",
                    value,
                    Language::ALL.map(|l| l.to_string())
                ),
            },
        };

        let backend = match lookup("SANDBOX_BACKEND") {
            None => SandboxBackend::default(),
            Some(value) => match SandboxBackend::parse(&value) {
                Some(backend) => backend,
                None => bail!("Invalid SANDBOX_BACKEND '{}'. Valid options: docker, process", value),
            },
        };

        let number = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<usize>().ok())
                .filter(|v| *v > 0)
        };
        let workers = number("GRADING_WORKERS").unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        let queue_depth = number("GRADING_QUEUE_DEPTH").unwrap_or(workers * 4);

        let defaults = SandboxSettings::default();
        let sandbox = SandboxSettings {
            grace_ms: number("SANDBOX_GRACE_MS")
                .map(|v| v as u64)
                .unwrap_or(defaults.grace_ms),
            max_output_bytes: number("SANDBOX_MAX_OUTPUT_BYTES").unwrap_or(defaults.max_output_bytes),
            ..defaults
        };

        Ok(Self {
            language,
            backend,
            workers,
            queue_depth,
            shutdown_grace: Duration::from_secs(
                number("WORKER_SHUTDOWN_GRACE_SECONDS").unwrap_or(60) as u64,
            ),
            languages_path: lookup("LANGUAGES_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
            settings: Settings::from_lookup(&lookup),
            sandbox,
        })
    }
}
