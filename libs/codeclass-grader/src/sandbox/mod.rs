//! Isolated execution of untrusted programs.
//!
//! A [`Sandbox`] runs one program against one stdin and reports what
//! happened. It never judges output; that is the evaluator's job.
//! Every run starts from a clean filesystem and environment, has no
//! network, and is bounded in CPU time, wall time, memory, process
//! count and output size.

pub mod docker;
#[cfg(unix)]
pub mod process;

use crate::languages::LanguageConfigManager;
use anyhow::Result;
use async_trait::async_trait;
use codeclass_common::types::{ExecutionLimits, Language};
use std::path::Path;
use std::sync::Arc;

/// Markers interpreters print when an allocation is refused.
const OOM_MARKERS: [&str; 5] = [
    "MemoryError",
    "heap out of memory",
    "process out of memory",
    "Cannot allocate memory",
    "std::bad_alloc",
];

const MAX_MESSAGE_CHARS: usize = 300;

/// Stderr kept per run; only used to build the error message.
pub(crate) const STDERR_CAPTURE_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The program exited normally with status zero.
    Completed {
        stdout: String,
        exit_code: i32,
        elapsed_ms: u64,
    },
    TimedOut,
    MemoryExceeded,
    /// Non-zero exit, crash, or output over the cap. The message is safe
    /// to show to the student.
    RuntimeError { message: String },
    /// The sandbox itself could not run the program.
    SetupError { message: String },
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run `source` once with `stdin`. Never fails; every failure mode is
    /// an [`ExecutionOutcome`].
    async fn run(
        &self,
        source: &str,
        language: Language,
        stdin: &str,
        limits: &ExecutionLimits,
    ) -> ExecutionOutcome;

    fn name(&self) -> &'static str;
}

/// Knobs shared by every backend.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    /// Time between the polite and the forced kill.
    pub grace_ms: u64,
    pub max_output_bytes: usize,
    pub max_source_bytes: usize,
    pub max_input_bytes: usize,
    pub max_processes: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            grace_ms: 1_000,
            max_output_bytes: 64 * 1024,
            max_source_bytes: 64 * 1024,
            max_input_bytes: 1024 * 1024,
            max_processes: 64,
        }
    }
}

impl SandboxSettings {
    /// Reject payloads the sandbox refuses to even start with.
    pub fn check_sizes(&self, source: &str, stdin: &str) -> Option<ExecutionOutcome> {
        if source.len() > self.max_source_bytes {
            return Some(ExecutionOutcome::SetupError {
                message: format!(
                    "source code exceeds maximum size of {} bytes",
                    self.max_source_bytes
                ),
            });
        }
        if stdin.len() > self.max_input_bytes {
            return Some(ExecutionOutcome::SetupError {
                message: format!("test input exceeds maximum size of {} bytes", self.max_input_bytes),
            });
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SandboxBackend {
    #[default]
    Docker,
    /// Local processes with rlimits. Weaker isolation; development only.
    Process,
}

impl SandboxBackend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "docker" | "container" => Some(SandboxBackend::Docker),
            "process" | "local" => Some(SandboxBackend::Process),
            _ => None,
        }
    }
}

pub fn build_sandbox(
    backend: SandboxBackend,
    languages: &LanguageConfigManager,
    settings: SandboxSettings,
) -> Result<Arc<dyn Sandbox>> {
    match backend {
        SandboxBackend::Docker => Ok(Arc::new(docker::DockerSandbox::new(
            languages.clone(),
            settings,
        )?)),
        #[cfg(unix)]
        SandboxBackend::Process => Ok(Arc::new(process::ProcessSandbox::new(
            languages.clone(),
            settings,
        ))),
        #[cfg(not(unix))]
        SandboxBackend::Process => anyhow::bail!("process sandbox is only available on unix"),
    }
}

/// Byte buffer that keeps reading but stops storing past `cap`.
#[derive(Debug)]
pub(crate) struct CappedBuffer {
    buf: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CappedBuffer {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
            truncated: false,
        }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.buf.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    pub(crate) fn truncated(&self) -> bool {
        self.truncated
    }

    pub(crate) fn into_string(self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

pub fn looks_like_oom(stderr: &str) -> bool {
    OOM_MARKERS.iter().any(|marker| stderr.contains(marker))
}

/// Turn raw stderr into a short message that is safe to show a student:
/// the last meaningful line, with stack frames and sandbox paths removed.
pub fn sanitize_message(stderr: &str, exit_code: i32, workdir: Option<&Path>) -> String {
    let cleaned = match workdir {
        Some(dir) => stderr.replace(dir.to_string_lossy().as_ref(), "<sandbox>"),
        None => stderr.to_string(),
    };

    let line = cleaned
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| {
            !line.starts_with("Traceback")
                && !line.starts_with("File \"")
                && !line.starts_with("at ")
                && !line.starts_with("Node.js v")
                && !line.chars().all(|c| matches!(c, '^' | '~' | ' '))
        })
        .last();

    match line {
        Some(line) => line.chars().take(MAX_MESSAGE_CHARS).collect(),
        None => format!("exited with status {}", exit_code),
    }
}

/// Map a finished process onto an outcome.
pub(crate) fn classify_exit(
    stdout: CappedBuffer,
    stderr: &str,
    exit_code: i32,
    elapsed_ms: u64,
    workdir: Option<&Path>,
) -> ExecutionOutcome {
    if exit_code != 0 && looks_like_oom(stderr) {
        return ExecutionOutcome::MemoryExceeded;
    }
    if exit_code != 0 {
        return ExecutionOutcome::RuntimeError {
            message: sanitize_message(stderr, exit_code, workdir),
        };
    }
    if stdout.truncated() {
        return ExecutionOutcome::RuntimeError {
            message: format!("output limit of {} bytes exceeded", stdout.cap),
        };
    }
    ExecutionOutcome::Completed {
        stdout: stdout.into_string(),
        exit_code,
        elapsed_ms,
    }
}
