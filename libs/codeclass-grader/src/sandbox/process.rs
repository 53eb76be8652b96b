// Local-process sandbox: rlimits, a private temp dir and a scrubbed
// environment. Meant for development machines without a docker daemon.

use super::{classify_exit, CappedBuffer, ExecutionOutcome, Sandbox, SandboxSettings, STDERR_CAPTURE_BYTES};
use crate::languages::{LanguageConfigManager, MemoryRlimit};
use anyhow::{Context, Result};
use async_trait::async_trait;
use codeclass_common::types::{ExecutionLimits, Language};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setpgid, Pid};
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const MAX_OPEN_FILES: u64 = 64;
const MAX_FILE_BYTES: u64 = 1024 * 1024;

pub struct ProcessSandbox {
    languages: LanguageConfigManager,
    settings: SandboxSettings,
}

impl ProcessSandbox {
    pub fn new(languages: LanguageConfigManager, settings: SandboxSettings) -> Self {
        warn!(
            "Process sandbox selected: programs share the host kernel, user and network. \
             Use the docker backend for untrusted code."
        );
        Self {
            languages,
            settings,
        }
    }

    async fn execute(
        &self,
        source: &str,
        language: Language,
        stdin: &str,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionOutcome> {
        let config = self.languages.get_config(&language)?;

        // Dropped at the end of the run, taking every file the program wrote with it.
        let workdir = tempfile::Builder::new()
            .prefix("codeclass-")
            .tempdir()
            .context("Failed to create sandbox directory")?;
        let file_name = format!("main{}", config.execution.file_extension);
        tokio::fs::write(workdir.path().join(&file_name), source)
            .await
            .context("Failed to write source file")?;

        let memory_bytes = limits.memory_mb.min(config.memory_limit_mb as u64) * 1024 * 1024;
        let cpu_seconds = limits.cpu_ms.div_ceil(1000).max(1);
        let max_processes = self.settings.max_processes;
        let memory_resource = match config.execution.memory_rlimit {
            MemoryRlimit::AddressSpace => Resource::RLIMIT_AS,
            MemoryRlimit::Data => Resource::RLIMIT_DATA,
        };

        let mut cmd = Command::new(&config.execution.command);
        cmd.args(config.execution.argv(&file_name, memory_bytes / (1024 * 1024)))
            .current_dir(workdir.path())
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", workdir.path())
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Runs in the forked child before exec; only async-signal-safe calls.
        unsafe {
            cmd.pre_exec(move || {
                setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
                setrlimit(memory_resource, memory_bytes, memory_bytes)?;
                setrlimit(Resource::RLIMIT_CPU, cpu_seconds, cpu_seconds + 1)?;
                setrlimit(Resource::RLIMIT_NOFILE, MAX_OPEN_FILES, MAX_OPEN_FILES)?;
                setrlimit(Resource::RLIMIT_FSIZE, MAX_FILE_BYTES, MAX_FILE_BYTES)?;
                setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
                setrlimit(Resource::RLIMIT_NPROC, max_processes, max_processes)?;
                Ok(())
            });
        }

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to start '{}'", config.execution.command))?;
        let group = child.id().map(|id| Pid::from_raw(id as i32));

        let mut stdin_pipe = child.stdin.take().context("stdin was not captured")?;
        let stdout_pipe = child.stdout.take().context("stdout was not captured")?;
        let stderr_pipe = child.stderr.take().context("stderr was not captured")?;

        let input = stdin.as_bytes().to_vec();
        let writer = tokio::spawn(async move {
            // The program may exit without reading its input; a broken pipe is fine.
            let _ = stdin_pipe.write_all(&input).await;
            let _ = stdin_pipe.shutdown().await;
        });
        let stdout_task = tokio::spawn(read_capped(stdout_pipe, self.settings.max_output_bytes));
        let stderr_task = tokio::spawn(read_capped(stderr_pipe, STDERR_CAPTURE_BYTES));

        let wall = Duration::from_millis(limits.wall_ms);
        let status = match timeout(wall, child.wait()).await {
            Ok(status) => status.context("Failed to wait for sandboxed process")?,
            Err(_) => {
                debug!(wall_ms = limits.wall_ms, "Wall clock limit reached");
                self.terminate(&mut child, group).await;
                writer.abort();
                stdout_task.abort();
                stderr_task.abort();
                return Ok(ExecutionOutcome::TimedOut);
            }
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        // Anything the program left behind in its group goes too, so the
        // pipes reach EOF.
        if let Some(group) = group {
            let _ = killpg(group, Signal::SIGKILL);
        }
        writer.abort();

        let grace = Duration::from_millis(self.settings.grace_ms);
        let stdout = collect(stdout_task, grace, self.settings.max_output_bytes).await;
        let stderr = collect(stderr_task, grace, STDERR_CAPTURE_BYTES).await.into_string();

        if let Some(signal) = status.signal() {
            return Ok(classify_signal(signal, &stderr));
        }

        let exit_code = status.code().unwrap_or(-1);
        Ok(classify_exit(
            stdout,
            &stderr,
            exit_code,
            elapsed_ms,
            Some(workdir.path()),
        ))
    }

    /// SIGTERM the whole group, then SIGKILL whatever survives the grace period.
    async fn terminate(&self, child: &mut Child, group: Option<Pid>) {
        if let Some(group) = group {
            let _ = killpg(group, Signal::SIGTERM);
        }

        let grace = Duration::from_millis(self.settings.grace_ms);
        if timeout(grace, child.wait()).await.is_err() {
            warn!(grace_ms = self.settings.grace_ms, "Sandboxed process ignored SIGTERM, killing");
            if let Some(group) = group {
                let _ = killpg(group, Signal::SIGKILL);
            }
            let _ = child.kill().await;
        }

        if let Some(group) = group {
            let _ = killpg(group, Signal::SIGKILL);
        }
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn run(
        &self,
        source: &str,
        language: Language,
        stdin: &str,
        limits: &ExecutionLimits,
    ) -> ExecutionOutcome {
        if let Some(rejected) = self.settings.check_sizes(source, stdin) {
            return rejected;
        }

        match self.execute(source, language, stdin, limits).await {
            Ok(outcome) => outcome,
            Err(e) => ExecutionOutcome::SetupError {
                message: format!("{:#}", e),
            },
        }
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

fn classify_signal(signal: i32, stderr: &str) -> ExecutionOutcome {
    // SIGXCPU at the soft CPU limit, SIGKILL at the hard one.
    if signal == Signal::SIGXCPU as i32 || signal == Signal::SIGKILL as i32 {
        return ExecutionOutcome::TimedOut;
    }
    if super::looks_like_oom(stderr) {
        return ExecutionOutcome::MemoryExceeded;
    }
    let name = Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| signal.to_string());
    ExecutionOutcome::RuntimeError {
        message: format!("terminated by signal {}", name),
    }
}

async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> CappedBuffer {
    let mut buf = CappedBuffer::new(cap);
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.push(&chunk[..n]),
        }
    }
    buf
}

async fn collect(task: JoinHandle<CappedBuffer>, grace: Duration, cap: usize) -> CappedBuffer {
    match timeout(grace, task).await {
        Ok(Ok(buf)) => buf,
        _ => CappedBuffer::new(cap),
    }
}
