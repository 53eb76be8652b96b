//! Docker sandbox: one throwaway container per run.
//!
//! **Isolation:**
//! - No network (`network_mode: none`)
//! - Read-only root filesystem, private tmpfs at /tmp
//! - All capabilities dropped, `no-new-privileges`, unprivileged user
//! - Memory without swap, CPU share, pid limit and a CPU-seconds ulimit
//!
//! The source travels base64-encoded in an env var that the launcher
//! unsets before exec; test input is written to the attached stdin.
//! The container is removed when the run ends, however it ends.

use super::{
    classify_exit, CappedBuffer, ExecutionOutcome, Sandbox, SandboxSettings, STDERR_CAPTURE_BYTES,
};
use crate::languages::{LanguageConfig, LanguageConfigManager};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    InspectContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, ResourcesUlimits};
use bollard::Docker;
use codeclass_common::types::{ExecutionLimits, Language};
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const CONTAINER_WORKDIR: &str = "/tmp";
const CONTAINER_USER: &str = "65534:65534";
const TMPFS_OPTIONS: &str = "rw,noexec,nosuid,nodev,size=16m";

// 128 + SIGKILL / SIGXCPU
const EXIT_SIGKILL: i64 = 137;
const EXIT_SIGXCPU: i64 = 152;

/// Removes the container. Finished runs call [`ContainerGuard::remove`];
/// cancelled or panicking ones fall back to a removal spawned from drop.
struct ContainerGuard {
    docker: Docker,
    container_id: String,
}

fn remove_options() -> Option<RemoveContainerOptions> {
    Some(RemoveContainerOptions {
        force: true,
        ..Default::default()
    })
}

impl ContainerGuard {
    async fn remove(mut self) {
        let container_id = std::mem::take(&mut self.container_id);
        if let Err(e) = self.docker.remove_container(&container_id, remove_options()).await {
            warn!(container_id = %container_id, error = %e, "Failed to remove container");
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if self.container_id.is_empty() {
            return;
        }
        let docker = self.docker.clone();
        let container_id = std::mem::take(&mut self.container_id);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(container_id = %container_id, "No runtime to remove container");
            return;
        };

        runtime.spawn(async move {
            if let Err(e) = docker.remove_container(&container_id, remove_options()).await {
                warn!(container_id = %container_id, error = %e, "Failed to remove container");
            }
        });
    }
}

pub struct DockerSandbox {
    docker: Docker,
    languages: LanguageConfigManager,
    settings: SandboxSettings,
}

impl DockerSandbox {
    pub fn new(languages: LanguageConfigManager, settings: SandboxSettings) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self {
            docker,
            languages,
            settings,
        })
    }

    /// Pull the image unless it is already cached.
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        warn!(image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.context("Failed to pull Docker image")?;
        }

        info!(image, "Image pulled");
        Ok(())
    }

    async fn execute(
        &self,
        source: &str,
        language: Language,
        stdin: &str,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionOutcome> {
        let config = self.languages.get_config(&language)?;
        self.ensure_image(&config.image)
            .await
            .with_context(|| format!("Failed to ensure Docker image '{}' is available", config.image))?;

        let container_name = format!("codeclass-{}", uuid::Uuid::new_v4());
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };
        let container = self
            .docker
            .create_container(Some(create_options), container_config(config, &self.settings, source, limits))
            .await
            .context("Failed to create Docker container")?;
        let guard = ContainerGuard {
            docker: self.docker.clone(),
            container_id: container.id.clone(),
        };

        let outcome = self.run_container(&container.id, stdin, limits).await;
        guard.remove().await;
        outcome
    }

    async fn run_container(
        &self,
        container_id: &str,
        stdin: &str,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionOutcome> {
        // Attach before start so no output is missed.
        let AttachContainerResults { mut output, mut input } = self
            .docker
            .attach_container(
                container_id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(true),
                    detach_keys: None,
                }),
            )
            .await
            .context("Failed to attach to Docker container")?;

        let start = Instant::now();
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")?;

        // Fed from its own task so a program that never reads stdin cannot
        // stall the run before the wall clock is armed.
        let stdin = stdin.as_bytes().to_vec();
        let writer = tokio::spawn(async move {
            // The program may exit before reading its input; write errors are fine.
            let _ = input.write_all(&stdin).await;
            let _ = input.shutdown().await;
        });

        let max_output = self.settings.max_output_bytes;
        let execution = async {
            let mut stdout = CappedBuffer::new(max_output);
            let mut stderr = CappedBuffer::new(STDERR_CAPTURE_BYTES);
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => stdout.push(&message),
                    Ok(LogOutput::StdErr { message }) => stderr.push(&message),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Error reading container output");
                        break;
                    }
                }
            }
            let exit_code = self.wait_exit_code(container_id).await;
            (stdout, stderr, exit_code)
        };

        let timed = timeout(Duration::from_millis(limits.wall_ms), execution).await;
        writer.abort();
        let (stdout, stderr, exit_code) = match timed {
            Ok(collected) => collected,
            Err(_) => {
                debug!(wall_ms = limits.wall_ms, "Wall clock limit reached");
                self.stop(container_id).await;
                return Ok(ExecutionOutcome::TimedOut);
            }
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;
        let stderr = stderr.into_string();

        let oom_killed = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .ok()
            .and_then(|info| info.state)
            .and_then(|state| state.oom_killed)
            .unwrap_or(false);
        if oom_killed {
            return Ok(ExecutionOutcome::MemoryExceeded);
        }

        let exit_code = exit_code.context("No exit status reported for container")?;
        if exit_code == EXIT_SIGXCPU || exit_code == EXIT_SIGKILL {
            return Ok(ExecutionOutcome::TimedOut);
        }

        Ok(classify_exit(
            stdout,
            &stderr,
            exit_code as i32,
            elapsed_ms,
            Some(Path::new(CONTAINER_WORKDIR)),
        ))
    }

    async fn wait_exit_code(&self, container_id: &str) -> Option<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(container_id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Some(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Some(code),
            Some(Err(e)) => {
                warn!(error = %e, "Failed to wait for container");
                None
            }
            None => None,
        }
    }

    /// SIGTERM, then SIGKILL once the grace period has passed.
    async fn stop(&self, container_id: &str) {
        let grace_secs = self.settings.grace_ms.div_ceil(1000).max(1);
        let stop = self.docker.stop_container(
            container_id,
            Some(StopContainerOptions {
                t: grace_secs as i64,
            }),
        );
        let deadline = Duration::from_secs(grace_secs + 1);
        match timeout(deadline, stop).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to stop timed-out container"),
            Err(_) => {
                warn!("Container ignored stop request, killing");
                if let Err(e) = self
                    .docker
                    .kill_container(container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(error = %e, "Failed to kill timed-out container");
                }
            }
        }
    }
}

fn container_config(
    config: &LanguageConfig,
    settings: &SandboxSettings,
    source: &str,
    limits: &ExecutionLimits,
) -> Config<String> {
    let file = format!("{}/main{}", CONTAINER_WORKDIR, config.execution.file_extension);
    let memory_mb = limits.memory_mb.min(config.memory_limit_mb as u64);
    let mut command = vec![config.execution.command.clone()];
    command.extend(config.execution.argv(&file, memory_mb));
    let launcher = format!(
        "printf '%s' \"$SOURCE_CODE\" | base64 -d > {file} && unset SOURCE_CODE && exec {cmd}",
        file = file,
        cmd = command.join(" "),
    );

    let memory_bytes = (memory_mb * 1024 * 1024) as i64;
    let cpu_seconds = limits.cpu_ms.div_ceil(1000).max(1) as i64;

    Config {
        image: Some(config.image.clone()),
        entrypoint: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
        cmd: Some(vec![launcher]),
        env: Some(vec![
            format!("SOURCE_CODE={}", general_purpose::STANDARD.encode(source)),
            "PATH=/usr/local/bin:/usr/bin:/bin".to_string(),
            format!("HOME={}", CONTAINER_WORKDIR),
        ]),
        working_dir: Some(CONTAINER_WORKDIR.to_string()),
        user: Some(CONTAINER_USER.to_string()),
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        open_stdin: Some(true),
        stdin_once: Some(true),
        tty: Some(false),
        network_disabled: Some(true),
        host_config: Some(HostConfig {
            memory: Some(memory_bytes),
            memory_swap: Some(memory_bytes),
            nano_cpus: Some((config.cpu_limit as f64 * 1_000_000_000.0) as i64),
            pids_limit: Some(settings.max_processes as i64),
            network_mode: Some("none".to_string()),
            readonly_rootfs: Some(true),
            tmpfs: Some(HashMap::from([(
                CONTAINER_WORKDIR.to_string(),
                TMPFS_OPTIONS.to_string(),
            )])),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ulimits: Some(vec![ResourcesUlimits {
                name: Some("cpu".to_string()),
                soft: Some(cpu_seconds),
                hard: Some(cpu_seconds + 1),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
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
        "docker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ExecutionLimits {
        ExecutionLimits {
            cpu_ms: 2_000,
            wall_ms: 5_000,
            memory_mb: 128,
        }
    }

    #[test]
    fn test_container_config_is_locked_down() {
        let languages = LanguageConfigManager::builtin();
        let python = languages.get_config(&Language::Python).unwrap();
        let config = container_config(python, &SandboxSettings::default(), "print(1)", &limits());

        let host = config.host_config.unwrap();
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.memory, Some(128 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.pids_limit, Some(64));
        assert_eq!(config.network_disabled, Some(true));

        let env = config.env.unwrap();
        assert!(env[0].starts_with("SOURCE_CODE="));
        assert!(!env[0].contains("print(1)"));
        assert!(config.cmd.unwrap()[0].contains("unset SOURCE_CODE"));
    }

    #[tokio::test]
    #[ignore] // requires a docker daemon and the python image
    async fn test_docker_square() {
        let sandbox =
            DockerSandbox::new(LanguageConfigManager::builtin(), SandboxSettings::default()).unwrap();
        let outcome = sandbox
            .run("n = int(input())\nprint(n * n)\n", Language::Python, "3\n", &limits())
            .await;
        assert!(matches!(
            outcome,
            ExecutionOutcome::Completed { ref stdout, .. } if stdout == "9\n"
        ));
    }

    #[tokio::test]
    #[ignore] // requires a docker daemon and the python image
    async fn test_docker_infinite_loop_times_out() {
        let sandbox =
            DockerSandbox::new(LanguageConfigManager::builtin(), SandboxSettings::default()).unwrap();
        let outcome = sandbox
            .run("while True:\n    pass\n", Language::Python, "", &limits())
            .await;
        assert_eq!(outcome, ExecutionOutcome::TimedOut);
    }

    #[test]
    fn test_container_command_carries_heap_flag() {
        let languages = LanguageConfigManager::builtin();
        let node = languages.get_config(&Language::JavaScript).unwrap();
        let config = container_config(node, &SandboxSettings::default(), "console.log(1)", &limits());
        let launcher = &config.cmd.unwrap()[0];
        assert!(launcher.ends_with("exec node --max-old-space-size=96 /tmp/main.js"));
        assert_eq!(config.host_config.unwrap().memory, Some(128 * 1024 * 1024));
    }

    #[tokio::test]
    #[ignore] // requires a docker daemon and the python image
    async fn test_program_ignoring_large_stdin_still_times_out() {
        let sandbox =
            DockerSandbox::new(LanguageConfigManager::builtin(), SandboxSettings::default()).unwrap();
        let stdin = "1\n".repeat(512 * 1024);
        let started = Instant::now();
        let outcome = sandbox
            .run("import time\ntime.sleep(10**9)\n", Language::Python, &stdin, &limits())
            .await;
        assert_eq!(outcome, ExecutionOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(15));
    }

    #[tokio::test]
    #[ignore] // requires a docker daemon and the python image
    async fn test_docker_has_no_network() {
        let sandbox =
            DockerSandbox::new(LanguageConfigManager::builtin(), SandboxSettings::default()).unwrap();
        let source = "import socket\nsocket.create_connection(('1.1.1.1', 53), timeout=1)\n";
        let outcome = sandbox.run(source, Language::Python, "", &limits()).await;
        assert!(matches!(outcome, ExecutionOutcome::RuntimeError { .. }));
    }
}
