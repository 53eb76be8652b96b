mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use codeclass_common::types::ExecutionLimits;
use codeclass_grader::languages::DEFAULT_CONFIG_PATH;
use codeclass_grader::sandbox::SandboxBackend;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "codeclass")]
#[command(about = "CodeClass CLI - Grade submissions locally and manage language configs", long_about = None)]
struct Cli {
    /// Path to languages.json
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    languages: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade a source file against a fixtures file without recording anything
    DryRun {
        /// Source file to grade
        #[arg(short, long)]
        file: PathBuf,

        /// JSON array of {"input", "output"} pairs
        #[arg(short = 't', long)]
        fixtures: PathBuf,

        /// Language (inferred from the file extension when omitted)
        #[arg(short, long)]
        language: Option<String>,

        /// Sandbox backend: docker or process
        #[arg(short, long, default_value = "docker")]
        backend: String,

        /// CPU time limit per test in ms
        #[arg(long, default_value = "2000")]
        cpu_ms: u64,

        /// Wall clock limit per test in ms
        #[arg(long, default_value = "5000")]
        wall_ms: u64,

        /// Memory limit per test in MB
        #[arg(long, default_value = "256")]
        memory_mb: u64,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// List enabled languages
    Languages,

    /// Write a default config/languages.json
    Init {
        /// Project path
        #[arg(short, long, default_value = ".")]
        path: PathBuf,

        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::DryRun {
            file,
            fixtures,
            language,
            backend,
            cpu_ms,
            wall_ms,
            memory_mb,
            json,
        } => {
            let backend = SandboxBackend::parse(&backend)
                .ok_or_else(|| anyhow::anyhow!("Unknown backend '{}'", backend))?;
            let passed = commands::dry_run(commands::DryRunArgs {
                file: &file,
                language: language.as_deref(),
                fixtures: &fixtures,
                backend,
                languages_path: &cli.languages,
                limits: ExecutionLimits {
                    cpu_ms,
                    wall_ms,
                    memory_mb,
                },
                json,
            })
            .await?;
            if !passed {
                std::process::exit(1);
            }
        }
        Commands::Languages => {
            commands::list_languages(&cli.languages)?;
        }
        Commands::Init { path, force } => {
            commands::init_project(&path, force)?;
        }
    }

    Ok(())
}
